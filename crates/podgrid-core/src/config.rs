//! podgrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodgridConfig {
    pub gateway: GatewayConfig,
    pub watch: WatchConfig,
    pub autoscale: AutoscaleConfig,
    pub reset: ResetConfig,
}

/// Where the fan-out portal lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `host:port` of the portal.
    pub address: String,
    /// Upper bound for a single request to the portal.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Health watch cadence: `checks + 1` polls spaced by `wait`, then `period`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub clusters: Vec<String>,
    #[serde(with = "duration_str")]
    pub period: Duration,
    #[serde(with = "duration_str")]
    pub wait: Duration,
    pub checks: u32,
    /// Per-poll fan-out timeout.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Process states counted as up.
    pub allowed: Vec<String>,
    /// Optional JSON-lines file the period reports are appended to.
    pub report_path: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            clusters: vec!["*".to_string()],
            period: Duration::from_secs(300),
            wait: Duration::from_secs(20),
            checks: 3,
            timeout: Duration::from_secs(5),
            allowed: vec!["running".to_string()],
            report_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub clusters: Vec<String>,
    #[serde(with = "duration_str")]
    pub period: Duration,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub policy: PolicyConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            period: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            policy: PolicyConfig::default(),
        }
    }
}

/// Which scale policy drives the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Majority vote over per-pod `stressed` flags.
    Threshold {
        #[serde(default = "default_unit")]
        unit: u32,
        #[serde(default = "default_max_instances")]
        max_instances: u32,
    },
    /// Averaged external/internal rates against a ceiling/floor band.
    RateAveraged {
        #[serde(default = "default_unit")]
        unit: u32,
        #[serde(default = "default_max_instances")]
        max_instances: u32,
        #[serde(default = "default_reps")]
        reps: u32,
        #[serde(default = "default_sample_interval", with = "duration_str")]
        sample_interval: Duration,
        #[serde(default = "default_external_metric")]
        external_metric: String,
        #[serde(default = "default_internal_metric")]
        internal_metric: String,
        external_ceiling: f64,
        external_floor: f64,
        internal_ceiling: f64,
        internal_floor: f64,
    },
    /// Fixed target cycle for soak testing.
    Pulse {
        #[serde(default = "default_pulse_sequence")]
        sequence: Vec<u32>,
    },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::Threshold {
            unit: default_unit(),
            max_instances: default_max_instances(),
        }
    }
}

fn default_unit() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    4
}

fn default_reps() -> u32 {
    5
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_external_metric() -> String {
    "sessions".to_string()
}

fn default_internal_metric() -> String {
    "inflight".to_string()
}

fn default_pulse_sequence() -> Vec<u32> {
    vec![1, 2, 3, 2]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Bound on concurrently running per-cluster reset tasks.
    pub max_concurrency: Option<usize>,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl PodgridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: PodgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.watch.checks == 0 {
            return Err(ConfigError::Invalid("watch.checks must be at least 1".into()));
        }

        match &self.autoscale.policy {
            PolicyConfig::Threshold {
                unit,
                max_instances,
            } => check_bounds(*unit, *max_instances),
            PolicyConfig::RateAveraged {
                unit,
                max_instances,
                reps,
                sample_interval,
                external_ceiling,
                external_floor,
                internal_ceiling,
                internal_floor,
                ..
            } => {
                check_bounds(*unit, *max_instances)?;
                if *reps == 0 {
                    return Err(ConfigError::Invalid("policy.reps must be at least 1".into()));
                }
                if external_floor > external_ceiling || internal_floor > internal_ceiling {
                    return Err(ConfigError::Invalid(
                        "policy floors must not exceed their ceilings".into(),
                    ));
                }
                // Sampling happens inside the period; a shorter period collapses the schedule.
                let sampling = sample_interval.checked_mul(*reps).ok_or_else(|| {
                    ConfigError::Invalid("reps x sample_interval overflows".into())
                })?;
                if self.autoscale.period <= sampling {
                    return Err(ConfigError::Invalid(format!(
                        "autoscale.period ({:?}) must exceed reps x sample_interval ({:?})",
                        self.autoscale.period, sampling
                    )));
                }
                Ok(())
            }
            PolicyConfig::Pulse { sequence } => {
                if sequence.is_empty() || sequence.contains(&0) {
                    return Err(ConfigError::Invalid(
                        "pulse sequence must be non-empty and hold positive sizes".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn check_bounds(unit: u32, max_instances: u32) -> ConfigResult<()> {
    if unit == 0 {
        return Err(ConfigError::Invalid("policy.unit must be at least 1".into()));
    }
    if max_instances == 0 {
        return Err(ConfigError::Invalid(
            "policy.max_instances must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Parse a duration string like "5s", "500ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    /// `"5s"` style strings, or a bare integer of seconds.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(raw) => super::parse_duration(&raw)
                .ok_or_else(|| de::Error::custom(super::ConfigError::Duration(raw))),
        }
    }
}
