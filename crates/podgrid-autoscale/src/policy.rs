//! Scale policies. Pure decision logic; sampling and publishing live in
//! [`crate::scaler`].

use std::time::Duration;

use serde::Serialize;

use podgrid_core::PolicyConfig;

/// Direction of a scale decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    Up,
    Down,
    None,
}

/// What a policy wants done to one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleDecision {
    pub cluster: String,
    /// Member count the decision was made from.
    pub from: u32,
    pub target: u32,
    pub action: ScaleAction,
}

impl ScaleDecision {
    /// Leave the cluster as it is.
    pub fn hold(cluster: &str, current: u32) -> Self {
        Self {
            cluster: cluster.to_string(),
            from: current,
            target: current,
            action: ScaleAction::None,
        }
    }

    pub fn is_change(&self) -> bool {
        self.action != ScaleAction::None
    }
}

/// Step size and capacity shared by the adaptive policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBounds {
    pub unit: u32,
    pub max_instances: u32,
}

impl StepBounds {
    fn up(&self, cluster: &str, current: u32) -> ScaleDecision {
        match current.checked_add(self.unit) {
            Some(target) if target <= self.max_instances => ScaleDecision {
                cluster: cluster.to_string(),
                from: current,
                target,
                action: ScaleAction::Up,
            },
            _ => ScaleDecision::hold(cluster, current),
        }
    }

    fn down(&self, cluster: &str, current: u32) -> ScaleDecision {
        if current > self.unit {
            ScaleDecision {
                cluster: cluster.to_string(),
                from: current,
                target: current - self.unit,
                action: ScaleAction::Down,
            }
        } else {
            ScaleDecision::hold(cluster, current)
        }
    }
}

/// Majority vote over per-member `stressed` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub bounds: StepBounds,
}

impl ThresholdPolicy {
    pub fn decide(&self, cluster: &str, stressed: u32, current: u32) -> ScaleDecision {
        if current == 0 {
            return ScaleDecision::hold(cluster, current);
        }
        // stressed vs current / 2 without the division.
        let doubled = u64::from(stressed) * 2;
        let current_wide = u64::from(current);
        if doubled > current_wide {
            self.bounds.up(cluster, current)
        } else if doubled < current_wide {
            self.bounds.down(cluster, current)
        } else {
            ScaleDecision::hold(cluster, current)
        }
    }
}

/// Ceiling/floor band for one per-member rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBand {
    pub floor: f64,
    pub ceiling: f64,
}

impl RateBand {
    fn above(&self, rate: f64) -> bool {
        rate > self.ceiling
    }

    fn below(&self, rate: f64) -> bool {
        rate < self.floor
    }
}

/// Cluster-wide rates, already averaged over the measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RateSample {
    pub external: f64,
    pub internal: f64,
}

/// Incremental mean: `avg += (x - avg) / (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunningAverage {
    value: f64,
    samples: u32,
}

impl RunningAverage {
    pub fn push(&mut self, sample: f64) {
        self.value += (sample - self.value) / f64::from(self.samples + 1);
        self.samples += 1;
    }

    /// `None` until at least one sample was pushed.
    pub fn value(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.value)
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// Both per-member rates must agree before the cluster moves.
#[derive(Debug, Clone, PartialEq)]
pub struct RateAveragedPolicy {
    pub bounds: StepBounds,
    pub external: RateBand,
    pub internal: RateBand,
    pub reps: u32,
    pub sample_interval: Duration,
    /// Key of the external rate in a pod's metrics body.
    pub external_metric: String,
    /// Key of the internal rate in a pod's metrics body.
    pub internal_metric: String,
}

impl RateAveragedPolicy {
    pub fn decide(&self, cluster: &str, sample: &RateSample, current: u32) -> ScaleDecision {
        if current == 0 {
            return ScaleDecision::hold(cluster, current);
        }
        let members = f64::from(current);
        let external = sample.external / members;
        let internal = sample.internal / members;

        if self.external.above(external) && self.internal.above(internal) {
            self.bounds.up(cluster, current)
        } else if self.external.below(external) && self.internal.below(internal) {
            self.bounds.down(cluster, current)
        } else {
            ScaleDecision::hold(cluster, current)
        }
    }
}

/// Walks a fixed cycle of targets, one step per period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulsePolicy {
    sequence: Vec<u32>,
    step: usize,
}

impl PulsePolicy {
    pub fn new(sequence: Vec<u32>) -> Self {
        Self { sequence, step: 0 }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    fn at(&self, step: usize) -> Option<u32> {
        if self.sequence.is_empty() {
            return None;
        }
        self.sequence.get(step % self.sequence.len()).copied()
    }

    /// Target for the current step. The action is relative to the
    /// previous entry of the cycle, so the first step of `[1, 2, 3, 2]`
    /// reads as `2 → 1`.
    pub fn decide(&self, cluster: &str) -> Option<ScaleDecision> {
        let target = self.at(self.step)?;
        let len = self.sequence.len();
        let from = self.at(self.step % len + len - 1)?;
        let action = match target.cmp(&from) {
            std::cmp::Ordering::Greater => ScaleAction::Up,
            std::cmp::Ordering::Less => ScaleAction::Down,
            std::cmp::Ordering::Equal => ScaleAction::None,
        };
        Some(ScaleDecision {
            cluster: cluster.to_string(),
            from,
            target,
            action,
        })
    }

    pub fn advance(&mut self) {
        self.step = self.step.wrapping_add(1);
    }
}

/// The configured policy, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Threshold(ThresholdPolicy),
    RateAveraged(RateAveragedPolicy),
    Pulse(PulsePolicy),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Threshold(_) => "threshold",
            Policy::RateAveraged(_) => "rate_averaged",
            Policy::Pulse(_) => "pulse",
        }
    }
}

impl From<&PolicyConfig> for Policy {
    fn from(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::Threshold {
                unit,
                max_instances,
            } => Policy::Threshold(ThresholdPolicy {
                bounds: StepBounds {
                    unit: *unit,
                    max_instances: *max_instances,
                },
            }),
            PolicyConfig::RateAveraged {
                unit,
                max_instances,
                reps,
                sample_interval,
                external_metric,
                internal_metric,
                external_ceiling,
                external_floor,
                internal_ceiling,
                internal_floor,
            } => Policy::RateAveraged(RateAveragedPolicy {
                bounds: StepBounds {
                    unit: *unit,
                    max_instances: *max_instances,
                },
                external: RateBand {
                    floor: *external_floor,
                    ceiling: *external_ceiling,
                },
                internal: RateBand {
                    floor: *internal_floor,
                    ceiling: *internal_ceiling,
                },
                reps: *reps,
                sample_interval: *sample_interval,
                external_metric: external_metric.clone(),
                internal_metric: internal_metric.clone(),
            }),
            PolicyConfig::Pulse { sequence } => Policy::Pulse(PulsePolicy::new(sequence.clone())),
        }
    }
}
