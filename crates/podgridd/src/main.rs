//! podgridd: the podgrid fleet control daemon.
//!
//! One binary, one subcommand per control loop:
//! - `watch`: health state machine + identity churn, periodic reports
//! - `autoscale`: threshold / rate-averaged / pulse scaling
//! - `reset`: coordinated off/reset/on across clusters
//! - `signal`: deliver a JSON payload to every pod of some clusters
//!
//! # Usage
//!
//! ```text
//! podgridd --config podgrid.toml watch --clusters 'marathon.*'
//! podgridd reset web -i 0 1
//! podgridd --dry-run signal '{"reload": true}' web
//! ```

mod signal;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use podgrid_autoscale::Autoscaler;
use podgrid_core::PodgridConfig;
use podgrid_fanout::{FanoutGateway, HttpGateway, MemoryGateway};
use podgrid_health::Watcher;
use podgrid_reset::{ResetCoordinator, ResetRequest};

/// Loaded when `--config` is not given and the file exists.
const DEFAULT_CONFIG: &str = "podgrid.toml";

/// Pods per group in the `--dry-run` fleet.
const DRY_RUN_GROUP_SIZE: u32 = 3;

#[derive(Parser)]
#[command(name = "podgridd", about = "podgrid fleet control daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run against an in-memory fleet instead of the fan-out portal.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Watch cluster health and identity churn until interrupted.
    Watch {
        /// Cluster patterns to watch (overrides the config file).
        #[arg(long, value_delimiter = ',')]
        clusters: Vec<String>,
    },

    /// Autoscale clusters until interrupted.
    Autoscale {
        /// Cluster patterns to scale (overrides the config file).
        #[arg(long, value_delimiter = ',')]
        clusters: Vec<String>,
    },

    /// Power-cycle pods: off, reset, then on.
    Reset {
        /// 1+ cluster patterns.
        #[arg(default_value = "*")]
        clusters: Vec<String>,

        /// Only reset these sequence indices.
        #[arg(short = 'i', long = "indices", num_args = 1..)]
        indices: Option<Vec<u32>>,

        /// Allow resetting every pod when no indices are given.
        #[arg(long)]
        force: bool,

        /// Print the outcome as JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Send a JSON payload to every pod of the given clusters.
    Signal {
        /// Verbatim JSON, or a path to a JSON file with --file.
        payload: String,

        /// 1+ cluster patterns.
        #[arg(default_value = "*")]
        clusters: Vec<String>,

        /// Read the payload from the file named by PAYLOAD.
        #[arg(short = 'f', long)]
        file: bool,

        /// Print the merged replies as JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Watch { clusters } => {
            let mut watch_config = config.watch.clone();
            if !clusters.is_empty() {
                watch_config.clusters = clusters;
            }
            let gateway = build_gateway(&config, cli.dry_run, &watch_config.clusters);
            Watcher::new(gateway, watch_config)
                .run(shutdown_signal())
                .await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Autoscale { clusters } => {
            let mut autoscale = config.autoscale.clone();
            if !clusters.is_empty() {
                autoscale.clusters = clusters;
            }
            if autoscale.clusters.is_empty() {
                anyhow::bail!("no clusters to autoscale (use --clusters or [autoscale] clusters)");
            }
            let gateway = build_gateway(&config, cli.dry_run, &autoscale.clusters);
            Autoscaler::new(gateway, autoscale)
                .run(shutdown_signal())
                .await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Reset {
            clusters,
            indices,
            force,
            json,
        } => {
            let gateway = build_gateway(&config, cli.dry_run, &clusters);
            let request = ResetRequest {
                clusters,
                subset: indices,
                force,
            };
            let report = ResetCoordinator::new(gateway, &config.reset)
                .run(&request)
                .await?;

            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.to_text());
            }
            Ok(if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Signal {
            payload,
            clusters,
            file,
            json,
        } => {
            let payload = parse_payload(&payload, file)?;
            let gateway = build_gateway(&config, cli.dry_run, &clusters);
            let report = signal::deliver(
                gateway.as_ref(),
                &clusters,
                &payload,
                config.gateway.timeout,
            )
            .await;

            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{}", report.to_text());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,podgrid=debug"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PodgridConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => {
            info!("no configuration file, using defaults");
            return Ok(PodgridConfig::default());
        }
    };
    let config = PodgridConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn parse_payload(raw: &str, from_file: bool) -> anyhow::Result<serde_json::Value> {
    if from_file {
        let content =
            std::fs::read_to_string(raw).with_context(|| format!("unable to read {raw}"))?;
        return serde_json::from_str(&content).with_context(|| format!("{raw} is not valid JSON"));
    }
    serde_json::from_str(raw).context("payload is not valid JSON (use --file for a file)")
}

/// The portal client, or an in-memory fleet seeded with one group per
/// literal cluster name when `dry_run` is set.
fn build_gateway(
    config: &PodgridConfig,
    dry_run: bool,
    clusters: &[String],
) -> Arc<dyn FanoutGateway> {
    if !dry_run {
        info!(address = %config.gateway.address, "using fan-out portal");
        return Arc::new(HttpGateway::new(
            config.gateway.address.clone(),
            config.gateway.timeout,
        ));
    }

    let fleet = MemoryGateway::new();
    for cluster in clusters {
        if cluster.contains(['*', '?']) {
            warn!(cluster = %cluster, "dry run cannot seed glob patterns");
            continue;
        }
        fleet.add_group(cluster, DRY_RUN_GROUP_SIZE);
    }
    info!(groups = clusters.len(), "dry run against an in-memory fleet");
    Arc::new(fleet)
}

/// Flips to `true` on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for ctrl-c");
            // Keep the sender alive so the loops keep running.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}
