//! Watcher: the health control loop.
//!
//! One watcher owns every tracker and churn detector for the process. A
//! period is `checks + 1` polls, each followed by a `wait` sleep, after
//! which the period closes, the report is published, and the loop sleeps
//! for `period`. Clusters are polled one after another; a slow fan-out
//! delays everything behind it.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use podgrid_core::{snapshot_from_replies, Operation, WatchConfig};
use podgrid_fanout::{FanoutGateway, FanoutRequest};

use crate::churn::ChurnDetector;
use crate::report::HealthReport;
use crate::tracker::HealthTracker;

/// Per-pattern state.
#[derive(Debug)]
struct ClusterWatch {
    health: HealthTracker,
    churn: ChurnDetector,
}

/// Drives health polling for every watched cluster pattern.
pub struct Watcher {
    gateway: Arc<dyn FanoutGateway>,
    config: WatchConfig,
    clusters: BTreeMap<String, ClusterWatch>,
}

impl Watcher {
    pub fn new(gateway: Arc<dyn FanoutGateway>, config: WatchConfig) -> Self {
        Self {
            gateway,
            config,
            clusters: BTreeMap::new(),
        }
    }

    /// Tracker for a cluster pattern, once it has been polled successfully.
    pub fn health(&self, cluster: &str) -> Option<&HealthTracker> {
        self.clusters.get(cluster).map(|c| &c.health)
    }

    pub fn churn(&self, cluster: &str) -> Option<&ChurnDetector> {
        self.clusters.get(cluster).map(|c| &c.churn)
    }

    /// Poll every cluster once. Churn events land in `report`.
    pub async fn poll(&mut self, report: &mut HealthReport) {
        let patterns = self.config.clusters.clone();
        for pattern in &patterns {
            self.poll_cluster(pattern, report).await;
        }
    }

    async fn poll_cluster(&mut self, pattern: &str, report: &mut HealthReport) {
        let request = FanoutRequest::new(pattern, Operation::Info, self.config.timeout);

        let replies = match self.gateway.query(&request).await {
            Ok(replies) => replies,
            Err(e) => {
                // Keep the previous records untouched.
                warn!(cluster = %pattern, error = %e, "health poll skipped");
                return;
            }
        };

        let checks = self.config.checks;
        let allowed = &self.config.allowed;
        let state = self
            .clusters
            .entry(pattern.to_string())
            .or_insert_with(|| ClusterWatch {
                health: HealthTracker::new(checks, allowed.iter().cloned()),
                churn: ChurnDetector::new(),
            });

        for event in state.churn.observe(&replies) {
            report.record_churn(pattern, &event);
        }

        let snapshot = snapshot_from_replies(&replies);
        let recoveries = state.health.observe(&snapshot);
        debug!(
            cluster = %pattern,
            pods = snapshot.len(),
            recoveries = recoveries.len(),
            "health poll"
        );
    }

    /// Close the period on every tracker and fold the alerts into `report`.
    pub fn close_period(&mut self, report: &mut HealthReport) {
        for (pattern, state) in self.clusters.iter_mut() {
            for alert in state.health.close_period() {
                report.record_alert(pattern, &alert);
            }
        }
    }

    /// One full period: `checks + 1` polls with `wait` after each.
    pub async fn run_period(&mut self) -> HealthReport {
        let mut report = HealthReport::new();
        for _ in 0..=self.config.checks {
            self.poll(&mut report).await;
            tokio::time::sleep(self.config.wait).await;
        }
        self.close_period(&mut report);
        report
    }

    /// Log the report and append it to the report file, if configured.
    pub fn publish(&self, report: &HealthReport) -> anyhow::Result<()> {
        if report.is_empty() {
            debug!("health period closed without issues");
            return Ok(());
        }

        let json = report.to_json().context("serialize health report")?;
        warn!(report = %json, "health issues detected");

        if let Some(path) = &self.config.report_path {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open report file {}", path.display()))?;
            writeln!(file, "{json}")
                .with_context(|| format!("append to report file {}", path.display()))?;
        }
        Ok(())
    }

    /// Run until shutdown. Returns an error only for conditions the loop
    /// cannot recover from; transport failures are absorbed per poll.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            clusters = ?self.config.clusters,
            checks = self.config.checks,
            wait_secs = self.config.wait.as_secs(),
            period_secs = self.config.period.as_secs(),
            "health watcher started"
        );

        loop {
            let report = tokio::select! {
                report = self.run_period() => report,
                _ = shutdown.changed() => break,
            };
            self.publish(&report)?;

            tokio::select! {
                _ = tokio::time::sleep(self.config.period) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("health watcher shutting down");
        Ok(())
    }
}
