//! Reset coordinator: one concurrent off/reset/on task per cluster.
//!
//! Tasks share nothing; each returns its [`ResetOutcome`] by value and the
//! coordinator joins them all before aggregating. A `max_concurrency`
//! bound, when configured, only limits how many run at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use podgrid_core::{Operation, PodIdentity, ResetConfig};
use podgrid_fanout::{FanoutError, FanoutGateway, FanoutRequest};

use crate::error::{ResetError, ResetResult};
use crate::report::{ResetOutcome, ResetReport};

/// What to reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub clusters: Vec<String>,
    /// Sequence indices to target; `None` means every member.
    pub subset: Option<Vec<u32>>,
    /// Required to target every member.
    pub force: bool,
}

impl ResetRequest {
    pub fn new<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clusters: clusters.into_iter().map(Into::into).collect(),
            subset: None,
            force: false,
        }
    }

    pub fn with_subset(mut self, subset: Vec<u32>) -> Self {
        self.subset = Some(subset);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn validate(&self) -> ResetResult<()> {
        if self.clusters.is_empty() {
            return Err(ResetError::NoClusters);
        }
        if self.subset.is_none() && !self.force {
            return Err(ResetError::ForceRequired);
        }
        Ok(())
    }
}

/// Why a single cluster's reset did not go through.
#[derive(Debug, Error)]
enum PhaseFailure {
    #[error("{operation} failed: {source}")]
    Fanout {
        operation: Operation,
        source: FanoutError,
    },

    #[error("no pod acknowledged {0}")]
    NoAcknowledgement(Operation),

    #[error("one or more pods did not respond to {operation} (expected {expected:?}, got {got:?})")]
    Mismatch {
        operation: Operation,
        expected: BTreeSet<PodIdentity>,
        got: BTreeSet<PodIdentity>,
    },
}

/// Runs reset requests against the fan-out layer.
pub struct ResetCoordinator {
    gateway: Arc<dyn FanoutGateway>,
    timeout: Duration,
    max_concurrency: Option<usize>,
}

impl ResetCoordinator {
    pub fn new(gateway: Arc<dyn FanoutGateway>, config: &ResetConfig) -> Self {
        Self {
            gateway,
            timeout: config.timeout,
            max_concurrency: config.max_concurrency,
        }
    }

    /// Reset every requested cluster and wait for all of them.
    ///
    /// Per-cluster failures end up in the report; only an invalid request
    /// is an error.
    pub async fn run(&self, request: &ResetRequest) -> ResetResult<ResetReport> {
        request.validate()?;

        let clusters: BTreeSet<String> = request.clusters.iter().cloned().collect();
        // Anything that never reports back counts as failed.
        let mut outcomes: BTreeMap<String, ResetOutcome> = clusters
            .iter()
            .map(|c| (c.clone(), ResetOutcome::failed()))
            .collect();

        let permits = self.max_concurrency.unwrap_or(clusters.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = JoinSet::new();

        for cluster in clusters {
            let gateway = Arc::clone(&self.gateway);
            let sem = Arc::clone(&semaphore);
            let subset = request.subset.clone();
            let timeout = self.timeout;

            tasks.spawn(async move {
                let outcome = match sem.acquire_owned().await {
                    Ok(_permit) => reset_cluster(gateway.as_ref(), &cluster, subset, timeout).await,
                    Err(_) => ResetOutcome::failed(),
                };
                (cluster, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((cluster, outcome)) => {
                    outcomes.insert(cluster, outcome);
                }
                Err(e) => warn!(error = %e, "reset task panicked"),
            }
        }

        let report = ResetReport::new(outcomes);
        if report.succeeded() {
            info!(
                clusters = report.outcomes().len(),
                pods = report.reset_count(),
                "reset complete"
            );
        } else {
            warn!(
                success_pct = report.success_pct(),
                pods = report.reset_count(),
                "reset incomplete"
            );
        }
        Ok(report)
    }
}

async fn reset_cluster(
    gateway: &dyn FanoutGateway,
    cluster: &str,
    subset: Option<Vec<u32>>,
    timeout: Duration,
) -> ResetOutcome {
    match run_phases(gateway, cluster, subset, timeout).await {
        Ok(pods) => {
            debug!(cluster = %cluster, pods = pods.len(), "cluster reset");
            ResetOutcome::succeeded(&pods)
        }
        Err(e) => {
            debug!(cluster = %cluster, error = %e, "failed to reset");
            ResetOutcome::failed()
        }
    }
}

async fn run_phases(
    gateway: &dyn FanoutGateway,
    cluster: &str,
    subset: Option<Vec<u32>>,
    timeout: Duration,
) -> Result<BTreeSet<PodIdentity>, PhaseFailure> {
    let off = phase(gateway, cluster, Operation::Off, &subset, timeout).await?;
    if off.is_empty() {
        return Err(PhaseFailure::NoAcknowledgement(Operation::Off));
    }

    for operation in [Operation::Reset, Operation::On] {
        let acked = phase(gateway, cluster, operation, &subset, timeout).await?;
        if acked != off {
            return Err(PhaseFailure::Mismatch {
                operation,
                expected: off,
                got: acked,
            });
        }
    }
    Ok(off)
}

/// Pods that acknowledged `operation`, keyed by group and sequence number
/// since one pattern can match several groups reusing the same indices.
async fn phase(
    gateway: &dyn FanoutGateway,
    cluster: &str,
    operation: Operation,
    subset: &Option<Vec<u32>>,
    timeout: Duration,
) -> Result<BTreeSet<PodIdentity>, PhaseFailure> {
    let request = FanoutRequest::new(cluster, operation, timeout).with_subset(subset.clone());
    let replies = gateway
        .query(&request)
        .await
        .map_err(|source| PhaseFailure::Fanout { operation, source })?;

    Ok(replies
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, r)| PodIdentity::new(id.group.clone(), r.seq))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgrid_fanout::MemoryGateway;

    fn coordinator(gw: &Arc<MemoryGateway>, max_concurrency: Option<usize>) -> ResetCoordinator {
        ResetCoordinator::new(
            gw.clone(),
            &ResetConfig {
                max_concurrency,
                timeout: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn whole_cluster_reset_requires_force() {
        assert_eq!(
            ResetRequest::new(["web"]).validate(),
            Err(ResetError::ForceRequired)
        );
        assert!(ResetRequest::new(["web"]).forced().validate().is_ok());
        assert!(ResetRequest::new(["web"]).with_subset(vec![0]).validate().is_ok());
        assert_eq!(
            ResetRequest::new(Vec::<String>::new()).forced().validate(),
            Err(ResetError::NoClusters)
        );
    }

    #[tokio::test]
    async fn rejected_request_touches_nothing() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        let result = coordinator(&gw, None).run(&ResetRequest::new(["web"])).await;
        assert_eq!(result, Err(ResetError::ForceRequired));
        assert!(gw.requests().is_empty());
    }

    #[tokio::test]
    async fn all_phases_agree() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web"]).forced())
            .await
            .unwrap();

        let outcome = report.outcome("web").unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.reset, vec![0, 1]);
        assert!(report.succeeded());

        let ops: Vec<Operation> = gw.requests().iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec![Operation::Off, Operation::Reset, Operation::On]);
        assert!(gw.pods().values().all(|p| p.process == "running"));
    }

    #[tokio::test]
    async fn missing_power_on_ack_fails_cluster() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        gw.fail_operation("web", 1, Operation::On);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web"]).forced())
            .await
            .unwrap();

        assert_eq!(report.outcome("web"), Some(&ResetOutcome::failed()));
        assert_eq!(report.to_text(), "0% success (0 pods reset)");
    }

    #[tokio::test]
    async fn reset_mismatch_stops_before_power_on() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        gw.fail_operation("web", 0, Operation::Reset);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web"]).forced())
            .await
            .unwrap();

        assert!(!report.succeeded());
        let ops: Vec<Operation> = gw.requests().iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec![Operation::Off, Operation::Reset]);
    }

    #[tokio::test]
    async fn subset_is_forwarded_to_every_phase() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 3);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web"]).with_subset(vec![2]))
            .await
            .unwrap();

        assert_eq!(report.outcome("web").unwrap().reset, vec![2]);
        assert!(gw.requests().iter().all(|r| r.subset == Some(vec![2])));
        assert_eq!(gw.pods()[&podgrid_core::PodIdentity::new("web", 0)].process, "running");
    }

    #[tokio::test]
    async fn empty_cluster_is_a_failure() {
        let gw = Arc::new(MemoryGateway::new());
        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["ghost"]).forced())
            .await
            .unwrap();
        assert_eq!(report.outcome("ghost"), Some(&ResetOutcome::failed()));
        assert_eq!(report.success_pct(), 0);
    }

    #[tokio::test]
    async fn clusters_are_isolated_and_aggregated() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        gw.add_group("db", 1);
        gw.add_group("cache", 3);
        gw.fail_operation("cache", 2, Operation::Off);
        gw.fail_operation("cache", 2, Operation::Reset);
        gw.fail_operation("cache", 2, Operation::On);
        gw.fail_operation("db", 0, Operation::Reset);

        let report = coordinator(&gw, Some(1))
            .run(&ResetRequest::new(["web", "db", "cache", "web"]).forced())
            .await
            .unwrap();

        assert_eq!(report.outcomes().len(), 3);
        // cache: index 2 failed every phase, so the sets still agree.
        assert_eq!(report.outcome("cache").unwrap().reset, vec![0, 1]);
        assert!(!report.outcome("db").unwrap().ok);
        assert_eq!(report.success_pct(), 66);
        assert_eq!(report.to_text(), "66% success (4 pods reset)");
    }

    fn two_group_fleet() -> Arc<MemoryGateway> {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web-a", 2);
        gw.add_group("web-b", 2);
        gw
    }

    #[tokio::test]
    async fn glob_over_two_groups_counts_every_pod() {
        let gw = two_group_fleet();

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web-*"]).forced())
            .await
            .unwrap();

        let outcome = report.outcome("web-*").unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.reset, vec![0, 0, 1, 1]);
        assert_eq!(report.to_text(), "100% success (4 pods reset)");
    }

    #[tokio::test]
    async fn glob_over_two_groups_notices_one_missing_pod() {
        let gw = two_group_fleet();
        gw.fail_operation("web-b", 0, Operation::On);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web-*"]).forced())
            .await
            .unwrap();

        assert_eq!(report.outcome("web-*"), Some(&ResetOutcome::failed()));
        assert_eq!(report.to_text(), "0% success (0 pods reset)");
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn unreachable_gateway_fails_every_cluster() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        gw.set_offline(true);

        let report = coordinator(&gw, None)
            .run(&ResetRequest::new(["web"]).forced())
            .await
            .unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.reset_count(), 0);
    }
}
