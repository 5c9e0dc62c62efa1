//! Autoscaler: samples cluster metrics and publishes scale requests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use podgrid_core::{AutoscaleConfig, Operation, Replies, ScaleReport};
use podgrid_fanout::{FanoutGateway, FanoutRequest};

use crate::policy::{
    Policy, RateAveragedPolicy, RateSample, RunningAverage, ScaleAction, ScaleDecision,
    ThresholdPolicy,
};

/// Whether a pod's metrics body reports it as stressed.
///
/// Pods report either a boolean or the strings `"Very"` / `"true"`.
pub fn is_stressed(body: &Value) -> bool {
    match body.get("stressed") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "Very" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Sum of a numeric metric over the successful replies. Pods with a
/// missing or non-numeric value are left out; `None` if none had one.
fn metric_total(replies: &Replies, key: &str) -> Option<f64> {
    replies
        .values()
        .filter(|r| r.is_ok())
        .filter_map(|r| r.body.get(key).and_then(Value::as_f64))
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn members(replies: &Replies) -> u32 {
    let count = replies.values().filter(|r| r.is_ok()).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Groups that answered. Scale targets are absolute per group, so a
/// decision made over replies from several groups would be wrong for
/// each of them.
fn group_count(replies: &Replies) -> usize {
    replies
        .keys()
        .map(|id| id.group.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn spans_one_group(cluster: &str, replies: &Replies) -> bool {
    let groups = group_count(replies);
    if groups > 1 {
        warn!(cluster = %cluster, groups, "pattern matches several groups; skipping");
        return false;
    }
    true
}

/// Drives one policy over every configured cluster.
pub struct Autoscaler {
    gateway: Arc<dyn FanoutGateway>,
    config: AutoscaleConfig,
    policy: Policy,
    /// Set after a rate-averaged action; halves the next sleep.
    cooldown: bool,
}

impl Autoscaler {
    pub fn new(gateway: Arc<dyn FanoutGateway>, config: AutoscaleConfig) -> Self {
        let policy = Policy::from(&config.policy);
        Self {
            gateway,
            config,
            policy,
            cooldown: false,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn cooldown(&self) -> bool {
        self.cooldown
    }

    /// Sleep before the next evaluation round.
    pub fn next_sleep(&self) -> Duration {
        if self.cooldown {
            self.config.period / 2
        } else {
            self.config.period
        }
    }

    async fn metrics(&self, cluster: &str) -> Option<Replies> {
        let request = FanoutRequest::new(cluster, Operation::Metrics, self.config.timeout);
        match self.gateway.query(&request).await {
            Ok(replies) => Some(replies),
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "metrics collection failed");
                None
            }
        }
    }

    async fn evaluate_threshold(
        &self,
        policy: &ThresholdPolicy,
        cluster: &str,
    ) -> Option<ScaleDecision> {
        let replies = self.metrics(cluster).await?;
        if !spans_one_group(cluster, &replies) {
            return None;
        }
        let current = members(&replies);
        if current == 0 {
            debug!(cluster = %cluster, "no members answered; skipping");
            return None;
        }
        let stressed = replies
            .values()
            .filter(|r| r.is_ok() && is_stressed(&r.body))
            .count();
        let stressed = u32::try_from(stressed).unwrap_or(u32::MAX);

        debug!(cluster = %cluster, current, stressed, "threshold sample");
        Some(policy.decide(cluster, stressed, current))
    }

    async fn evaluate_rates(
        &self,
        policy: &RateAveragedPolicy,
        cluster: &str,
    ) -> Option<ScaleDecision> {
        let mut external = RunningAverage::default();
        let mut internal = RunningAverage::default();
        let mut current = 0;

        for _ in 0..policy.reps {
            tokio::time::sleep(policy.sample_interval).await;
            let Some(replies) = self.metrics(cluster).await else {
                continue;
            };
            if !spans_one_group(cluster, &replies) {
                return None;
            }
            current = members(&replies);
            if let Some(total) = metric_total(&replies, &policy.external_metric) {
                external.push(total);
            }
            if let Some(total) = metric_total(&replies, &policy.internal_metric) {
                internal.push(total);
            }
        }

        if current == 0 {
            debug!(cluster = %cluster, "no members answered; skipping");
            return None;
        }
        let (Some(external), Some(internal)) = (external.value(), internal.value()) else {
            warn!(
                cluster = %cluster,
                external_metric = %policy.external_metric,
                internal_metric = %policy.internal_metric,
                "no usable rate samples; skipping"
            );
            return None;
        };

        debug!(cluster = %cluster, current, external, internal, "averaged rates");
        Some(policy.decide(cluster, &RateSample { external, internal }, current))
    }

    /// Issue the scale request and log how it went.
    pub async fn publish(&self, decision: &ScaleDecision) -> Option<ScaleReport> {
        let cluster = &decision.cluster;
        match self
            .gateway
            .scale(cluster, decision.target, self.config.timeout)
            .await
        {
            Ok(report) => {
                log_scale_report(cluster, &report);
                Some(report)
            }
            Err(e) => {
                warn!(
                    cluster = %cluster,
                    target = decision.target,
                    error = %e,
                    "communication with the fan-out layer failed while scaling"
                );
                None
            }
        }
    }

    /// Evaluate every cluster once, publishing each change.
    ///
    /// Clusters that could not be sampled, or have no members, produce no
    /// decision.
    pub async fn evaluate_all(&mut self) -> Vec<ScaleDecision> {
        let clusters = self.config.clusters.clone();
        let mut decisions = Vec::new();

        for cluster in &clusters {
            let decision = match &self.policy {
                Policy::Threshold(p) => self.evaluate_threshold(p, cluster).await,
                Policy::RateAveraged(p) => self.evaluate_rates(p, cluster).await,
                Policy::Pulse(p) => p.decide(cluster),
            };
            let Some(decision) = decision else {
                continue;
            };

            // Pulse targets are absolute and always sent.
            let publish = decision.is_change() || matches!(self.policy, Policy::Pulse(_));
            if publish {
                debug!(
                    cluster = %cluster,
                    from = decision.from,
                    target = decision.target,
                    action = ?decision.action,
                    "scaling"
                );
                self.publish(&decision).await;
            }
            decisions.push(decision);
        }

        match &mut self.policy {
            Policy::RateAveraged(_) => {
                self.cooldown = decisions.iter().any(ScaleDecision::is_change);
            }
            Policy::Pulse(p) => p.advance(),
            Policy::Threshold(_) => {}
        }

        decisions
    }

    /// Run the autoscaler loop: sleep, then evaluate, until shutdown.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            clusters = ?self.config.clusters,
            policy = self.policy.name(),
            period_secs = self.config.period.as_secs(),
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_sleep()) => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                decisions = self.evaluate_all() => {
                    let changed = decisions.iter().filter(|d| d.action != ScaleAction::None).count();
                    debug!(evaluated = decisions.len(), changed, "autoscale round complete");
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("autoscaler shutting down");
    }
}

fn log_scale_report(cluster: &str, report: &ScaleReport) {
    if report.values().any(|g| g.failed.is_some()) {
        warn!(cluster = %cluster, report = ?report, "scaling failed");
        return;
    }
    for (name, group) in report {
        info!(
            cluster = %cluster,
            group = %name,
            running = group.running,
            requested = group.requested,
            "scaled: {}/{} pods running",
            group.running,
            group.requested
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use podgrid_core::PolicyConfig;
    use podgrid_fanout::MemoryGateway;

    fn config(clusters: &[&str], policy: PolicyConfig) -> AutoscaleConfig {
        AutoscaleConfig {
            clusters: clusters.iter().map(|c| c.to_string()).collect(),
            period: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            policy,
        }
    }

    fn threshold() -> PolicyConfig {
        PolicyConfig::Threshold {
            unit: 1,
            max_instances: 4,
        }
    }

    fn rates() -> PolicyConfig {
        PolicyConfig::RateAveraged {
            unit: 1,
            max_instances: 4,
            reps: 3,
            sample_interval: Duration::from_secs(1),
            external_metric: "sessions".into(),
            internal_metric: "inflight".into(),
            external_ceiling: 20.0,
            external_floor: 5.0,
            internal_ceiling: 4.0,
            internal_floor: 1.0,
        }
    }

    fn stress(gw: &MemoryGateway, group: &str, flags: &[bool]) {
        for (i, flag) in flags.iter().enumerate() {
            let value = if *flag { "Very" } else { "Nope" };
            gw.set_metrics(group, i as u32, json!({ "stressed": value }));
        }
    }

    #[test]
    fn stressed_flag_forms() {
        assert!(is_stressed(&json!({"stressed": "Very"})));
        assert!(is_stressed(&json!({"stressed": true})));
        assert!(is_stressed(&json!({"stressed": "TRUE"})));
        assert!(!is_stressed(&json!({"stressed": "Nope"})));
        assert!(!is_stressed(&json!({"stressed": 1})));
        assert!(!is_stressed(&json!({})));
    }

    #[test]
    fn metric_total_skips_malformed_values() {
        let mut replies = Replies::new();
        replies.insert(
            podgrid_core::PodIdentity::new("web", 0),
            podgrid_core::PodReply::ok(0, json!({"sessions": 10})),
        );
        replies.insert(
            podgrid_core::PodIdentity::new("web", 1),
            podgrid_core::PodReply::ok(1, json!({"sessions": "lots"})),
        );
        assert_eq!(metric_total(&replies, "sessions"), Some(10.0));
        assert_eq!(metric_total(&replies, "inflight"), None);
    }

    #[tokio::test]
    async fn threshold_scales_up_stressed_cluster() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        stress(&gw, "web", &[true, true]);

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        let decisions = scaler.evaluate_all().await;

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, ScaleAction::Up);
        assert_eq!(gw.scale_requests(), vec![("web".to_string(), 3)]);
        assert_eq!(gw.group_size("web"), 3);
    }

    #[tokio::test]
    async fn threshold_at_capacity_publishes_nothing() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 4);
        stress(&gw, "web", &[true, true, true, false]);

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        let decisions = scaler.evaluate_all().await;

        assert_eq!(decisions, vec![ScaleDecision::hold("web", 4)]);
        assert!(gw.scale_requests().is_empty());
    }

    #[tokio::test]
    async fn threshold_scales_down_idle_cluster() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 3);
        stress(&gw, "web", &[false, false, false]);

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        scaler.evaluate_all().await;

        assert_eq!(gw.scale_requests(), vec![("web".to_string(), 2)]);
        assert_eq!(gw.group_size("web"), 2);
    }

    #[tokio::test]
    async fn empty_or_unreachable_clusters_are_skipped() {
        let gw = Arc::new(MemoryGateway::new());
        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        assert!(scaler.evaluate_all().await.is_empty());

        gw.add_group("web", 2);
        gw.set_offline(true);
        assert!(scaler.evaluate_all().await.is_empty());
        assert_eq!(gw.scale_requests(), Vec::<(String, u32)>::new());
    }

    #[tokio::test]
    async fn failed_members_do_not_count() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 3);
        stress(&gw, "web", &[true, false, false]);
        gw.fail_operation("web", 1, Operation::Metrics);
        gw.fail_operation("web", 2, Operation::Metrics);

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        let decisions = scaler.evaluate_all().await;

        // One member answered and it is stressed; 1 + 1 <= 4.
        assert_eq!(decisions[0].from, 1);
        assert_eq!(decisions[0].target, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pattern_over_several_groups_is_not_scaled() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web-a", 2);
        gw.add_group("web-b", 2);
        stress(&gw, "web-a", &[false, false]);
        stress(&gw, "web-b", &[false, false]);

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web-*"], threshold()));
        assert!(scaler.evaluate_all().await.is_empty());

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web-*"], rates()));
        assert!(scaler.evaluate_all().await.is_empty());

        assert!(gw.scale_requests().is_empty());
        assert_eq!((gw.group_size("web-a"), gw.group_size("web-b")), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_policy_scales_and_enters_cooldown() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        for i in 0..2 {
            gw.set_metrics("web", i, json!({"sessions": 50.0, "inflight": 10}));
        }

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], rates()));
        let decisions = scaler.evaluate_all().await;

        assert_eq!(decisions[0].action, ScaleAction::Up);
        assert_eq!(gw.scale_requests(), vec![("web".to_string(), 3)]);
        assert!(scaler.cooldown());
        assert_eq!(scaler.next_sleep(), Duration::from_secs(15));
        // reps samples of the metrics operation.
        assert_eq!(gw.requests().len(), 3);

        // Per-member rates now sit inside the band.
        for i in 0..3 {
            gw.set_metrics("web", i, json!({"sessions": 10.0, "inflight": 2}));
        }
        let decisions = scaler.evaluate_all().await;
        assert_eq!(decisions[0].action, ScaleAction::None);
        assert!(!scaler.cooldown());
        assert_eq!(scaler.next_sleep(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_policy_skips_without_usable_samples() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        gw.set_metrics("web", 0, json!({"sessions": "n/a"}));

        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], rates()));
        assert!(scaler.evaluate_all().await.is_empty());
        assert!(gw.scale_requests().is_empty());
    }

    #[tokio::test]
    async fn pulse_walks_sequence_once_per_round() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 1);
        gw.add_group("db", 1);

        let pulse = PolicyConfig::Pulse {
            sequence: vec![1, 2, 3, 2],
        };
        let mut scaler = Autoscaler::new(gw.clone(), config(&["web", "db"], pulse));
        for _ in 0..4 {
            scaler.evaluate_all().await;
        }

        let web: Vec<u32> = gw
            .scale_requests()
            .into_iter()
            .filter(|(p, _)| p == "web")
            .map(|(_, n)| n)
            .collect();
        assert_eq!(web, vec![1, 2, 3, 2]);
        assert_eq!(gw.group_size("db"), 2);
        // Pulse never samples metrics.
        assert!(gw.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_scale_is_reported_not_fatal() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        stress(&gw, "web", &[true, true]);
        gw.fail_scale("web");

        let scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        let decision = ScaleDecision {
            cluster: "web".into(),
            from: 2,
            target: 3,
            action: ScaleAction::Up,
        };
        let report = scaler.publish(&decision).await.unwrap();
        assert!(report["web"].failed.is_some());
        assert_eq!(gw.group_size("web"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_group("web", 2);
        stress(&gw, "web", &[true, true]);

        let (tx, rx) = watch::channel(false);
        let mut scaler = Autoscaler::new(gw.clone(), config(&["web"], threshold()));
        let handle = tokio::spawn(async move {
            scaler.run(rx).await;
            scaler
        });

        tokio::time::sleep(Duration::from_secs(45)).await;
        tx.send(true).unwrap();
        let scaler = handle.await.unwrap();

        assert!(!scaler.cooldown());
        assert_eq!(gw.scale_requests(), vec![("web".to_string(), 3)]);
    }
}
