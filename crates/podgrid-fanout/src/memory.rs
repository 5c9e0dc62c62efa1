//! In-memory fleet behind the gateway contract.
//!
//! Pods are addressed by glob pattern over their group name (`*` and `?`).
//! Lifecycle operations mutate the pod's process state, scale requests add
//! or remove the highest indices, and individual pod/operation pairs can be
//! made to fail so the control loops see per-pod failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use podgrid_core::{GroupScale, Operation, PodIdentity, PodReply, Replies, ScaleReport};

use crate::gateway::{FanoutError, FanoutFuture, FanoutGateway, FanoutRequest, FanoutResult};

/// State of one simulated pod.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPod {
    /// Process state reported by `info`.
    pub process: String,
    /// Body returned by `metrics`.
    pub metrics: Value,
}

impl MemoryPod {
    pub fn running() -> Self {
        Self {
            process: "running".to_string(),
            metrics: json!({}),
        }
    }
}

#[derive(Debug, Default)]
struct Fleet {
    pods: BTreeMap<PodIdentity, MemoryPod>,
    failing: HashSet<(PodIdentity, Operation)>,
    failing_scale: HashSet<String>,
    offline: bool,
    requests: Vec<FanoutRequest>,
    scales: Vec<(String, u32)>,
}

/// A fleet that lives entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    fleet: Mutex<Fleet>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a running pod.
    pub fn add_pod(&self, group: &str, index: u32) {
        self.fleet()
            .pods
            .insert(PodIdentity::new(group, index), MemoryPod::running());
    }

    /// Add running pods `0..count` to a group.
    pub fn add_group(&self, group: &str, count: u32) {
        for index in 0..count {
            self.add_pod(group, index);
        }
    }

    pub fn remove_pod(&self, group: &str, index: u32) {
        self.fleet().pods.remove(&PodIdentity::new(group, index));
    }

    pub fn set_process(&self, group: &str, index: u32, process: &str) {
        if let Some(pod) = self.fleet().pods.get_mut(&PodIdentity::new(group, index)) {
            pod.process = process.to_string();
        }
    }

    pub fn set_metrics(&self, group: &str, index: u32, metrics: Value) {
        if let Some(pod) = self.fleet().pods.get_mut(&PodIdentity::new(group, index)) {
            pod.metrics = metrics;
        }
    }

    /// Make one pod answer `operation` with a 500.
    pub fn fail_operation(&self, group: &str, index: u32, operation: Operation) {
        self.fleet()
            .failing
            .insert((PodIdentity::new(group, index), operation));
    }

    /// Mark scale requests for `group` as failed.
    pub fn fail_scale(&self, group: &str) {
        self.fleet().failing_scale.insert(group.to_string());
    }

    pub fn clear_failures(&self) {
        let mut fleet = self.fleet();
        fleet.failing.clear();
        fleet.failing_scale.clear();
    }

    /// While offline every call fails at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.fleet().offline = offline;
    }

    pub fn pods(&self) -> BTreeMap<PodIdentity, MemoryPod> {
        self.fleet().pods.clone()
    }

    /// Number of pods currently in `group`.
    pub fn group_size(&self, group: &str) -> usize {
        self.fleet().pods.keys().filter(|id| id.group == group).count()
    }

    /// Every fan-out request seen so far, in order.
    pub fn requests(&self) -> Vec<FanoutRequest> {
        self.fleet().requests.clone()
    }

    /// Every scale request seen so far as `(pattern, instances)`.
    pub fn scale_requests(&self) -> Vec<(String, u32)> {
        self.fleet().scales.clone()
    }

    fn answer(&self, request: &FanoutRequest) -> FanoutResult<Replies> {
        let matcher = glob_matcher(&request.pattern)?;
        let mut fleet = self.fleet();
        fleet.requests.push(request.clone());

        if fleet.offline {
            return Err(FanoutError::Transport("gateway offline".into()));
        }

        let targets: Vec<PodIdentity> = fleet
            .pods
            .keys()
            .filter(|id| matcher.is_match(&id.group))
            .filter(|id| {
                request
                    .subset
                    .as_ref()
                    .is_none_or(|subset| subset.contains(&id.index))
            })
            .cloned()
            .collect();

        let mut replies = Replies::new();
        for id in targets {
            if fleet.failing.contains(&(id.clone(), request.operation)) {
                replies.insert(
                    id.clone(),
                    PodReply {
                        seq: id.index,
                        body: json!({}),
                        code: 500,
                    },
                );
                continue;
            }

            let Some(pod) = fleet.pods.get_mut(&id) else {
                continue;
            };
            let body = match request.operation {
                Operation::Info => json!({ "process": pod.process }),
                Operation::Metrics => pod.metrics.clone(),
                Operation::Signal => request.payload.clone().unwrap_or(Value::Null),
                Operation::Off => {
                    pod.process = "stopped".to_string();
                    json!({})
                }
                Operation::On => {
                    pod.process = "running".to_string();
                    json!({})
                }
                Operation::Reset => json!({}),
            };
            replies.insert(id.clone(), PodReply::ok(id.index, body));
        }

        debug!(
            pattern = %request.pattern,
            operation = %request.operation,
            replies = replies.len(),
            "in-memory fan-out"
        );
        Ok(replies)
    }

    fn resize(&self, pattern: &str, instances: u32) -> FanoutResult<ScaleReport> {
        let matcher = glob_matcher(pattern)?;
        let mut fleet = self.fleet();
        fleet.scales.push((pattern.to_string(), instances));

        if fleet.offline {
            return Err(FanoutError::Transport("gateway offline".into()));
        }

        let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for id in fleet.pods.keys().filter(|id| matcher.is_match(&id.group)) {
            groups.entry(id.group.clone()).or_default().push(id.index);
        }

        let mut report = ScaleReport::new();
        for (group, mut indices) in groups {
            if fleet.failing_scale.contains(&group) {
                report.insert(
                    group,
                    GroupScale {
                        failed: Some(json!(true)),
                        ..Default::default()
                    },
                );
                continue;
            }

            indices.sort_unstable();
            let target = instances as usize;
            // Scaling only ever appends or removes the highest indices.
            while indices.len() > target {
                if let Some(top) = indices.pop() {
                    fleet.pods.remove(&PodIdentity::new(group.as_str(), top));
                }
            }
            let mut next = indices.last().map_or(0, |top| top + 1);
            while indices.len() < target {
                fleet
                    .pods
                    .insert(PodIdentity::new(group.as_str(), next), MemoryPod::running());
                indices.push(next);
                next += 1;
            }

            report.insert(
                group,
                GroupScale {
                    running: instances,
                    requested: instances,
                    failed: None,
                },
            );
        }

        Ok(report)
    }
}

impl FanoutGateway for MemoryGateway {
    fn query<'a>(&'a self, request: &'a FanoutRequest) -> FanoutFuture<'a, Replies> {
        Box::pin(async move { self.answer(request) })
    }

    fn scale<'a>(
        &'a self,
        pattern: &'a str,
        instances: u32,
        _timeout: Duration,
    ) -> FanoutFuture<'a, ScaleReport> {
        Box::pin(async move { self.resize(pattern, instances) })
    }
}

/// Compile a cluster glob (`*`, `?`) into an anchored regex.
fn glob_matcher(pattern: &str) -> FanoutResult<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|_| FanoutError::InvalidPattern(pattern.to_string()))
}
