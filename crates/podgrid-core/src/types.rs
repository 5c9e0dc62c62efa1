//! Shared types used across podgrid crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PodIdentity;

/// Status code a pod returns when it handled a fan-out request.
pub const STATUS_OK: u16 = 200;

/// Operations understood by the pods behind the fan-out layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Health snapshot (process state, node, ip).
    #[serde(rename = "info")]
    Info,
    /// Arbitrary payload delivered to the pod's signal handler.
    #[serde(rename = "control/signal")]
    Signal,
    /// Gracefully stop the pod's sub-process.
    #[serde(rename = "control/off")]
    Off,
    /// Reset the pod's coordination state.
    #[serde(rename = "reset")]
    Reset,
    /// Restart the pod's sub-process.
    #[serde(rename = "control/on")]
    On,
    /// Per-pod stress and rate metrics.
    #[serde(rename = "metrics")]
    Metrics,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Info => "info",
            Operation::Signal => "control/signal",
            Operation::Off => "control/off",
            Operation::Reset => "reset",
            Operation::On => "control/on",
            Operation::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pod's answer to a fan-out request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodReply {
    /// Sequence number the pod reports for itself.
    pub seq: u32,
    /// Operation-specific response body.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Per-pod status code; anything but 200 is a per-pod failure.
    pub code: u16,
}

impl PodReply {
    pub fn ok(seq: u32, body: serde_json::Value) -> Self {
        Self {
            seq,
            body,
            code: STATUS_OK,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == STATUS_OK
    }
}

/// Replies from every pod that answered in time.
pub type Replies = BTreeMap<PodIdentity, PodReply>;

/// Status of one pod in a poll: its process state, or the failure code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PodStatus {
    Process(String),
    Failed(u16),
}

impl PodStatus {
    /// Derive the status from an `info` reply.
    pub fn from_reply(reply: &PodReply) -> Self {
        if !reply.is_ok() {
            return PodStatus::Failed(reply.code);
        }
        let process = reply
            .body
            .get("process")
            .and_then(|p| p.as_str())
            .unwrap_or("unknown");
        PodStatus::Process(process.to_string())
    }
}

/// Immutable per-pod status capture from a single `info` fan-out.
pub type PollSnapshot = BTreeMap<PodIdentity, PodStatus>;

/// Build a poll snapshot from raw `info` replies.
pub fn snapshot_from_replies(replies: &Replies) -> PollSnapshot {
    replies
        .iter()
        .map(|(id, reply)| (id.clone(), PodStatus::from_reply(reply)))
        .collect()
}

/// Outcome of a scale request for one group.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroupScale {
    #[serde(default)]
    pub running: u32,
    #[serde(default)]
    pub requested: u32,
    /// Present when the scale request for this group failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<serde_json::Value>,
}

/// Per-group outcome of a scale request, keyed by group name.
pub type ScaleReport = BTreeMap<String, GroupScale>;
