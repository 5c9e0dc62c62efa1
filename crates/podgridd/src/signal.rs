//! `control/signal` delivery across cluster patterns.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use podgrid_core::{Operation, PodIdentity};
use podgrid_fanout::{FanoutGateway, FanoutRequest};

/// Replies merged over every pattern a payload was sent to.
#[derive(Debug, Default)]
pub struct SignalReport {
    /// Pods that answered, successfully or not.
    total: usize,
    /// Bodies of the successful replies.
    merged: BTreeMap<PodIdentity, Value>,
}

impl SignalReport {
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn replied(&self) -> usize {
        self.merged.len()
    }

    pub fn pct(&self) -> usize {
        if self.total == 0 {
            return 0;
        }
        self.merged.len() * 100 / self.total
    }

    pub fn to_text(&self) -> String {
        format!("{}% replies, pinged {} pods", self.pct(), self.replied())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.merged)
    }
}

/// Send `payload` to every pod of each pattern. An unreachable pattern
/// contributes no replies.
pub async fn deliver(
    gateway: &dyn FanoutGateway,
    clusters: &[String],
    payload: &Value,
    timeout: Duration,
) -> SignalReport {
    let mut report = SignalReport::default();

    for pattern in clusters {
        let request = FanoutRequest::new(pattern.as_str(), Operation::Signal, timeout)
            .with_payload(payload.clone());
        let replies = match gateway.query(&request).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!(cluster = %pattern, error = %e, "signal delivery failed");
                continue;
            }
        };

        report.total += replies.len();
        for (id, reply) in replies {
            if reply.is_ok() {
                report.merged.insert(id, reply.body);
            }
        }
    }

    report
}
