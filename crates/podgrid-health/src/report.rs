//! Published health report: `{cluster: {group: {issue: detail}}}`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};

use crate::churn::ChurnEvent;
use crate::tracker::{Activity, HealthAlert};

/// Detail carried by a `health` issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthDetail {
    pub up: u32,
    pub down: u32,
    pub activity: Activity,
}

/// Base index movement folded over a period: first `from`, latest `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BaseShift {
    from: u32,
    to: Option<u32>,
}

/// Issues raised for one group during a period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupIssues {
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_shift"
    )]
    changed_base_index: Option<BaseShift>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    lost_indices: BTreeSet<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthDetail>,
}

impl GroupIssues {
    /// `"#<from> to #<to>"` or `"#<from> to none"`.
    pub fn changed_base_index(&self) -> Option<String> {
        self.changed_base_index.map(|s| format_shift(&s))
    }

    pub fn lost_indices(&self) -> &BTreeSet<u32> {
        &self.lost_indices
    }

    pub fn health(&self) -> Option<&HealthDetail> {
        self.health.as_ref()
    }
}

fn format_shift(shift: &BaseShift) -> String {
    match shift.to {
        Some(to) => format!("#{} to #{}", shift.from, to),
        None => format!("#{} to none", shift.from),
    }
}

fn serialize_shift<S: Serializer>(shift: &Option<BaseShift>, s: S) -> Result<S::Ok, S::Error> {
    match shift {
        Some(shift) => s.serialize_str(&format_shift(shift)),
        None => s.serialize_none(),
    }
}

/// Everything worth telling an operator about one watch period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HealthReport {
    clusters: BTreeMap<String, BTreeMap<String, GroupIssues>>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    fn entry(&mut self, cluster: &str, group: &str) -> &mut GroupIssues {
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
    }

    pub fn record_churn(&mut self, cluster: &str, event: &ChurnEvent) {
        let issues = self.entry(cluster, event.group());
        match event {
            ChurnEvent::ChangedBaseIndex { from, to, .. } => {
                let from = issues.changed_base_index.map_or(*from, |s| s.from);
                issues.changed_base_index = Some(BaseShift { from, to: *to });
            }
            ChurnEvent::LostIndices { indices, .. } => {
                issues.lost_indices.extend(indices.iter().copied());
            }
        }
    }

    pub fn record_alert(&mut self, cluster: &str, alert: &HealthAlert) {
        self.entry(cluster, &alert.group).health = Some(HealthDetail {
            up: alert.up,
            down: alert.down,
            activity: alert.activity,
        });
    }

    pub fn group(&self, cluster: &str, group: &str) -> Option<&GroupIssues> {
        self.clusters.get(cluster)?.get(group)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report() {
        let report = HealthReport::new();
        assert!(report.is_empty());
        assert_eq!(report.to_json().unwrap(), "{}");
    }

    #[test]
    fn serializes_issue_map() {
        let mut report = HealthReport::new();
        report.record_churn(
            "marathon.*",
            &ChurnEvent::ChangedBaseIndex {
                group: "marathon.web".into(),
                from: 0,
                to: Some(1),
            },
        );
        report.record_churn(
            "marathon.*",
            &ChurnEvent::LostIndices {
                group: "marathon.web".into(),
                indices: vec![0],
            },
        );
        report.record_alert(
            "marathon.*",
            &HealthAlert {
                group: "marathon.db".into(),
                up: 1,
                down: 2,
                activity: Activity::Stagnant,
            },
        );

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "marathon.*": {
                    "marathon.web": {
                        "changed_base_index": "#0 to #1",
                        "lost_indices": [0]
                    },
                    "marathon.db": {
                        "health": {"up": 1, "down": 2, "activity": "stagnant"}
                    }
                }
            })
        );
    }

    #[test]
    fn repeated_shifts_keep_first_origin() {
        let mut report = HealthReport::new();
        for (from, to) in [(0, Some(1)), (1, Some(2))] {
            report.record_churn(
                "*",
                &ChurnEvent::ChangedBaseIndex {
                    group: "web".into(),
                    from,
                    to,
                },
            );
        }
        report.record_churn(
            "*",
            &ChurnEvent::LostIndices {
                group: "web".into(),
                indices: vec![0],
            },
        );
        report.record_churn(
            "*",
            &ChurnEvent::LostIndices {
                group: "web".into(),
                indices: vec![1],
            },
        );

        let issues = report.group("*", "web").unwrap();
        assert_eq!(issues.changed_base_index().as_deref(), Some("#0 to #2"));
        assert_eq!(issues.lost_indices().iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    }
}
