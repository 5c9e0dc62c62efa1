//! Identity churn detection.
//!
//! Ordinary scaling only appends or removes the highest sequence indices.
//! A group whose lowest index disappears, or whose indices vanish from the
//! middle, was replaced underneath us.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::warn;

use podgrid_core::Replies;

/// Something unexpected happened to a group's identity set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChurnEvent {
    /// The previous lowest index is gone. `to` is `None` when the whole
    /// group vanished.
    ChangedBaseIndex {
        group: String,
        from: u32,
        to: Option<u32>,
    },
    /// Indices seen last time and missing now.
    LostIndices { group: String, indices: Vec<u32> },
}

impl ChurnEvent {
    pub fn group(&self) -> &str {
        match self {
            ChurnEvent::ChangedBaseIndex { group, .. } | ChurnEvent::LostIndices { group, .. } => {
                group
            }
        }
    }

    /// Report key for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ChurnEvent::ChangedBaseIndex { .. } => "changed_base_index",
            ChurnEvent::LostIndices { .. } => "lost_indices",
        }
    }

    /// Human-readable detail: `"#0 to #1"`, `"#0 to none"`, `"[0, 3]"`.
    pub fn detail(&self) -> String {
        match self {
            ChurnEvent::ChangedBaseIndex { from, to, .. } => match to {
                Some(to) => format!("#{from} to #{to}"),
                None => format!("#{from} to none"),
            },
            ChurnEvent::LostIndices { indices, .. } => format!("{indices:?}"),
        }
    }
}

impl fmt::Display for ChurnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.group(), self.kind(), self.detail())
    }
}

/// Known sequence indices per group, for one cluster pattern.
#[derive(Debug, Default)]
pub struct ChurnDetector {
    groups: BTreeMap<String, BTreeSet<u32>>,
}

impl ChurnDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indices(&self, group: &str) -> Option<&BTreeSet<u32>> {
        self.groups.get(group)
    }

    /// Compare one group's current indices with what was known.
    pub fn observe_group(&mut self, group: &str, current: BTreeSet<u32>) -> Vec<ChurnEvent> {
        if !self.groups.contains_key(group) {
            self.groups.insert(group.to_string(), current);
            return Vec::new();
        }
        let Some(previous) = self.groups.get_mut(group) else {
            return Vec::new();
        };

        let mut events = Vec::new();

        if let Some(&base) = previous.first()
            && !current.contains(&base)
        {
            events.push(ChurnEvent::ChangedBaseIndex {
                group: group.to_string(),
                from: base,
                to: current.first().copied(),
            });
        }

        let lost: Vec<u32> = previous.difference(&current).copied().collect();
        if !lost.is_empty() {
            events.push(ChurnEvent::LostIndices {
                group: group.to_string(),
                indices: lost,
            });
        }

        *previous = current;
        events
    }

    /// Drop a group that disappeared from the poll entirely.
    pub fn forget(&mut self, group: &str) -> Vec<ChurnEvent> {
        let Some(previous) = self.groups.remove(group) else {
            return Vec::new();
        };

        let mut events = vec![ChurnEvent::LostIndices {
            group: group.to_string(),
            indices: previous.iter().copied().collect(),
        }];
        if let Some(&base) = previous.first() {
            events.push(ChurnEvent::ChangedBaseIndex {
                group: group.to_string(),
                from: base,
                to: None,
            });
        }
        events
    }

    /// Feed the raw replies of one poll.
    ///
    /// Only successful replies contribute indices. A group that answered
    /// with nothing but failures keeps its previous record.
    pub fn observe(&mut self, replies: &Replies) -> Vec<ChurnEvent> {
        let mut present: BTreeSet<&str> = BTreeSet::new();
        let mut seen: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();

        for (id, reply) in replies {
            present.insert(id.group.as_str());
            if reply.is_ok() {
                seen.entry(id.group.as_str()).or_default().insert(id.index);
            }
        }

        let mut events = Vec::new();
        for (group, indices) in seen {
            events.extend(self.observe_group(group, indices));
        }

        let vanished: Vec<String> = self
            .groups
            .keys()
            .filter(|g| !present.contains(g.as_str()))
            .cloned()
            .collect();
        for group in vanished {
            events.extend(self.forget(&group));
        }

        for event in &events {
            warn!(group = %event.group(), kind = event.kind(), detail = %event.detail(), "identity churn");
        }
        events
    }
}
