//! Per-cluster reset outcomes and their aggregate.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use podgrid_core::PodIdentity;

/// How one cluster fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub ok: bool,
    /// Sequence index of every pod that went through all three phases,
    /// one entry per pod; empty unless `ok`.
    pub reset: Vec<u32>,
}

impl ResetOutcome {
    pub fn succeeded(pods: &BTreeSet<PodIdentity>) -> Self {
        let mut reset: Vec<u32> = pods.iter().map(|p| p.index).collect();
        reset.sort_unstable();
        Self { ok: true, reset }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            reset: Vec::new(),
        }
    }
}

/// Outcome of a whole reset request, keyed by cluster pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResetReport {
    outcomes: BTreeMap<String, ResetOutcome>,
}

impl ResetReport {
    pub fn new(outcomes: BTreeMap<String, ResetOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &BTreeMap<String, ResetOutcome> {
        &self.outcomes
    }

    pub fn outcome(&self, cluster: &str) -> Option<&ResetOutcome> {
        self.outcomes.get(cluster)
    }

    /// Integer percentage of clusters reset successfully; 0 for no clusters.
    pub fn success_pct(&self) -> u32 {
        let total = self.outcomes.len();
        if total == 0 {
            return 0;
        }
        let ok = self.outcomes.values().filter(|o| o.ok).count();
        (100 * ok / total) as u32
    }

    /// Pods reset across all clusters.
    pub fn reset_count(&self) -> usize {
        self.outcomes.values().map(|o| o.reset.len()).sum()
    }

    pub fn succeeded(&self) -> bool {
        self.success_pct() == 100
    }

    pub fn to_text(&self) -> String {
        format!(
            "{}% success ({} pods reset)",
            self.success_pct(),
            self.reset_count()
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
