//! Per-group health state machine.
//!
//! Each poll classifies every group of a cluster pattern against its
//! previous record:
//!
//! ```text
//! down == 0, up unchanged         → STABLE    allowance refilled
//! down == 0, up changed           → ACTIVE    allowance refilled
//! down  > 0, (up, down) changed   → ACTIVE    allowance refilled
//! down  > 0, (up, down) unchanged → STAGNANT  allowance - 1
//! group missing from the poll     → ABSENT    allowance = 0, up = down = 0
//! ```
//!
//! Alerts are only raised when the period closes.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use podgrid_core::{PodStatus, PollSnapshot};

/// How a group behaved on its latest poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Stable,
    Active,
    Stagnant,
    Absent,
}

/// Health record for one group.
#[derive(Debug, Clone)]
pub struct GroupHealth {
    remaining_checks: u32,
    last_snapshot: PollSnapshot,
    activity: Activity,
    up: u32,
    down: u32,
    /// Snapshot captured when the last alert fired.
    alerted: Option<PollSnapshot>,
}

impl GroupHealth {
    fn fresh(checks: u32, snapshot: PollSnapshot, up: u32, down: u32) -> Self {
        Self {
            remaining_checks: checks,
            last_snapshot: snapshot,
            activity: if down == 0 {
                Activity::Stable
            } else {
                Activity::Active
            },
            up,
            down,
            alerted: None,
        }
    }

    pub fn remaining_checks(&self) -> u32 {
        self.remaining_checks
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn up(&self) -> u32 {
        self.up
    }

    pub fn down(&self) -> u32 {
        self.down
    }

    pub fn last_snapshot(&self) -> &PollSnapshot {
        &self.last_snapshot
    }
}

/// Raised at period close for a group whose allowance ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAlert {
    pub group: String,
    pub up: u32,
    pub down: u32,
    pub activity: Activity,
}

/// Raised when an alerted group settles back to STABLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub group: String,
    pub up: u32,
}

/// Tracks every group seen under one cluster pattern.
#[derive(Debug)]
pub struct HealthTracker {
    checks: u32,
    allowed: HashSet<String>,
    groups: BTreeMap<String, GroupHealth>,
}

impl HealthTracker {
    /// `checks` is the per-period allowance; `allowed` lists the process
    /// states counted as up.
    pub fn new<I, S>(checks: u32, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            checks,
            allowed: allowed.into_iter().map(Into::into).collect(),
            groups: BTreeMap::new(),
        }
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }

    pub fn group(&self, name: &str) -> Option<&GroupHealth> {
        self.groups.get(name)
    }

    pub fn activity(&self, name: &str) -> Option<Activity> {
        self.groups.get(name).map(GroupHealth::activity)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &GroupHealth)> {
        self.groups.iter().map(|(name, g)| (name.as_str(), g))
    }

    /// Up/down counts for one group. A pod that answered with an error
    /// code is not running an allowed state, so it counts as down.
    fn count(&self, snapshot: &PollSnapshot) -> (u32, u32) {
        snapshot
            .values()
            .fold((0, 0), |(up, down), status| match status {
                PodStatus::Process(p) if self.allowed.contains(p) => (up + 1, down),
                PodStatus::Process(_) | PodStatus::Failed(_) => (up, down + 1),
            })
    }

    /// Feed one poll of the whole cluster pattern.
    pub fn observe(&mut self, snapshot: &PollSnapshot) -> Vec<Recovery> {
        let mut by_group: BTreeMap<String, PollSnapshot> = BTreeMap::new();
        for (id, status) in snapshot {
            by_group
                .entry(id.group.clone())
                .or_default()
                .insert(id.clone(), status.clone());
        }

        let mut recoveries = Vec::new();

        for (name, current) in by_group.iter() {
            let (up, down) = self.count(current);
            let checks = self.checks;

            let known = self
                .groups
                .get(name)
                .is_some_and(|g| g.activity != Activity::Absent);
            if !known {
                // First sighting, or back from ABSENT: start over.
                debug!(group = %name, up, down, "tracking group");
                self.groups.insert(
                    name.clone(),
                    GroupHealth::fresh(checks, current.clone(), up, down),
                );
                continue;
            }
            let Some(record) = self.groups.get_mut(name) else {
                continue;
            };

            let previous = record.activity;
            if down == 0 {
                record.activity = if up == record.up {
                    Activity::Stable
                } else {
                    Activity::Active
                };
                record.remaining_checks = checks;
            } else if (up, down) != (record.up, record.down) {
                record.activity = Activity::Active;
                record.remaining_checks = checks;
            } else {
                record.activity = Activity::Stagnant;
                record.remaining_checks = record.remaining_checks.saturating_sub(1);
            }

            if record.activity == Activity::Stable
                && previous != Activity::Stable
                && record.alerted.as_ref().is_some_and(|a| a != current)
            {
                info!(group = %name, up, "group changed status; health OK");
                record.alerted = None;
                recoveries.push(Recovery {
                    group: name.clone(),
                    up,
                });
            }

            record.up = up;
            record.down = down;
            record.last_snapshot = current.clone();
        }

        for (name, record) in self.groups.iter_mut() {
            if by_group.contains_key(name) || record.activity == Activity::Absent {
                continue;
            }
            debug!(group = %name, "group absent from poll");
            record.activity = Activity::Absent;
            record.remaining_checks = 0;
            record.up = 0;
            record.down = 0;
            record.last_snapshot.clear();
        }

        recoveries
    }

    /// Close the period: alert every group whose allowance ran out, then
    /// refill the allowance. Absent groups are alerted once and dropped.
    pub fn close_period(&mut self) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        for (name, record) in self.groups.iter_mut() {
            if record.remaining_checks == 0 {
                warn!(
                    group = %name,
                    up = record.up,
                    down = record.down,
                    checks = self.checks,
                    activity = ?record.activity,
                    "health checks FAILED"
                );
                record.alerted = Some(record.last_snapshot.clone());
                alerts.push(HealthAlert {
                    group: name.clone(),
                    up: record.up,
                    down: record.down,
                    activity: record.activity,
                });
            }
            if record.activity != Activity::Absent {
                record.remaining_checks = self.checks;
            }
        }

        self.groups
            .retain(|_, record| record.activity != Activity::Absent);
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgrid_core::PodIdentity;

    fn poll(group: &str, states: &[&str]) -> PollSnapshot {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    PodIdentity::new(group, i as u32),
                    PodStatus::Process(s.to_string()),
                )
            })
            .collect()
    }

    fn tracker(checks: u32) -> HealthTracker {
        HealthTracker::new(checks, ["running"])
    }

    fn assert_bounded(t: &HealthTracker) {
        for (_, g) in t.groups() {
            assert!(g.remaining_checks() <= t.checks());
        }
    }

    #[test]
    fn healthy_group_stays_stable() {
        let mut t = tracker(3);
        let snap = poll("web", &["running", "running", "running"]);

        assert!(t.observe(&snap).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Stable));

        assert!(t.observe(&snap).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Stable));
        assert_eq!(t.group("web").unwrap().remaining_checks(), 3);
        assert!(t.close_period().is_empty());
    }

    #[test]
    fn stagnant_group_alerts_when_allowance_runs_out() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["running", "running", "running"]));

        let degraded = poll("web", &["running", "dead", "dead"]);
        t.observe(&degraded);
        assert_eq!(t.activity("web"), Some(Activity::Active));

        for expected in [2, 1, 0] {
            t.observe(&degraded);
            assert_eq!(t.activity("web"), Some(Activity::Stagnant));
            assert_eq!(t.group("web").unwrap().remaining_checks(), expected);
            assert_bounded(&t);
        }

        let alerts = t.close_period();
        assert_eq!(
            alerts,
            vec![HealthAlert {
                group: "web".into(),
                up: 1,
                down: 2,
                activity: Activity::Stagnant,
            }]
        );
        // Allowance is a per-period budget.
        assert_eq!(t.group("web").unwrap().remaining_checks(), 3);
    }

    #[test]
    fn allowance_never_goes_negative() {
        let mut t = tracker(2);
        let degraded = poll("web", &["dead"]);
        for _ in 0..6 {
            t.observe(&degraded);
            assert_bounded(&t);
        }
        assert_eq!(t.group("web").unwrap().remaining_checks(), 0);
    }

    #[test]
    fn changing_unhealthy_group_refills_allowance() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["dead", "dead", "running"]));
        t.observe(&poll("web", &["dead", "dead", "running"]));
        assert_eq!(t.group("web").unwrap().remaining_checks(), 2);

        t.observe(&poll("web", &["dead", "running", "running"]));
        assert_eq!(t.activity("web"), Some(Activity::Active));
        assert_eq!(t.group("web").unwrap().remaining_checks(), 3);
    }

    #[test]
    fn scale_up_is_active_not_alerting() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["running"]));
        t.observe(&poll("web", &["running", "running"]));
        assert_eq!(t.activity("web"), Some(Activity::Active));
        assert!(t.close_period().is_empty());
    }

    fn unreachable(group: &str, pods: u32) -> PollSnapshot {
        (0..pods)
            .map(|i| (PodIdentity::new(group, i), PodStatus::Failed(503)))
            .collect()
    }

    #[test]
    fn failed_pods_count_as_down() {
        let mut t = tracker(3);
        let mut snap = poll("web", &["running", "running"]);
        snap.insert(PodIdentity::new("web", 2), PodStatus::Failed(500));
        t.observe(&snap);
        let g = t.group("web").unwrap();
        assert_eq!((g.up(), g.down()), (2, 1));
        assert_eq!(g.activity(), Activity::Active);
    }

    #[test]
    fn alerted_group_going_unreachable_keeps_alerting() {
        let mut t = tracker(1);
        let degraded = poll("web", &["running", "dead"]);
        t.observe(&degraded);
        t.observe(&degraded);
        assert_eq!(t.close_period().len(), 1);

        let dark = unreachable("web", 2);
        assert!(t.observe(&dark).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Active));
        assert!(t.observe(&dark).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Stagnant));

        assert_eq!(
            t.close_period(),
            vec![HealthAlert {
                group: "web".into(),
                up: 0,
                down: 2,
                activity: Activity::Stagnant,
            }]
        );
    }

    #[test]
    fn missing_group_goes_absent_then_reinitializes() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["running", "running"]));
        t.observe(&poll("db", &["running"]));

        let web = t.group("web").unwrap();
        assert_eq!(web.activity(), Activity::Absent);
        assert_eq!((web.up(), web.down(), web.remaining_checks()), (0, 0, 0));

        t.observe(&poll("web", &["running"]));
        let web = t.group("web").unwrap();
        assert_eq!(web.remaining_checks(), 3);
        assert_eq!(web.activity(), Activity::Stable);
    }

    #[test]
    fn absent_group_alerts_once_and_is_dropped() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["running"]));
        t.observe(&PollSnapshot::new());

        let alerts = t.close_period();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].activity, Activity::Absent);
        assert_eq!((alerts[0].up, alerts[0].down), (0, 0));
        assert!(t.group("web").is_none());

        t.observe(&PollSnapshot::new());
        assert!(t.close_period().is_empty());
    }

    #[test]
    fn recovery_after_alert() {
        let mut t = tracker(1);
        let degraded = poll("web", &["running", "dead"]);
        t.observe(&degraded);
        t.observe(&degraded);
        assert_eq!(t.close_period().len(), 1);

        // Pod comes back: counts change first, then settle.
        let healthy = poll("web", &["running", "running"]);
        assert!(t.observe(&healthy).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Active));

        let recoveries = t.observe(&healthy);
        assert_eq!(
            recoveries,
            vec![Recovery {
                group: "web".into(),
                up: 2
            }]
        );

        // Only once.
        assert!(t.observe(&healthy).is_empty());
    }

    #[test]
    fn no_recovery_without_prior_alert() {
        let mut t = tracker(3);
        t.observe(&poll("web", &["running", "dead"]));
        t.observe(&poll("web", &["running", "running"]));
        assert!(t.observe(&poll("web", &["running", "running"])).is_empty());
        assert_eq!(t.activity("web"), Some(Activity::Stable));
    }

    #[test]
    fn groups_are_tracked_independently() {
        let mut t = tracker(1);
        let mut snap = poll("web", &["dead"]);
        snap.extend(poll("db", &["running"]));
        t.observe(&snap);
        t.observe(&snap);

        let alerts = t.close_period();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].group, "web");
        assert_eq!(t.activity("db"), Some(Activity::Stable));
    }
}
