//! podgrid-health: health watching and churn detection for pod clusters.
//!
//! Polls every watched cluster pattern with the `info` fan-out, classifies
//! each group with a small state machine, and reports groups that stayed
//! unhealthy without change for a whole period. Alongside, the churn
//! detector flags groups whose identity set shifted in ways ordinary
//! scaling never produces.
//!
//! # Architecture
//!
//! ```text
//! Watcher (one per process, owns all per-group state)
//!   ├── per period: checks + 1 polls, `wait` after each, then `period`
//!   ├── per cluster pattern
//!   │   ├── HealthTracker  (STABLE / ACTIVE / STAGNANT / ABSENT, check allowance)
//!   │   └── ChurnDetector  (base index shifts, lost indices)
//!   └── HealthReport → log + optional JSON-lines file
//! ```
//!
//! # Hysteresis
//!
//! The allowance of `checks` is only spent while a group is unhealthy and
//! unchanged. Any change resets it, so a group in the middle of a deploy
//! never alerts. The allowance is refilled at the end of every period.

pub mod churn;
pub mod monitor;
pub mod report;
pub mod tracker;

pub use churn::{ChurnDetector, ChurnEvent};
pub use monitor::Watcher;
pub use report::{GroupIssues, HealthDetail, HealthReport};
pub use tracker::{Activity, GroupHealth, HealthAlert, HealthTracker, Recovery};
