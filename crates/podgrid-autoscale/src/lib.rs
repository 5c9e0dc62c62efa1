//! podgrid-autoscale: bounded, step-wise cluster scaling.
//!
//! Polls the `metrics` fan-out for every configured cluster, feeds the
//! result to one of three policies, and publishes any change through the
//! gateway's scale operation.
//!
//! # Policies
//!
//! ```text
//! threshold:      stressed > n/2 and n + unit <= max  → n + unit
//!                 stressed < n/2 and n > unit         → n - unit
//!
//! rate_averaged:  ext/n > ext_ceiling and int/n > int_ceiling and n + unit <= max → n + unit
//!                 ext/n < ext_floor   and int/n < int_floor   and n > unit        → n - unit
//!                 (ext, int averaged over `reps` samples, `sample_interval` apart)
//!
//! pulse:          1, 2, 3, 2, 1, 2, ... one step per period, metrics ignored
//! ```
//!
//! Empty clusters are never scaled. After a rate-averaged action the next
//! sleep is halved so the controller re-checks sooner.

pub mod policy;
pub mod scaler;

pub use policy::{
    Policy, PulsePolicy, RateAveragedPolicy, RateBand, RateSample, RunningAverage, ScaleAction,
    ScaleDecision, StepBounds, ThresholdPolicy,
};
pub use scaler::{is_stressed, Autoscaler};
