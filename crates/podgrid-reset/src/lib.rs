//! podgrid-reset: coordinated power-off / reset / power-on across clusters.
//!
//! One task per requested cluster pattern runs the three phases in order
//! over the same pattern and index subset. A cluster only counts as reset
//! when every phase was acknowledged by exactly the same, non-empty set of
//! sequence indices. The aggregate succeeds only when every cluster did.

pub mod coordinator;
pub mod error;
pub mod report;

pub use coordinator::{ResetCoordinator, ResetRequest};
pub use error::{ResetError, ResetResult};
pub use report::{ResetOutcome, ResetReport};
