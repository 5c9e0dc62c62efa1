//! podgrid-core: shared vocabulary for the podgrid control loops.
//!
//! Every other crate consumes pods through [`PodIdentity`], which is parsed
//! exactly once from the `"<group> #<index>"` wire form at the gateway
//! boundary. Configuration lives in [`PodgridConfig`].

pub mod config;
pub mod error;
pub mod identity;
pub mod types;

pub use config::{
    parse_duration, AutoscaleConfig, GatewayConfig, PodgridConfig, PolicyConfig, ResetConfig,
    WatchConfig,
};
pub use error::{ConfigError, ConfigResult, IdentityError};
pub use identity::PodIdentity;
pub use types::*;
