//! podgrid-fanout: the fan-out gateway contract and its adapters.
//!
//! The control loops never talk to pods directly. Every interaction is a
//! single fan-out call addressed by glob pattern, answered by whichever
//! pods replied within the timeout.
//!
//! # Adapters
//!
//! ```text
//! FanoutGateway (trait)
//!   ├── HttpGateway   → POST /fanout, /scale on the portal (HTTP/1, JSON)
//!   └── MemoryGateway → in-process fleet for tests and dry runs
//! ```
//!
//! Reply keys are parsed into [`PodIdentity`](podgrid_core::PodIdentity)
//! here and nowhere else.

pub mod gateway;
pub mod http;
pub mod memory;

pub use gateway::{FanoutError, FanoutFuture, FanoutGateway, FanoutRequest, FanoutResult};
pub use http::HttpGateway;
pub use memory::{MemoryGateway, MemoryPod};
