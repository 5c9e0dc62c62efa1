//! Gateway trait and request type.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use podgrid_core::{Operation, Replies, ScaleReport};

/// Result type alias for gateway calls.
pub type FanoutResult<T> = Result<T, FanoutError>;

/// Boxed future returned by gateway calls.
pub type FanoutFuture<'a, T> = Pin<Box<dyn Future<Output = FanoutResult<T>> + Send + 'a>>;

/// Top-level failure of a fan-out call. Per-pod failures are not errors;
/// they come back as replies with a non-200 code.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("communication with the fan-out layer failed: {0}")]
    Transport(String),

    #[error("fan-out layer answered with HTTP {0}")]
    Status(u16),

    #[error("undecodable fan-out response: {0}")]
    Decode(String),

    #[error("fan-out call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid cluster pattern {0:?}")]
    InvalidPattern(String),
}

/// One logical request broadcast to every pod matching `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanoutRequest {
    pub pattern: String,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Restrict the call to these sequence indices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset: Option<Vec<u32>>,
    #[serde(skip)]
    pub timeout: Duration,
}

impl FanoutRequest {
    pub fn new(pattern: impl Into<String>, operation: Operation, timeout: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            operation,
            payload: None,
            subset: None,
            timeout,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_subset(mut self, subset: Option<Vec<u32>>) -> Self {
        self.subset = subset;
        self
    }
}

/// The fan-out layer as seen by the control loops.
///
/// Pods that miss the timeout are simply absent from the replies. An `Err`
/// means the whole call failed and callers skip the cycle.
pub trait FanoutGateway: Send + Sync {
    /// Broadcast `request` and collect the replies.
    fn query<'a>(&'a self, request: &'a FanoutRequest) -> FanoutFuture<'a, Replies>;

    /// Ask the fan-out layer to resize every group matching `pattern`.
    fn scale<'a>(
        &'a self,
        pattern: &'a str,
        instances: u32,
        timeout: Duration,
    ) -> FanoutFuture<'a, ScaleReport>;
}
