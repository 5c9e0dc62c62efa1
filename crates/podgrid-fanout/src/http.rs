//! HTTP adapter to the fan-out portal.
//!
//! The portal exposes two JSON endpoints:
//!
//! - `POST /fanout` with `{pattern, operation, payload?, subset?, timeout_ms}`,
//!   answered by `{"<group> #<index>": {seq, body, code}, ...}`
//! - `POST /scale` with `{pattern, instances}`, answered by
//!   `{"<group>": {running, requested} | {failed}, ...}`

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use podgrid_core::{PodIdentity, PodReply, Replies, ScaleReport};

use crate::gateway::{FanoutError, FanoutFuture, FanoutGateway, FanoutRequest, FanoutResult};

#[derive(Serialize)]
struct FanoutBody<'a> {
    #[serde(flatten)]
    request: &'a FanoutRequest,
    timeout_ms: u64,
}

#[derive(Serialize)]
struct ScaleBody<'a> {
    pattern: &'a str,
    instances: u32,
}

/// Talks to the portal over plain HTTP/1.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    /// `host:port` of the portal.
    address: String,
    /// Floor for the overall request deadline.
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Vec<u8>,
        deadline: Duration,
    ) -> FanoutResult<T> {
        match tokio::time::timeout(deadline, self.exchange(path, body)).await {
            Ok(result) => {
                let bytes = result?;
                serde_json::from_slice(&bytes).map_err(|e| FanoutError::Decode(e.to_string()))
            }
            Err(_) => Err(FanoutError::Timeout(deadline)),
        }
    }

    async fn exchange(&self, path: &str, body: Vec<u8>) -> FanoutResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(self.address.as_str())
            .await
            .map_err(|e| FanoutError::Transport(format!("connect {}: {e}", self.address)))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FanoutError::Transport(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, %address, "portal connection closed");
            }
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(path)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "podgrid/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FanoutError::Transport(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| FanoutError::Transport(format!("request {path}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FanoutError::Transport(format!("read {path}: {e}")))?
            .to_bytes();

        if !status.is_success() {
            debug!(%status, %path, "portal returned non-2xx");
            return Err(FanoutError::Status(status.as_u16()));
        }

        Ok(bytes)
    }
}

/// Parse raw reply keys, dropping the ones that are not pod identities.
fn parse_replies(raw: BTreeMap<String, PodReply>) -> Replies {
    raw.into_iter()
        .filter_map(|(key, reply)| match PodIdentity::parse(&key) {
            Ok(id) => Some((id, reply)),
            Err(e) => {
                warn!(error = %e, "ignoring reply with malformed pod identity");
                None
            }
        })
        .collect()
}

impl FanoutGateway for HttpGateway {
    fn query<'a>(&'a self, request: &'a FanoutRequest) -> FanoutFuture<'a, Replies> {
        Box::pin(async move {
            let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
            let body = serde_json::to_vec(&FanoutBody {
                request,
                timeout_ms,
            })
            .map_err(|e| FanoutError::Decode(e.to_string()))?;

            let deadline = self.timeout.max(request.timeout);
            let raw: BTreeMap<String, PodReply> =
                self.post_json("/fanout", body, deadline).await?;

            debug!(
                pattern = %request.pattern,
                operation = %request.operation,
                replies = raw.len(),
                "fan-out complete"
            );
            Ok(parse_replies(raw))
        })
    }

    fn scale<'a>(
        &'a self,
        pattern: &'a str,
        instances: u32,
        timeout: Duration,
    ) -> FanoutFuture<'a, ScaleReport> {
        Box::pin(async move {
            let body = serde_json::to_vec(&ScaleBody { pattern, instances })
                .map_err(|e| FanoutError::Decode(e.to_string()))?;
            self.post_json("/scale", body, self.timeout.max(timeout)).await
        })
    }
}
