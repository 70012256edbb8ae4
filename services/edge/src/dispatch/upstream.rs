//! Sending rewritten requests to backend hosts.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::{Request, Response};
use thiserror::Error;

use super::forwarded::strip_hop_by_hop;

/// Time allowed to establish a backend connection (TCP + TLS).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors forwarding a request to a backend.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The client went away while its request was being forwarded.
    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("invalid outbound request: {0}")]
    InvalidRequest(String),
}

/// Sends an already-rewritten request to its backend.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, UpstreamError>;
}

/// Forwards over HTTPS with reqwest.
#[derive(Clone)]
pub struct HttpsUpstream {
    client: reqwest::Client,
}

impl HttpsUpstream {
    /// Build the backend client. With `ignore_tls_errors` set, backend
    /// certificates are not validated.
    pub fn new(ignore_tls_errors: bool) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(ignore_tls_errors)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, UpstreamError> {
        let (parts, body) = request.into_parts();

        let mut outbound = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let backend_response = match outbound.send().await {
            Ok(response) => response,
            Err(e) if inbound_body_failed(&e) => return Err(UpstreamError::ClientCancelled),
            Err(e) => return Err(e.into()),
        };

        let status = backend_response.status();
        let mut headers = backend_response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(backend_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Whether a send failed because reading the inbound request body failed,
/// which only happens when the client hung up mid-request.
fn inbound_body_failed(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if err.downcast_ref::<axum::Error>().is_some() {
            return true;
        }
        source = err.source();
    }
    false
}
