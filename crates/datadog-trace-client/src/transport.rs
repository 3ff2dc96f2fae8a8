// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport to the trace agent.
//!
//! The agent listens on either a TCP port or a Unix Domain Socket; the
//! configured URL's scheme picks the transport ([`AgentEndpoint`]). Exports
//! are `PUT /v0.4/traces` requests carrying the msgpack body plus the
//! standard Datadog meta headers, sent over a fresh http1 connection per
//! flush. [`AgentClient`] is the seam the writer talks through, so tests can
//! substitute an in-memory agent.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::TRACER_VERSION;

/// Path the agent expects trace payloads on.
pub(crate) const TRACE_ENDPOINT_PATH: &str = "/v0.4/traces";

/// Compiler version reported in `Datadog-Meta-Lang-Version`.
const LANG_VERSION: &str = env!("RUSTC_VERSION");

/// Transport-level failure while talking to the agent.
///
/// These never reach instrumented code: the writer logs them and drops the
/// batch (at-most-once delivery).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The configured agent URL could not be understood.
    #[error("invalid agent URL: {0}")]
    InvalidUrl(String),

    /// Connecting to the agent failed.
    #[error("connection to trace agent failed: {0}")]
    Connect(#[source] std::io::Error),

    /// The HTTP exchange failed mid-flight.
    #[error("trace agent request failed: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built.
    #[error("failed to build trace agent request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The agent answered with a non-success status.
    #[error("trace agent responded with status {0}")]
    Status(StatusCode),

    /// The request did not complete within the flush timeout.
    #[error("trace agent request timed out after {0:?}")]
    Timeout(Duration),

    /// Unix socket transport requested on a platform without support.
    #[error("unix socket transport is not supported on this platform")]
    UnixUnsupported,
}

/// Where the trace agent lives: a TCP host/port or a Unix socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentEndpoint {
    /// Plain HTTP over TCP.
    Http(Uri),
    /// HTTP over a Unix Domain Socket.
    Unix(PathBuf),
}

impl AgentEndpoint {
    /// Parses a configured URL. `unix://` selects the Unix socket transport;
    /// `http`/`https` select TCP.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidUrl(url.to_string()));
            }
            return Ok(AgentEndpoint::Unix(PathBuf::from(path)));
        }
        let uri: Uri = url
            .parse()
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        match uri.scheme_str() {
            Some("http" | "https") if uri.host().is_some() => Ok(AgentEndpoint::Http(uri)),
            _ => Err(TransportError::InvalidUrl(url.to_string())),
        }
    }
}

impl std::fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentEndpoint::Http(uri) => write!(f, "{uri}"),
            AgentEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// The writer's view of the agent: send one framed batch, get the response
/// body back.
#[async_trait]
pub trait AgentClient {
    /// Sends a framed batch of `trace_count` traces and returns the agent's
    /// response body on success.
    async fn send_traces(&self, body: Bytes, trace_count: usize) -> Result<Bytes, TransportError>;
}

/// Real agent client speaking http1 over TCP or UDS.
#[derive(Clone, Debug)]
pub struct HttpAgentClient {
    endpoint: AgentEndpoint,
    timeout: Duration,
}

impl HttpAgentClient {
    /// Creates a client for the given endpoint. `timeout` caps the whole
    /// request, connect included.
    #[must_use]
    pub fn new(endpoint: AgentEndpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    async fn request(&self, body: Bytes, trace_count: usize) -> Result<Bytes, TransportError> {
        let response = match &self.endpoint {
            AgentEndpoint::Http(uri) => {
                let authority = uri
                    .authority()
                    .ok_or_else(|| TransportError::InvalidUrl(uri.to_string()))?;
                let host = authority.host();
                let port = uri.port_u16().unwrap_or(8126);
                let stream = TcpStream::connect((host, port))
                    .await
                    .map_err(TransportError::Connect)?;
                let request = build_request(authority.as_str(), body, trace_count)?;
                exchange(stream, request).await?
            }
            #[cfg(unix)]
            AgentEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(TransportError::Connect)?;
                let request = build_request("localhost", body, trace_count)?;
                exchange(stream, request).await?
            }
            #[cfg(not(unix))]
            AgentEndpoint::Unix(_) => return Err(TransportError::UnixUnsupported),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(bytes)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send_traces(&self, body: Bytes, trace_count: usize) -> Result<Bytes, TransportError> {
        match tokio::time::timeout(self.timeout, self.request(body, trace_count)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

/// Builds the `PUT /v0.4/traces` request with the Datadog meta headers.
fn build_request(
    host: &str,
    body: Bytes,
    trace_count: usize,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let request = Request::builder()
        .method(Method::PUT)
        .uri(TRACE_ENDPOINT_PATH)
        .header(HOST, host)
        .header(CONTENT_TYPE, "application/msgpack")
        .header("Datadog-Meta-Lang", "rust")
        .header("Datadog-Meta-Lang-Version", LANG_VERSION)
        .header("Datadog-Meta-Lang-Interpreter", "rustc")
        .header("Datadog-Meta-Tracer-Version", TRACER_VERSION)
        .header("X-Datadog-Trace-Count", trace_count.to_string())
        .body(Full::new(body))?;
    Ok(request)
}

/// Performs one http1 exchange over a fresh connection.
async fn exchange<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("trace agent connection closed with error: {err}");
        }
    });
    let response = sender.send_request(request).await?;
    Ok(response)
}
