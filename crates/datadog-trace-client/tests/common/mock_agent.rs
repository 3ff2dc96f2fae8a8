// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock trace agent for testing the export pipeline end to end.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Captures every request and answers 200 with a fixed body.
#[derive(Clone)]
pub struct MockAgentServer {
    received_requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    response_body: String,
}

impl MockAgentServer {
    fn new(response_body: &str) -> Self {
        MockAgentServer {
            received_requests: Arc::new(Mutex::new(Vec::new())),
            response_body: response_body.to_string(),
        }
    }

    /// Starts a mock agent on a random TCP port; returns it and its URL.
    pub async fn start(response_body: &str) -> (Self, String) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock agent");
        let addr = listener.local_addr().expect("failed to get local addr");

        let server = MockAgentServer::new(response_body);
        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => accept.serve_connection(stream),
                    Err(_) => break,
                }
            }
        });

        (server, format!("http://{addr}"))
    }

    /// Starts a mock agent on a Unix socket at `path`.
    #[cfg(unix)]
    pub fn start_uds(response_body: &str, path: &Path) -> Self {
        let listener = UnixListener::bind(path).expect("failed to bind unix socket");

        let server = MockAgentServer::new(response_body);
        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => accept.serve_connection(stream),
                    Err(_) => break,
                }
            }
        });

        server
    }

    fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let requests = self.received_requests.clone();
        let response_body = self.response_body.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let requests = requests.clone();
                let response_body = response_body.clone();
                async move {
                    let method = req.method().to_string();
                    let path = req.uri().path().to_string();
                    let headers: Vec<(String, String)> = req
                        .headers()
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                        .collect();

                    let body = req
                        .into_body()
                        .collect()
                        .await
                        .map(|collected| collected.to_bytes().to_vec())
                        .unwrap_or_default();

                    requests.lock().unwrap().push(ReceivedRequest {
                        method,
                        path,
                        headers,
                        body,
                    });

                    Ok::<_, hyper::http::Error>(
                        Response::builder()
                            .status(200)
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from(response_body)))
                            .unwrap(),
                    )
                }
            });

            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });
    }

    /// All requests received so far.
    pub fn get_requests(&self) -> Vec<ReceivedRequest> {
        self.received_requests.lock().unwrap().clone()
    }

    /// Polls until `count` requests arrived; panics after `timeout`.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<ReceivedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let requests = self.get_requests();
            if requests.len() >= count {
                return requests;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} agent requests, saw {}",
                requests.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
