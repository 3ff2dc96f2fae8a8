// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-crate test doubles shared by the unit tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::{AgentClient, TransportError};
use crate::{Config, Tracer};

/// One request the mock agent received.
#[derive(Clone, Debug)]
pub(crate) struct SentRequest {
    pub(crate) trace_count: usize,
    pub(crate) body: Bytes,
}

/// In-memory agent: records every batch and answers with a canned response
/// (or a connection failure).
pub(crate) struct MockAgent {
    requests: Mutex<Vec<SentRequest>>,
    response: Option<String>,
}

impl MockAgent {
    /// Agent answering with an empty rate table.
    pub(crate) fn ok() -> Arc<Self> {
        Self::with_response(r#"{"rate_by_service":{}}"#)
    }

    /// Agent answering every request with `body`.
    pub(crate) fn with_response(body: &str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response: Some(body.to_string()),
        })
    }

    /// Agent refusing every connection.
    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response: None,
        })
    }

    pub(crate) fn requests(&self) -> Vec<SentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Polls until `count` requests arrived; panics after `timeout`.
    pub(crate) async fn wait_for_requests(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<SentRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let requests = self.requests();
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

#[async_trait]
impl AgentClient for MockAgent {
    async fn send_traces(&self, body: Bytes, trace_count: usize) -> Result<Bytes, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentRequest { trace_count, body });
        match &self.response {
            Some(body) => Ok(Bytes::from(body.clone())),
            None => Err(TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock agent refused the connection",
            ))),
        }
    }
}

/// Tracer wired to a mock agent, with background flushing effectively off.
pub(crate) fn test_tracer(agent: Arc<MockAgent>) -> (Tracer, Arc<MockAgent>) {
    let config = Config {
        flush_interval: Duration::from_secs(3600),
        ..Config::default()
    };
    test_tracer_with_config(agent, config)
}

/// Tracer wired to a mock agent with an explicit configuration.
pub(crate) fn test_tracer_with_config(
    agent: Arc<MockAgent>,
    config: Config,
) -> (Tracer, Arc<MockAgent>) {
    (Tracer::with_client(config, Arc::clone(&agent) as _), agent)
}
