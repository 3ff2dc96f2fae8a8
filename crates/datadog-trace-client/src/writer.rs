// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffering writer: turns completed traces into agent requests.
//!
//! Appends are synchronous and never touch the network; each trace is
//! priority-sampled, encoded once, and queued with a running byte total.
//! When the total would cross the high-water mark, the queued batch is
//! swapped out and shipped in the background before the incoming trace is
//! queued, so producers are never blocked and never re-observe a half-sent
//! queue. A flush atomically takes the whole queue, frames it into one
//! request, and feeds the agent's `rate_by_service` response back into the
//! priority sampler.
//!
//! Delivery is at most once: a failed flush logs the error and discards the
//! batch. Losing traces during an agent outage is the accepted trade for
//! bounded memory and an unblocked application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, error};

use crate::context::CompletedTrace;
use crate::encode;
use crate::sampler::PrioritySampler;
use crate::transport::AgentClient;

/// Success-path agent response: sampling rates keyed by `service:,env:`.
#[derive(Debug, Default, Deserialize)]
struct AgentTracesResponse {
    #[serde(default)]
    rate_by_service: HashMap<String, f64>,
}

#[derive(Default)]
struct WriterState {
    /// Encoded traces in append order.
    queue: Vec<Vec<u8>>,
    /// Running byte total of the queue.
    size: usize,
}

/// One swapped-out queue, ready to be framed and sent.
struct Batch {
    payloads: Vec<Vec<u8>>,
}

/// Buffers encoded traces and flushes them to the agent.
pub struct Writer {
    state: Mutex<WriterState>,
    client: Arc<dyn AgentClient + Send + Sync>,
    priority_sampler: Arc<PrioritySampler>,
    max_buffer_bytes: usize,
    analytics: Option<f64>,
}

impl Writer {
    /// Creates a writer flushing through `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn AgentClient + Send + Sync>,
        priority_sampler: Arc<PrioritySampler>,
        max_buffer_bytes: usize,
        analytics: Option<f64>,
    ) -> Self {
        Self {
            state: Mutex::new(WriterState::default()),
            client,
            priority_sampler,
            max_buffer_bytes,
            analytics,
        }
    }

    /// Current queue depth in traces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Appends one completed trace to the queue.
    ///
    /// Silently drops the trace when it still has unfinished spans (a
    /// bookkeeping violation must not corrupt the queue) or when its
    /// sampling decision says drop. Triggers a background flush when the
    /// running byte total crosses the high-water mark.
    pub fn append(&self, trace: CompletedTrace) {
        if trace.spans.len() != trace.started {
            debug!(
                "dropping trace {} with unfinished spans ({} started, {} finished)",
                trace.trace_id(),
                trace.started,
                trace.spans.len()
            );
            return;
        }

        self.priority_sampler.sample(&trace, self.analytics);

        if trace.sampling.get().is_drop() {
            debug!("dropping unsampled trace {}", trace.trace_id());
            return;
        }

        let payload = match encode::encode_trace(&trace) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to encode trace {}: {err}", trace.trace_id());
                return;
            }
        };

        let mut pending = Vec::new();
        {
            let mut state = self.lock();
            // Ship the existing queue first when this trace would overflow
            // it; the incoming trace then starts the fresh queue.
            if !state.queue.is_empty() && state.size + payload.len() >= self.max_buffer_bytes {
                pending.push(Self::swap(&mut state));
            }
            state.size += payload.len();
            state.queue.push(payload);
            // A single trace can exceed the mark all by itself.
            if state.size >= self.max_buffer_bytes {
                pending.push(Self::swap(&mut state));
            }
        }
        for batch in pending {
            self.dispatch(batch);
        }
    }

    /// Flushes the buffered traces and waits for the agent's answer.
    ///
    /// Returns `None` without any network activity when the queue is empty,
    /// otherwise the number of traces in the flushed batch. The queue is
    /// swapped out atomically up front, so appends racing with the in-flight
    /// request land in a fresh queue.
    pub async fn flush(&self) -> Option<usize> {
        let batch = self.take_batch()?;
        let count = batch.payloads.len();
        Self::send(
            Arc::clone(&self.client),
            Arc::clone(&self.priority_sampler),
            batch,
        )
        .await;
        Some(count)
    }

    /// Kicks off a background flush without waiting for it.
    pub(crate) fn spawn_flush(&self) {
        if let Some(batch) = self.take_batch() {
            self.dispatch(batch);
        }
    }

    fn take_batch(&self) -> Option<Batch> {
        let mut state = self.lock();
        if state.queue.is_empty() {
            return None;
        }
        Some(Self::swap(&mut state))
    }

    fn swap(state: &mut MutexGuard<'_, WriterState>) -> Batch {
        state.size = 0;
        Batch {
            payloads: std::mem::take(&mut state.queue),
        }
    }

    fn dispatch(&self, batch: Batch) {
        let client = Arc::clone(&self.client);
        let sampler = Arc::clone(&self.priority_sampler);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    Self::send(client, sampler, batch).await;
                });
            }
            // No runtime, no export. At-most-once delivery allows the drop;
            // it must not block or crash the caller.
            Err(_) => error!(
                "no async runtime available to flush {} traces, dropping them",
                batch.payloads.len()
            ),
        }
    }

    async fn send(
        client: Arc<dyn AgentClient + Send + Sync>,
        sampler: Arc<PrioritySampler>,
        batch: Batch,
    ) {
        let count = batch.payloads.len();
        let body = encode::frame(&batch.payloads);
        debug!("flushing {count} traces to the agent");
        match client.send_traces(Bytes::from(body), count).await {
            Ok(body) => match serde_json::from_slice::<AgentTracesResponse>(&body) {
                Ok(response) => sampler.update(response.rate_by_service),
                Err(_) => {
                    debug!("agent response is not a rate_by_service payload, keeping previous rates");
                }
            },
            Err(err) => error!("error sending {count} traces to the agent: {err}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_payload_sizes(&self) -> Vec<usize> {
        self.lock().queue.iter().map(Vec::len).collect()
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
