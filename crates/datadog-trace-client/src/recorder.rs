// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recorder: the seam between finishing spans and the writer.
//!
//! Trace completion itself is detected inside the trace bookkeeping (the
//! push and the count check share one critical section); the recorder
//! receives each completed trace exactly once, appends it to the writer,
//! and owns the flushing cadence. With a flush interval configured, a
//! background loop flushes periodically; with an interval of zero, every
//! recorded trace triggers an immediate background flush.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::context::CompletedTrace;
use crate::writer::Writer;

/// Receives completed traces and drives the writer's flush schedule.
pub struct Recorder {
    writer: Arc<Writer>,
    flush_interval: Duration,
    enabled: bool,
    #[cfg(test)]
    recorded: std::sync::Mutex<Vec<CompletedTrace>>,
}

impl Recorder {
    /// Creates a recorder feeding `writer`.
    #[must_use]
    pub fn new(writer: Arc<Writer>, flush_interval: Duration, enabled: bool) -> Self {
        Self {
            writer,
            flush_interval,
            enabled,
            #[cfg(test)]
            recorded: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Hands one completed trace to the writer.
    pub fn record(&self, trace: CompletedTrace) {
        if !self.enabled {
            debug!("tracing disabled, discarding trace {}", trace.trace_id());
            return;
        }
        #[cfg(test)]
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(trace.clone());
        self.writer.append(trace);
        if self.flush_interval.is_zero() {
            self.writer.spawn_flush();
        }
    }

    /// Spawns the periodic flush loop on the current runtime. A zero
    /// interval means per-trace flushing and needs no loop.
    pub fn start(&self) {
        if self.flush_interval.is_zero() {
            return;
        }
        let writer = Arc::clone(&self.writer);
        let flush_interval = self.flush_interval;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut interval = tokio::time::interval(flush_interval);
                    // The first tick completes immediately; skip it so the
                    // loop waits a full interval before the first flush.
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        writer.flush().await;
                    }
                });
            }
            Err(_) => error!("cannot start the trace flush loop outside an async runtime"),
        }
    }

    /// The writer this recorder feeds.
    #[must_use]
    pub fn writer(&self) -> &Arc<Writer> {
        &self.writer
    }

    #[cfg(test)]
    pub(crate) fn last_recorded(&self) -> Option<CompletedTrace> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn recorded_count(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
