// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace identity, sampling decisions, and per-trace bookkeeping.
//!
//! A [`SpanContext`] carries the identity of one span (`trace_id`, `span_id`,
//! `parent_id`) together with two pieces of state shared by *every* context
//! in the same trace:
//!
//! - the [`Sampling`] decision, behind [`SharedSampling`], so a keep/drop or
//!   priority decision made anywhere propagates everywhere, and
//! - the trace bookkeeping, behind [`SharedTrace`], which tracks which spans
//!   have started and which have finished and is how trace completion is
//!   detected without a central coordinator.
//!
//! Baggage is the exception: it is copied by value from parent to child at
//! creation time, so later mutations stay local to one span.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::span::SpanData;

/// Sampling priority: the user asked for the trace to be dropped.
pub const USER_REJECT: i8 = -1;
/// Sampling priority: automatic sampling decided to drop the trace.
pub const AUTO_REJECT: i8 = 0;
/// Sampling priority: automatic sampling decided to keep the trace.
pub const AUTO_KEEP: i8 = 1;
/// Sampling priority: the user asked for the trace to be kept.
pub const USER_KEEP: i8 = 2;

/// Sampling mechanism: default decision, no agent rate involved.
pub const MECHANISM_DEFAULT: u8 = 0;
/// Sampling mechanism: decision derived from an agent-provided rate.
pub const MECHANISM_AGENT_RATE: u8 = 1;

/// Client-side keep/drop decision for a whole trace.
///
/// `Drop` is terminal: the writer discards the trace before it is ever
/// encoded. Traces with a reject *priority* are still sent to the agent
/// (the backend uses the priority); only `Drop` suppresses the export.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplingDecision {
    /// Export the trace.
    Keep,
    /// Discard the trace client-side.
    Drop,
}

/// Sampling state shared by every span of one trace.
#[derive(Copy, Clone, Default, Debug, PartialEq)]
pub struct Sampling {
    /// Sampling priority (`-1` user reject .. `2` user keep). `None` until
    /// the priority sampler has run for this trace.
    pub priority: Option<i8>,
    /// How the priority was decided. See the `MECHANISM_*` constants.
    pub mechanism: Option<u8>,
    /// Client-side keep/drop decision, if one has been made.
    pub decision: Option<SamplingDecision>,
}

impl Sampling {
    /// True when the trace must be discarded before export.
    #[must_use]
    pub fn is_drop(&self) -> bool {
        self.decision == Some(SamplingDecision::Drop)
    }
}

/// Shared handle to the [`Sampling`] record of one trace.
///
/// Cloning the handle shares the underlying record. A poisoned lock is
/// recovered rather than propagated: sampling state must never take the
/// instrumented application down.
#[derive(Clone, Debug, Default)]
pub struct SharedSampling(Arc<Mutex<Sampling>>);

impl SharedSampling {
    /// Wraps an initial sampling record.
    #[must_use]
    pub fn new(sampling: Sampling) -> Self {
        Self(Arc::new(Mutex::new(sampling)))
    }

    /// Returns a snapshot of the current record.
    #[must_use]
    pub fn get(&self) -> Sampling {
        *self.lock()
    }

    /// Runs `f` against the record inside the critical section.
    pub fn with<T>(&self, f: impl FnOnce(&mut Sampling) -> T) -> T {
        f(&mut self.lock())
    }

    /// Sets the priority and mechanism, overwriting any previous value.
    pub fn set_priority(&self, priority: i8, mechanism: u8) {
        self.with(|s| {
            s.priority = Some(priority);
            s.mechanism = Some(mechanism);
        });
    }

    /// Sets the client-side keep/drop decision.
    pub fn set_decision(&self, decision: SamplingDecision) {
        self.with(|s| s.decision = Some(decision));
    }

    fn lock(&self) -> MutexGuard<'_, Sampling> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-trace bookkeeping: which spans started, which finished.
#[derive(Debug, Default)]
struct Trace {
    /// Span ids in start order. Grows only when a span is constructed with
    /// this bookkeeping.
    started: Vec<u64>,
    /// Finished span records in finish order (which need not match start
    /// order). This is the exact sequence handed to the writer.
    finished: Vec<SpanData>,
    /// Trace origin (e.g. "synthetics"), carried across restarts.
    origin: Option<String>,
    /// Guards against a second emission of the same trace.
    emitted: bool,
}

/// Shared handle to the bookkeeping of one trace.
///
/// Exactly one `SharedTrace` exists per trace until the trace settles and a
/// context is reused, at which point the restart rule in
/// [`SpanContext::child_of`] starts a fresh one. All mutation goes through
/// methods that take the lock; the started/finished push pair and the
/// completion check share a single critical section.
#[derive(Clone, Debug)]
pub struct SharedTrace(Arc<Mutex<Trace>>);

impl SharedTrace {
    /// Creates empty bookkeeping with the given origin.
    #[must_use]
    pub fn new(origin: Option<String>) -> Self {
        Self(Arc::new(Mutex::new(Trace {
            origin,
            ..Trace::default()
        })))
    }

    /// Records a newly constructed span.
    pub(crate) fn register(&self, span_id: u64) {
        self.lock().started.push(span_id);
    }

    /// Records a finished span and reports whether the trace just completed.
    ///
    /// The push, the `started == finished` check, and the emitted flag all
    /// happen inside one critical section, so completion fires exactly once
    /// no matter how finishes interleave across threads. On completion the
    /// finished sequence is moved out and the bookkeeping is left settled.
    pub(crate) fn finish_span(
        &self,
        record: SpanData,
        sampling: &SharedSampling,
    ) -> Option<CompletedTrace> {
        let mut trace = self.lock();
        trace.finished.push(record);
        if trace.emitted || trace.started.len() != trace.finished.len() {
            return None;
        }
        trace.emitted = true;
        let started = trace.started.len();
        let spans = std::mem::take(&mut trace.finished);
        trace.started.clear();
        Some(CompletedTrace {
            spans,
            started,
            sampling: sampling.clone(),
            origin: trace.origin.clone(),
        })
    }

    /// True when every started span has finished (including the empty case).
    ///
    /// A settled trace has run its course through this bookkeeping; reusing
    /// one of its contexts as a parent starts fresh bookkeeping instead of
    /// growing this one forever.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        let trace = self.lock();
        trace.started.len() == trace.finished.len()
    }

    /// The trace origin, if any.
    #[must_use]
    pub fn origin(&self) -> Option<String> {
        self.lock().origin.clone()
    }

    #[cfg(test)]
    pub(crate) fn started_ids(&self) -> Vec<u64> {
        self.lock().started.clone()
    }

    #[cfg(test)]
    pub(crate) fn finished_len(&self) -> usize {
        self.lock().finished.len()
    }

    fn lock(&self) -> MutexGuard<'_, Trace> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn ptr_eq(&self, other: &SharedTrace) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for SharedTrace {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A fully finished trace, emitted by the bookkeeping exactly once and
/// consumed by the writer.
#[derive(Clone, Debug)]
pub struct CompletedTrace {
    /// Finished span records in finish order.
    pub spans: Vec<SpanData>,
    /// Number of spans that started in this trace, captured at emission.
    /// The writer drops the trace if this disagrees with `spans.len()`.
    pub started: usize,
    /// The trace's shared sampling state; the priority sampler writes the
    /// priority here and the encoder reads it back.
    pub sampling: SharedSampling,
    /// Trace origin, stamped into `_dd.origin` on the wire.
    pub origin: Option<String>,
}

impl CompletedTrace {
    /// Trace id, taken from the first finished span.
    #[must_use]
    pub fn trace_id(&self) -> u64 {
        self.spans.first().map_or(0, |s| s.trace_id)
    }

    /// Service name the sampling rate is keyed on.
    #[must_use]
    pub fn service(&self) -> &str {
        self.spans.first().map_or("", |s| s.service.as_str())
    }
}

/// Propagable identity and shared state of one span.
///
/// Identity fields are immutable after construction; the sampling record and
/// trace bookkeeping are shared by reference with every other context of the
/// same trace. Construction never fails.
#[derive(Clone, Debug)]
pub struct SpanContext {
    trace_id: u64,
    span_id: u64,
    parent_id: Option<u64>,
    baggage: HashMap<String, String>,
    sampling: SharedSampling,
    trace: SharedTrace,
}

impl SpanContext {
    /// Seeds a brand-new trace: `trace_id == span_id`, no parent, fresh
    /// bookkeeping and sampling.
    #[must_use]
    pub(crate) fn root(span_id: u64) -> Self {
        Self {
            trace_id: span_id,
            span_id,
            parent_id: None,
            baggage: HashMap::new(),
            sampling: SharedSampling::default(),
            trace: SharedTrace::default(),
        }
    }

    /// Derives a child context from `parent`.
    ///
    /// Sampling is shared with the parent and baggage copied by value. When
    /// the parent's bookkeeping is already settled (every started span has
    /// finished), the child starts fresh bookkeeping carrying only the
    /// origin; a long-lived context reused across many logically separate
    /// traces would otherwise grow its bookkeeping without bound.
    #[must_use]
    pub(crate) fn child_of(parent: &SpanContext, span_id: u64) -> Self {
        let trace = if parent.trace.is_settled() {
            SharedTrace::new(parent.trace.origin())
        } else {
            parent.trace.clone()
        };
        Self {
            trace_id: parent.trace_id,
            span_id,
            parent_id: Some(parent.span_id),
            baggage: parent.baggage.clone(),
            sampling: parent.sampling.clone(),
            trace,
        }
    }

    /// Reconstructs a context received from another process, for use as a
    /// parent. Extraction from carriers (headers etc.) happens elsewhere;
    /// this is the seam it feeds.
    #[must_use]
    pub fn remote(
        trace_id: u64,
        span_id: u64,
        sampling: Sampling,
        baggage: HashMap<String, String>,
        origin: Option<String>,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_id: None,
            baggage,
            sampling: SharedSampling::new(sampling),
            trace: SharedTrace::new(origin),
        }
    }

    /// Trace identifier shared by every span of the trace.
    #[must_use]
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Identifier of the span owning this context.
    #[must_use]
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Identifier of the parent span, if any.
    #[must_use]
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// Reads a baggage item.
    #[must_use]
    pub fn baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    pub(crate) fn set_baggage_item(&mut self, key: String, value: String) {
        self.baggage.insert(key, value);
    }

    pub(crate) fn sampling(&self) -> &SharedSampling {
        &self.sampling
    }

    pub(crate) fn trace(&self) -> &SharedTrace {
        &self.trace
    }

    #[cfg(test)]
    pub(crate) fn shares_trace_with(&self, other: &SpanContext) -> bool {
        self.trace.ptr_eq(&other.trace)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(trace_id: u64, span_id: u64) -> SpanData {
        SpanData {
            trace_id,
            span_id,
            ..SpanData::default()
        }
    }

    #[test]
    fn test_root_context_seeds_trace_identity() {
        let ctx = SpanContext::root(42);
        assert_eq!(ctx.trace_id(), 42);
        assert_eq!(ctx.span_id(), 42);
        assert_eq!(ctx.parent_id(), None);
        assert!(ctx.trace().is_settled());
    }

    #[test]
    fn test_child_shares_trace_and_sampling() {
        let root = SpanContext::root(1);
        root.trace().register(1);
        let child = SpanContext::child_of(&root, 2);

        assert_eq!(child.trace_id(), 1);
        assert_eq!(child.parent_id(), Some(1));
        assert!(child.shares_trace_with(&root));

        root.sampling().set_decision(SamplingDecision::Drop);
        assert!(child.sampling().get().is_drop());
    }

    #[test]
    fn test_child_of_settled_trace_starts_fresh_bookkeeping() {
        let root = SpanContext::root(1);
        root.trace().register(1);
        let complete = root
            .trace()
            .finish_span(record(1, 1), root.sampling())
            .expect("single span trace should complete");
        assert_eq!(complete.spans.len(), 1);

        // The previous trace ran its course; a new child must not grow the
        // exhausted bookkeeping.
        let child = SpanContext::child_of(&root, 2);
        assert!(!child.shares_trace_with(&root));
        child.trace().register(2);
        assert_eq!(child.trace().started_ids(), vec![2]);
        assert_eq!(child.trace().finished_len(), 0);
    }

    #[test]
    fn test_completion_fires_exactly_once_regardless_of_order() {
        let root = SpanContext::root(1);
        let sampling = root.sampling().clone();
        let trace = root.trace().clone();
        trace.register(1);
        trace.register(2);
        trace.register(3);

        // Children outliving the root is allowed: completion is judged by
        // counts, not tree shape.
        assert!(trace.finish_span(record(1, 3), &sampling).is_none());
        assert!(trace.finish_span(record(1, 1), &sampling).is_none());
        let complete = trace.finish_span(record(1, 2), &sampling);
        let complete = complete.expect("third finish completes the trace");
        assert_eq!(complete.started, 3);
        assert_eq!(
            complete.spans.iter().map(|s| s.span_id).collect::<Vec<_>>(),
            vec![3, 1, 2],
            "spans must be emitted in finish order"
        );

        // A stray extra record must not re-emit.
        assert!(trace.finish_span(record(1, 4), &sampling).is_none());
    }

    #[test]
    fn test_remote_context_carries_origin_to_children() {
        let remote = SpanContext::remote(
            7,
            8,
            Sampling {
                priority: Some(AUTO_KEEP),
                mechanism: Some(MECHANISM_DEFAULT),
                decision: None,
            },
            HashMap::from([("account".to_string(), "42".to_string())]),
            Some("synthetics".to_string()),
        );

        let child = SpanContext::child_of(&remote, 9);
        assert_eq!(child.trace_id(), 7);
        assert_eq!(child.parent_id(), Some(8));
        assert_eq!(child.baggage_item("account"), Some("42"));
        assert_eq!(child.trace().origin(), Some("synthetics".to_string()));
        assert_eq!(child.sampling().get().priority, Some(AUTO_KEEP));
    }
}
