// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog Trace Client
//!
//! Client-side trace assembly and export pipeline for Datadog APM.
//!
//! This crate implements the core of a tracing client: it creates spans,
//! links them into traces through shared span contexts, detects when a
//! multi-span trace has fully finished, applies priority sampling, and ships
//! completed traces to a local trace agent over the msgpack `/v0.4/traces`
//! protocol (TCP or Unix Domain Socket).
//!
//! ## Pipeline
//!
//! ```text
//! instrumented code
//!   ↓ start_span / finish
//! Span + SpanContext (shared per-trace bookkeeping)
//!   ↓ last span of the trace finishes
//! Recorder (completion detection, periodic flushing)
//!   ↓
//! Writer (msgpack encoding, size-bounded buffering)
//!   ↓ PUT /v0.4/traces
//! Trace Agent → rate_by_service response → PrioritySampler
//! ```
//!
//! The library is fail-open: no span or writer operation ever propagates an
//! error into the instrumented application. Traces are dropped (and the drop
//! logged) rather than blocking or crashing the host.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]

pub mod config;
pub mod context;
pub mod encode;
pub mod id;
pub mod recorder;
pub mod sampler;
pub mod span;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tracer;
pub mod transport;
pub mod writer;

pub use config::Config;
pub use context::{Sampling, SamplingDecision, SpanContext};
pub use span::{Span, SpanOptions, TagValue};
pub use tracer::Tracer;

/// Tracer version reported to the agent in `Datadog-Meta-Tracer-Version`.
pub const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");
