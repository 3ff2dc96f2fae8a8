// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! msgpack encoding for the `/v0.4/traces` protocol.
//!
//! One trace encodes to a msgpack array of span maps, in finish order. A
//! request body is a msgpack array of traces: [`frame`] writes the outer
//! array header and concatenates the already-encoded traces, so traces are
//! serialized once when appended and never re-encoded at flush time.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::context::CompletedTrace;

/// Metric carrying the trace's sampling priority to the agent.
pub(crate) const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";

/// Meta entry carrying the trace origin.
pub(crate) const ORIGIN_KEY: &str = "_dd.origin";

/// Failure to serialize a trace. Encoding failures drop the trace; they are
/// never surfaced to instrumented code.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// msgpack serialization rejected the span data.
    #[error("msgpack serialization failed: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),
}

/// The v0.4 wire shape of one span. Serialized as a named map.
#[derive(Serialize)]
struct WireSpan<'a> {
    trace_id: u64,
    span_id: u64,
    parent_id: u64,
    name: &'a str,
    resource: &'a str,
    service: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    span_type: Option<&'a str>,
    error: i32,
    start: u64,
    duration: u64,
    meta: BTreeMap<&'a str, &'a str>,
    metrics: BTreeMap<&'a str, f64>,
}

/// Encodes a completed trace into one msgpack array of span maps.
///
/// The shared sampling priority is stamped into every span's metrics and the
/// trace origin into every span's meta, so the agent sees the decision no
/// matter which span it treats as the root.
pub fn encode_trace(trace: &CompletedTrace) -> Result<Vec<u8>, EncodeError> {
    let sampling = trace.sampling.get();
    let origin = trace.origin.as_deref();

    let spans: Vec<WireSpan<'_>> = trace
        .spans
        .iter()
        .map(|span| {
            let mut meta: BTreeMap<&str, &str> = span
                .meta
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            if let Some(origin) = origin {
                meta.insert(ORIGIN_KEY, origin);
            }
            let mut metrics: BTreeMap<&str, f64> = span
                .metrics
                .iter()
                .map(|(k, v)| (k.as_str(), *v))
                .collect();
            if let Some(priority) = sampling.priority {
                metrics.insert(SAMPLING_PRIORITY_KEY, f64::from(priority));
            }
            WireSpan {
                trace_id: span.trace_id,
                span_id: span.span_id,
                parent_id: span.parent_id.unwrap_or(0),
                name: &span.name,
                resource: &span.resource,
                service: &span.service,
                span_type: span.span_type.as_deref(),
                error: i32::from(span.error),
                start: span.start,
                duration: span.duration,
                meta,
                metrics,
            }
        })
        .collect();

    let mut buf = Vec::with_capacity(128 * trace.spans.len());
    rmp_serde::encode::write_named(&mut buf, &spans)?;
    Ok(buf)
}

/// Frames already-encoded traces into one request body: a msgpack array
/// header followed by the concatenated trace payloads.
#[must_use]
pub fn frame(payloads: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = payloads.iter().map(Vec::len).sum();
    let mut body = Vec::with_capacity(5 + total);
    write_array_header(&mut body, payloads.len());
    for payload in payloads {
        body.extend_from_slice(payload);
    }
    body
}

/// msgpack array header: fixarray, array 16, or array 32 by length.
#[allow(clippy::cast_possible_truncation)]
fn write_array_header(buf: &mut Vec<u8>, len: usize) {
    if len < 16 {
        buf.push(0x90 | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.push(0xdc);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(0xdd);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
}
