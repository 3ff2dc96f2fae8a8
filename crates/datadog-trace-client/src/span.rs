// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spans: timed units of work and their finished wire records.
//!
//! A [`Span`] is mutable while in flight (name, tags, logs, metrics,
//! baggage) and becomes immutable for duration purposes on the first
//! [`Span::finish`] call. Finishing pushes a [`SpanData`] snapshot into the
//! trace's shared bookkeeping; when that makes the trace complete, the span
//! hands the whole finished sequence to the recorder.
//!
//! Every mutator is fail-open: malformed caller input is logged and ignored,
//! never propagated. Tagging must not be able to crash instrumented code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::error;

use crate::context::SpanContext;
use crate::recorder::Recorder;

/// Metric key carrying the rate sampler's rate at span creation time.
pub(crate) const SAMPLE_RATE_METRIC_KEY: &str = "_sample_rate";

/// Tag reserved for the service name.
pub const SERVICE_NAME_TAG: &str = "service.name";
/// Tag reserved for the resource name.
pub const RESOURCE_NAME_TAG: &str = "resource.name";
/// Tag reserved for the span type.
pub const SPAN_TYPE_TAG: &str = "span.type";
/// Tag reserved for the error flag.
pub const ERROR_TAG: &str = "error";

/// A tag value: the closed set of scalar shapes a tag can take.
///
/// Numbers land in the span's `metrics` map on the wire; strings and
/// booleans land in `meta`.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    /// String tag, exported into `meta`.
    Str(String),
    /// Numeric tag, exported into `metrics`.
    Float(f64),
    /// Boolean tag, exported into `meta` as `"true"`/`"false"`.
    Bool(bool),
}

impl TagValue {
    fn into_string(self) -> String {
        match self {
            TagValue::Str(s) => s,
            TagValue::Float(f) => f.to_string(),
            TagValue::Bool(b) => b.to_string(),
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            TagValue::Str(_) => true,
            TagValue::Float(f) => *f != 0.0,
            TagValue::Bool(b) => *b,
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Float(value as f64)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

/// One span log entry: a timestamp plus an opaque payload.
#[derive(Clone, Debug, Default)]
pub struct LogRecord {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// Arbitrary key/value payload supplied by the caller.
    pub fields: HashMap<String, Value>,
}

/// The immutable record of a finished span, in the shape the v0.4 encoder
/// consumes.
#[derive(Clone, Debug, Default)]
pub struct SpanData {
    /// Trace identifier shared with every span of the trace.
    pub trace_id: u64,
    /// This span's identifier.
    pub span_id: u64,
    /// Parent span identifier; `None` for root spans.
    pub parent_id: Option<u64>,
    /// Operation name.
    pub name: String,
    /// Service the span belongs to.
    pub service: String,
    /// Resource being operated on; defaults to the operation name.
    pub resource: String,
    /// Span type (`web`, `db`, ...), if any.
    pub span_type: Option<String>,
    /// Start time in nanoseconds since the Unix epoch.
    pub start: u64,
    /// Duration in nanoseconds.
    pub duration: u64,
    /// Whether the span errored.
    pub error: bool,
    /// String tags.
    pub meta: HashMap<String, String>,
    /// Numeric tags and metrics.
    pub metrics: HashMap<String, f64>,
    /// Span logs; retained on the record, not part of the v0.4 encoding.
    pub logs: Vec<LogRecord>,
}

/// Options for [`crate::Tracer::start_span`].
#[derive(Default)]
pub struct SpanOptions<'a> {
    /// Parent context to derive the new span's context from.
    pub parent: Option<&'a SpanContext>,
    /// Explicit start time; defaults to now.
    pub start_time: Option<SystemTime>,
    /// Service override; defaults to the tracer's configured service.
    pub service: Option<String>,
    /// Resource name; defaults to the operation name.
    pub resource: Option<String>,
    /// Span type.
    pub span_type: Option<String>,
    /// Initial tags.
    pub tags: Vec<(String, TagValue)>,
}

impl<'a> SpanOptions<'a> {
    /// Options for a child of `parent`.
    #[must_use]
    pub fn child_of(parent: &'a SpanContext) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Adds an initial tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Sets an explicit start time.
    #[must_use]
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Sets the resource name.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Sets the span type.
    #[must_use]
    pub fn with_span_type(mut self, span_type: impl Into<String>) -> Self {
        self.span_type = Some(span_type.into());
        self
    }
}

/// A timed unit of work within a trace.
pub struct Span {
    context: SpanContext,
    recorder: Arc<Recorder>,
    name: String,
    service: String,
    resource: Option<String>,
    span_type: Option<String>,
    start: u64,
    started_at: Instant,
    explicit_start: bool,
    duration: Option<u64>,
    error: bool,
    tags: HashMap<String, TagValue>,
    metrics: HashMap<String, f64>,
    logs: Vec<LogRecord>,
}

impl Span {
    pub(crate) fn start(
        context: SpanContext,
        name: String,
        service: String,
        start_time: Option<SystemTime>,
        sample_rate: f64,
        recorder: Arc<Recorder>,
    ) -> Self {
        context.trace().register(context.span_id());
        let explicit_start = start_time.is_some();
        let start = unix_nanos(start_time.unwrap_or_else(SystemTime::now));
        Self {
            context,
            recorder,
            name,
            service,
            resource: None,
            span_type: None,
            start,
            started_at: Instant::now(),
            explicit_start,
            duration: None,
            error: false,
            tags: HashMap::new(),
            metrics: HashMap::from([(SAMPLE_RATE_METRIC_KEY.to_string(), sample_rate)]),
            logs: Vec::new(),
        }
    }

    /// The span's propagable context.
    #[must_use]
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    /// The current operation name.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.name
    }

    /// Overwrites the operation name. Takes effect for any later read.
    pub fn set_operation_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Duration set by the first `finish` call, if the span has finished.
    #[must_use]
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.duration.map(std::time::Duration::from_nanos)
    }

    /// Sets a single tag. The reserved tags `service.name`, `resource.name`,
    /// `span.type` and `error` update the corresponding span fields instead
    /// of the tag map.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            SERVICE_NAME_TAG => self.service = value.into_string(),
            RESOURCE_NAME_TAG => self.resource = Some(value.into_string()),
            SPAN_TYPE_TAG => self.span_type = Some(value.into_string()),
            ERROR_TAG => self.error = value.is_truthy(),
            _ => {
                self.tags.insert(key, value);
            }
        }
    }

    /// Merges a dynamic map of tags, keys overwriting.
    ///
    /// Accepts any JSON value so instrumentation can forward caller-supplied
    /// data unchecked; anything that is not an object is logged and ignored.
    pub fn add_tags(&mut self, tags: Value) {
        match tags {
            Value::Object(map) => {
                for (key, value) in map {
                    let tag = match value {
                        Value::String(s) => TagValue::Str(s),
                        Value::Number(n) => TagValue::Float(n.as_f64().unwrap_or(0.0)),
                        Value::Bool(b) => TagValue::Bool(b),
                        Value::Null => continue,
                        // Nested shapes flatten to their JSON text.
                        other => TagValue::Str(other.to_string()),
                    };
                    self.set_tag(key, tag);
                }
            }
            other => error!("ignoring tags that are not a key/value object: {other}"),
        }
    }

    /// Sets a numeric metric on the span.
    pub fn set_metric(&mut self, key: impl Into<String>, value: f64) {
        self.metrics.insert(key.into(), value);
    }

    /// Sets a baggage item. Baggage propagates only to children created
    /// after this call, never to already-created relatives.
    pub fn set_baggage_item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.set_baggage_item(key.into(), value.into());
    }

    /// Reads a baggage item.
    #[must_use]
    pub fn get_baggage_item(&self, key: &str) -> Option<&str> {
        self.context.baggage_item(key)
    }

    /// Appends a log entry with the given or current timestamp.
    pub fn log<I>(&mut self, fields: I, timestamp: Option<SystemTime>)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.logs.push(LogRecord {
            timestamp: unix_nanos(timestamp.unwrap_or_else(SystemTime::now)),
            fields: fields.into_iter().collect(),
        });
    }

    /// Finishes the span now. Idempotent: only the first call sets the
    /// duration and reports the span.
    pub fn finish(&mut self) {
        self.finish_inner(None);
    }

    /// Finishes the span at an explicit time. A finish time earlier than
    /// the start clamps the duration to zero.
    pub fn finish_with_time(&mut self, finish_time: SystemTime) {
        self.finish_inner(Some(finish_time));
    }

    fn finish_inner(&mut self, finish_time: Option<SystemTime>) {
        if self.duration.is_some() {
            return;
        }
        let duration = match finish_time {
            Some(t) => unix_nanos(t).saturating_sub(self.start),
            // An explicit start time breaks the monotonic anchor, so fall
            // back to wall-clock arithmetic in that case.
            None if self.explicit_start => {
                unix_nanos(SystemTime::now()).saturating_sub(self.start)
            }
            None => duration_nanos(self.started_at.elapsed()),
        };
        self.duration = Some(duration);
        let record = self.snapshot(duration);
        if let Some(complete) = self
            .context
            .trace()
            .finish_span(record, self.context.sampling())
        {
            self.recorder.record(complete);
        }
    }

    fn snapshot(&self, duration: u64) -> SpanData {
        let mut meta = HashMap::new();
        let mut metrics = self.metrics.clone();
        for (key, value) in &self.tags {
            match value {
                TagValue::Str(s) => {
                    meta.insert(key.clone(), s.clone());
                }
                TagValue::Bool(b) => {
                    meta.insert(key.clone(), b.to_string());
                }
                TagValue::Float(f) => {
                    metrics.insert(key.clone(), *f);
                }
            }
        }
        SpanData {
            trace_id: self.context.trace_id(),
            span_id: self.context.span_id(),
            parent_id: self.context.parent_id(),
            name: self.name.clone(),
            service: self.service.clone(),
            resource: self.resource.clone().unwrap_or_else(|| self.name.clone()),
            span_type: self.span_type.clone(),
            start: self.start,
            duration,
            error: self.error,
            meta,
            metrics,
            logs: self.logs.clone(),
        }
    }
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, duration_nanos)
}

fn duration_nanos(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::json;

    use super::*;
    use crate::test_support::{test_tracer, MockAgent};

    #[test]
    fn test_finish_is_idempotent() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.finish_with_time(SystemTime::now() + Duration::from_millis(50));
        let first = span.duration().unwrap();

        span.finish_with_time(SystemTime::now() + Duration::from_secs(600));
        assert_eq!(span.duration().unwrap(), first);
    }

    #[test]
    fn test_finish_clamps_negative_duration_to_zero() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.finish_with_time(SystemTime::UNIX_EPOCH);
        assert_eq!(span.duration().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_reserved_tags_route_to_span_fields() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.set_tag(SERVICE_NAME_TAG, "billing");
        span.set_tag(RESOURCE_NAME_TAG, "SELECT 1");
        span.set_tag(SPAN_TYPE_TAG, "db");
        span.set_tag(ERROR_TAG, true);
        span.set_tag("custom", "value");
        span.set_tag("retries", 3.0);
        span.finish();

        let trace = tracer.recorder().last_recorded().unwrap();
        let data = &trace.spans[0];
        assert_eq!(data.service, "billing");
        assert_eq!(data.resource, "SELECT 1");
        assert_eq!(data.span_type.as_deref(), Some("db"));
        assert!(data.error);
        assert_eq!(data.meta.get("custom").map(String::as_str), Some("value"));
        assert_eq!(data.metrics.get("retries"), Some(&3.0));
    }

    #[test]
    fn test_add_tags_accepts_objects_and_ignores_malformed_input() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.add_tags(json!({
            "http.status_code": 200,
            "http.method": "GET",
            "cache.hit": false,
            "ignored": null,
        }));
        // Malformed input must be swallowed, not panic or poison the span.
        span.add_tags(json!("not an object"));
        span.add_tags(json!([1, 2, 3]));
        span.finish();

        let trace = tracer.recorder().last_recorded().unwrap();
        let data = &trace.spans[0];
        assert_eq!(data.metrics.get("http.status_code"), Some(&200.0));
        assert_eq!(
            data.meta.get("http.method").map(String::as_str),
            Some("GET")
        );
        assert_eq!(
            data.meta.get("cache.hit").map(String::as_str),
            Some("false")
        );
        assert!(!data.meta.contains_key("ignored"));
    }

    #[test]
    fn test_metrics_seeded_with_sample_rate() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.finish();

        let trace = tracer.recorder().last_recorded().unwrap();
        assert_eq!(
            trace.spans[0].metrics.get(SAMPLE_RATE_METRIC_KEY),
            Some(&1.0)
        );
    }

    #[test]
    fn test_logs_are_append_ordered() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("operation", SpanOptions::default());
        span.log(
            [("event".to_string(), json!("first"))],
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1)),
        );
        span.log([("event".to_string(), json!("second"))], None);
        span.finish();

        let trace = tracer.recorder().last_recorded().unwrap();
        let logs = &trace.spans[0].logs;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].fields.get("event"), Some(&json!("first")));
        assert_eq!(logs[0].timestamp, 1_000_000_000);
        assert_eq!(logs[1].fields.get("event"), Some(&json!("second")));
    }

    #[test]
    fn test_baggage_does_not_reach_existing_children() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut parent = tracer.start_span("parent", SpanOptions::default());
        parent.set_baggage_item("request.id", "before");
        let child = tracer.start_span("child", SpanOptions::child_of(parent.context()));

        parent.set_baggage_item("late.key", "after");

        assert_eq!(child.get_baggage_item("request.id"), Some("before"));
        assert_eq!(child.get_baggage_item("late.key"), None);
    }

    #[test]
    fn test_operation_name_can_be_overwritten() {
        let (tracer, _agent) = test_tracer(MockAgent::ok());
        let mut span = tracer.start_span("old", SpanOptions::default());
        span.set_operation_name("new");
        span.finish();

        let trace = tracer.recorder().last_recorded().unwrap();
        assert_eq!(trace.spans[0].name, "new");
        assert_eq!(trace.spans[0].resource, "new");
    }
}
