// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracer: span factory and pipeline wiring.
//!
//! `Tracer::new` assembles the whole export pipeline from a [`Config`]:
//! rate sampler, priority sampler, writer (with the real agent client), and
//! recorder. It is cheap to clone and safe to share; all state lives behind
//! one `Arc`.

use std::sync::Arc;

use tracing::error;

use crate::config::Config;
use crate::context::{SamplingDecision, SpanContext};
use crate::id;
use crate::recorder::Recorder;
use crate::sampler::{PrioritySampler, RateSampler};
use crate::span::{Span, SpanOptions};
use crate::transport::{AgentClient, AgentEndpoint, HttpAgentClient};
use crate::writer::Writer;

/// Entry point of the tracing client.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    config: Config,
    sampler: RateSampler,
    recorder: Arc<Recorder>,
}

impl Tracer {
    /// Builds a tracer exporting to the configured agent endpoint.
    ///
    /// A bad agent URL does not fail construction: the error is logged and
    /// the default local endpoint used instead, keeping the tracer fail-open
    /// for the host application.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let endpoint = match AgentEndpoint::parse(&config.agent_url) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                error!("{err}, falling back to {}", crate::config::DEFAULT_AGENT_URL);
                AgentEndpoint::Http(hyper::Uri::from_static(crate::config::DEFAULT_AGENT_URL))
            }
        };
        let client = Arc::new(HttpAgentClient::new(endpoint, config.flush_timeout));
        Self::with_client(config, client)
    }

    /// Builds a tracer with an injected agent client. This is the seam used
    /// by tests and alternate transports.
    #[must_use]
    pub fn with_client(config: Config, client: Arc<dyn AgentClient + Send + Sync>) -> Self {
        let priority_sampler = Arc::new(PrioritySampler::new(config.env.clone()));
        let writer = Arc::new(Writer::new(
            client,
            priority_sampler,
            config.max_buffer_bytes,
            config.analytics,
        ));
        let recorder = Arc::new(Recorder::new(writer, config.flush_interval, config.enabled));
        let sampler = RateSampler::new(config.sample_rate);
        Self {
            inner: Arc::new(TracerInner {
                config,
                sampler,
                recorder,
            }),
        }
    }

    /// Starts the background flush loop. Must be called from within an
    /// async runtime; without it, traces only leave on explicit
    /// [`Tracer::flush`] calls or when the buffer fills.
    pub fn start(&self) {
        self.inner.recorder.start();
    }

    /// Starts a span.
    ///
    /// With a parent in the options, the span joins the parent's trace
    /// (subject to the bookkeeping restart rule); otherwise it roots a new
    /// trace and the configured sample rate decides keep/drop for the whole
    /// trace up front.
    #[must_use]
    pub fn start_span(&self, name: impl Into<String>, options: SpanOptions<'_>) -> Span {
        let name = name.into();
        let span_id = id::generate_id();

        let context = match options.parent {
            Some(parent) => SpanContext::child_of(parent, span_id),
            None => {
                let context = SpanContext::root(span_id);
                if !self.inner.sampler.is_sampled(context.trace_id()) {
                    context.sampling().set_decision(SamplingDecision::Drop);
                }
                context
            }
        };

        let service = options
            .service
            .unwrap_or_else(|| self.inner.config.service.clone());
        let mut span = Span::start(
            context,
            name,
            service,
            options.start_time,
            self.inner.sampler.rate(),
            Arc::clone(&self.inner.recorder),
        );

        for (key, value) in &self.inner.config.tags {
            span.set_tag(key.clone(), value.clone());
        }
        if let Some(env) = &self.inner.config.env {
            span.set_tag("env", env.clone());
        }
        if let Some(version) = &self.inner.config.version {
            span.set_tag("version", version.clone());
        }
        if let Some(resource) = options.resource {
            span.set_tag(crate::span::RESOURCE_NAME_TAG, resource);
        }
        if let Some(span_type) = options.span_type {
            span.set_tag(crate::span::SPAN_TYPE_TAG, span_type);
        }
        for (key, value) in options.tags {
            span.set_tag(key, value);
        }
        span
    }

    /// Flushes buffered traces now and waits for the agent exchange.
    /// Returns the number of traces sent, or `None` when nothing was
    /// buffered.
    pub async fn flush(&self) -> Option<usize> {
        self.inner.recorder.writer().flush().await
    }

    /// Queue depth of the underlying writer, in traces.
    #[must_use]
    pub fn pending_traces(&self) -> usize {
        self.inner.recorder.writer().len()
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn recorder(&self) -> &Arc<Recorder> {
        &self.inner.recorder
    }
}
