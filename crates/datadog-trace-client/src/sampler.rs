// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace sampling: the base rate sampler and the priority sampler.
//!
//! The [`RateSampler`] makes deterministic keep/drop decisions from a fixed
//! rate and is consulted once per span to stamp the `_sample_rate` metric.
//! The [`PrioritySampler`] assigns a sampling priority per trace when the
//! trace is appended for export, using a process-wide `service:,env:` rate
//! table refreshed from every successful agent response.
//!
//! Neither sampler can fail: any internal problem degrades to "keep
//! everything" rather than silently dropping traces.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::context::{CompletedTrace, AUTO_KEEP, AUTO_REJECT, MECHANISM_AGENT_RATE, MECHANISM_DEFAULT};

/// Knuth's multiplicative hashing constant, the factor every Datadog tracer
/// uses so sampling decisions agree across languages for the same trace id.
const KNUTH_FACTOR: u64 = 1_111_111_111_111_111_111;

/// Rate table key used when the agent has no entry for a service.
pub const DEFAULT_RATE_KEY: &str = "service:,env:";

/// Deterministic keep/drop decision for `trace_id` at `rate`.
fn sampled(trace_id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let threshold = (rate * u64::MAX as f64) as u64;
    trace_id.wrapping_mul(KNUTH_FACTOR) <= threshold
}

/// Clamps a configured rate into `0..=1`; anything unparseable (NaN) keeps
/// everything.
pub(crate) fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        1.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

/// Samples traces at a fixed rate, decided deterministically per trace id.
#[derive(Clone, Copy, Debug)]
pub struct RateSampler {
    rate: f64,
}

impl RateSampler {
    /// Creates a sampler clamped into `0..=1`.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        Self {
            rate: sanitize_rate(rate),
        }
    }

    /// The configured rate, stamped into every span's metrics at creation.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Whether the trace with this id should be kept.
    #[must_use]
    pub fn is_sampled(&self, trace_id: u64) -> bool {
        sampled(trace_id, self.rate)
    }
}

impl Default for RateSampler {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Assigns sampling priorities from agent-provided per-service rates.
///
/// The rate table is process-wide mutable state: `update` replaces it after
/// every successful flush, `sample` reads it on every trace append. Readers
/// may observe a stale table between a flush response and its `update` call;
/// that staleness is accepted.
#[derive(Debug)]
pub struct PrioritySampler {
    env: Option<String>,
    rates: RwLock<HashMap<String, f64>>,
}

impl PrioritySampler {
    /// Creates a sampler keyed on the given deployment environment.
    #[must_use]
    pub fn new(env: Option<String>) -> Self {
        Self {
            env,
            rates: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a priority into the trace's shared sampling decision.
    ///
    /// No-op when a priority is already set, so a decision made anywhere
    /// (user code, an upstream service) wins over the automatic one. An
    /// `analytics` rate, when configured, takes precedence over the agent's
    /// rate table. Never blocks on I/O and never fails.
    pub fn sample(&self, trace: &CompletedTrace, analytics: Option<f64>) {
        trace.sampling.with(|sampling| {
            if sampling.priority.is_some() {
                return;
            }
            let (rate, mechanism) = match analytics {
                Some(rate) => (sanitize_rate(rate), MECHANISM_DEFAULT),
                None => self.lookup(trace.service()),
            };
            let priority = if sampled(trace.trace_id(), rate) {
                AUTO_KEEP
            } else {
                AUTO_REJECT
            };
            sampling.priority = Some(priority);
            sampling.mechanism = Some(mechanism);
        });
    }

    /// Replaces the rate table with the agent's latest `rate_by_service`.
    pub fn update(&self, rates: HashMap<String, f64>) {
        match self.rates.write() {
            Ok(mut table) => {
                debug!("updated sampling rates for {} services", rates.len());
                *table = rates;
            }
            Err(_) => debug!("sampling rate table lock poisoned, keeping previous rates"),
        }
    }

    /// The effective rate for a service, as `sample` would resolve it.
    #[must_use]
    pub fn rate_for(&self, service: &str) -> f64 {
        self.lookup(service).0
    }

    fn lookup(&self, service: &str) -> (f64, u8) {
        let key = format!(
            "service:{service},env:{}",
            self.env.as_deref().unwrap_or("")
        );
        match self.rates.read() {
            Ok(table) => table
                .get(&key)
                .or_else(|| table.get(DEFAULT_RATE_KEY))
                .map_or((1.0, MECHANISM_DEFAULT), |rate| {
                    (*rate, MECHANISM_AGENT_RATE)
                }),
            // A poisoned table degrades to sampling everything.
            Err(_) => (1.0, MECHANISM_DEFAULT),
        }
    }
}
