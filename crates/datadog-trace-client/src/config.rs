// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracer configuration.
//!
//! Configuration merges three sources, later ones winning: built-in
//! defaults, `DD_*` environment variables, and whatever the host
//! application sets on the [`Config`] value before handing it to
//! [`crate::Tracer::new`]. Loading is fail-open: a value that does not
//! parse falls back to its default instead of failing tracer startup.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::warn;

use crate::sampler::sanitize_rate;

/// Default agent endpoint: the local trace agent's standard port.
pub const DEFAULT_AGENT_URL: &str = "http://localhost:8126";

/// Service name used when the host never sets one.
pub const DEFAULT_SERVICE: &str = "unnamed-rust-service";

/// Default writer high-water mark: 8 MiB of encoded traces.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Default interval between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Default cap on one export request, connect included.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Tracer settings. Fields are plain data; construct with
/// [`Config::default`] or [`Config::from_env`] and override as needed.
#[derive(Clone, Debug)]
pub struct Config {
    /// Master switch; a disabled tracer creates spans but exports nothing.
    pub enabled: bool,
    /// Service name stamped on spans that do not override it.
    pub service: String,
    /// Deployment environment (`env` tag and sampling key).
    pub env: Option<String>,
    /// Application version (`version` tag).
    pub version: Option<String>,
    /// Agent URL: `http(s)://host:port` or `unix:///path/to/apm.socket`.
    pub agent_url: String,
    /// Background flush cadence; zero flushes after every completed trace.
    pub flush_interval: Duration,
    /// Timeout for one export request.
    pub flush_timeout: Duration,
    /// Writer high-water mark in bytes of encoded traces.
    pub max_buffer_bytes: usize,
    /// Base sampling rate in `0..=1`, stamped on every span at creation.
    pub sample_rate: f64,
    /// Optional analytics sample rate; overrides agent rates when set.
    pub analytics: Option<f64>,
    /// Global tags added to every span.
    pub tags: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            service: DEFAULT_SERVICE.to_string(),
            env: None,
            version: None,
            agent_url: DEFAULT_AGENT_URL.to_string(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            sample_rate: 1.0,
            analytics: None,
            tags: HashMap::new(),
        }
    }
}

impl Config {
    /// Builds a configuration from `DD_*` environment variables on top of
    /// the defaults. Never fails; unparseable values are skipped with a
    /// warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(enabled) = env_bool("DD_TRACE_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(service) = env_string("DD_SERVICE") {
            config.service = service;
        }
        config.env = env_string("DD_ENV");
        config.version = env_string("DD_VERSION");

        // A full URL wins over the host/port pair.
        if let Some(url) = env_string("DD_TRACE_AGENT_URL") {
            config.agent_url = url;
        } else {
            let host = env_string("DD_AGENT_HOST");
            let port = env_string("DD_TRACE_AGENT_PORT");
            if host.is_some() || port.is_some() {
                config.agent_url = format!(
                    "http://{}:{}",
                    host.as_deref().unwrap_or("localhost"),
                    port.as_deref().unwrap_or("8126")
                );
            }
        }

        if let Some(rate) = env_parse::<f64>("DD_TRACE_SAMPLE_RATE") {
            config.sample_rate = sanitize_rate(rate);
        }
        if let Some(rate) = env_parse::<f64>("DD_TRACE_ANALYTICS_SAMPLE_RATE") {
            config.analytics = Some(sanitize_rate(rate));
        }
        if let Some(millis) = env_parse::<u64>("DD_TRACE_FLUSH_INTERVAL") {
            config.flush_interval = Duration::from_millis(millis);
        }
        if let Some(tags) = env_string("DD_TAGS") {
            config.tags = parse_tags(&tags);
        }

        config
    }
}

/// Parses `DD_TAGS`-style tag lists.
///
/// Space-separated `key:value` pairs are the standard; comma separation is
/// also accepted for compatibility. Entries without exactly one `:` are
/// skipped.
pub(crate) fn parse_tags(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    let normalized = raw.replace(',', " ");
    for kv in normalized.split_whitespace() {
        let parts = kv.split(':').collect::<Vec<&str>>();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            tags.insert(parts[0].to_string(), parts[1].to_string());
        }
    }
    tags
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| !v.eq_ignore_ascii_case("false") && v != "0")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable value for {key}: {raw}");
            None
        }
    }
}
