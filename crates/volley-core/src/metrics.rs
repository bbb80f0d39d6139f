//! Call metrics
//!
//! Streams and unary calls report through a [`MetricsSink`]. The host decides
//! where samples go; [`InMemoryMetrics`] keeps counters for summaries and tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::params::{ContentType, Protocol};
use crate::schema::MethodInfo;

/// Direction of a streamed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Tags attached to every sample of one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricTags {
    pub method: String,
    pub service: String,
    pub procedure: String,
    pub call_type: String,
    pub protocol: String,
    pub content_type: String,
    /// Caller supplied tags
    pub extra: HashMap<String, String>,
}

impl MetricTags {
    pub fn for_call(
        method: &MethodInfo,
        protocol: Protocol,
        content_type: ContentType,
        extra: &HashMap<String, String>,
    ) -> Self {
        Self {
            method: method.full_method.clone(),
            service: method
                .full_method
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            procedure: method.procedure().to_string(),
            call_type: method.kind().to_string(),
            protocol: protocol.as_str().to_string(),
            content_type: content_type.as_str().to_string(),
            extra: extra.clone(),
        }
    }
}

/// Receives samples for calls and streams
pub trait MetricsSink: Send + Sync {
    fn record_stream_start(&self, tags: &MetricTags);

    fn record_stream_message(&self, tags: &MetricTags, direction: Direction, size: usize);

    /// Recorded once per stream. `error` is the failure message, if any.
    fn record_stream_end(&self, tags: &MetricTags, duration: Duration, error: Option<&str>);

    fn record_unary_request(&self, tags: &MetricTags, duration: Duration, status: &str);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_stream_start(&self, _tags: &MetricTags) {}
    fn record_stream_message(&self, _tags: &MetricTags, _direction: Direction, _size: usize) {}
    fn record_stream_end(&self, _tags: &MetricTags, _duration: Duration, _error: Option<&str>) {}
    fn record_unary_request(&self, _tags: &MetricTags, _duration: Duration, _status: &str) {}
}

/// Per-method counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodStats {
    pub streams_started: u64,
    pub streams_ended: u64,
    pub streams_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub unary_requests: u64,
    /// Unary requests by status code name
    pub unary_statuses: BTreeMap<String, u64>,
    #[serde(with = "millis")]
    pub total_duration: Duration,
}

/// Thread-safe counters keyed by method
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    methods: DashMap<String, MethodStats>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one method, zeroed if it never reported
    pub fn stats(&self, method: &str) -> MethodStats {
        self.methods
            .get(method)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// All methods, sorted by name
    pub fn summary(&self) -> BTreeMap<String, MethodStats> {
        self.methods
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_stream_start(&self, tags: &MetricTags) {
        self.methods.entry(tags.method.clone()).or_default().streams_started += 1;
    }

    fn record_stream_message(&self, tags: &MetricTags, direction: Direction, size: usize) {
        let mut stats = self.methods.entry(tags.method.clone()).or_default();
        match direction {
            Direction::Sent => {
                stats.messages_sent += 1;
                stats.bytes_sent += size as u64;
            }
            Direction::Received => {
                stats.messages_received += 1;
                stats.bytes_received += size as u64;
            }
        }
    }

    fn record_stream_end(&self, tags: &MetricTags, duration: Duration, error: Option<&str>) {
        let mut stats = self.methods.entry(tags.method.clone()).or_default();
        stats.streams_ended += 1;
        if error.is_some() {
            stats.streams_failed += 1;
        }
        stats.total_duration += duration;
    }

    fn record_unary_request(&self, tags: &MetricTags, duration: Duration, status: &str) {
        let mut stats = self.methods.entry(tags.method.clone()).or_default();
        stats.unary_requests += 1;
        *stats.unary_statuses.entry(status.to_string()).or_default() += 1;
        stats.total_duration += duration;
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
