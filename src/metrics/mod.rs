//! Metric names, tags, and the buffered per-message recorder.
//!
//! Metric names are stable identifiers; dashboards and alerts key on them,
//! so they must be emitted exactly as defined here.
use tracing::debug;

use crate::{Message, MetricsAnnotator};

/// Stable metric names emitted by the engine.
pub mod names {
    /// Counter: a message reference was picked up for processing.
    pub const RECEIVED: &str = "core.received";
    /// Counter: a message finished processing; tagged with `result`.
    pub const PROCESSED: &str = "core.processed";
    /// Counter: store sink commits; tagged with `result`.
    pub const STORE: &str = "core.store";
    /// Counter: publish sink commits; tagged with `result`.
    pub const PUBLISH: &str = "core.publish";
    /// Counter: a batch of contexts was flushed to the sinks.
    pub const OUTPUT_BATCH: &str = "core.output_batch";
    /// Gauge: depth of the input queue.
    pub const INPUT_QUEUE: &str = "core.input_queue";
    /// Gauge: depth of the output queue.
    pub const OUTPUT_QUEUE: &str = "core.output_queue";
    /// Gauge: number of handlers currently in flight.
    pub const CONCURRENT_HANDLERS: &str = "core.concurrent_handlers";
}

/// Value of the `result` tag on [names::PROCESSED] and the sink counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricResult {
    /// Fully processed and committed.
    Success,
    /// Failed with a non-conflict error.
    Error,
    /// Failed on a sequence conflict.
    ErrSeqNum,
    /// Failed input or output validation.
    ErrInvalidMsg,
    /// The handler failed after retries.
    ErrFailedMsgProcessing,
    /// The source's release callback failed.
    ErrFailedMsgRelease,
    /// Reprocessing could not be scheduled.
    ErrReprocessing,
    /// No handler is registered for the message type.
    Unhandled,
}

impl MetricResult {
    /// The stable tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricResult::Success => "success",
            MetricResult::Error => "error",
            MetricResult::ErrSeqNum => "error.seq_num",
            MetricResult::ErrInvalidMsg => "error.invalid_msg",
            MetricResult::ErrFailedMsgProcessing => "error.failed_msg_processing",
            MetricResult::ErrFailedMsgRelease => "error.failed_msg_release",
            MetricResult::ErrReprocessing => "error.reprocessing",
            MetricResult::Unhandled => "unhandled",
        }
    }

    /// The `result` tag pair for this outcome.
    pub fn tag(&self) -> (String, String) {
        ("result".to_string(), self.as_str().to_string())
    }
}

/// Trait for metrics backends.
///
/// Implementations record counters and gauges emitted by the engine. The
/// trait is designed to be lightweight and non-blocking to avoid impacting
/// pipeline performance.
pub trait MetricsSink: Send + Sync {
    /// Increments a counter by one.
    fn increment(&self, name: &str, tags: &[(String, String)]);

    /// Records a gauge observation.
    fn gauge(&self, name: &str, value: f64, tags: &[(String, String)]);
}

/// Metrics backend that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &str, _tags: &[(String, String)]) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: &[(String, String)]) {}
}

/// Metrics backend that emits observations as debug log events.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn increment(&self, name: &str, tags: &[(String, String)]) {
        debug!(metric = name, tags = ?tags, "counter");
    }

    fn gauge(&self, name: &str, value: f64, tags: &[(String, String)]) {
        debug!(metric = name, value, tags = ?tags, "gauge");
    }
}

#[derive(Clone, Debug)]
enum Observation {
    Increment(String, Vec<(String, String)>),
    Gauge(String, f64, Vec<(String, String)>),
}

/// Per-message metrics buffer.
///
/// Handlers record through this during dispatch; observations only reach the
/// backend when the owning context completes. A cleared context drops its
/// buffer, so failed attempts leave no metric residue.
#[derive(Debug, Default)]
pub struct BufferedMetrics {
    pending: Vec<Observation>,
}

impl BufferedMetrics {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        BufferedMetrics::default()
    }

    /// Buffers a counter increment.
    pub fn increment(&mut self, name: impl Into<String>, tags: Vec<(String, String)>) {
        self.pending.push(Observation::Increment(name.into(), tags));
    }

    /// Buffers a gauge observation.
    pub fn gauge(&mut self, name: impl Into<String>, value: f64, tags: Vec<(String, String)>) {
        self.pending.push(Observation::Gauge(name.into(), value, tags));
    }

    /// Number of buffered observations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the buffer into the backend.
    pub(crate) fn flush(&mut self, sink: &dyn MetricsSink) {
        for observation in self.pending.drain(..) {
            match observation {
                Observation::Increment(name, tags) => sink.increment(&name, &tags),
                Observation::Gauge(name, value, tags) => sink.gauge(&name, value, &tags),
            }
        }
    }

    /// Discards the buffer without emitting.
    pub(crate) fn discard(&mut self) {
        self.pending.clear();
    }
}

/// Collects tags from a set of annotators for a message.
pub(crate) fn annotate(
    annotators: &[Box<dyn MetricsAnnotator>],
    message: &Message,
) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for annotator in annotators {
        tags.extend(annotator.annotate(message));
    }
    tags
}
