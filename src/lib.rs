//! Generic engine for building event-driven message processing services
//!
//! Provides a library core that consumes messages from pluggable sources,
//! routes each message to a registered handler, buffers the handler's intent
//! to publish downstream events or store state changing events, and commits
//! those outputs to pluggable sinks under configurable consistency and retry
//! semantics.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

pub mod batching;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;

mod runtime;
pub use runtime::{RunHandle, Runtime, RuntimeBuilder};

/// Reserved metadata key carrying the process-wide input sequence number
/// assigned by the input pipeline.
pub const SEQUENCE_KEY: &str = "sys.sequence";
/// Reserved metadata key marking a message that is being replayed after a
/// sequence conflict.
pub const REPROCESSING_KEY: &str = "sys.reprocessingContext";
/// Reserved metadata key for a source-assigned sequence number.
pub const SEQ_NUM_KEY: &str = "sn";
/// Reserved metadata key for a source-assigned stream identifier.
pub const STREAM_ID_KEY: &str = "stream_id";
/// Reserved metadata key for the type tag of the event a message carries.
pub const EVENT_TYPE_KEY: &str = "event_type";
/// Reserved metadata key stamping when an output message was buffered.
pub const TIMESTAMP_KEY: &str = "dt";

/// Key/value metadata attached to message references and buffered outputs.
pub type Metadata = HashMap<String, Value>;

/// Message is the uniform unit of data moving through the engine: a string
/// type tag plus a payload that is semantically opaque to the core.
/// ```
/// # use conveyor::Message;
/// # use serde_json::json;
/// let message = Message::new("ledger.Increment", json!({ "count": 4 }));
/// assert_eq!(message.mtype, "ledger.Increment");
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// type tag of the message; handlers are resolved against this string
    #[serde(rename = "type")]
    pub mtype: String,
    /// opaque payload; the core never inspects it
    pub payload: Value,
}

impl Message {
    /// Builds a message from a type tag and payload.
    pub fn new(mtype: impl Into<String>, payload: Value) -> Self {
        Message {
            mtype: mtype.into(),
            payload,
        }
    }
}

/// Status resolved through a message reference's release callback.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    /// Fully processed; carries the handler's response value when the source
    /// expects a per-message reply.
    Processed(Option<Value>),
    /// Processing failed with the given error description.
    Errored(String),
    /// The reference was evicted before it was handled.
    Evicted,
}

/// Channel for sending the final processing status back to a source.
///
/// Sources can optionally provide a callback channel when emitting message
/// references. The engine resolves it exactly once, after the outputs of the
/// message have been committed (or its failure is final).
pub type CallbackChan = oneshot::Sender<Status>;

/// Helper to create the transmitting and receiving pair used for
/// [CallbackChan] by source implementations.
pub fn new_callback_chan() -> (CallbackChan, oneshot::Receiver<Status>) {
    oneshot::channel()
}

/// MessageRef is the envelope a source emits: the message itself, key/value
/// metadata, a tracing span, and a one-shot release callback.
///
/// A reference is released at most once; release fires any registered
/// listeners in registration order before resolving the callback channel.
pub struct MessageRef {
    /// the message being carried
    pub message: Message,
    /// metadata attached by the source and the input pipeline
    pub metadata: Metadata,
    /// tracing span covering the lifetime of this reference
    pub span: tracing::Span,
    evicted: bool,
    released: bool,
    callback: Option<CallbackChan>,
    listeners: Vec<Box<dyn FnOnce(&Status) + Send + Sync>>,
}

impl std::fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRef")
            .field("message", &self.message)
            .field("metadata", &self.metadata)
            .field("evicted", &self.evicted)
            .field("released", &self.released)
            .finish()
    }
}

impl MessageRef {
    /// Wraps a message with metadata and no release callback.
    pub fn new(message: Message, metadata: Metadata) -> Self {
        MessageRef {
            message,
            metadata,
            span: tracing::Span::none(),
            evicted: false,
            released: false,
            callback: None,
            listeners: Vec::new(),
        }
    }

    /// Wraps a message with metadata and a release callback.
    pub fn with_callback(message: Message, metadata: Metadata, callback: CallbackChan) -> Self {
        MessageRef {
            callback: Some(callback),
            ..MessageRef::new(message, metadata)
        }
    }

    /// Reads a metadata value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Sets a metadata value, replacing any previous entry for the key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        let _ = self.metadata.insert(key.into(), value);
    }

    /// The process-wide input sequence number, once assigned by the input
    /// pipeline.
    pub fn sequence(&self) -> Option<u64> {
        self.metadata.get(SEQUENCE_KEY).and_then(Value::as_u64)
    }

    /// Registers a listener fired on release, before the callback channel is
    /// resolved. Listeners fire in registration order.
    pub fn on_release(&mut self, listener: impl FnOnce(&Status) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Releases the reference with the given status. Subsequent calls are
    /// no-ops; a reference is released at most once.
    pub fn release(&mut self, status: Status) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        for listener in self.listeners.drain(..) {
            listener(&status);
        }
        if let Some(chan) = self.callback.take() {
            chan.send(status)
                .map_err(|_| Error::ExecutionError("release callback dropped".into()))?;
        }
        Ok(())
    }

    /// Whether the reference has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Marks the reference as evicted; evicted references are skipped by the
    /// processing stages.
    pub fn evict(&mut self) {
        self.evicted = true;
    }

    /// Whether the reference has been marked evicted.
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }
}

/// Context handed to a source on start, exposing engine controls.
///
/// `evict` marks queued references matching the predicate as evicted and
/// waits until every message currently in flight has resolved.
#[derive(Clone, Default)]
pub struct SourceContext {
    control: Option<std::sync::Arc<dyn EvictionControl>>,
}

impl SourceContext {
    pub(crate) fn with_control(control: std::sync::Arc<dyn EvictionControl>) -> Self {
        SourceContext {
            control: Some(control),
        }
    }

    /// Marks queued references matching `predicate` as evicted, then waits
    /// until all currently in-flight messages resolve. A no-op under the
    /// serial strategy, which holds at most one message at a time.
    pub async fn evict<F>(&self, predicate: F)
    where
        F: Fn(&MessageRef) -> bool + Send + Sync + 'static,
    {
        if let Some(control) = &self.control {
            control.evict(Box::new(predicate)).await;
        }
    }
}

pub(crate) trait EvictionControl: Send + Sync {
    fn evict<'a>(
        &'a self,
        predicate: Box<dyn Fn(&MessageRef) -> bool + Send + Sync>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>;
}

/// Source trait producing the lazy, possibly infinite sequence of message
/// references the engine consumes.
#[async_trait]
pub trait Source: Send {
    /// Called once before the first read with the engine-side context. The
    /// default implementation discards it; sources that evict keep it.
    async fn start(&mut self, _ctx: SourceContext) -> Result<(), Error> {
        Ok(())
    }

    /// Reads the next message reference. Returns [Error::EndOfInput] when the
    /// source is exhausted.
    async fn read(&mut self) -> Result<MessageRef, Error>;

    /// Asks the source to stop producing; subsequent reads should return
    /// [Error::EndOfInput] promptly.
    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Consistency guarantee an output sink makes about a batch it accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// No atomicity promise; items may fail individually.
    #[default]
    None = 0,
    /// The entire batch commits or fails as one.
    Atomic = 1,
    /// Items sharing a partition key commit or fail together.
    AtomicPerPartition = 2,
}

/// Guarantees an output sink advertises to the sink coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkGuarantees {
    /// Whether re-sending an already committed item is safe.
    pub idempotent: bool,
    /// Batch atomicity promise.
    pub consistency: Consistency,
    /// Upper bound on batch size accepted per call, if any.
    pub max_batch_size: Option<usize>,
}

/// Output sink trait. The coordinator calls `sink` with batches shaped
/// according to the advertised [SinkGuarantees].
#[async_trait]
pub trait OutputSink<T: Send + 'static>: Send + Sync {
    /// Commits a batch of items. The retry context allows a sink to bail out
    /// of further retry attempts.
    async fn sink(&self, items: Vec<T>, retry: &retry::RetryContext) -> Result<(), Error>;

    /// The guarantees this sink makes.
    fn guarantees(&self) -> SinkGuarantees;
}

#[async_trait]
impl<T, S> OutputSink<T> for std::sync::Arc<S>
where
    T: Send + 'static,
    S: OutputSink<T> + ?Sized,
{
    async fn sink(&self, items: Vec<T>, retry: &retry::RetryContext) -> Result<(), Error> {
        (**self).sink(items, retry).await
    }

    fn guarantees(&self) -> SinkGuarantees {
        (**self).guarantees()
    }
}

/// Result of validating a message.
#[derive(Clone, Debug, Default)]
pub struct Validation {
    /// Whether the message passed validation.
    pub success: bool,
    /// Failure detail when `success` is false.
    pub message: Option<String>,
}

impl Validation {
    /// A passing validation result.
    pub fn ok() -> Self {
        Validation {
            success: true,
            message: None,
        }
    }

    /// A failing validation result with a reason.
    pub fn fail(message: impl Into<String>) -> Self {
        Validation {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Validator applied to incoming messages and to buffered outputs.
pub trait Validator: Send + Sync {
    /// Validates a message.
    fn validate(&self, message: &Message) -> Validation;
}

/// Validator that accepts every message.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullValidator;

impl Validator for NullValidator {
    fn validate(&self, _message: &Message) -> Validation {
        Validation::ok()
    }
}

/// Result of a duplicate check on an incoming reference.
#[derive(Clone, Debug, Default)]
pub struct DupeCheck {
    /// Whether the reference duplicates one already seen.
    pub dupe: bool,
    /// Detail for the skip log when `dupe` is true.
    pub message: Option<String>,
}

/// Deduper consulted by the input pipeline; duplicate references are released
/// and skipped.
pub trait Deduper: Send + Sync {
    /// Checks whether a reference is a duplicate.
    fn is_dupe(&self, reference: &MessageRef) -> DupeCheck;
}

/// Enricher applied to messages as they enter the pipeline and to outputs as
/// they are buffered. Enrichment is a pure transformation chained in
/// registration order.
pub trait Enricher: Send + Sync {
    /// Returns the enriched message.
    fn enrich(&self, message: Message) -> Message;
}

/// Annotator contributing tags to the metrics emitted for a message.
pub trait MetricsAnnotator: Send + Sync {
    /// Tags to attach, keyed by tag name.
    fn annotate(&self, message: &Message) -> Vec<(String, String)>;
}

/// Maps message type tags to the names outputs are labeled with.
pub trait TypeMapper: Send + Sync {
    /// The output name for a type tag.
    fn type_name(&self, mtype: &str) -> String;
}

/// Default mapper: the substring after the last `.` of the type tag.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrettyTypeMapper;

impl TypeMapper for PrettyTypeMapper {
    fn type_name(&self, mtype: &str) -> String {
        match mtype.rsplit_once('.') {
            Some((_, name)) => name.to_string(),
            None => mtype.to_string(),
        }
    }
}

/// Enum to capture errors occurring throughout the engine.
///
/// Uses `thiserror` for ergonomic error handling with proper
/// `std::error::Error` implementation. Errors that wrap other errors use
/// `#[from]` for proper error chaining.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The input pipeline is exhausted and will not produce further
    /// references. Triggers a graceful shutdown of the engine.
    #[error("End of input reached")]
    EndOfInput,

    /// The queue was closed while the operation was waiting on it.
    #[error("Queue closed")]
    QueueClosed,

    /// A dispatch context was used after `complete` or `clear`.
    #[error("Dispatch context already completed")]
    AlreadyCompleted,

    /// A message failed validation and the handler set exposes no invalid
    /// handler.
    #[error("No invalid handler registered for message type: {0}")]
    NoInvalidHandler(String),

    /// A message failed validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A state write was based on a stale view of the key.
    #[error("Sequence conflict on key {key}: expected {expected}, found {actual}")]
    SequenceConflict {
        /// state key the conflict was detected on
        key: String,
        /// sequence or epoch the writer should have observed
        expected: u64,
        /// sequence or epoch the writer actually observed
        actual: u64,
    },

    /// A handler failed while processing a message.
    #[error("Processor failure: {0}")]
    ProcessingError(String),

    /// A state provider or aggregation source failed.
    #[error("State error: {0}")]
    StateError(String),

    /// An output sink failed to commit a batch.
    #[error("Sink error: {0}")]
    SinkError(String),

    /// A source failed while reading.
    #[error("Input error: {0}")]
    InputError(String),

    /// A message encoder failed.
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Configuration provided to the engine is invalid.
    #[error("Configuration validation failed: {0}")]
    ConfigFailedValidation(String),

    /// Yaml parsing errors found within engine configuration
    #[error("Unable to deserialize YAML object")]
    UnableToSerializeYamlObject(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON serialization errors from payload handling
    #[error("Unable to serialize JSON object")]
    UnableToSerializeJsonObject(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// Failure to send to an internal channel between engine stages
    #[error("Pipeline processing error: {0}")]
    UnableToSendToChannel(String),

    /// Error with the engine due to a failure of internal machinery
    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl Error {
    /// Whether this error is a sequence conflict; conflicts are never retried
    /// against the sink and instead trigger reprocessing.
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, Error::SequenceConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn release_fires_listeners_in_order() {
        use std::sync::{Arc, Mutex};

        let mut reference = MessageRef::new(Message::new("a.B", json!(1)), Metadata::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        reference.on_release(move |_| first.lock().expect("lock").push(1));
        reference.on_release(move |_| second.lock().expect("lock").push(2));

        reference.release(Status::Processed(None)).expect("release");
        assert_eq!(*order.lock().expect("lock"), vec![1, 2]);
    }

    #[test]
    fn release_is_one_shot() {
        let (tx, mut rx) = new_callback_chan();
        let mut reference =
            MessageRef::with_callback(Message::new("a.B", json!(1)), Metadata::new(), tx);

        reference.release(Status::Processed(None)).expect("release");
        assert!(reference.is_released());
        // second release is a no-op
        reference
            .release(Status::Errored("late".into()))
            .expect("release");

        assert!(matches!(rx.try_recv(), Ok(Status::Processed(None))));
    }

    #[test]
    fn sequence_reads_reserved_key() {
        let mut reference = MessageRef::new(Message::default(), Metadata::new());
        assert_eq!(reference.sequence(), None);
        reference.set_metadata(SEQUENCE_KEY, json!(17));
        assert_eq!(reference.sequence(), Some(17));
    }

    #[test]
    fn pretty_type_mapper_strips_prefix() {
        let mapper = PrettyTypeMapper;
        assert_eq!(mapper.type_name("orders.v2.Created"), "Created");
        assert_eq!(mapper.type_name("Created"), "Created");
    }

    #[test]
    fn consistency_discriminants_are_stable() {
        assert_eq!(Consistency::None as u8, 0);
        assert_eq!(Consistency::Atomic as u8, 1);
        assert_eq!(Consistency::AtomicPerPartition as u8, 2);
    }

    #[test]
    fn sequence_conflict_classification() {
        let err = Error::SequenceConflict {
            key: "tally-1".into(),
            expected: 3,
            actual: 1,
        };
        assert!(err.is_sequence_conflict());
        assert!(!Error::EndOfInput.is_sequence_conflict());
    }

    #[test]
    fn message_serializes_with_type_tag() {
        let message = Message::new("ledger.Increment", json!({ "count": 4 }));
        let encoded = serde_json::to_string(&message).expect("serialize");
        assert!(encoded.contains("\"type\":\"ledger.Increment\""));
    }
}
