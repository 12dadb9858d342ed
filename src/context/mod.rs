//! Per-message dispatch context.
//!
//! A context is the scratch area a handler works against: it buffers intended
//! publishes and stores, tracks the state references loaded during handling,
//! and buffers metrics. Nothing leaves the context until the engine commits
//! it; a failed or cleared context leaves no trace.
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

use crate::metrics::{BufferedMetrics, MetricsSink};
use crate::retry::RetryContext;
use crate::state::{StateProvider, StateRef};
use crate::{
    Enricher, Error, Message, Metadata, TypeMapper, EVENT_TYPE_KEY, SEQ_NUM_KEY, TIMESTAMP_KEY,
};

/// A downstream event buffered by `publish`.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    /// the outgoing message, already enriched
    pub message: Message,
    /// metadata attached at publish time
    pub metadata: Metadata,
    /// metadata of the source reference this output derives from
    pub origin: Metadata,
}

/// A state-change event buffered by `store`, bound to the state reference the
/// change was computed against.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    /// the outgoing event, already enriched
    pub message: Message,
    /// the state reference the change is based on
    pub state: StateRef,
    /// metadata attached at store time
    pub metadata: Metadata,
    /// metadata of the source reference this output derives from
    pub origin: Metadata,
}

/// Read-only assertion that a key was observed at a sequence number; lets the
/// store sink detect concurrent modification even when a handler stored
/// nothing.
#[derive(Clone, Debug)]
pub struct StateVerification {
    /// the observed state reference
    pub state: StateRef,
    /// metadata of the source reference the observation was made under
    pub origin: Metadata,
}

/// Item handed to the store sink.
#[derive(Clone, Debug)]
pub enum StoreItem {
    /// a state-change event to append
    Message(StoredMessage),
    /// a read assertion to check
    Verification(StateVerification),
}

impl StoreItem {
    /// The state reference this item is pinned to.
    pub fn state(&self) -> &StateRef {
        match self {
            StoreItem::Message(stored) => &stored.state,
            StoreItem::Verification(verification) => &verification.state,
        }
    }

    /// The state key this item targets.
    pub fn key(&self) -> &str {
        &self.state().key
    }
}

/// Outcome of the handler invocation that owned a context.
#[derive(Clone, Debug, Default)]
pub struct HandlerResult {
    /// value returned by the handler, released to RPC-style sources
    pub value: Option<Value>,
    /// error description when the handler failed
    pub error: Option<String>,
}

/// Per-message scratch area handed to handlers.
pub struct DispatchContext {
    message: Message,
    source_metadata: Metadata,
    sequence: u64,
    published: Vec<PublishedMessage>,
    stored: Vec<StoredMessage>,
    loaded: Vec<StateRef>,
    metrics: BufferedMetrics,
    handler_result: HandlerResult,
    retry: RetryContext,
    completed: bool,
    state: Option<Arc<dyn StateProvider>>,
    enrichers: Arc<Vec<Box<dyn Enricher>>>,
    type_mapper: Arc<dyn TypeMapper>,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("message", &self.message)
            .field("sequence", &self.sequence)
            .field("published", &self.published.len())
            .field("stored", &self.stored.len())
            .field("loaded", &self.loaded.len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl DispatchContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        message: Message,
        source_metadata: Metadata,
        sequence: u64,
        state: Option<Arc<dyn StateProvider>>,
        enrichers: Arc<Vec<Box<dyn Enricher>>>,
        type_mapper: Arc<dyn TypeMapper>,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> Self {
        DispatchContext {
            message,
            source_metadata,
            sequence,
            published: Vec::new(),
            stored: Vec::new(),
            loaded: Vec::new(),
            metrics: BufferedMetrics::new(),
            handler_result: HandlerResult::default(),
            retry: RetryContext::standalone(),
            completed: false,
            state,
            enrichers,
            type_mapper,
            metrics_sink,
        }
    }

    /// The message this context was created for.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The process-wide input sequence number of the source reference.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reads a metadata value from the source reference.
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.source_metadata.get(key)
    }

    /// The output name for a type tag, per the configured mapper.
    pub fn type_name(&self, mtype: &str) -> String {
        self.type_mapper.type_name(mtype)
    }

    /// The retry context of the current dispatch attempt.
    pub fn retry(&self) -> &RetryContext {
        &self.retry
    }

    pub(crate) fn set_retry(&mut self, retry: RetryContext) {
        self.retry = retry;
    }

    /// Buffered metrics recorder; observations reach the backend only when
    /// the context completes.
    pub fn metrics(&mut self) -> &mut BufferedMetrics {
        &mut self.metrics
    }

    /// The handler outcome captured by the engine.
    pub fn handler_result(&self) -> &HandlerResult {
        &self.handler_result
    }

    pub(crate) fn set_handler_result(&mut self, result: HandlerResult) {
        self.handler_result = result;
    }

    /// Whether `complete` or `clear` has sealed this context.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn enrich(&self, message: Message) -> Message {
        self.enrichers
            .iter()
            .fold(message, |message, enricher| enricher.enrich(message))
    }

    fn output_metadata(&self, mtype: &str, meta: Option<Metadata>) -> Metadata {
        let mut metadata = meta.unwrap_or_default();
        let _ = metadata
            .entry(EVENT_TYPE_KEY.to_string())
            .or_insert_with(|| Value::String(self.type_name(mtype)));
        let _ = metadata
            .entry(TIMESTAMP_KEY.to_string())
            .or_insert_with(|| Value::from(Utc::now().timestamp_millis()));
        metadata
    }

    /// Buffers a downstream event for the publish sink.
    pub fn publish(
        &mut self,
        mtype: &str,
        payload: Value,
        meta: Option<Metadata>,
    ) -> Result<(), Error> {
        if self.completed {
            return Err(Error::AlreadyCompleted);
        }
        let metadata = self.output_metadata(mtype, meta);
        let message = self.enrich(Message::new(mtype, payload));
        trace!(mtype, sequence = self.sequence, "buffered publish");
        self.published.push(PublishedMessage {
            message,
            metadata,
            origin: self.source_metadata.clone(),
        });
        Ok(())
    }

    /// Buffers a state-change event for the store sink, bound to the state
    /// reference the change was computed against.
    pub fn store(
        &mut self,
        mtype: &str,
        state: &StateRef,
        payload: Value,
        meta: Option<Metadata>,
    ) -> Result<(), Error> {
        if self.completed {
            return Err(Error::AlreadyCompleted);
        }
        let mut metadata = self.output_metadata(mtype, meta);
        let _ = metadata
            .entry(SEQ_NUM_KEY.to_string())
            .or_insert_with(|| Value::from(state.seq_num));
        let message = self.enrich(Message::new(mtype, payload));
        trace!(
            mtype,
            key = state.key,
            seq_num = state.seq_num,
            sequence = self.sequence,
            "buffered store"
        );
        self.stored.push(StoredMessage {
            message,
            state: state.clone(),
            metadata,
            origin: self.source_metadata.clone(),
        });
        Ok(())
    }

    /// Loads state for a key through the configured provider and records the
    /// returned reference in the loaded set.
    pub async fn state_get(&mut self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error> {
        if self.completed {
            return Err(Error::AlreadyCompleted);
        }
        let provider = self
            .state
            .as_ref()
            .ok_or_else(|| Error::StateError("no state provider configured".into()))?;
        let reference = provider.get(key, at_sn).await?;
        if !self
            .loaded
            .iter()
            .any(|seen| seen.unique_id() == reference.unique_id())
        {
            self.loaded.push(reference.clone());
        }
        Ok(reference)
    }

    /// Buffered downstream events.
    pub fn published(&self) -> &[PublishedMessage] {
        &self.published
    }

    /// Buffered state-change events.
    pub fn stored(&self) -> &[StoredMessage] {
        &self.stored
    }

    /// State references loaded during handling.
    pub fn loaded(&self) -> &[StateRef] {
        &self.loaded
    }

    /// Keys of the state references loaded during handling.
    pub fn loaded_keys(&self) -> Vec<String> {
        self.loaded.iter().map(|r| r.key.clone()).collect()
    }

    /// Read assertions for loaded keys the handler stored nothing against.
    pub(crate) fn verifications(&self) -> Vec<StateVerification> {
        self.loaded
            .iter()
            .filter(|reference| !self.stored.iter().any(|s| s.state.key == reference.key))
            .map(|reference| StateVerification {
                state: reference.clone(),
                origin: self.source_metadata.clone(),
            })
            .collect()
    }

    /// The full set of items for the store sink: state-change events followed
    /// by read assertions.
    pub(crate) fn store_items(&self) -> Vec<StoreItem> {
        let mut items: Vec<StoreItem> = self.stored.iter().cloned().map(StoreItem::Message).collect();
        items.extend(self.verifications().into_iter().map(StoreItem::Verification));
        items
    }

    /// Computes the post-application state reference per stored key via the
    /// provider, grouping pending stores by key.
    pub fn compute_loaded(&self) -> Result<Vec<StateRef>, Error> {
        let provider = match &self.state {
            Some(provider) => provider,
            None => return Ok(Vec::new()),
        };
        let mut order: Vec<&str> = Vec::new();
        for stored in &self.stored {
            if !order.contains(&stored.state.key.as_str()) {
                order.push(&stored.state.key);
            }
        }
        let mut computed = Vec::with_capacity(order.len());
        for key in order {
            let base = self
                .stored
                .iter()
                .find(|s| s.state.key == key)
                .map(|s| &s.state)
                .ok_or_else(|| Error::StateError(format!("no base reference for key {key}")))?;
            let events: Vec<Message> = self
                .stored
                .iter()
                .filter(|s| s.state.key == key)
                .map(|s| s.message.clone())
                .collect();
            computed.push(provider.compute(base, &events)?);
        }
        Ok(computed)
    }

    /// Seals the context: buffered metrics are flushed and the computed
    /// post-handler state references are written back to the provider cache.
    pub async fn complete(&mut self) -> Result<(), Error> {
        if self.completed {
            return Err(Error::AlreadyCompleted);
        }
        self.completed = true;
        if let Some(provider) = &self.state {
            for reference in self.compute_loaded()? {
                provider.set(reference).await;
            }
        }
        self.metrics.flush(self.metrics_sink.as_ref());
        Ok(())
    }

    /// Discards buffered outputs, metrics, and loaded state, sealing the
    /// context.
    pub fn clear(&mut self) {
        self.published.clear();
        self.stored.clear();
        self.loaded.clear();
        self.metrics.discard();
        self.completed = true;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use crate::PrettyTypeMapper;

    /// Builds a context with default collaborators for unit tests.
    pub(crate) fn context(
        message: Message,
        sequence: u64,
        state: Option<Arc<dyn StateProvider>>,
    ) -> DispatchContext {
        let mut metadata = Metadata::new();
        let _ = metadata.insert(crate::SEQUENCE_KEY.to_string(), Value::from(sequence));
        DispatchContext::new(
            message,
            metadata,
            sequence,
            state,
            Arc::new(Vec::new()),
            Arc::new(PrettyTypeMapper),
            Arc::new(NoopMetricsSink),
        )
    }
}

#[cfg(test)]
mod test {
    use super::test_support::context;
    use super::*;
    use crate::state::test_support::{tally_aggregator, MemoryStreams};
    use crate::state::{CachingStateProvider, EventSourcedStateProvider};
    use serde_json::json;

    fn caching_provider(streams: Arc<MemoryStreams>) -> Arc<CachingStateProvider> {
        let inner = EventSourcedStateProvider::new(streams, Arc::new(tally_aggregator()));
        Arc::new(CachingStateProvider::new(Arc::new(inner), 16, None))
    }

    #[test]
    fn publish_buffers_and_stamps_metadata() {
        let mut ctx = context(Message::new("ledger.Increment", json!({ "count": 4 })), 1, None);
        ctx.publish("ledger.Decrement", json!({ "count": 5 }), None)
            .expect("publish");

        let published = ctx.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message.mtype, "ledger.Decrement");
        assert_eq!(
            published[0].metadata.get(EVENT_TYPE_KEY),
            Some(&json!("Decrement"))
        );
        assert!(published[0].metadata.contains_key(TIMESTAMP_KEY));
    }

    #[test]
    fn publish_after_complete_fails() {
        let mut ctx = context(Message::default(), 1, None);
        tokio_test::block_on(ctx.complete()).expect("complete");
        assert!(matches!(
            ctx.publish("a.B", json!(1), None),
            Err(Error::AlreadyCompleted)
        ));
        let state = StateRef::new(json!({}), "k", 0);
        assert!(matches!(
            ctx.store("a.B", &state, json!(1), None),
            Err(Error::AlreadyCompleted)
        ));
    }

    #[test]
    fn publish_after_clear_fails() {
        let mut ctx = context(Message::default(), 1, None);
        ctx.publish("a.B", json!(1), None).expect("publish");
        ctx.clear();
        assert!(ctx.published().is_empty());
        assert!(matches!(
            ctx.publish("a.B", json!(2), None),
            Err(Error::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn state_get_records_loaded_reference() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        let provider = caching_provider(streams);
        let mut ctx = context(Message::default(), 1, Some(provider));

        let reference = ctx.state_get("tally-1", None).await.expect("get");
        assert_eq!(reference.seq_num, 1);
        assert_eq!(ctx.loaded().len(), 1);

        // loading the same version twice records it once
        let _ = ctx.state_get("tally-1", None).await.expect("get");
        assert_eq!(ctx.loaded().len(), 1);
    }

    #[tokio::test]
    async fn store_and_verifications_partition_loaded_keys() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("a", Message::new("ledger.Increment", json!({ "count": 1 })));
        streams.append("b", Message::new("ledger.Increment", json!({ "count": 2 })));
        let provider = caching_provider(streams);
        let mut ctx = context(Message::default(), 1, Some(provider));

        let ref_a = ctx.state_get("a", None).await.expect("get");
        let _ref_b = ctx.state_get("b", None).await.expect("get");
        ctx.store("ledger.Increment", &ref_a, json!({ "count": 3 }), None)
            .expect("store");

        let items = ctx.store_items();
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], StoreItem::Message(s) if s.state.key == "a"));
        assert!(matches!(&items[1], StoreItem::Verification(v) if v.state.key == "b"));
    }

    #[tokio::test]
    async fn compute_loaded_groups_stores_by_key() {
        let streams = Arc::new(MemoryStreams::default());
        let provider = caching_provider(streams);
        let mut ctx = context(Message::default(), 1, Some(provider));

        let reference = ctx.state_get("tally-1", None).await.expect("get");
        assert!(reference.is_new());
        ctx.store("ledger.Increment", &reference, json!({ "count": 4 }), None)
            .expect("store");
        ctx.store("ledger.Increment", &reference, json!({ "count": 7 }), None)
            .expect("store");

        let computed = ctx.compute_loaded().expect("compute");
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].seq_num, 2);
        assert_eq!(computed[0].state["total"], json!(11));
    }

    #[tokio::test]
    async fn complete_writes_computed_state_back_to_cache() {
        let streams = Arc::new(MemoryStreams::default());
        let provider = caching_provider(Arc::clone(&streams));
        let mut ctx = context(
            Message::default(),
            1,
            Some(Arc::clone(&provider) as Arc<dyn StateProvider>),
        );

        let reference = ctx.state_get("tally-1", None).await.expect("get");
        ctx.store("ledger.Increment", &reference, json!({ "count": 4 }), None)
            .expect("store");
        ctx.complete().await.expect("complete");

        // the cache now serves the post-handler state without a stream append
        let cached = provider.get("tally-1", None).await.expect("get");
        assert_eq!(cached.seq_num, 1);
        assert_eq!(cached.state["total"], json!(4));
    }

    #[test]
    fn stored_metadata_carries_target_sequence() {
        let mut ctx = context(Message::default(), 1, None);
        let state = StateRef::new(json!({}), "k", 3);
        ctx.store("ledger.Increment", &state, json!({ "count": 1 }), None)
            .expect("store");
        assert_eq!(ctx.stored()[0].metadata.get(SEQ_NUM_KEY), Some(&json!(3)));
    }
}
