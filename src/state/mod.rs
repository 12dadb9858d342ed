//! State providers backing `state.get` in dispatch contexts.
//!
//! An event-sourced provider aggregates an event stream into state through a
//! registered aggregator; a materialized provider treats the latest snapshot
//! as the state. Either can be wrapped by [cache::CachingStateProvider], and
//! under RPC parallelism additionally by [epoch::EpochAwareStateProvider].
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::{Error, Message};

pub mod cache;
pub mod epoch;

pub use cache::CachingStateProvider;
pub use epoch::{EpochAwareStateProvider, EpochManager};

/// A snapshot of state at a key, pinned to the sequence number it was
/// observed at.
#[derive(Clone, Debug, PartialEq)]
pub struct StateRef {
    /// the aggregated state
    pub state: Value,
    /// the state key
    pub key: String,
    /// sequence number of the last event folded into `state`
    pub seq_num: u64,
    /// generation counter attached by the epoch-aware provider
    pub epoch: Option<u64>,
}

impl StateRef {
    /// Builds a reference without an epoch.
    pub fn new(state: Value, key: impl Into<String>, seq_num: u64) -> Self {
        StateRef {
            state,
            key: key.into(),
            seq_num,
            epoch: None,
        }
    }

    /// `key@seqNum`, unique per observed version of a key.
    pub fn unique_id(&self) -> String {
        format!("{}@{}", self.key, self.seq_num)
    }

    /// Whether the key had no events when this reference was created.
    pub fn is_new(&self) -> bool {
        self.seq_num == 0
    }
}

/// What an aggregation source loads for a key: an optional snapshot plus the
/// events recorded after it.
#[derive(Clone, Debug, Default)]
pub struct AggregateLoad {
    /// materialized snapshot, if the store keeps one
    pub snapshot: Option<Value>,
    /// events after the snapshot, oldest first
    pub events: Vec<Message>,
    /// sequence number of the last event in the stream (0 when empty)
    pub last_sn: u64,
}

/// Storage seam the providers load from.
#[async_trait]
pub trait AggregationSource: Send + Sync {
    /// Loads the snapshot and events for a key, up to `at_sn` when given.
    async fn load(&self, key: &str, at_sn: Option<u64>) -> Result<AggregateLoad, Error>;
}

/// Provider seam backing `state.get` in dispatch contexts.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Loads the state of a key, optionally pinned at a sequence number.
    async fn get(&self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error>;

    /// Applies `events` on top of `base` and returns the advanced reference.
    fn compute(&self, base: &StateRef, events: &[Message]) -> Result<StateRef, Error>;

    /// Cache lifecycle: offers a reference for write-back. Default no-op.
    async fn set(&self, _reference: StateRef) {}

    /// Cache lifecycle: drops any cached entries for the keys. Default no-op.
    async fn invalidate(&self, _keys: &[String]) {}
}

type ApplyFn = Box<dyn Fn(&mut Value, &Message) + Send + Sync>;

/// Aggregator folding events into state, one registered function per event
/// type. Events with no registered function are skipped.
///
/// ```
/// # use conveyor::state::Aggregator;
/// # use serde_json::json;
/// let aggregator = Aggregator::new(|| json!({ "total": 0 })).on("Increment", |state, event| {
///     let count = event.payload["count"].as_i64().unwrap_or(0);
///     state["total"] = json!(state["total"].as_i64().unwrap_or(0) + count);
/// });
/// ```
pub struct Aggregator {
    init: Box<dyn Fn() -> Value + Send + Sync>,
    routes: FxHashMap<String, ApplyFn>,
}

impl Aggregator {
    /// Builds an aggregator with the constructor for fresh state.
    pub fn new(init: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Aggregator {
            init: Box::new(init),
            routes: FxHashMap::default(),
        }
    }

    /// Registers the fold function for an event type name. Events match by
    /// full type tag or by the substring after the last `.`.
    pub fn on(
        mut self,
        type_name: impl Into<String>,
        apply: impl Fn(&mut Value, &Message) + Send + Sync + 'static,
    ) -> Self {
        let _ = self.routes.insert(type_name.into(), Box::new(apply));
        self
    }

    /// A fresh, empty state value.
    pub fn fresh(&self) -> Value {
        (self.init)()
    }

    /// Folds one event into `state`.
    pub fn apply(&self, state: &mut Value, event: &Message) {
        let route = self.routes.get(&event.mtype).or_else(|| {
            event
                .mtype
                .rsplit_once('.')
                .and_then(|(_, name)| self.routes.get(name))
        });
        if let Some(apply) = route {
            apply(state, event);
        }
    }

    /// Folds a sequence of events into `state`, oldest first.
    pub fn apply_all(&self, state: &mut Value, events: &[Message]) {
        for event in events {
            self.apply(state, event);
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Provider that reconstructs state by folding an event stream through an
/// [Aggregator], starting from the stored snapshot when one exists.
pub struct EventSourcedStateProvider {
    source: Arc<dyn AggregationSource>,
    aggregator: Arc<Aggregator>,
}

impl EventSourcedStateProvider {
    /// Builds a provider over a source and aggregator.
    pub fn new(source: Arc<dyn AggregationSource>, aggregator: Arc<Aggregator>) -> Self {
        EventSourcedStateProvider { source, aggregator }
    }
}

#[async_trait]
impl StateProvider for EventSourcedStateProvider {
    async fn get(&self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error> {
        let load = self.source.load(key, at_sn).await?;
        let mut state = load.snapshot.unwrap_or_else(|| self.aggregator.fresh());
        self.aggregator.apply_all(&mut state, &load.events);
        Ok(StateRef::new(state, key, load.last_sn))
    }

    fn compute(&self, base: &StateRef, events: &[Message]) -> Result<StateRef, Error> {
        let mut state = base.state.clone();
        self.aggregator.apply_all(&mut state, events);
        Ok(StateRef {
            state,
            key: base.key.clone(),
            seq_num: base.seq_num + events.len() as u64,
            epoch: base.epoch,
        })
    }
}

/// Provider for materialized state: the latest snapshot is the state, and
/// state-change events carry the next snapshot as their payload.
pub struct MaterializedStateProvider {
    source: Arc<dyn AggregationSource>,
}

impl MaterializedStateProvider {
    /// Builds a provider over a snapshot source.
    pub fn new(source: Arc<dyn AggregationSource>) -> Self {
        MaterializedStateProvider { source }
    }
}

#[async_trait]
impl StateProvider for MaterializedStateProvider {
    async fn get(&self, key: &str, at_sn: Option<u64>) -> Result<StateRef, Error> {
        let load = self.source.load(key, at_sn).await?;
        let state = load
            .events
            .last()
            .map(|event| event.payload.clone())
            .or(load.snapshot)
            .unwrap_or(Value::Null);
        Ok(StateRef::new(state, key, load.last_sn))
    }

    fn compute(&self, base: &StateRef, events: &[Message]) -> Result<StateRef, Error> {
        let state = events
            .last()
            .map(|event| event.payload.clone())
            .unwrap_or_else(|| base.state.clone());
        Ok(StateRef {
            state,
            key: base.key.clone(),
            seq_num: base.seq_num + events.len() as u64,
            epoch: base.epoch,
        })
    }
}


#[cfg(test)]
mod test {
    use super::test_support::{tally_aggregator, MemoryStreams};
    use super::*;
    use serde_json::json;

    #[test]
    fn state_ref_identity() {
        let reference = StateRef::new(json!({}), "tally-1", 3);
        assert_eq!(reference.unique_id(), "tally-1@3");
        assert!(!reference.is_new());
        assert!(StateRef::new(json!({}), "tally-1", 0).is_new());
    }

    #[tokio::test]
    async fn event_sourced_get_aggregates_stream() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 7 })));
        let provider =
            EventSourcedStateProvider::new(streams, Arc::new(tally_aggregator()));

        let reference = provider.get("tally-1", None).await.expect("get");
        assert_eq!(reference.state["total"], json!(11));
        assert_eq!(reference.seq_num, 2);
    }

    #[tokio::test]
    async fn event_sourced_get_pinned_at_sn() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 4 })));
        streams.append("tally-1", Message::new("ledger.Increment", json!({ "count": 7 })));
        let provider =
            EventSourcedStateProvider::new(streams, Arc::new(tally_aggregator()));

        let reference = provider.get("tally-1", Some(1)).await.expect("get");
        assert_eq!(reference.state["total"], json!(4));
        assert_eq!(reference.seq_num, 1);
    }

    #[tokio::test]
    async fn compute_advances_without_touching_base() {
        let streams = Arc::new(MemoryStreams::default());
        let provider =
            EventSourcedStateProvider::new(streams, Arc::new(tally_aggregator()));
        let base = StateRef::new(json!({ "total": 4 }), "tally-1", 1);

        let advanced = provider
            .compute(
                &base,
                &[
                    Message::new("ledger.Increment", json!({ "count": 7 })),
                    Message::new("ledger.Increment", json!({ "count": 2 })),
                ],
            )
            .expect("compute");
        assert_eq!(advanced.seq_num, 3);
        assert_eq!(advanced.state["total"], json!(13));
        // the base reference is untouched
        assert_eq!(base.state["total"], json!(4));
    }

    #[tokio::test]
    async fn prefix_aggregation_matches_snapshot_load() {
        // folding a prefix from scratch equals folding onto the loaded prefix
        let streams = Arc::new(MemoryStreams::default());
        for count in [4, 7, 2] {
            streams.append(
                "tally-1",
                Message::new("ledger.Increment", json!({ "count": count })),
            );
        }
        let provider =
            EventSourcedStateProvider::new(Arc::clone(&streams) as Arc<dyn AggregationSource>, Arc::new(tally_aggregator()));

        let full = provider.get("tally-1", None).await.expect("get");
        let prefix = provider.get("tally-1", Some(2)).await.expect("get");
        let extended = provider
            .compute(
                &prefix,
                &[Message::new("ledger.Increment", json!({ "count": 2 }))],
            )
            .expect("compute");
        assert_eq!(extended.state, full.state);
        assert_eq!(extended.seq_num, full.seq_num);
    }

    #[tokio::test]
    async fn materialized_state_is_last_event_payload() {
        let streams = Arc::new(MemoryStreams::default());
        streams.append("doc-1", Message::new("doc.Saved", json!({ "rev": 1 })));
        streams.append("doc-1", Message::new("doc.Saved", json!({ "rev": 2 })));
        let provider = MaterializedStateProvider::new(streams);

        let reference = provider.get("doc-1", None).await.expect("get");
        assert_eq!(reference.state, json!({ "rev": 2 }));
        assert_eq!(reference.seq_num, 2);
    }

    #[test]
    fn materialized_compute_clones_current_state_without_events() {
        let streams = Arc::new(MemoryStreams::default());
        let provider = MaterializedStateProvider::new(streams);
        let base = StateRef::new(json!({ "rev": 2 }), "doc-1", 2);

        let same = provider.compute(&base, &[]).expect("compute");
        assert_eq!(same.state, base.state);
        assert_eq!(same.seq_num, 2);

        let advanced = provider
            .compute(&base, &[Message::new("doc.Saved", json!({ "rev": 3 }))])
            .expect("compute");
        assert_eq!(advanced.state, json!({ "rev": 3 }));
        assert_eq!(advanced.seq_num, 3);
    }

    #[test]
    fn aggregator_skips_unregistered_events() {
        let aggregator = tally_aggregator();
        let mut state = aggregator.fresh();
        aggregator.apply(&mut state, &Message::new("ledger.Unknown", json!({})));
        assert_eq!(state["total"], json!(0));
    }
}
