use async_trait::async_trait;
use conveyor::context::{PublishedMessage, StoreItem};
use conveyor::retry::RetryContext;
use conveyor::state::{AggregateLoad, AggregationSource};
use conveyor::{Consistency, Error, Message, OutputSink, SinkGuarantees};
use std::collections::HashMap;
use std::sync::Mutex;

/// Publish sink capturing committed messages in commit order.
#[derive(Default)]
pub struct CapturePublishSink {
    published: Mutex<Vec<Message>>,
}

impl CapturePublishSink {
    pub fn new() -> Self {
        CapturePublishSink::default()
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().expect("lock").clone()
    }
}

#[async_trait]
impl OutputSink<PublishedMessage> for CapturePublishSink {
    async fn sink(&self, items: Vec<PublishedMessage>, _retry: &RetryContext) -> Result<(), Error> {
        let mut published = self.published.lock().expect("lock");
        published.extend(items.into_iter().map(|item| item.message));
        Ok(())
    }

    fn guarantees(&self) -> SinkGuarantees {
        SinkGuarantees {
            idempotent: true,
            consistency: Consistency::None,
            max_batch_size: None,
        }
    }
}

/// Shared in-memory event streams: the aggregation source providers load
/// from, and the store the store sink appends to.
#[derive(Default)]
pub struct StreamStore {
    streams: Mutex<HashMap<String, Vec<Message>>>,
}

impl StreamStore {
    pub fn new() -> Self {
        StreamStore::default()
    }

    pub fn events(&self, key: &str) -> Vec<Message> {
        self.streams
            .lock()
            .expect("lock")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn append(&self, key: &str, event: Message) {
        self.streams
            .lock()
            .expect("lock")
            .entry(key.to_string())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl AggregationSource for StreamStore {
    async fn load(&self, key: &str, at_sn: Option<u64>) -> Result<AggregateLoad, Error> {
        let streams = self.streams.lock().expect("lock");
        let events: Vec<Message> = streams.get(key).cloned().unwrap_or_default();
        let events = match at_sn {
            Some(sn) => events.into_iter().take(sn as usize).collect(),
            None => events,
        };
        let last_sn = events.len() as u64;
        Ok(AggregateLoad {
            snapshot: None,
            events,
            last_sn,
        })
    }
}

/// Store sink appending to a [StreamStore] with optimistic sequence checks.
///
/// Each item must start exactly at the current end of its stream, or the
/// sink reports a sequence conflict. Optionally injects one foreign event
/// after the first successful append, to simulate a concurrent writer.
pub struct StreamStoreSink {
    store: std::sync::Arc<StreamStore>,
    inject_after_first: Mutex<Option<(String, Message)>>,
    guarantees: SinkGuarantees,
}

impl StreamStoreSink {
    pub fn new(store: std::sync::Arc<StreamStore>) -> Self {
        StreamStoreSink {
            store,
            inject_after_first: Mutex::new(None),
            guarantees: SinkGuarantees {
                idempotent: true,
                consistency: Consistency::AtomicPerPartition,
                max_batch_size: None,
            },
        }
    }

    /// Arms a one-shot foreign append of `event` onto `key`, fired right
    /// after the first successful store.
    pub fn inject_after_first(self, key: &str, event: Message) -> Self {
        *self.inject_after_first.lock().expect("lock") = Some((key.to_string(), event));
        self
    }
}

#[async_trait]
impl OutputSink<StoreItem> for StreamStoreSink {
    async fn sink(&self, items: Vec<StoreItem>, _retry: &RetryContext) -> Result<(), Error> {
        // (key, origin sequence) pairs already checked within this call;
        // later stores from the same handler invocation append in order
        let mut checked: Vec<(String, u64)> = Vec::new();
        let mut appended = false;
        for item in &items {
            let state = item.state();
            let origin_sequence = match item {
                StoreItem::Message(stored) => stored.origin.get(conveyor::SEQUENCE_KEY),
                StoreItem::Verification(verification) => {
                    verification.origin.get(conveyor::SEQUENCE_KEY)
                }
            }
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_default();
            let origin = (state.key.clone(), origin_sequence);
            let current = self.store.events(&state.key).len() as u64;
            match item {
                StoreItem::Message(stored) => {
                    if !checked.contains(&origin) {
                        if state.seq_num != current {
                            return Err(Error::SequenceConflict {
                                key: state.key.clone(),
                                expected: current,
                                actual: state.seq_num,
                            });
                        }
                        checked.push(origin);
                    }
                    self.store.append(&state.key, stored.message.clone());
                    appended = true;
                }
                StoreItem::Verification(_) => {
                    if state.seq_num != current {
                        return Err(Error::SequenceConflict {
                            key: state.key.clone(),
                            expected: current,
                            actual: state.seq_num,
                        });
                    }
                }
            }
        }
        if appended {
            if let Some((key, event)) = self.inject_after_first.lock().expect("lock").take() {
                self.store.append(&key, event);
            }
        }
        Ok(())
    }

    fn guarantees(&self) -> SinkGuarantees {
        self.guarantees
    }
}
