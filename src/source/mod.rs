//! Input composition: merges the configured sources into one sequence of
//! message references, assigning sequence numbers, enriching, deduplicating,
//! and tracking outstanding releases.
use futures::future::join_all;
use rustc_hash::FxHashSet;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::{Deduper, Enricher, Error, MessageRef, Source, SourceContext, Status, SEQUENCE_KEY};

/// Tracks references that have been handed downstream but not yet released.
#[derive(Default)]
pub(crate) struct PendingSet {
    inner: Mutex<FxHashSet<u64>>,
    changed: Notify,
}

impl PendingSet {
    fn track(&self, sequence: u64) {
        let _ = self.inner.lock().expect("pending lock").insert(sequence);
    }

    fn resolve(&self, sequence: u64) {
        let _ = self.inner.lock().expect("pending lock").remove(&sequence);
        self.changed.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending lock").len()
    }

    /// Waits until every tracked reference has been released.
    pub(crate) async fn drain(&self) {
        loop {
            let waiter = self.changed.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            if self.inner.lock().expect("pending lock").is_empty() {
                return;
            }
            waiter.await;
        }
    }
}

struct SourceSlot {
    source: Box<dyn Source>,
    done: bool,
}

/// The composite input feeding an engine run.
///
/// With several sources, references are taken one at a time from each in
/// rotation; a source ending removes only itself, and the pipeline ends once
/// the last source terminates and all outstanding references are released.
pub(crate) struct InputPipeline {
    slots: Vec<SourceSlot>,
    next_slot: usize,
    enrichers: Arc<Vec<Box<dyn Enricher>>>,
    deduper: Option<Box<dyn Deduper>>,
    sequence: u64,
    pending: Arc<PendingSet>,
}

impl InputPipeline {
    pub(crate) fn new(
        sources: Vec<Box<dyn Source>>,
        enrichers: Arc<Vec<Box<dyn Enricher>>>,
        deduper: Option<Box<dyn Deduper>>,
    ) -> Self {
        InputPipeline {
            slots: sources
                .into_iter()
                .map(|source| SourceSlot {
                    source,
                    done: false,
                })
                .collect(),
            next_slot: 0,
            enrichers,
            deduper,
            sequence: 0,
            pending: Arc::new(PendingSet::default()),
        }
    }

    /// Hands the engine context to every source before the first read.
    pub(crate) async fn start(&mut self, ctx: SourceContext) -> Result<(), Error> {
        for slot in &mut self.slots {
            slot.source.start(ctx.clone()).await?;
        }
        Ok(())
    }

    /// Asks every live source to stop producing.
    pub(crate) async fn stop(&mut self) -> Result<(), Error> {
        let results = join_all(
            self.slots
                .iter_mut()
                .filter(|slot| !slot.done)
                .map(|slot| slot.source.stop()),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    pub(crate) fn pending(&self) -> Arc<PendingSet> {
        Arc::clone(&self.pending)
    }

    fn pick_slot(&mut self) -> Option<usize> {
        let count = self.slots.len();
        for offset in 0..count {
            let index = (self.next_slot + offset) % count;
            if !self.slots[index].done {
                self.next_slot = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    /// The next reference, or `None` once every source has ended and all
    /// outstanding references are released.
    pub(crate) async fn next(&mut self) -> Result<Option<MessageRef>, Error> {
        loop {
            let index = match self.pick_slot() {
                Some(index) => index,
                None => {
                    trace!(
                        outstanding = self.pending.len(),
                        "sources exhausted, draining outstanding references"
                    );
                    self.pending.drain().await;
                    return Ok(None);
                }
            };

            match self.slots[index].source.read().await {
                Ok(mut reference) => {
                    self.sequence += 1;
                    let sequence = self.sequence;
                    reference.set_metadata(SEQUENCE_KEY, Value::from(sequence));

                    let message = std::mem::take(&mut reference.message);
                    reference.message = self
                        .enrichers
                        .iter()
                        .fold(message, |message, enricher| enricher.enrich(message));

                    if let Some(deduper) = &self.deduper {
                        let check = deduper.is_dupe(&reference);
                        if check.dupe {
                            debug!(
                                sequence,
                                reason = check.message.as_deref().unwrap_or("duplicate"),
                                "skipping duplicate reference"
                            );
                            reference.release(Status::Processed(None))?;
                            continue;
                        }
                    }

                    self.pending.track(sequence);
                    let pending = Arc::clone(&self.pending);
                    reference.on_release(move |_| pending.resolve(sequence));
                    return Ok(Some(reference));
                }
                Err(Error::EndOfInput) => {
                    debug!(source = index, "source ended");
                    self.slots[index].done = true;
                }
                Err(error) => {
                    tracing::error!(source = index, error = %error, "read error from source");
                    return Err(error);
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::test_support::ListSource;
    use super::*;
    use crate::{DupeCheck, Message};
    use serde_json::json;
    use tokio::time::{sleep, timeout, Duration};

    fn messages(prefix: &str, count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new("test.Item", json!({ "id": format!("{prefix}{i}") })))
            .collect()
    }

    fn pipeline(sources: Vec<Box<dyn Source>>) -> InputPipeline {
        InputPipeline::new(sources, Arc::new(Vec::new()), None)
    }

    async fn collect(pipeline: &mut InputPipeline) -> Vec<MessageRef> {
        let mut out = Vec::new();
        while let Some(mut reference) = pipeline.next().await.expect("next") {
            reference.release(Status::Processed(None)).expect("release");
            out.push(reference);
        }
        out
    }

    #[tokio::test]
    async fn assigns_monotonic_sequence_numbers() {
        let mut pipeline = pipeline(vec![Box::new(ListSource::new(messages("a", 3)))]);
        let refs = collect(&mut pipeline).await;
        let sequences: Vec<u64> = refs.iter().filter_map(MessageRef::sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn round_robins_across_sources() {
        let mut pipeline = pipeline(vec![
            Box::new(ListSource::new(messages("a", 2))),
            Box::new(ListSource::new(messages("b", 3))),
        ]);
        let refs = collect(&mut pipeline).await;
        let ids: Vec<String> = refs
            .iter()
            .map(|r| r.message.payload["id"].as_str().unwrap_or_default().to_string())
            .collect();
        // a and b alternate until a ends, then b finishes alone
        assert_eq!(ids, vec!["a0", "b0", "a1", "b1", "b2"]);
    }

    #[tokio::test]
    async fn enrichers_chain_in_order() {
        struct Suffix(&'static str);
        impl Enricher for Suffix {
            fn enrich(&self, mut message: Message) -> Message {
                let id = message.payload["id"].as_str().unwrap_or_default().to_string();
                message.payload["id"] = json!(format!("{id}{}", self.0));
                message
            }
        }

        let enrichers: Arc<Vec<Box<dyn Enricher>>> =
            Arc::new(vec![Box::new(Suffix("-x")), Box::new(Suffix("-y"))]);
        let mut pipeline = InputPipeline::new(
            vec![Box::new(ListSource::new(messages("a", 1)))],
            enrichers,
            None,
        );
        let refs = collect(&mut pipeline).await;
        assert_eq!(refs[0].message.payload["id"], json!("a0-x-y"));
    }

    #[tokio::test]
    async fn duplicates_are_released_and_skipped() {
        struct OddDeduper;
        impl Deduper for OddDeduper {
            fn is_dupe(&self, reference: &MessageRef) -> DupeCheck {
                let dupe = reference.sequence().map(|s| s % 2 == 0).unwrap_or(false);
                DupeCheck {
                    dupe,
                    message: dupe.then(|| "seen before".to_string()),
                }
            }
        }

        let mut pipeline = InputPipeline::new(
            vec![Box::new(ListSource::new(messages("a", 4)))],
            Arc::new(Vec::new()),
            Some(Box::new(OddDeduper)),
        );
        let refs = collect(&mut pipeline).await;
        let sequences: Vec<u64> = refs.iter().filter_map(MessageRef::sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
    }

    #[tokio::test]
    async fn termination_waits_for_outstanding_releases() {
        let mut pipeline = pipeline(vec![Box::new(ListSource::new(messages("a", 1)))]);
        let mut reference = pipeline.next().await.expect("next").expect("reference");

        let ended = tokio::spawn(async move { pipeline.next().await });
        sleep(Duration::from_millis(20)).await;
        assert!(!ended.is_finished());

        reference.release(Status::Processed(None)).expect("release");
        let result = timeout(Duration::from_secs(1), ended)
            .await
            .expect("drained")
            .expect("join")
            .expect("next");
        assert!(result.is_none());
    }
}
