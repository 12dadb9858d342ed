//! The sink coordinator: commits buffered context outputs to the store and
//! publish sinks under their advertised guarantees.
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::batching::{batch, filter_by_epoch, filter_nonlinear_state_changes, Partition};
use crate::context::{DispatchContext, PublishedMessage, StoreItem};
use crate::metrics::{names, MetricResult, MetricsSink};
use crate::retry::RetryContext;
use crate::state::EpochManager;
use crate::{Consistency, Error, OutputSink};

/// Metadata key publish batches partition on under
/// [Consistency::AtomicPerPartition].
pub const PARTITION_KEY: &str = "key";

/// A sink failure with its retry classification.
#[derive(Debug)]
pub struct SinkFailure {
    /// the underlying error
    pub error: Error,
    /// whether re-handing the failed contexts to the coordinator may succeed
    pub retryable: bool,
}

/// Outcome of handing a batch of contexts to the coordinator.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// contexts committed through both sinks, completed and in order
    pub successful: Vec<DispatchContext>,
    /// contexts that failed or were cut off by a failure, in order
    pub failed: Vec<DispatchContext>,
    /// the failure that split the batch, if any
    pub error: Option<SinkFailure>,
}

struct PhaseOutcome {
    committed: usize,
    error: Option<Error>,
}

/// Streams one sink's view of a container batch through [batch], committing
/// chunk by chunk. On a chunk failure with several containers in flight the
/// batch size is halved and the uncommitted suffix retried, narrowing down
/// the failing container. Bisection is skipped for [Consistency::None] sinks,
/// which make no batch-atomicity promise.
fn run_phase<'a, T, A, G>(
    sink: &'a dyn OutputSink<T>,
    contexts: &'a [DispatchContext],
    accessor: &'a A,
    grouping: &'a G,
    batch_size: usize,
    retry: &'a RetryContext,
) -> BoxFuture<'a, PhaseOutcome>
where
    T: Send + 'static,
    A: Fn(&DispatchContext) -> Vec<T> + Sync + Send,
    G: Fn(Option<&T>, &T) -> bool + Sync + Send,
{
    Box::pin(async move {
        let chunks = batch(contexts, accessor, grouping, batch_size);
        let mut committed = 0usize;
        for chunk in chunks {
            let completed = chunk.containers_completed;
            match sink.sink(chunk.items, retry).await {
                Ok(()) => committed = completed,
                Err(sink_error) => {
                    let remaining = contexts.len() - committed;
                    let bisect = remaining > 1
                        && batch_size > 1
                        && sink.guarantees().consistency != Consistency::None;
                    if bisect {
                        debug!(
                            remaining,
                            batch_size = batch_size / 2,
                            error = %sink_error,
                            "bisecting failed batch"
                        );
                        let sub = run_phase(
                            sink,
                            &contexts[committed..],
                            accessor,
                            grouping,
                            batch_size / 2,
                            retry,
                        )
                        .await;
                        return PhaseOutcome {
                            committed: committed + sub.committed,
                            error: sub.error,
                        };
                    }
                    return PhaseOutcome {
                        committed,
                        error: Some(sink_error),
                    };
                }
            }
        }
        PhaseOutcome {
            committed: contexts.len(),
            error: None,
        }
    })
}

/// Commits buffered outputs of completed dispatch contexts, honoring sink
/// consistency, detecting sequence conflicts, and classifying failures for
/// the engine's retry and reprocessing machinery.
pub struct SinkCoordinator {
    store: Option<Arc<dyn OutputSink<StoreItem>>>,
    publish: Option<Arc<dyn OutputSink<PublishedMessage>>>,
    epochs: Option<Arc<EpochManager>>,
    metrics: Arc<dyn MetricsSink>,
}

impl SinkCoordinator {
    /// Builds a coordinator over the configured sinks. The epoch manager is
    /// present only under RPC parallelism with a store sink.
    pub(crate) fn new(
        store: Option<Arc<dyn OutputSink<StoreItem>>>,
        publish: Option<Arc<dyn OutputSink<PublishedMessage>>>,
        epochs: Option<Arc<EpochManager>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        SinkCoordinator {
            store,
            publish,
            epochs,
            metrics,
        }
    }

    fn phase_metric(&self, name: &str, outcome: &PhaseOutcome) {
        let result = match &outcome.error {
            None => MetricResult::Success,
            Some(err) if err.is_sequence_conflict() => MetricResult::ErrSeqNum,
            Some(_) => MetricResult::Error,
        };
        self.metrics.increment(name, &[result.tag()]);
    }

    async fn store_phase(&self, good: &[DispatchContext], retry: &RetryContext) -> PhaseOutcome {
        let sink = match &self.store {
            Some(sink) => sink,
            None => {
                return PhaseOutcome {
                    committed: good.len(),
                    error: None,
                }
            }
        };
        let guarantees = sink.guarantees();
        let total_items: usize = good.iter().map(|ctx| ctx.store_items().len()).sum();
        let batch_size = guarantees.max_batch_size.unwrap_or(total_items.max(1));
        let accessor = |ctx: &DispatchContext| ctx.store_items();
        let outcome = match guarantees.consistency {
            Consistency::AtomicPerPartition => {
                let grouping =
                    |prev: Option<&StoreItem>, curr: &StoreItem| match prev {
                        Some(prev) => prev.key() == curr.key(),
                        None => true,
                    };
                run_phase(sink.as_ref(), good, &accessor, &grouping, batch_size, retry).await
            }
            Consistency::None | Consistency::Atomic => {
                let grouping = |_: Option<&StoreItem>, _: &StoreItem| true;
                run_phase(sink.as_ref(), good, &accessor, &grouping, batch_size, retry).await
            }
        };
        self.phase_metric(names::STORE, &outcome);
        outcome
    }

    async fn publish_phase(
        &self,
        contexts: &[DispatchContext],
        retry: &RetryContext,
    ) -> PhaseOutcome {
        let sink = match &self.publish {
            Some(sink) => sink,
            None => {
                return PhaseOutcome {
                    committed: contexts.len(),
                    error: None,
                }
            }
        };
        let guarantees = sink.guarantees();
        let total_items: usize = contexts.iter().map(|ctx| ctx.published().len()).sum();
        let batch_size = guarantees.max_batch_size.unwrap_or(total_items.max(1));
        let accessor = |ctx: &DispatchContext| ctx.published().to_vec();
        let outcome = match guarantees.consistency {
            Consistency::AtomicPerPartition => {
                let grouping = |prev: Option<&PublishedMessage>, curr: &PublishedMessage| match prev
                {
                    Some(prev) => prev.metadata.get(PARTITION_KEY) == curr.metadata.get(PARTITION_KEY),
                    None => true,
                };
                run_phase(
                    sink.as_ref(),
                    contexts,
                    &accessor,
                    &grouping,
                    batch_size,
                    retry,
                )
                .await
            }
            Consistency::None | Consistency::Atomic => {
                let grouping = |_: Option<&PublishedMessage>, _: &PublishedMessage| true;
                run_phase(
                    sink.as_ref(),
                    contexts,
                    &accessor,
                    &grouping,
                    batch_size,
                    retry,
                )
                .await
            }
        };
        self.phase_metric(names::PUBLISH, &outcome);
        outcome
    }

    fn store_idempotent(&self) -> bool {
        self.store
            .as_ref()
            .map(|sink| sink.guarantees().idempotent)
            .unwrap_or(true)
    }

    fn classify(&self, sink_consistency: Option<Consistency>, error: &Error) -> bool {
        if error.is_sequence_conflict() {
            return true;
        }
        // a partially committed batch on a non-atomic, non-idempotent sink
        // cannot safely be replayed
        match sink_consistency {
            Some(Consistency::None) if !self.store_idempotent() => false,
            _ => true,
        }
    }

    fn invalidate_conflicted(&self, affected: &[DispatchContext]) {
        let epochs = match &self.epochs {
            Some(epochs) => epochs,
            None => return,
        };
        let mut keys: Vec<String> = Vec::new();
        for ctx in affected {
            for key in ctx.loaded_keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        for key in &keys {
            let _ = epochs.invalidate(key);
        }
        if !keys.is_empty() {
            warn!(keys = ?keys, "invalidated epochs after sequence conflict");
        }
    }

    /// Commits a batch of contexts.
    ///
    /// Contexts are first partitioned by the epoch and linearity pre-filters;
    /// the good prefix goes to the store sink, then the store-committed
    /// prefix goes to the publish sink. Successful contexts are completed
    /// (flushing their buffered metrics and state write-backs) before being
    /// returned.
    pub async fn handle(&self, contexts: Vec<DispatchContext>, retry: &RetryContext) -> BatchResult {
        if contexts.is_empty() {
            return BatchResult::default();
        }
        self.metrics.increment(names::OUTPUT_BATCH, &[]);

        // partition off contexts that are already known stale
        let epoch_partition = match &self.epochs {
            Some(epochs) => filter_by_epoch(contexts, epochs),
            None => Partition {
                good: contexts,
                ..Partition::default()
            },
        };
        let linear_partition = filter_nonlinear_state_changes(epoch_partition.good);
        let good = linear_partition.good;
        let mut bad = linear_partition.bad;
        bad.extend(epoch_partition.bad);
        let synthetic = linear_partition.conflict.or(epoch_partition.conflict);

        let store_outcome = self.store_phase(&good, retry).await;

        let store_conflict = store_outcome
            .error
            .as_ref()
            .map(Error::is_sequence_conflict)
            .unwrap_or(false);
        if synthetic.is_some() || store_conflict {
            // both the filtered-out contexts and the ones the sink rejected
            // were built on stale reads
            self.invalidate_conflicted(&bad);
            self.invalidate_conflicted(&good[store_outcome.committed..]);
        }

        // downstream consumers rely on the committed prefix being published
        // even when the tail of the batch failed to store
        let publish_outcome = self
            .publish_phase(&good[..store_outcome.committed], retry)
            .await;

        let mut successful = good;
        let mut failed = successful.split_off(publish_outcome.committed);
        failed.extend(bad);

        for ctx in &mut successful {
            if let Err(complete_error) = ctx.complete().await {
                error!(error = %complete_error, "failed to complete committed context");
            }
        }

        let store_consistency = self.store.as_ref().map(|s| s.guarantees().consistency);
        let publish_consistency = self.publish.as_ref().map(|s| s.guarantees().consistency);
        let publish_failed = publish_outcome.error.is_some();

        let error = if let Some(store_error) = store_outcome.error {
            // a sequence conflict stays retryable no matter what happened
            // downstream; reprocessing is the only way it resolves
            let retryable = store_error.is_sequence_conflict()
                || (self.classify(store_consistency, &store_error)
                    && !(publish_failed && !self.store_idempotent()));
            Some(SinkFailure {
                error: store_error,
                retryable,
            })
        } else if let Some(publish_error) = publish_outcome.error {
            // the store cannot safely be retried later when it is not
            // idempotent and its writes already landed
            let retryable = publish_error.is_sequence_conflict()
                || (self.classify(publish_consistency, &publish_error)
                    && self.store_idempotent());
            Some(SinkFailure {
                error: publish_error,
                retryable,
            })
        } else {
            synthetic.map(|conflict| SinkFailure {
                error: conflict,
                retryable: true,
            })
        };

        BatchResult {
            successful,
            failed,
            error,
        }
    }
}
