//! Concurrent strategy: three pipelined stages with bounded queues between
//! them, batched sink commits, and priority reprocessing after sequence
//! conflicts.
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use super::{EngineCore, Handled};
use crate::metrics::{names, MetricResult};
use crate::queue::PriorityQueue;
use crate::retry::Exhausted;
use crate::source::InputPipeline;
use crate::{Error, EvictionControl, MessageRef, SourceContext, Status};

pub(super) const PRIORITY_NORMAL: usize = 0;
pub(super) const PRIORITY_REPROCESS: usize = 1;

/// Marker carried by a message being replayed after a sequence conflict.
/// Records the keys whose cached state must be dropped before the replay.
pub(super) struct ReprocessingContext {
    pub(super) id: Uuid,
    pub(super) at_sn: u64,
    keys: Vec<String>,
}

impl ReprocessingContext {
    pub(super) fn new(at_sn: u64, keys: Vec<String>) -> Self {
        ReprocessingContext {
            id: Uuid::new_v4(),
            at_sn,
            keys,
        }
    }

    pub(super) fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// A reference queued for processing, possibly wrapped by a reprocessing
/// marker.
pub(super) struct QueuedRef {
    pub(super) reference: MessageRef,
    pub(super) reprocess: Option<Arc<ReprocessingContext>>,
}

/// Counts messages between pickup and release, for eviction draining and the
/// concurrency gauge.
#[derive(Default)]
pub(super) struct InFlight {
    count: Mutex<usize>,
    changed: Notify,
}

impl InFlight {
    /// Marks a reference in flight; the matching exit happens on release.
    pub(super) fn enter(self: &Arc<Self>, reference: &mut MessageRef) {
        *self.count.lock().expect("in-flight lock") += 1;
        let tracker = Arc::clone(self);
        reference.on_release(move |_| tracker.exit());
    }

    fn exit(&self) {
        let mut count = self.count.lock().expect("in-flight lock");
        *count = count.saturating_sub(1);
        drop(count);
        self.changed.notify_waiters();
    }

    pub(super) fn count(&self) -> usize {
        *self.count.lock().expect("in-flight lock")
    }

    /// Waits until no message is in flight.
    pub(super) async fn drained(&self) {
        loop {
            let waiter = self.changed.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            waiter.await;
        }
    }
}

/// Eviction control handed to sources: marks queued references and waits for
/// in-flight work to resolve.
pub(super) struct QueueEviction {
    pub(super) queue: Arc<PriorityQueue<QueuedRef>>,
    pub(super) in_flight: Arc<InFlight>,
}

impl EvictionControl for QueueEviction {
    fn evict<'a>(
        &'a self,
        predicate: Box<dyn Fn(&MessageRef) -> bool + Send + Sync>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            fn matches(
                queued: &QueuedRef,
                predicate: &(dyn Fn(&MessageRef) -> bool + Send + Sync),
            ) -> bool {
                predicate(&queued.reference)
            }
            self.queue.update(
                |queued| matches(queued, &*predicate),
                |queued| queued.reference.evict(),
            );
            self.in_flight.drained().await;
        })
    }
}

type ActiveReprocess = Arc<Mutex<Option<Arc<ReprocessingContext>>>>;

pub(super) struct Envelope {
    reference: MessageRef,
    outcome: Handled,
    reprocess: Option<Arc<ReprocessingContext>>,
}

pub(super) async fn spawn(
    core: Arc<EngineCore>,
    mut pipeline: InputPipeline,
    handles: &mut JoinSet<Result<(), Error>>,
    kill: flume::Receiver<()>,
) -> Result<(), Error> {
    let input_queue = Arc::new(PriorityQueue::new(core.config.input_queue_capacity));
    let in_flight = Arc::new(InFlight::default());
    let (out_tx, out_rx) = flume::bounded::<Envelope>(core.config.output_queue_capacity);
    let reprocess: ActiveReprocess = Arc::new(Mutex::new(None));

    pipeline
        .start(SourceContext::with_control(Arc::new(QueueEviction {
            queue: Arc::clone(&input_queue),
            in_flight: Arc::clone(&in_flight),
        })))
        .await?;

    let (done_tx, done_rx) = flume::bounded::<()>(1);
    handles.spawn(gauge_loop(
        Arc::clone(&core),
        Arc::clone(&input_queue),
        Some(out_rx.clone()),
        Arc::clone(&in_flight),
        done_rx,
    ));
    handles.spawn(input_loop(pipeline, Arc::clone(&input_queue), kill));
    handles.spawn(processing_loop(
        Arc::clone(&core),
        Arc::clone(&input_queue),
        out_tx,
        Arc::clone(&in_flight),
        Arc::clone(&reprocess),
    ));
    handles.spawn(output_loop(core, out_rx, input_queue, reprocess, done_tx));
    Ok(())
}

/// Reads the composed source and feeds the input queue. References that
/// cannot be queued anymore are released as unavailable.
pub(super) async fn input_loop(
    mut pipeline: InputPipeline,
    queue: Arc<PriorityQueue<QueuedRef>>,
    kill: flume::Receiver<()>,
) -> Result<(), Error> {
    debug!("input loop started");
    loop {
        tokio::select! {
            biased;
            Ok(()) = kill.recv_async() => {
                debug!("stop requested, closing sources");
                pipeline.stop().await?;
            },
            next = pipeline.next() => {
                match next? {
                    Some(reference) => {
                        let queued = QueuedRef { reference, reprocess: None };
                        if let Err(returned) = queue.enqueue(queued, PRIORITY_NORMAL).await {
                            let QueuedRef { mut reference, .. } = returned;
                            warn!(
                                sequence = reference.sequence(),
                                "input queue closed, releasing reference as unavailable"
                            );
                            let _ = reference.release(Status::Errored("engine unavailable".into()));
                        }
                    }
                    None => break,
                }
            },
        }
    }
    queue.close();
    debug!("input loop finished");
    Ok(())
}

/// Dequeues references, dispatches them, and forwards the resulting contexts
/// to the output stage in arrival order.
async fn processing_loop(
    core: Arc<EngineCore>,
    queue: Arc<PriorityQueue<QueuedRef>>,
    out_tx: flume::Sender<Envelope>,
    in_flight: Arc<InFlight>,
    active: ActiveReprocess,
) -> Result<(), Error> {
    debug!("processing loop started");
    while let Ok(queued) = queue.dequeue().await {
        let QueuedRef {
            mut reference,
            reprocess,
        } = queued;

        if reference.is_evicted() {
            trace!(sequence = reference.sequence(), "skipping evicted reference");
            let _ = reference.release(Status::Evicted);
            continue;
        }

        if reprocess.is_none() {
            core.emit_received(&reference.message);
        }
        if let Some(marker) = &reprocess {
            let is_active = active
                .lock()
                .expect("reprocess lock")
                .as_ref()
                .map(|current| Arc::ptr_eq(current, marker))
                .unwrap_or(false);
            if is_active {
                core.invalidate_keys(marker.keys()).await;
            }
        }

        in_flight.enter(&mut reference);
        let outcome = {
            let span = info_span!(parent: &reference.span, "handle_message", sequence = reference.sequence());
            core.prepare(&reference).instrument(span).await
        };
        out_tx
            .send_async(Envelope {
                reference,
                outcome,
                reprocess,
            })
            .await
            .map_err(|send_error| Error::UnableToSendToChannel(format!("{send_error}")))?;
    }
    debug!("processing loop finished");
    Ok(())
}

/// Accumulates contexts into batches and commits them through the sink
/// coordinator, releasing source references in arrival order.
async fn output_loop(
    core: Arc<EngineCore>,
    out_rx: flume::Receiver<Envelope>,
    input_queue: Arc<PriorityQueue<QueuedRef>>,
    active: ActiveReprocess,
    _done: flume::Sender<()>,
) -> Result<(), Error> {
    debug!("output loop started");
    let max = core.config.maximum_batch_size;
    let min = core.config.minimum_batch_size;
    let linger = core.config.batch_linger;

    loop {
        let mut batch: Vec<Envelope> = Vec::with_capacity(min);
        match out_rx.recv_async().await {
            Ok(envelope) => batch.push(envelope),
            Err(_) => break,
        }

        let deadline = Instant::now() + linger;
        let mut disconnected = false;
        while batch.len() < max {
            if out_rx.is_empty() && batch.len() >= min {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, out_rx.recv_async()).await {
                Ok(Ok(envelope)) => batch.push(envelope),
                Ok(Err(_)) => {
                    disconnected = true;
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        flush(&core, batch, &input_queue, &active).await?;
        if disconnected {
            break;
        }
    }
    debug!("output loop finished");
    Ok(())
}

enum Disposition {
    Success(Option<Value>),
    Failed(String, MetricResult),
    Reprocess(Arc<ReprocessingContext>),
}

async fn flush(
    core: &Arc<EngineCore>,
    batch: Vec<Envelope>,
    input_queue: &Arc<PriorityQueue<QueuedRef>>,
    active: &ActiveReprocess,
) -> Result<(), Error> {
    // while a reprocessing pass is pending, stale dispatches cycle back to
    // the input queue until the awaited sequence number comes through
    let mut envelopes = Vec::with_capacity(batch.len());
    for envelope in batch {
        let current = active.lock().expect("reprocess lock").clone();
        match current {
            Some(marker) => {
                if envelope.reference.sequence() == Some(marker.at_sn) {
                    trace!(at_sn = marker.at_sn, id = %marker.id, "reprocessing target arrived");
                    *active.lock().expect("reprocess lock") = None;
                    envelopes.push(envelope);
                } else if matches!(envelope.outcome, Handled::Ready(_)) {
                    let marker = envelope.reprocess.unwrap_or(marker);
                    requeue(core, input_queue, envelope.reference, marker);
                } else {
                    envelopes.push(envelope);
                }
            }
            None => envelopes.push(envelope),
        }
    }
    if envelopes.is_empty() {
        return Ok(());
    }

    // split sinkable contexts from terminal outcomes, keeping arrival order
    enum Slot {
        Terminal(Status, MetricResult),
        Sinked,
    }
    let mut order: Vec<(MessageRef, Slot)> = Vec::with_capacity(envelopes.len());
    let mut ready = Vec::new();
    for envelope in envelopes {
        let Envelope {
            reference, outcome, ..
        } = envelope;
        match outcome {
            Handled::Unhandled => order.push((
                reference,
                Slot::Terminal(Status::Processed(None), MetricResult::Unhandled),
            )),
            Handled::Invalid { reason } => order.push((
                reference,
                Slot::Terminal(Status::Errored(reason), MetricResult::ErrInvalidMsg),
            )),
            Handled::Failed { reason, fatal } => {
                if fatal {
                    let mut reference = reference;
                    let message = reference.message.clone();
                    core.finish(
                        &mut reference,
                        Status::Errored(reason.clone()),
                        MetricResult::ErrFailedMsgProcessing,
                        &message,
                    );
                    return Err(Error::ProcessingError(reason));
                }
                order.push((
                    reference,
                    Slot::Terminal(
                        Status::Errored(reason),
                        MetricResult::ErrFailedMsgProcessing,
                    ),
                ));
            }
            Handled::Ready(ctx) => {
                ready.push(*ctx);
                order.push((reference, Slot::Sinked));
            }
        }
    }

    // every loaded key across the batch is recorded on the reprocessing
    // marker, in case the commit uncovers a conflict
    let mut batch_keys: Vec<String> = Vec::new();
    for ctx in &ready {
        for key in ctx.loaded_keys() {
            if !batch_keys.contains(&key) {
                batch_keys.push(key);
            }
        }
    }

    let mut dispositions: FxHashMap<u64, Disposition> = FxHashMap::default();
    let mut fatal_error: Option<Error> = None;
    let mut pending = ready;
    let mut attempt: u64 = 1;
    while !pending.is_empty() {
        let retry_ctx = core.sink_retrier.context(attempt);
        let span = info_span!("sink_outputs", contexts = pending.len(), attempt);
        let result = core
            .coordinator
            .handle(pending, &retry_ctx)
            .instrument(span)
            .await;
        for ctx in result.successful {
            let _ = dispositions.insert(
                ctx.sequence(),
                Disposition::Success(ctx.handler_result().value.clone()),
            );
        }
        let failure = match result.error {
            None => break,
            Some(failure) => failure,
        };
        if failure.error.is_sequence_conflict() {
            let at_sn = result
                .failed
                .first()
                .map(|ctx| ctx.sequence())
                .unwrap_or_default();
            let marker = Arc::new(ReprocessingContext::new(at_sn, batch_keys.clone()));
            info!(
                at_sn,
                id = %marker.id,
                error = %failure.error,
                "sequence conflict, scheduling reprocessing"
            );
            *active.lock().expect("reprocess lock") = Some(Arc::clone(&marker));
            for ctx in result.failed {
                let _ = dispositions.insert(ctx.sequence(), Disposition::Reprocess(Arc::clone(&marker)));
            }
            break;
        }
        let exhausted = core
            .sink_retrier
            .max_attempts()
            .map(|m| attempt >= m)
            .unwrap_or(false);
        if failure.retryable && !exhausted {
            debug!(attempt, error = %failure.error, "sink attempt failed, retrying batch tail");
            pending = result.failed;
            core.sink_retrier.wait(&retry_ctx).await;
            attempt = attempt.saturating_add(1);
            continue;
        }
        let reason = failure.error.to_string();
        for ctx in result.failed {
            let _ = dispositions.insert(
                ctx.sequence(),
                Disposition::Failed(reason.clone(), MetricResult::Error),
            );
        }
        if matches!(core.sink_retrier.on_exhausted(), Exhausted::Fail) {
            fatal_error = Some(Error::SinkError(reason));
        }
        break;
    }

    // successful predecessors release before any successor re-enters the
    // input queue
    let mut to_requeue: Vec<(MessageRef, Arc<ReprocessingContext>)> = Vec::new();
    for (mut reference, slot) in order {
        let message = reference.message.clone();
        match slot {
            Slot::Terminal(status, metric) => core.finish(&mut reference, status, metric, &message),
            Slot::Sinked => {
                let sequence = reference.sequence().unwrap_or_default();
                match dispositions.remove(&sequence) {
                    Some(Disposition::Success(value)) => core.finish(
                        &mut reference,
                        Status::Processed(value),
                        MetricResult::Success,
                        &message,
                    ),
                    Some(Disposition::Failed(reason, metric)) => {
                        core.finish(&mut reference, Status::Errored(reason), metric, &message)
                    }
                    Some(Disposition::Reprocess(marker)) => to_requeue.push((reference, marker)),
                    None => core.finish(
                        &mut reference,
                        Status::Errored("batch commit did not reach this message".into()),
                        MetricResult::Error,
                        &message,
                    ),
                }
            }
        }
    }
    for (reference, marker) in to_requeue {
        requeue(core, input_queue, reference, marker);
    }

    match fatal_error {
        Some(fatal) => Err(fatal),
        None => Ok(()),
    }
}

/// Puts a reference back on the input queue at reprocessing priority.
/// The re-entry must not wait for queue capacity: the processing stage may
/// be blocked on the output stage, which is blocked on this call.
fn requeue(
    core: &Arc<EngineCore>,
    input_queue: &Arc<PriorityQueue<QueuedRef>>,
    reference: MessageRef,
    marker: Arc<ReprocessingContext>,
) {
    let queued = QueuedRef {
        reference,
        reprocess: Some(marker),
    };
    if let Err(returned) = input_queue.force_enqueue(queued, PRIORITY_REPROCESS) {
        let QueuedRef { mut reference, .. } = returned;
        let message = reference.message.clone();
        warn!(
            sequence = reference.sequence(),
            "input queue closed, cannot reprocess"
        );
        core.finish(
            &mut reference,
            Status::Errored("reprocessing unavailable".into()),
            MetricResult::ErrReprocessing,
            &message,
        );
    }
}

/// Emits queue-depth and concurrency gauges on a timer until the engine run
/// ends.
pub(super) async fn gauge_loop(
    core: Arc<EngineCore>,
    input_queue: Arc<PriorityQueue<QueuedRef>>,
    out_rx: Option<flume::Receiver<Envelope>>,
    in_flight: Arc<InFlight>,
    done: flume::Receiver<()>,
) -> Result<(), Error> {
    let mut ticker = interval(core.config.metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                core.metrics.gauge(names::INPUT_QUEUE, input_queue.len() as f64, &[]);
                if let Some(out_rx) = &out_rx {
                    core.metrics.gauge(names::OUTPUT_QUEUE, out_rx.len() as f64, &[]);
                }
                core.metrics.gauge(names::CONCURRENT_HANDLERS, in_flight.count() as f64, &[]);
            },
            _ = done.recv_async() => break,
        }
    }
    Ok(())
}
