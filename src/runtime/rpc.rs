//! RPC strategy: unordered parallel dispatch with per-message release, for
//! sources that need the handler's return value as a response.
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info_span, trace, Instrument};

use super::concurrent::{self, InFlight, QueueEviction, QueuedRef};
use super::{CommitOutcome, EngineCore, Handled};
use crate::metrics::MetricResult;
use crate::queue::PriorityQueue;
use crate::source::InputPipeline;
use crate::{Error, MessageRef, SourceContext, Status};

pub(super) async fn spawn(
    core: Arc<EngineCore>,
    mut pipeline: InputPipeline,
    handles: &mut JoinSet<Result<(), Error>>,
    kill: flume::Receiver<()>,
) -> Result<(), Error> {
    let input_queue = Arc::new(PriorityQueue::new(core.config.input_queue_capacity));
    let in_flight = Arc::new(InFlight::default());

    pipeline
        .start(SourceContext::with_control(Arc::new(QueueEviction {
            queue: Arc::clone(&input_queue),
            in_flight: Arc::clone(&in_flight),
        })))
        .await?;

    let (done_tx, done_rx) = flume::bounded::<()>(1);
    handles.spawn(concurrent::gauge_loop(
        Arc::clone(&core),
        Arc::clone(&input_queue),
        None,
        Arc::clone(&in_flight),
        done_rx,
    ));
    handles.spawn(concurrent::input_loop(
        pipeline,
        Arc::clone(&input_queue),
        kill,
    ));
    handles.spawn(dispatch_loop(core, input_queue, in_flight, done_tx));
    Ok(())
}

/// Dequeues references and fans each out to its own task, capped by the
/// configured request parallelism. Releases happen as handlers finish, in no
/// particular order.
async fn dispatch_loop(
    core: Arc<EngineCore>,
    queue: Arc<PriorityQueue<QueuedRef>>,
    in_flight: Arc<InFlight>,
    _done: flume::Sender<()>,
) -> Result<(), Error> {
    debug!("rpc dispatch loop started");
    let limiter = Arc::new(Semaphore::new(core.config.max_parallel_rpc_requests));
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    while let Ok(queued) = queue.dequeue().await {
        while let Some(finished) = tasks.try_join_next() {
            propagate(finished)?;
        }

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
            core.invalidate_keys(marker.keys()).await;
        }
        in_flight.enter(&mut reference);

        let permit = Arc::clone(&limiter)
            .acquire_owned()
            .await
            .map_err(|acquire_error| Error::ExecutionError(format!("{acquire_error}")))?;
        let core = Arc::clone(&core);
        tasks.spawn(async move {
            let _permit = permit;
            process_one(core, reference).await
        });
    }

    while let Some(finished) = tasks.join_next().await {
        propagate(finished)?;
    }
    debug!("rpc dispatch loop finished");
    Ok(())
}

fn propagate(finished: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match finished {
        Ok(result) => result,
        Err(join_error) => Err(Error::ExecutionError(format!("{join_error}"))),
    }
}

async fn process_one(core: Arc<EngineCore>, mut reference: MessageRef) -> Result<(), Error> {
    let message = reference.message.clone();
    let handled = {
        let span = info_span!(parent: &reference.span, "handle_message", sequence = reference.sequence());
        core.prepare(&reference).instrument(span).await
    };

    match handled {
        Handled::Unhandled => {
            core.finish(
                &mut reference,
                Status::Processed(None),
                MetricResult::Unhandled,
                &message,
            );
        }
        Handled::Invalid { reason } => {
            core.finish(
                &mut reference,
                Status::Errored(reason),
                MetricResult::ErrInvalidMsg,
                &message,
            );
        }
        Handled::Failed { reason, fatal } => {
            core.finish(
                &mut reference,
                Status::Errored(reason.clone()),
                MetricResult::ErrFailedMsgProcessing,
                &message,
            );
            if fatal {
                return Err(Error::ProcessingError(reason));
            }
        }
        Handled::Ready(ctx) => {
            // conflicts invalidate the stale epochs and re-dispatch against
            // fresh state inside this task; ordering is not preserved anyway
            let committed = {
                let span = info_span!("sink_outputs", sequence = reference.sequence());
                core.commit_single(&reference, *ctx).instrument(span).await
            };
            match committed {
                CommitOutcome::Committed { value } => {
                    core.finish(
                        &mut reference,
                        Status::Processed(value),
                        MetricResult::Success,
                        &message,
                    );
                }
                CommitOutcome::Failed(failure) => {
                    core.finish(
                        &mut reference,
                        Status::Errored(failure.reason.clone()),
                        failure.metric,
                        &message,
                    );
                    if failure.fatal {
                        return Err(Error::SinkError(failure.reason));
                    }
                }
            }
        }
    }
    Ok(())
}
