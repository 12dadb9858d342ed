//! Serial strategy: strict FIFO, one message at a time from source to sink.
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

use super::{CommitOutcome, EngineCore, Handled};
use crate::metrics::MetricResult;
use crate::source::InputPipeline;
use crate::{Error, MessageRef, SourceContext, Status};

pub(super) async fn run(
    core: Arc<EngineCore>,
    mut pipeline: InputPipeline,
    kill: flume::Receiver<()>,
) -> Result<(), Error> {
    // eviction has no effect when at most one message is ever held
    pipeline.start(SourceContext::default()).await?;
    debug!("serial strategy started");

    loop {
        tokio::select! {
            biased;
            Ok(()) = kill.recv_async() => {
                debug!("stop requested, closing sources");
                pipeline.stop().await?;
            },
            next = pipeline.next() => {
                match next? {
                    Some(reference) => process_one(&core, reference).await?,
                    None => break,
                }
            },
        }
    }

    debug!("serial strategy finished");
    Ok(())
}

async fn process_one(core: &EngineCore, mut reference: MessageRef) -> Result<(), Error> {
    let message = reference.message.clone();
    core.emit_received(&message);

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
