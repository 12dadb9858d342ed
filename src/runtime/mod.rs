//! The processing engine: wiring, shared per-message pipeline, and the three
//! execution strategies.
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, Parallelism};
use crate::context::{DispatchContext, HandlerResult, PublishedMessage, StoreItem};
use crate::dispatch::Dispatcher;
use crate::metrics::{names, MetricResult, MetricsSink, NoopMetricsSink};
use crate::retry::{Exhausted, Retrier};
use crate::sink::SinkCoordinator;
use crate::source::InputPipeline;
use crate::state::{
    CachingStateProvider, EpochAwareStateProvider, EpochManager, StateProvider,
};
use crate::{
    Deduper, Enricher, Error, Message, MessageRef, MetricsAnnotator, NullValidator, OutputSink,
    PrettyTypeMapper, Source, Status, TypeMapper, Validation, Validator,
};

mod concurrent;
mod rpc;
mod serial;

/// Outcome of preparing one message: validation plus dispatch under the
/// dispatch retrier.
pub(crate) enum Handled {
    /// No handler is registered for the type.
    Unhandled,
    /// Input or output validation failed; any context was cleared.
    Invalid { reason: String },
    /// Dispatched successfully; the context holds the buffered outputs.
    Ready(Box<DispatchContext>),
    /// Dispatch failed after retries. `fatal` stops the engine.
    Failed { reason: String, fatal: bool },
}

/// Failure of the sink commit of a single context.
pub(crate) struct CommitFailure {
    pub(crate) reason: String,
    pub(crate) metric: MetricResult,
    pub(crate) fatal: bool,
}

/// Outcome of committing a single context, conflicts resolved.
pub(crate) enum CommitOutcome {
    Committed { value: Option<Value> },
    Failed(CommitFailure),
}

enum SinkSingle {
    Committed { value: Option<Value> },
    Conflict { keys: Vec<String> },
    Failed(CommitFailure),
}

/// Shared engine wiring used by every strategy.
pub(crate) struct EngineCore {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) state: Option<Arc<dyn StateProvider>>,
    pub(crate) enrichers: Arc<Vec<Box<dyn Enricher>>>,
    pub(crate) type_mapper: Arc<dyn TypeMapper>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) annotators: Arc<Vec<Box<dyn MetricsAnnotator>>>,
    pub(crate) coordinator: SinkCoordinator,
    pub(crate) dispatch_retrier: Retrier,
    pub(crate) sink_retrier: Retrier,
    pub(crate) config: EngineConfig,
}

impl EngineCore {
    fn tags(&self, message: &Message, result: Option<MetricResult>) -> Vec<(String, String)> {
        let mut tags = crate::metrics::annotate(&self.annotators, message);
        if let Some(result) = result {
            tags.push(result.tag());
        }
        tags
    }

    pub(crate) fn emit_received(&self, message: &Message) {
        self.metrics
            .increment(names::RECEIVED, &self.tags(message, None));
    }

    pub(crate) fn emit_processed(&self, message: &Message, result: MetricResult) {
        self.metrics
            .increment(names::PROCESSED, &self.tags(message, Some(result)));
    }

    pub(crate) fn make_context(&self, reference: &MessageRef) -> DispatchContext {
        DispatchContext::new(
            reference.message.clone(),
            reference.metadata.clone(),
            reference.sequence().unwrap_or_default(),
            self.state.clone(),
            Arc::clone(&self.enrichers),
            Arc::clone(&self.type_mapper),
            Arc::clone(&self.metrics),
        )
    }

    /// Drops cached state for the keys ahead of a reprocessing pass.
    pub(crate) async fn invalidate_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Some(provider) = &self.state {
            debug!(keys = ?keys, "invalidating state for reprocessing");
            provider.invalidate(keys).await;
        }
    }

    /// Validates and dispatches one message, producing the context to commit.
    /// Does not emit metrics or release the reference; that stays with the
    /// calling strategy.
    pub(crate) async fn prepare(&self, reference: &MessageRef) -> Handled {
        let message = &reference.message;
        if !self.dispatcher.can_dispatch(message) {
            debug!(mtype = message.mtype, "no handler registered");
            return Handled::Unhandled;
        }

        let validation = self.validator.validate(message);
        if !validation.success {
            // the invalid handler may observe the message, but nothing it
            // buffers is committed
            let mut ctx = self.make_context(reference);
            let dispatched = self
                .dispatcher
                .dispatch(message, &mut ctx, &validation)
                .await;
            ctx.clear();
            let reason = match dispatched {
                Ok(_) => validation
                    .message
                    .unwrap_or_else(|| "message failed validation".into()),
                Err(dispatch_error) => dispatch_error.to_string(),
            };
            return Handled::Invalid { reason };
        }

        let dispatched = self
            .dispatch_retrier
            .retry(|retry_ctx| {
                let mut ctx = self.make_context(reference);
                ctx.set_retry(retry_ctx);
                async move {
                    match self
                        .dispatcher
                        .dispatch(message, &mut ctx, &Validation::ok())
                        .await
                    {
                        Ok(value) => {
                            ctx.set_handler_result(HandlerResult { value, error: None });
                            Ok(ctx)
                        }
                        Err(handler_error) => Err(handler_error),
                    }
                }
            })
            .await;

        match dispatched {
            Ok(Some(mut ctx)) => {
                let mut invalid_reason = None;
                for output in ctx
                    .published()
                    .iter()
                    .map(|p| &p.message)
                    .chain(ctx.stored().iter().map(|s| &s.message))
                {
                    let check = self.validator.validate(output);
                    if !check.success {
                        let reason = check
                            .message
                            .unwrap_or_else(|| "output failed validation".into());
                        warn!(mtype = output.mtype, reason, "discarding invalid output");
                        invalid_reason = Some(reason);
                        break;
                    }
                }
                if let Some(reason) = invalid_reason {
                    ctx.clear();
                    return Handled::Invalid { reason };
                }
                Handled::Ready(Box::new(ctx))
            }
            Ok(None) => Handled::Failed {
                reason: "handler failed and the error was suppressed".into(),
                fatal: false,
            },
            Err(handler_error) => Handled::Failed {
                reason: handler_error.to_string(),
                fatal: matches!(self.dispatch_retrier.on_exhausted(), Exhausted::Fail),
            },
        }
    }

    /// Commits one context under the sink retrier.
    async fn sink_single(&self, ctx: DispatchContext) -> SinkSingle {
        let max = self.sink_retrier.max_attempts();
        let mut attempt: u64 = 1;
        let mut pending = ctx;
        loop {
            let retry_ctx = self.sink_retrier.context(attempt);
            let mut result = self.coordinator.handle(vec![pending], &retry_ctx).await;
            let failure = match result.error {
                None => {
                    let value = result
                        .successful
                        .first()
                        .and_then(|c| c.handler_result().value.clone());
                    return SinkSingle::Committed { value };
                }
                Some(failure) => failure,
            };
            if failure.error.is_sequence_conflict() {
                let mut keys = Vec::new();
                for failed in &result.failed {
                    for key in failed.loaded_keys() {
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                return SinkSingle::Conflict { keys };
            }
            let exhausted = max.map(|m| attempt >= m).unwrap_or(false);
            if failure.retryable && !exhausted {
                match result.failed.pop() {
                    Some(failed) => pending = failed,
                    None => {
                        return SinkSingle::Failed(CommitFailure {
                            reason: failure.error.to_string(),
                            metric: MetricResult::Error,
                            fatal: false,
                        })
                    }
                }
                debug!(attempt, error = %failure.error, "sink attempt failed, retrying");
                self.sink_retrier.wait(&retry_ctx).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
            return SinkSingle::Failed(CommitFailure {
                reason: failure.error.to_string(),
                metric: MetricResult::Error,
                fatal: matches!(self.sink_retrier.on_exhausted(), Exhausted::Fail),
            });
        }
    }

    /// Commits one context; a sequence conflict invalidates the loaded keys
    /// and re-dispatches from fresh state until the commit lands.
    pub(crate) async fn commit_single(
        &self,
        reference: &MessageRef,
        ctx: DispatchContext,
    ) -> CommitOutcome {
        let mut ctx = ctx;
        loop {
            match self.sink_single(ctx).await {
                SinkSingle::Committed { value } => return CommitOutcome::Committed { value },
                SinkSingle::Failed(failure) => return CommitOutcome::Failed(failure),
                SinkSingle::Conflict { keys } => {
                    info!(keys = ?keys, sequence = reference.sequence(), "sequence conflict, re-dispatching from fresh state");
                    self.invalidate_keys(&keys).await;
                    match self.prepare(reference).await {
                        Handled::Ready(fresh) => ctx = *fresh,
                        Handled::Unhandled => {
                            return CommitOutcome::Failed(CommitFailure {
                                reason: "handler unregistered during reprocessing".into(),
                                metric: MetricResult::ErrReprocessing,
                                fatal: false,
                            })
                        }
                        Handled::Invalid { reason } => {
                            return CommitOutcome::Failed(CommitFailure {
                                reason,
                                metric: MetricResult::ErrInvalidMsg,
                                fatal: false,
                            })
                        }
                        Handled::Failed { reason, fatal } => {
                            return CommitOutcome::Failed(CommitFailure {
                                reason,
                                metric: MetricResult::ErrFailedMsgProcessing,
                                fatal,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Releases a reference and emits its `processed` metric. A failed
    /// release is recorded in place of the intended result.
    pub(crate) fn finish(
        &self,
        reference: &mut MessageRef,
        status: Status,
        result: MetricResult,
        message: &Message,
    ) {
        match reference.release(status) {
            Ok(()) => self.emit_processed(message, result),
            Err(release_error) => {
                error!(error = %release_error, "failed to release source reference");
                self.emit_processed(message, MetricResult::ErrFailedMsgRelease);
            }
        }
    }
}

/// Handle to a running engine; `cancel` asks the sources to stop.
#[derive(Clone)]
pub struct RunHandle {
    kill: flume::Sender<()>,
}

impl RunHandle {
    /// Requests a graceful stop: sources stop producing, in-flight work
    /// drains, and the engine run returns.
    pub fn cancel(&self) {
        let _ = self.kill.try_send(());
    }
}

/// A configured engine, ready to run.
///
/// ```no_run
/// use conveyor::config::EngineConfig;
/// use conveyor::context::DispatchContext;
/// use conveyor::dispatch::{handler_fn, Dispatcher};
/// use conveyor::{Message, Runtime};
/// use serde_json::{json, Value};
///
/// # async fn example(source: impl conveyor::Source + 'static) -> Result<(), conveyor::Error> {
/// let dispatcher = Dispatcher::new().on(
///     "Increment",
///     handler_fn(
///         |message: &Message, ctx: &mut DispatchContext| -> Result<Option<Value>, conveyor::Error> {
///             let count = message.payload["count"].as_i64().unwrap_or(0);
///             ctx.publish("Decrement", json!({ "count": count + 1 }), None)?;
///             Ok(None)
///         },
///     ),
/// );
/// let runtime = Runtime::builder()
///     .config(EngineConfig::default())
///     .source(source)
///     .dispatcher(dispatcher)
///     .build()?;
/// runtime.run().await
/// # }
/// ```
pub struct Runtime {
    core: Arc<EngineCore>,
    pipeline: InputPipeline,
    kill_tx: flume::Sender<()>,
    kill_rx: flume::Receiver<()>,
}

impl Runtime {
    /// Starts building an engine.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// A handle that can stop this engine from another task.
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            kill: self.kill_tx.clone(),
        }
    }

    /// Runs the engine until the sources are exhausted or a fatal error
    /// surfaces. Ctrl+C triggers a graceful stop with the configured grace
    /// period; a second interrupt aborts immediately.
    pub async fn run(self) -> Result<(), Error> {
        let Runtime {
            core,
            pipeline,
            kill_tx,
            kill_rx,
        } = self;
        let grace = core.config.shutdown_grace;
        let mut handles: JoinSet<Result<(), Error>> = JoinSet::new();

        match core.config.parallelism {
            Parallelism::Serial => {
                let core = Arc::clone(&core);
                let kill = kill_rx.clone();
                handles.spawn(serial::run(core, pipeline, kill));
            }
            Parallelism::Concurrent => {
                concurrent::spawn(Arc::clone(&core), pipeline, &mut handles, kill_rx.clone())
                    .await?;
            }
            Parallelism::Rpc => {
                rpc::spawn(Arc::clone(&core), pipeline, &mut handles, kill_rx.clone()).await?;
            }
        }
        info!(parallelism = ?core.config.parallelism, "engine started");

        let mut shutting_down = false;
        loop {
            if shutting_down {
                tokio::select! {
                    joined = timeout(grace, handles.join_next()) => match joined {
                        Ok(Some(Ok(Ok(())))) => {}
                        Ok(Some(Ok(Err(task_error)))) => return Err(task_error),
                        Ok(Some(Err(join_error))) => {
                            return Err(Error::ExecutionError(format!("{join_error}")))
                        }
                        Ok(None) => break,
                        Err(_elapsed) => {
                            warn!("grace period elapsed, aborting in-flight work");
                            handles.shutdown().await;
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => {
                        error!("second interrupt received, exiting immediately");
                        handles.shutdown().await;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    joined = handles.join_next() => match joined {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(task_error))) => return Err(task_error),
                        Some(Err(join_error)) => {
                            return Err(Error::ExecutionError(format!("{join_error}")))
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received, stopping sources");
                        let _ = kill_tx.try_send(());
                        shutting_down = true;
                    }
                }
            }
        }

        info!("engine finished");
        Ok(())
    }
}

/// Builder wiring sources, handlers, sinks, and policies into a [Runtime].
pub struct RuntimeBuilder {
    config: EngineConfig,
    sources: Vec<Box<dyn Source>>,
    dispatcher: Option<Dispatcher>,
    validator: Arc<dyn Validator>,
    deduper: Option<Box<dyn Deduper>>,
    enrichers: Vec<Box<dyn Enricher>>,
    annotators: Vec<Box<dyn MetricsAnnotator>>,
    type_mapper: Arc<dyn TypeMapper>,
    metrics: Arc<dyn MetricsSink>,
    state: Option<Arc<dyn StateProvider>>,
    store: Option<Arc<dyn OutputSink<StoreItem>>>,
    publish: Option<Arc<dyn OutputSink<PublishedMessage>>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder::new()
    }
}

impl RuntimeBuilder {
    /// A builder with default policies and no components.
    pub fn new() -> Self {
        RuntimeBuilder {
            config: EngineConfig::default(),
            sources: Vec::new(),
            dispatcher: None,
            validator: Arc::new(NullValidator),
            deduper: None,
            enrichers: Vec::new(),
            annotators: Vec::new(),
            type_mapper: Arc::new(PrettyTypeMapper),
            metrics: Arc::new(NoopMetricsSink),
            state: None,
            store: None,
            publish: None,
        }
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds an input source; several sources are merged round-robin.
    pub fn source(mut self, source: impl Source + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Sets the handler registry.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the validator applied to inputs and buffered outputs.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Sets the deduper consulted by the input pipeline.
    pub fn deduper(mut self, deduper: impl Deduper + 'static) -> Self {
        self.deduper = Some(Box::new(deduper));
        self
    }

    /// Adds an enricher; enrichers chain in registration order.
    pub fn enricher(mut self, enricher: impl Enricher + 'static) -> Self {
        self.enrichers.push(Box::new(enricher));
        self
    }

    /// Adds a metrics annotator.
    pub fn annotator(mut self, annotator: impl MetricsAnnotator + 'static) -> Self {
        self.annotators.push(Box::new(annotator));
        self
    }

    /// Sets the type-name mapper for outputs.
    pub fn type_mapper(mut self, mapper: impl TypeMapper + 'static) -> Self {
        self.type_mapper = Arc::new(mapper);
        self
    }

    /// Sets the metrics backend.
    pub fn metrics(mut self, metrics: impl MetricsSink + 'static) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// Sets the state provider backing `state_get`.
    pub fn state_provider(mut self, provider: impl StateProvider + 'static) -> Self {
        self.state = Some(Arc::new(provider));
        self
    }

    /// Sets the sink receiving stored state-change events.
    pub fn store_sink(mut self, sink: impl OutputSink<StoreItem> + 'static) -> Self {
        self.store = Some(Arc::new(sink));
        self
    }

    /// Sets the sink receiving published downstream events.
    pub fn publish_sink(mut self, sink: impl OutputSink<PublishedMessage> + 'static) -> Self {
        self.publish = Some(Arc::new(sink));
        self
    }

    /// Validates the wiring and produces a runnable engine.
    ///
    /// The state provider is wrapped in an LRU cache (unless disabled), and
    /// under RPC parallelism with a store sink additionally in the
    /// epoch-aware provider that detects writes from stale reads.
    pub fn build(self) -> Result<Runtime, Error> {
        self.config.validate()?;
        if self.sources.is_empty() {
            return Err(Error::ConfigFailedValidation(
                "at least one source is required".into(),
            ));
        }
        let dispatcher = self.dispatcher.ok_or_else(|| {
            Error::ConfigFailedValidation("a dispatcher with handlers is required".into())
        })?;

        let mut epochs: Option<Arc<EpochManager>> = None;
        let state: Option<Arc<dyn StateProvider>> = match self.state {
            Some(provider) if self.config.state_cache_capacity > 0 => {
                let cache = Arc::new(CachingStateProvider::new(
                    provider,
                    self.config.state_cache_capacity,
                    self.config.state_cache_ttl,
                ));
                if self.store.is_some() && self.config.parallelism == Parallelism::Rpc {
                    let manager = Arc::new(EpochManager::new());
                    epochs = Some(Arc::clone(&manager));
                    Some(Arc::new(EpochAwareStateProvider::new(cache, manager)))
                } else {
                    Some(cache)
                }
            }
            other => other,
        };

        let coordinator = SinkCoordinator::new(
            self.store,
            self.publish,
            epochs,
            Arc::clone(&self.metrics),
        );

        let enrichers = Arc::new(self.enrichers);
        let core = EngineCore {
            dispatcher,
            validator: self.validator,
            state,
            enrichers: Arc::clone(&enrichers),
            type_mapper: self.type_mapper,
            metrics: self.metrics,
            annotators: Arc::new(self.annotators),
            coordinator,
            dispatch_retrier: Retrier::new(self.config.dispatch_retry.clone()),
            sink_retrier: Retrier::new(self.config.sink_retry.clone()),
            config: self.config,
        };

        let pipeline = InputPipeline::new(self.sources, enrichers, self.deduper);
        let (kill_tx, kill_rx) = flume::bounded(1);

        Ok(Runtime {
            core: Arc::new(core),
            pipeline,
            kill_tx,
            kill_rx,
        })
    }
}
