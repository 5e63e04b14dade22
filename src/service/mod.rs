//! Commands service
//!
//! Public entry point of the crate. Resolves a command's type tag, picks the
//! local executor or a remote application, and runs remote calls through
//! the correlation manager and the transport.

mod handle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_shared::{destinations, frame, now_ms, CommandEnvelope, Frame, OutcomeKind, ResultEnvelope};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use handle::CommandHandle;

use crate::codec::{encode_command, JsonCodec, PayloadCodec};
use crate::command::{
    tag_of, Command, CommandExecutor, CommandResult, ExecutorBinding, ExecutorRegistry,
    FallbackExecutor, FallbackHandle, InboundProcessor, LocalExecutor, Outcome, TypeRegistry,
};
use crate::config::{CommandsConfig, Precedence};
use crate::correlation::{CorrelationId, CorrelationManager, CorrelationStats, PendingSlot, TimeoutSweeper};
use crate::error::CommandError;
use crate::transport::{LocalTransport, Transport};

/// Frames buffered between the transport and the inbound loop
const INBOUND_CAPACITY: usize = 256;

/// Per-call overrides for `execute_sync_with` / `execute_async_with`
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Application that must execute the command; a different app than this
    /// one forces remote dispatch, this app forces the local executor
    pub target_app: Option<String>,
    /// Wait bound, defaults to `CommandsConfig::default_timeout`
    pub timeout: Option<Duration>,
    /// Receivers drop the command once this much time has passed since it was issued
    pub ttl: Option<Duration>,
    pub user: Option<String>,
    pub tenant: Option<String>,
}

impl ExecuteOptions {
    pub fn target(app: impl Into<String>) -> Self {
        Self {
            target_app: Some(app.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

enum Route {
    Local(LocalRoute),
    Remote(String),
}

enum LocalRoute {
    Typed(LocalExecutor),
    Fallback(FallbackHandle),
}

impl LocalRoute {
    async fn run<C: Command>(self, tag: &str, command: C) -> Result<Value, CommandError> {
        match self {
            LocalRoute::Typed(executor) => executor.execute(Box::new(command)).await,
            LocalRoute::Fallback(fallback) => {
                let body = serde_json::to_value(&command)?;
                fallback.execute(tag, body).await
            }
        }
    }
}

/// Remote command issued before the service was started
struct Queued {
    id: CorrelationId,
    deadline: Instant,
    destination: String,
    frame: Frame,
}

/// Builder for `CommandsService`
pub struct CommandsServiceBuilder {
    config: CommandsConfig,
    transport: Option<Arc<dyn Transport>>,
    codec: Arc<dyn PayloadCodec>,
}

impl CommandsServiceBuilder {
    /// Use `transport` instead of the in-process loopback
    pub fn transport<T: Transport>(self, transport: T) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codec<C: PayloadCodec + 'static>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn build(self) -> CommandsService {
        let config = self.config;
        let types = Arc::new(TypeRegistry::new());
        let executors = Arc::new(ExecutorRegistry::new(config.executor_policy));
        let processor = InboundProcessor::new(
            types.clone(),
            executors.clone(),
            self.codec.clone(),
            config.app_name.clone(),
            config.app_instance_id.clone(),
        );
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTransport::new(processor.clone())));
        let (shutdown_tx, _) = watch::channel(false);

        CommandsService {
            inner: Arc::new(ServiceInner {
                results_channel: destinations::results(&config.app_name, &config.app_instance_id),
                correlation: CorrelationManager::new(config.pending_warn_threshold),
                config,
                types,
                executors,
                transport,
                codec: self.codec,
                processor,
                tasks: Mutex::new(Vec::new()),
                outbox: Mutex::new(Some(Vec::new())),
                shutdown_tx,
                started: AtomicBool::new(false),
            }),
        }
    }
}

struct ServiceInner {
    config: CommandsConfig,
    types: Arc<TypeRegistry>,
    executors: Arc<ExecutorRegistry>,
    correlation: Arc<CorrelationManager>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    processor: InboundProcessor,
    /// Reply queue of this instance
    results_channel: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Remote commands held until `start`; `None` once started
    outbox: Mutex<Option<Vec<Queued>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Executes commands locally or through a transport
///
/// Cloning is cheap; clones share registries, the slot table and the
/// transport.
#[derive(Clone)]
pub struct CommandsService {
    inner: Arc<ServiceInner>,
}

impl CommandsService {
    pub fn builder(config: CommandsConfig) -> CommandsServiceBuilder {
        CommandsServiceBuilder {
            config,
            transport: None,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Service over the in-process loopback transport
    pub fn new(config: CommandsConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CommandsConfig {
        &self.inner.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.inner.executors
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Remote calls still waiting for an outcome
    pub fn in_flight(&self) -> usize {
        self.inner.correlation.in_flight()
    }

    pub fn correlation_stats(&self) -> CorrelationStats {
        self.inner.correlation.stats()
    }

    /// Register a command shape without binding an executor
    pub fn register_command<C: Command>(&self) -> Result<(), CommandError> {
        self.inner.types.register_command::<C>()
    }

    /// Bind a local executor and register its command shape
    pub fn add_executor<E: CommandExecutor>(&self, executor: E) -> Result<(), CommandError> {
        self.inner.types.register_command::<E::Command>()?;
        self.inner.executors.add_executor(executor)
    }

    /// Bind the executor for commands whose tag has no typed executor
    ///
    /// It also accepts tags that were never registered, receiving the
    /// command's raw body.
    pub fn add_fallback_executor<F: FallbackExecutor>(&self, executor: F) -> Result<(), CommandError> {
        self.inner.executors.set_fallback(executor)
    }

    /// Delegate `C` to `target_app` and register its command shape
    pub fn add_remote_executor<C: Command>(
        &self,
        target_app: impl Into<String>,
    ) -> Result<(), CommandError> {
        self.inner.types.register_command::<C>()?;
        self.inner.executors.add_remote::<C>(target_app)
    }

    /// Subscribe to this app's channels and start background tasks
    ///
    /// Remote commands issued earlier are sent once the subscriptions are in
    /// place. Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<(), CommandError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = Vec::new();
        if !inner.config.local_only {
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            let commands_channel = destinations::commands(&inner.config.app_name);

            let subscribed = match inner.transport.subscribe(&inner.results_channel, tx.clone()).await {
                Ok(()) => inner.transport.subscribe(&commands_channel, tx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = subscribed {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }

            let inbound = InboundLoop {
                processor: inner.processor.clone(),
                transport: inner.transport.clone(),
                correlation: inner.correlation.clone(),
                codec: inner.codec.clone(),
                permits: Arc::new(Semaphore::new(inner.config.concurrent_consumers.max(1))),
            };
            tasks.push(tokio::spawn(inbound.run(rx)));

            info!(
                "Commands service {} ({}) listening on {} and {} via {}",
                inner.config.app_name,
                inner.config.app_instance_id,
                commands_channel,
                inner.results_channel,
                inner.transport.name()
            );
        } else {
            info!("Commands service {} started in local-only mode", inner.config.app_name);
        }

        inner.shutdown_tx.send_replace(false);
        let sweeper = TimeoutSweeper::new(inner.correlation.clone(), inner.config.sweep_interval);
        let shutdown_rx = inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { sweeper.run(shutdown_rx).await }));
        inner.tasks.lock().extend(tasks);

        let queued = inner.outbox.lock().take().unwrap_or_default();
        if !queued.is_empty() {
            debug!("Sending {} commands issued before start", queued.len());
        }
        for queued in queued {
            self.flush(queued).await;
        }
        Ok(())
    }

    async fn flush(&self, queued: Queued) {
        let inner = &self.inner;
        if !inner.correlation.is_pending(&queued.id) {
            debug!("Command {} ended before start, not sending", queued.id);
            return;
        }

        let send = inner.transport.send(&queued.destination, queued.frame);
        let error = match tokio::time::timeout_at(queued.deadline, send).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => CommandError::from(e),
            // The waiter times out on the same deadline
            Err(_) => return,
        };
        warn!("Failed to send held command {}: {}", queued.id, error);
        inner.correlation.resolve(&queued.id, Err(error));
    }

    /// Stop background tasks and leave this app's channels
    ///
    /// Pending remote calls run into their timeout. Remote commands issued
    /// afterwards are held until the next `start`.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(true);
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if !inner.config.local_only {
            inner.transport.unsubscribe(&inner.results_channel);
            inner
                .transport
                .unsubscribe(&destinations::commands(&inner.config.app_name));
        }
        inner.outbox.lock().get_or_insert_with(Vec::new);
        inner.started.store(false, Ordering::SeqCst);
        info!("Commands service {} stopped", inner.config.app_name);
    }

    /// Execute `command` and wait for its outcome
    pub async fn execute_sync<C: Command>(&self, command: C) -> Outcome {
        self.execute_sync_with(command, ExecuteOptions::default()).await
    }

    pub async fn execute_sync_with<C: Command>(&self, command: C, options: ExecuteOptions) -> Outcome {
        let tag = tag_of::<C>()?;

        match self.route(tag, &options)? {
            Route::Local(route) => execute_local(&self.inner.config, tag, route, command).await,
            Route::Remote(target) => {
                self.dispatch_remote(&command, tag, &target, &options)
                    .await?
                    .wait()
                    .await
            }
        }
    }

    /// Start executing `command` and return a handle to its outcome
    ///
    /// Routing errors are returned immediately; execution errors come out
    /// of the handle.
    pub async fn execute_async<C: Command>(&self, command: C) -> Result<CommandHandle, CommandError> {
        self.execute_async_with(command, ExecuteOptions::default()).await
    }

    pub async fn execute_async_with<C: Command>(
        &self,
        command: C,
        options: ExecuteOptions,
    ) -> Result<CommandHandle, CommandError> {
        let tag = tag_of::<C>()?;

        match self.route(tag, &options)? {
            Route::Local(route) => {
                let config = self.inner.config.clone();
                let task =
                    tokio::spawn(async move { execute_local(&config, tag, route, command).await });
                Ok(CommandHandle::local(tag, task))
            }
            Route::Remote(target) => {
                let slot = self.dispatch_remote(&command, tag, &target, &options).await?;
                Ok(CommandHandle::remote(tag, slot))
            }
        }
    }

    fn route(&self, tag: &str, options: &ExecuteOptions) -> Result<Route, CommandError> {
        let config = &self.inner.config;
        let executors = &self.inner.executors;
        let no_executor = || CommandError::NoExecutor(tag.to_string());
        let fallback = || executors.fallback().map(|f| Route::Local(LocalRoute::Fallback(f)));

        if let Err(e) = self.inner.types.resolve(tag) {
            // Only the fallback executor accepts unregistered tags, and only here
            let targets_self = options.target_app.as_deref().map_or(true, |t| t == config.app_name);
            return match fallback() {
                Some(route) if targets_self => Ok(route),
                _ => Err(e),
            };
        }

        if let Some(target) = options.target_app.as_deref() {
            if target == config.app_name {
                return executors
                    .local(tag)
                    .map(|e| Route::Local(LocalRoute::Typed(e)))
                    .or_else(fallback)
                    .ok_or_else(no_executor);
            }
            if config.local_only {
                return Err(no_executor());
            }
            return Ok(Route::Remote(target.to_string()));
        }

        let (local, bound_remote) = match executors.lookup(tag) {
            Some(ExecutorBinding::Local(executor)) => (Some(executor), None),
            Some(ExecutorBinding::Remote { target_app }) => (None, Some(target_app)),
            None => (None, None),
        };
        let remote = if config.local_only {
            None
        } else {
            bound_remote.or_else(|| config.default_target.clone())
        };

        match (local, remote) {
            (Some(executor), None) => Ok(Route::Local(LocalRoute::Typed(executor))),
            (Some(executor), Some(target)) => match config.precedence {
                Precedence::LocalFirst => Ok(Route::Local(LocalRoute::Typed(executor))),
                Precedence::RemoteFirst => Ok(Route::Remote(target)),
            },
            (None, Some(target)) => Ok(Route::Remote(target)),
            (None, None) => fallback().ok_or_else(no_executor),
        }
    }

    async fn dispatch_remote<C: Command>(
        &self,
        command: &C,
        tag: &'static str,
        target: &str,
        options: &ExecuteOptions,
    ) -> Result<PendingSlot, CommandError> {
        let inner = &self.inner;
        let payload = encode_command(inner.codec.as_ref(), command)?;
        let timeout = options.timeout.unwrap_or(inner.config.default_timeout);
        let slot = inner.correlation.begin(tag, timeout);

        let envelope = CommandEnvelope {
            type_tag: tag.to_string(),
            payload,
            correlation_id: slot.id().to_string(),
            reply_to: inner.results_channel.clone(),
            issued_at_ms: now_ms(),
            ttl_ms: options.ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0),
            source_app: inner.config.app_name.clone(),
            source_app_id: inner.config.app_instance_id.clone(),
            target_app: target.to_string(),
            user: options.user.clone().unwrap_or_default(),
            tenant: options.tenant.clone().unwrap_or_default(),
        };

        let destination = destinations::commands(target);
        let frame = Frame::command(envelope);

        let frame = match inner.outbox.lock().as_mut() {
            Some(outbox) => {
                outbox.push(Queued {
                    id: slot.id(),
                    deadline: slot.deadline(),
                    destination: destination.clone(),
                    frame,
                });
                None
            }
            None => Some(frame),
        };
        let Some(frame) = frame else {
            debug!("Holding command {} ({}) for {} until start", slot.id(), tag, target);
            return Ok(slot);
        };

        debug!("Sending command {} ({}) to {}", slot.id(), tag, target);

        // A failed send drops the slot, which withdraws it from the table
        let send = inner.transport.send(&destination, frame);
        match tokio::time::timeout_at(slot.deadline(), send).await {
            Ok(sent) => sent?,
            Err(_) => {
                warn!("Command {} ({}) could not be sent to {} in time", slot.id(), tag, target);
                return Err(slot.expire());
            }
        }
        Ok(slot)
    }
}

/// Run a local executor on the calling task
async fn execute_local<C: Command>(
    config: &CommandsConfig,
    tag: &str,
    route: LocalRoute,
    command: C,
) -> Outcome {
    let started = now_ms();
    let value = route.run(tag, command).await?;
    Ok(CommandResult {
        command_type: tag.to_string(),
        correlation_id: None,
        started_ms: started,
        completed_ms: now_ms(),
        app_name: config.app_name.clone(),
        app_instance_id: config.app_instance_id.clone(),
        value,
    })
}

/// Consumes frames delivered to this instance
struct InboundLoop {
    processor: InboundProcessor,
    transport: Arc<dyn Transport>,
    correlation: Arc<CorrelationManager>,
    codec: Arc<dyn PayloadCodec>,
    permits: Arc<Semaphore>,
}

impl InboundLoop {
    async fn run(self, mut frames: mpsc::Receiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            match frame.body {
                Some(frame::Body::Command(envelope)) => {
                    // Result frames must never queue behind busy executors
                    let permits = self.permits.clone();
                    let processor = self.processor.clone();
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        let result = processor.process(&envelope).await;
                        if envelope.reply_to.is_empty() {
                            debug!("Command {} has no reply destination", envelope.correlation_id);
                            return;
                        }
                        if let Err(e) = transport.send(&envelope.reply_to, Frame::result(result)).await {
                            warn!(
                                "Failed to send result of {} to {}: {}",
                                envelope.correlation_id, envelope.reply_to, e
                            );
                        }
                    });
                }
                Some(frame::Body::Result(result)) => self.complete(result),
                None => debug!("Ignoring empty frame"),
            }
        }
        debug!("Inbound loop finished");
    }

    fn complete(&self, result: ResultEnvelope) {
        let id: CorrelationId = match result.correlation_id.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("Result with malformed correlation id {:?}", result.correlation_id);
                return;
            }
        };
        let outcome = outcome_of(result, id, self.codec.as_ref());
        self.correlation.resolve(&id, outcome);
    }
}

/// Turn a result envelope into the caller-facing outcome
fn outcome_of(result: ResultEnvelope, id: CorrelationId, codec: &dyn PayloadCodec) -> Outcome {
    match result.outcome_kind() {
        OutcomeKind::Result => Ok(CommandResult {
            value: codec.decode(&result.payload)?,
            command_type: result.type_tag,
            correlation_id: Some(id),
            started_ms: result.started_at_ms,
            completed_ms: result.completed_at_ms,
            app_name: result.app_name,
            app_instance_id: result.app_instance_id,
        }),
        OutcomeKind::Failure | OutcomeKind::Unspecified => {
            Err(CommandError::from_wire(&result.error_code, result.error_message))
        }
    }
}
