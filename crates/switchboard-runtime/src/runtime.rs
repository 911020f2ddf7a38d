//! Runtime orchestration: configuration in, a running dispatcher out.
//!
//! [`Runtime`] wires together what a bot process needs around the
//! dispatcher: logging, the persistence backend named in the config, the
//! job queue, the intake queue and shutdown on Ctrl+C or SIGTERM.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use switchboard_runtime::Runtime;
//!
//! let runtime = Runtime::builder().config_file("switchboard.toml").build().await?;
//! runtime.add_handler(0, conversation).await?;
//!
//! let sender = runtime.update_sender().await.expect("not started yet");
//! tokio::spawn(feed_updates(sender));
//!
//! runtime.run().await?;
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_core::{FilePersistence, MemoryPersistence, Persistence};
use switchboard_framework::{
    CallbackContext, Dispatcher, DispatcherBuilder, Handler, IntoTransition, JobQueue,
    UpdateReceiver, UpdateSender, update_queue,
};

use crate::config::{
    ConfigLoader, PersistenceBackend, PersistenceConfig, SwitchboardConfig, validate_config,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Counters describing a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Whether the dispatcher loop is running.
    pub running: bool,
    /// Number of handler groups.
    pub groups: usize,
    /// Number of handlers over all groups.
    pub handlers: usize,
    /// Errors nobody handled so far.
    pub dead_letters: u64,
    /// Jobs waiting in the job queue.
    pub scheduled_jobs: usize,
}

/// Registration state until [`Runtime::run`] builds the dispatcher.
struct Pending {
    builder: DispatcherBuilder,
    receiver: UpdateReceiver,
    groups: BTreeSet<i32>,
    handlers: usize,
}

/// A configured bot process.
///
/// Register handlers, hand [`update_sender`](Self::update_sender) to a
/// transport, then call [`run`](Self::run). Handlers can only be added
/// before `run`.
pub struct Runtime {
    config: SwitchboardConfig,
    persistence: Option<Arc<dyn Persistence>>,
    job_queue: JobQueue,
    sender: Mutex<Option<UpdateSender>>,
    pending: Mutex<Option<Pending>>,
    dispatcher: RwLock<Option<Dispatcher>>,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Creates a runtime builder that loads configuration from files and the
    /// environment.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration.
    ///
    /// Validates the configuration, initializes logging (unless a subscriber
    /// is already installed) and opens the persistence backend.
    pub async fn from_config(config: &SwitchboardConfig) -> RuntimeResult<Self> {
        validate_config(config)?;
        logging::init_from_config(&config.logging);

        let persistence = open_persistence(&config.persistence).await?;
        let job_queue = JobQueue::new();
        let (sender, receiver) = update_queue(config.dispatcher.queue_capacity);

        let mut builder = Dispatcher::builder()
            .workers(config.dispatcher.workers)
            .flush_interval(config.dispatcher.flush_interval())
            .job_queue(job_queue.clone());
        if let Some(persistence) = &persistence {
            builder = builder.persistence(Arc::clone(persistence));
        }

        info!(
            backend = %config.persistence.backend,
            workers = config.dispatcher.workers,
            queue_capacity = ?config.dispatcher.queue_capacity,
            log_level = %config.logging.level,
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config: config.clone(),
            persistence,
            job_queue,
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(Some(Pending {
                builder,
                receiver,
                groups: BTreeSet::new(),
                handlers: 0,
            })),
            dispatcher: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    /// The persistence backend, if one is configured.
    pub fn persistence(&self) -> Option<&Arc<dyn Persistence>> {
        self.persistence.as_ref()
    }

    /// The job queue shared with the dispatcher.
    pub fn job_queue(&self) -> &JobQueue {
        &self.job_queue
    }

    /// Cancelling this token stops [`run`](Self::run) like Ctrl+C does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A sender for the intake queue. `None` once the runtime has started.
    ///
    /// The runtime drops its own sender when it starts, so the run loop also
    /// ends once every sender handed out here is gone.
    pub async fn update_sender(&self) -> Option<UpdateSender> {
        self.sender.lock().await.clone()
    }

    /// Appends a handler to `group`.
    pub async fn add_handler(&self, group: i32, handler: impl Handler) -> RuntimeResult<()> {
        let mut pending = self.pending.lock().await;
        let pending = pending.as_mut().ok_or(RuntimeError::AlreadyStarted)?;

        let builder = std::mem::take(&mut pending.builder);
        pending.builder = builder.add_handler(group, handler);
        pending.groups.insert(group);
        pending.handlers += 1;
        debug!(group, handlers = pending.handlers, "Handler registered");
        Ok(())
    }

    /// Adds an error handler. See [`DispatcherBuilder::add_error_handler`].
    pub async fn add_error_handler<F, Fut, R>(&self, f: F) -> RuntimeResult<()>
    where
        F: Fn(CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        let mut pending = self.pending.lock().await;
        let pending = pending.as_mut().ok_or(RuntimeError::AlreadyStarted)?;

        let builder = std::mem::take(&mut pending.builder);
        pending.builder = builder.add_error_handler(f);
        Ok(())
    }

    /// The dispatcher, once [`run`](Self::run) has built it.
    pub async fn dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher.read().await.clone()
    }

    /// Returns whether the dispatcher loop is running.
    pub async fn is_running(&self) -> bool {
        match &*self.dispatcher.read().await {
            Some(dispatcher) => dispatcher.is_running(),
            None => false,
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> RuntimeStats {
        let scheduled_jobs = self.job_queue.jobs().len();
        if let Some(dispatcher) = &*self.dispatcher.read().await {
            return RuntimeStats {
                running: dispatcher.is_running(),
                groups: dispatcher.group_count(),
                handlers: dispatcher.handler_count(),
                dead_letters: dispatcher.dead_letter_count(),
                scheduled_jobs,
            };
        }
        match &*self.pending.lock().await {
            Some(pending) => RuntimeStats {
                groups: pending.groups.len(),
                handlers: pending.handlers,
                scheduled_jobs,
                ..Default::default()
            },
            None => RuntimeStats {
                scheduled_jobs,
                ..Default::default()
            },
        }
    }

    /// Builds the dispatcher and processes updates until Ctrl+C, SIGTERM,
    /// cancellation of [`shutdown_token`](Self::shutdown_token) or until
    /// every update sender is gone.
    ///
    /// On the way out the dispatcher waits for running workers, stops the job
    /// queue and flushes persistence.
    pub async fn run(&self) -> RuntimeResult<()> {
        let pending = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::AlreadyStarted)?;
        self.sender.lock().await.take();

        let dispatcher = pending.builder.build().await?;
        *self.dispatcher.write().await = Some(dispatcher.clone());

        info!(
            groups = dispatcher.group_count(),
            handlers = dispatcher.handler_count(),
            "Switchboard runtime is now running. Press Ctrl+C to stop."
        );

        let signals = tokio::spawn(watch_signals(self.shutdown.clone()));
        let result = dispatcher.run(pending.receiver, self.shutdown.clone()).await;
        signals.abort();

        info!(dead_letters = dispatcher.dead_letter_count(), "Runtime stopped");
        result.map_err(RuntimeError::from)
    }

    /// Requests shutdown. Same as cancelling the shutdown token.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.config.persistence.backend)
            .field("workers", &self.config.dispatcher.workers)
            .field("stopping", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn open_persistence(config: &PersistenceConfig) -> RuntimeResult<Option<Arc<dyn Persistence>>> {
    let flags = config.store_flags();
    let persistence: Arc<dyn Persistence> = match config.backend {
        PersistenceBackend::None => return Ok(None),
        PersistenceBackend::Memory => Arc::new(MemoryPersistence::new().with_store_flags(flags)),
        PersistenceBackend::File => {
            let path = config
                .path
                .as_deref()
                .unwrap_or_else(|| Path::new("switchboard.json"));
            Arc::new(
                FilePersistence::open(path)
                    .await?
                    .on_flush(config.on_flush)
                    .with_store_flags(flags),
            )
        }
    };
    debug!(backend = %config.backend, "Persistence backend opened");
    Ok(Some(persistence))
}

/// Cancels `token` on Ctrl+C or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        received = wait_for_signal() => match received {
            Ok(name) => {
                info!(signal = name, "Received shutdown signal");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signals"),
        }
    }
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            received = signal::ctrl_c() => received.map(|()| "Ctrl+C"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`Runtime`] whose configuration comes from a
/// [`ConfigLoader`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Searches the current directory by default.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: SwitchboardConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads the configuration and builds the runtime.
    pub async fn build(self) -> RuntimeResult<Runtime> {
        let config = self.config_loader.load()?;
        Runtime::from_config(&config).await
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
