//! Update dispatcher for the Switchboard framework.
//!
//! The [`Dispatcher`] owns priority-ordered handler groups and decides, for
//! every update, which handlers run:
//!
//! 1. Groups are visited in ascending numeric order.
//! 2. Within a group, handlers are checked in registration order and the
//!    first match runs; the rest of the group is skipped.
//! 3. Later groups still run, unless a callback stopped propagation.
//!
//! A handler runs either inline, blocking the dispatch loop, or on a bounded
//! worker pool. After every successful invocation the user, chat and global
//! data the update touched are compared with their last persisted snapshot
//! and written back if they differ.
//!
//! Errors never abort dispatching. Callback errors go to the registered error
//! handlers or, when there are none, into a bounded dead-letter buffer.
//! Persistence errors of inline invocations are returned from
//! [`Dispatcher::process_update`] after every group ran.
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::builder()
//!     .add_handler(0, conversation)
//!     .add_handler(1, MessageHandler::new(filters::all(), log_update))
//!     .add_error_handler(|ctx| async move {
//!         tracing::error!(error = ?ctx.error(), "callback failed");
//!     })
//!     .persistence(Arc::new(FilePersistence::open("state.json").await?))
//!     .build()
//!     .await?;
//!
//! let (tx, rx) = update_queue(Some(256));
//! dispatcher.run(rx, CancellationToken::new()).await?;
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{Instrument, Level, debug, error, info, span, trace, warn};

use switchboard_core::{BoxedUpdate, Persistence, SharedData, Update};

use crate::context::{CallbackContext, UpdateScope};
use crate::error::{BoxError, DeadLetter, DispatchError, DispatchResult, ErrorSource, SharedError};
use crate::handler::{BoxedHandler, Handler, HandlerResult, IntoTransition, into_handler};
use crate::job::{JobErrorSink, JobHandle, JobQueue};
use crate::queue::UpdateReceiver;
use crate::store::DataStore;

/// A type-erased error handler.
///
/// Receives the failed update and the error through its context
/// ([`CallbackContext::update`], [`CallbackContext::error`]).
pub type ErrorCallback = Arc<dyn Fn(CallbackContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1024;

// ============================================================================
// DispatcherShared: what callbacks reach through their context
// ============================================================================

pub(crate) struct DispatcherShared {
    me: Weak<DispatcherShared>,
    store: DataStore,
    bot_data: SharedData,
    job_queue: JobQueue,
    error_handlers: Vec<ErrorCallback>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
    dead_letter_count: AtomicU64,
}

impl DispatcherShared {
    pub(crate) fn bot_data(&self) -> &SharedData {
        &self.bot_data
    }

    pub(crate) fn job_queue(&self) -> &JobQueue {
        &self.job_queue
    }

    /// Writes back global data and the update's user and chat data.
    pub(crate) async fn sync_namespaces(&self, update: &dyn Update) -> DispatchResult<()> {
        self.store.sync(update.user_id(), update.chat_id()).await?;
        Ok(())
    }

    /// Hands an error to every error handler, or dead-letters it.
    pub(crate) async fn route_error(&self, scope: Option<Arc<UpdateScope>>, error: BoxError, source: ErrorSource) {
        let error: SharedError = Arc::from(error);
        let scope = scope.unwrap_or_else(|| Arc::new(UpdateScope::detached()));

        let shared = self.me.upgrade().filter(|_| !self.error_handlers.is_empty());
        let Some(shared) = shared else {
            self.dead_letter(DeadLetter {
                update: scope.update().cloned(),
                error,
                source,
            });
            return;
        };

        for handler in &self.error_handlers {
            let ctx = CallbackContext::for_error(
                Arc::clone(&scope),
                Arc::clone(&shared),
                Arc::clone(&error),
                source.clone(),
            );
            if let Err(e) = handler(ctx).await {
                error!(%source, error = %e, "Error handler failed");
            }
        }
    }

    fn dead_letter(&self, letter: DeadLetter) {
        error!(source = %letter.source, error = %letter.error, "Unhandled error");
        self.dead_letter_count.fetch_add(1, Ordering::SeqCst);
        if self.dead_letter_capacity == 0 {
            return;
        }
        let mut letters = self.dead_letters.lock();
        if letters.len() == self.dead_letter_capacity {
            letters.pop_front();
        }
        letters.push_back(letter);
    }

    /// Routes a callback's error and syncs namespaces after a success.
    ///
    /// Persistence failures, including a conversation's failed write-through,
    /// are returned instead of routed.
    async fn finish_invocation(
        &self,
        scope: &Arc<UpdateScope>,
        handler: &str,
        result: HandlerResult,
    ) -> DispatchResult<()> {
        let mut persistence_error = None;
        if let Err(error) = result {
            match error.downcast::<DispatchError>() {
                Ok(error) if matches!(*error, DispatchError::Persistence(_)) => {
                    persistence_error = Some(*error);
                }
                Ok(error) => {
                    let source = ErrorSource::Handler { handler: handler.to_string() };
                    self.route_error(Some(Arc::clone(scope)), error, source).await;
                    return Ok(());
                }
                Err(error) => {
                    let source = ErrorSource::Handler { handler: handler.to_string() };
                    self.route_error(Some(Arc::clone(scope)), error, source).await;
                    return Ok(());
                }
            }
        }

        let synced = match scope.update() {
            Some(update) => self.sync_namespaces(update.as_ref()).await,
            None => Ok(()),
        };
        match persistence_error {
            Some(error) => Err(error),
            None => synced,
        }
    }
}

#[async_trait]
impl JobErrorSink for DispatcherShared {
    async fn job_failed(&self, job: JobHandle, error: BoxError) {
        let source = ErrorSource::Job {
            name: job.name().to_string(),
        };
        self.route_error(None, error, source).await;
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    groups: BTreeMap<i32, Vec<BoxedHandler>>,
    error_handlers: Vec<ErrorCallback>,
    persistence: Option<Arc<dyn Persistence>>,
    job_queue: Option<JobQueue>,
    workers: usize,
    flush_interval: Option<Duration>,
    dead_letter_capacity: usize,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            error_handlers: Vec::new(),
            persistence: None,
            job_queue: None,
            workers: DEFAULT_WORKERS,
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
        }
    }
}

impl DispatcherBuilder {
    /// Appends a handler to `group`, creating the group if needed.
    pub fn add_handler(self, group: i32, handler: impl Handler) -> Self {
        self.add_boxed_handler(group, into_handler(handler))
    }

    /// Appends an already boxed handler to `group`.
    pub fn add_boxed_handler(mut self, group: i32, handler: BoxedHandler) -> Self {
        self.groups.entry(group).or_default().push(handler);
        self
    }

    /// Adds an error handler. Every error handler sees every error.
    pub fn add_error_handler<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        let callback: ErrorCallback = Arc::new(move |ctx: CallbackContext| -> BoxFuture<'static, HandlerResult> {
            let fut = f(ctx);
            Box::pin(async move { fut.await.into_transition() })
        });
        self.error_handlers.push(callback);
        self
    }

    /// Sets the persistence backend.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Uses an existing job queue instead of a fresh one.
    pub fn job_queue(mut self, job_queue: JobQueue) -> Self {
        self.job_queue = Some(job_queue);
        self
    }

    /// Size of the worker pool for asynchronous handlers. Default 4.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// How often [`Dispatcher::run`] flushes persistence. `None` disables it.
    pub fn flush_interval(mut self, interval: impl Into<Option<Duration>>) -> Self {
        self.flush_interval = interval.into();
        self
    }

    /// How many dead letters are kept. The oldest are dropped first.
    pub fn dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Restores persisted state into every handler, loads global data and
    /// starts the job queue.
    ///
    /// Fails if a persistent conversation is registered without persistence.
    pub async fn build(self) -> DispatchResult<Dispatcher> {
        if self.workers == 0 {
            return Err(DispatchError::invalid_config("the worker pool needs at least one worker"));
        }
        if self.flush_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(DispatchError::invalid_config("flush interval must be positive"));
        }

        for handler in self.groups.values().flatten() {
            handler.restore(self.persistence.as_ref()).await?;
        }

        let store = DataStore::open(self.persistence.clone()).await?;
        let bot_data = store.bot_data();
        let job_queue = self.job_queue.unwrap_or_default();
        let error_handlers = self.error_handlers;
        let dead_letter_capacity = self.dead_letter_capacity;

        let shared = Arc::new_cyclic(|me| DispatcherShared {
            me: me.clone(),
            store,
            bot_data,
            job_queue: job_queue.clone(),
            error_handlers,
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_capacity,
            dead_letter_count: AtomicU64::new(0),
        });
        let sink: Weak<dyn JobErrorSink> = Arc::downgrade(&shared) as Weak<dyn JobErrorSink>;
        job_queue.set_error_sink(sink);
        job_queue.start();

        let dispatcher = Dispatcher {
            inner: Arc::new(DispatcherInner {
                groups: self.groups,
                shared,
                persistence: self.persistence,
                workers: Arc::new(Semaphore::new(self.workers)),
                worker_count: self.workers,
                tracker: TaskTracker::new(),
                flush_interval: self.flush_interval,
                running: AtomicBool::new(false),
            }),
        };
        info!(
            groups = dispatcher.group_count(),
            handlers = dispatcher.handler_count(),
            workers = dispatcher.inner.worker_count,
            "Dispatcher built"
        );
        Ok(dispatcher)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct DispatcherInner {
    groups: BTreeMap<i32, Vec<BoxedHandler>>,
    shared: Arc<DispatcherShared>,
    persistence: Option<Arc<dyn Persistence>>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    tracker: TaskTracker,
    flush_interval: Option<Duration>,
    running: AtomicBool,
}

/// Routes updates to handlers.
///
/// Cheap to clone; clones share handlers, data and workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Starts building a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Dispatches one update.
    ///
    /// Returns whether any handler matched. Asynchronous invocations are only
    /// started, not awaited; see [`wait_idle`](Self::wait_idle).
    ///
    /// # Errors
    ///
    /// Loading the update's user or chat data failed, or writing state back
    /// after an inline invocation failed. In the former case no group runs and
    /// the error is also routed to the error handlers with
    /// [`ErrorSource::Persistence`]. In the latter case every group has still
    /// been visited and in-memory state is kept.
    pub async fn process_update(&self, update: BoxedUpdate) -> DispatchResult<bool> {
        let span = span!(Level::DEBUG, "dispatch", update_id = update.update_id(), kind = ?update.kind());
        self.dispatch(update).instrument(span).await
    }

    async fn load_namespaces(&self, update: &dyn Update) -> DispatchResult<(Option<SharedData>, Option<SharedData>)> {
        let store = &self.inner.shared.store;
        let user_data = match update.user_id() {
            Some(user_id) => Some(store.user_data(user_id).await?),
            None => None,
        };
        let chat_data = match update.chat_id() {
            Some(chat_id) => Some(store.chat_data(chat_id).await?),
            None => None,
        };
        Ok((user_data, chat_data))
    }

    async fn dispatch(&self, update: BoxedUpdate) -> DispatchResult<bool> {
        let shared = &self.inner.shared;
        let (user_data, chat_data) = match self.load_namespaces(update.as_ref()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to load update data, update dropped");
                let scope = Arc::new(UpdateScope::new(Some(Arc::clone(&update)), None, None));
                shared
                    .route_error(Some(scope), Box::new(e.clone()), ErrorSource::Persistence)
                    .await;
                return Err(e);
            }
        };
        let scope = Arc::new(UpdateScope::new(Some(Arc::clone(&update)), user_data, chat_data));

        let mut handled = false;
        let mut persistence_error = None;
        for (&group, handlers) in &self.inner.groups {
            let selected = handlers.iter().find_map(|handler| {
                trace!(group, handler = handler.name(), "Checking handler");
                handler.check(&update).map(|matched| (handler, matched))
            });
            let Some((handler, matched)) = selected else {
                continue;
            };
            handled = true;

            let run_async = handler.runs_async(&matched);
            debug!(group, handler = handler.name(), run_async, "Handler selected");
            let ctx = CallbackContext::new(Arc::clone(&scope), Arc::clone(shared), &matched);

            if run_async {
                let permit = Arc::clone(&self.inner.workers).acquire_owned().await.ok();
                // The synchronous part of `handle` runs here, in dispatch order.
                let fut = handler.handle(Arc::clone(&update), matched, ctx);
                let shared = Arc::clone(shared);
                let scope = Arc::clone(&scope);
                let name = handler.name().to_string();
                self.inner.tracker.spawn(
                    async move {
                        let result = fut.await;
                        if let Err(e) = shared.finish_invocation(&scope, &name, result).await {
                            warn!(handler = %name, error = %e, "Persistence failed after asynchronous invocation");
                            shared.route_error(Some(scope), Box::new(e), ErrorSource::Persistence).await;
                        }
                        drop(permit);
                    }
                    .in_current_span(),
                );
            } else {
                let result = handler.handle(Arc::clone(&update), matched, ctx).await;
                if let Err(e) = shared.finish_invocation(&scope, handler.name(), result).await {
                    warn!(group, handler = handler.name(), error = %e, "Persistence failed after invocation");
                    persistence_error.get_or_insert(e);
                }
            }

            if !scope.is_propagating() {
                debug!(group, "Propagation stopped");
                break;
            }
        }

        if !handled {
            trace!("No handler matched");
        }
        match persistence_error {
            Some(error) => Err(error),
            None => Ok(handled),
        }
    }

    /// Processes updates from `updates` until `shutdown` is cancelled or every
    /// sender is gone, flushing persistence on the configured interval.
    ///
    /// On exit, waits for running workers, stops the job queue and flushes.
    pub async fn run(&self, mut updates: UpdateReceiver, shutdown: CancellationToken) -> DispatchResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyRunning);
        }
        info!("Dispatcher running");

        let mut flush = self
            .inner
            .flush_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            let flush_tick = async {
                match flush.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                update = updates.recv() => match update {
                    Some(update) => {
                        if let Err(e) = self.process_update(update).await {
                            warn!(error = %e, "Update processed with errors");
                        }
                    }
                    None => {
                        info!("Update queue closed");
                        break;
                    }
                },
                _ = flush_tick => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Periodic flush failed");
                    }
                }
            }
        }

        let result = self.shutdown().await;
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Dispatcher stopped");
        result
    }

    /// Waits for running workers, stops the job queue and flushes.
    pub async fn shutdown(&self) -> DispatchResult<()> {
        self.wait_idle().await;
        self.inner.shared.job_queue.stop().await;
        self.flush().await
    }

    /// Waits until every asynchronous invocation started so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Retries failed conversation writes, writes back every changed
    /// namespace, then flushes the backend.
    ///
    /// Every step runs even when an earlier one failed; the first error is
    /// returned.
    pub async fn flush(&self) -> DispatchResult<()> {
        let mut result = Ok(());
        for handler in self.inner.groups.values().flatten() {
            if let Err(e) = handler.flush().await {
                warn!(handler = handler.name(), error = %e, "Failed to write back handler state");
                result = result.and(Err(e));
            }
        }
        if let Err(e) = self.inner.shared.store.sync_all().await {
            result = result.and(Err(e.into()));
        }
        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.flush().await {
                result = result.and(Err(e.into()));
            }
        }
        if result.is_ok() {
            debug!("Persistence flushed");
        }
        result
    }

    /// Writes back the namespaces `update` touches, if they changed.
    pub async fn update_persistence(&self, update: &dyn Update) -> DispatchResult<()> {
        self.inner.shared.sync_namespaces(update).await
    }

    /// Errors recorded while no error handler was registered, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.shared.dead_letters.lock().iter().cloned().collect()
    }

    /// Takes every buffered dead letter.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.shared.dead_letters.lock().drain(..).collect()
    }

    /// How many errors were dead-lettered in total, dropped ones included.
    pub fn dead_letter_count(&self) -> u64 {
        self.inner.shared.dead_letter_count.load(Ordering::SeqCst)
    }

    /// Process-global data.
    pub fn bot_data(&self) -> SharedData {
        self.inner.shared.bot_data.clone()
    }

    /// The job queue shared with callbacks.
    pub fn job_queue(&self) -> &JobQueue {
        &self.inner.shared.job_queue
    }

    /// The persistence backend, if any.
    pub fn persistence(&self) -> Option<&Arc<dyn Persistence>> {
        self.inner.persistence.as_ref()
    }

    /// Whether [`run`](Self::run) is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of handler groups.
    pub fn group_count(&self) -> usize {
        self.inner.groups.len()
    }

    /// Number of registered handlers across every group.
    pub fn handler_count(&self) -> usize {
        self.inner.groups.values().map(Vec::len).sum()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("groups", &self.group_count())
            .field("handlers", &self.handler_count())
            .field("workers", &self.inner.worker_count)
            .field("running", &self.is_running())
            .field("dead_letters", &self.dead_letter_count())
            .finish()
    }
}

/// Tower Service implementation for Dispatcher.
///
/// The response is whether any handler matched, so a dispatcher can sit
/// behind Tower middleware such as rate limiting or timeouts.
impl Service<BoxedUpdate> for Dispatcher {
    type Response = bool;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, update: BoxedUpdate) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.process_update(update).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use switchboard_core::{
        BasicUpdate, ConversationKey, ConversationMap, Data, MemoryPersistence, PersistenceError,
        PersistenceResult, State,
    };
    use tower::ServiceExt;

    use crate::filters;
    use crate::handler::{MessageHandler, Transition, UpdateHandler};
    use crate::queue::update_queue;

    fn msg(update_id: i64, text: &str) -> BoxedUpdate {
        BasicUpdate::message(update_id, 10, 20, text).into_boxed()
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, label: &str) -> UpdateHandler {
        let log = Arc::clone(log);
        let label = label.to_string();
        UpdateHandler::any(move |_u, _c| {
            log.lock().push(label.clone());
            async {}
        })
    }

    #[tokio::test]
    async fn test_first_match_per_group_and_every_group() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::builder()
            .add_handler(2, recording(&log, "g2"))
            .add_handler(1, recording(&log, "g1-first"))
            .add_handler(1, recording(&log, "g1-second"))
            .add_handler(-5, MessageHandler::new(filters::text_eq("never"), |_u, _c| async {}))
            .build()
            .await
            .unwrap();

        assert!(dispatcher.process_update(msg(1, "hi")).await.unwrap());
        assert_eq!(*log.lock(), vec!["g1-first", "g2"]);
        assert_eq!(dispatcher.group_count(), 3);
        assert_eq!(dispatcher.handler_count(), 4);
    }

    #[tokio::test]
    async fn test_unmatched_update_is_dropped() {
        let dispatcher = Dispatcher::builder()
            .add_handler(0, MessageHandler::new(filters::command(), |_u, _c| async {}))
            .build()
            .await
            .unwrap();
        assert!(!dispatcher.process_update(msg(1, "plain")).await.unwrap());
        assert_eq!(dispatcher.dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_propagation_skips_later_groups() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::builder()
            .add_handler(0, UpdateHandler::any(|_u, ctx: CallbackContext| async move { ctx.stop_propagation() }))
            .add_handler(1, recording(&log, "late"))
            .build()
            .await
            .unwrap();

        assert!(dispatcher.process_update(msg(1, "hi")).await.unwrap());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_dead_lettered_without_handlers() {
        let dispatcher = Dispatcher::builder()
            .add_handler(
                0,
                UpdateHandler::any(|_u, _c| async { Err::<(), _>("boom") }).with_name("failing"),
            )
            .dead_letter_capacity(2)
            .build()
            .await
            .unwrap();

        for id in 0..3 {
            assert!(dispatcher.process_update(msg(id, "hi")).await.unwrap());
        }
        assert_eq!(dispatcher.dead_letter_count(), 3);

        let letters = dispatcher.drain_dead_letters();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].update.as_ref().map(|u| u.update_id()), Some(1));
        assert_eq!(letters[0].error.to_string(), "boom");
        assert_eq!(letters[0].source, ErrorSource::Handler { handler: "failing".into() });
        assert!(dispatcher.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_error_handlers_receive_update_and_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::builder()
            .add_handler(0, UpdateHandler::any(|_u, _c| async { Err::<(), _>("boom") }))
            .add_error_handler(move |ctx: CallbackContext| {
                let sink = Arc::clone(&sink);
                async move {
                    let id = ctx.update().map(|u| u.update_id());
                    let error = ctx.error().map(ToString::to_string);
                    sink.lock().push((id, error));
                }
            })
            .build()
            .await
            .unwrap();

        dispatcher.process_update(msg(7, "hi")).await.unwrap();
        assert_eq!(*seen.lock(), vec![(Some(7), Some("boom".to_string()))]);
        assert_eq!(dispatcher.dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn test_changed_namespaces_are_written_back() {
        let memory = Arc::new(MemoryPersistence::new().with_bot_data_json(r#"{"visits": 0}"#).unwrap());
        let dispatcher = Dispatcher::builder()
            .add_handler(
                0,
                UpdateHandler::any(|_u, ctx: CallbackContext| async move {
                    if let Some(user) = ctx.user_data() {
                        user.insert("seen", json!(true));
                    }
                    let visits = ctx.bot_data().get_as::<i64>("visits").unwrap_or_default();
                    ctx.bot_data().insert("visits", json!(visits + 1));
                }),
            )
            .persistence(memory.clone())
            .build()
            .await
            .unwrap();

        dispatcher.process_update(msg(1, "hi")).await.unwrap();
        dispatcher.process_update(msg(2, "hi")).await.unwrap();

        let doc = memory.document();
        assert_eq!(doc.user(20).get("seen"), Some(&json!(true)));
        assert_eq!(doc.bot_data.get("visits"), Some(&json!(2)));
        // The chat was loaded but never changed.
        assert!(doc.chat_data.is_empty());
    }

    #[tokio::test]
    async fn test_async_handlers_run_on_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let dispatcher = Dispatcher::builder()
            .add_handler(
                0,
                UpdateHandler::any(move |_u, _c| {
                    let counter = Arc::clone(&counter);
                    async move {
                        tokio::task::yield_now().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .run_async(true),
            )
            .workers(2)
            .build()
            .await
            .unwrap();

        for id in 0..5 {
            dispatcher.process_update(msg(id, "hi")).await.unwrap();
        }
        dispatcher.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_async_errors_reach_dead_letters() {
        let dispatcher = Dispatcher::builder()
            .add_handler(0, UpdateHandler::any(|_u, _c| async { Err::<(), _>("later") }).run_async(true))
            .build()
            .await
            .unwrap();
        dispatcher.process_update(msg(1, "hi")).await.unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.dead_letter_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_errors_are_routed() {
        let dispatcher = Dispatcher::builder().build().await.unwrap();
        dispatcher
            .job_queue()
            .run_once("nightly", Duration::from_secs(5), |_ctx| async { Err::<(), BoxError>("no".into()) });

        tokio::time::sleep(Duration::from_secs(10)).await;
        let letters = dispatcher.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].update.is_none());
        assert_eq!(letters[0].source, ErrorSource::Job { name: "nightly".into() });
    }

    #[tokio::test]
    async fn test_run_until_queue_closes() {
        let memory = Arc::new(MemoryPersistence::new());
        let dispatcher = Dispatcher::builder()
            .add_handler(
                0,
                UpdateHandler::any(|update: BoxedUpdate, ctx: CallbackContext| async move {
                    let ids = ctx.chat_data().map(|chat| chat.len()).unwrap_or_default();
                    if let Some(chat) = ctx.chat_data() {
                        chat.insert(format!("u{}", update.update_id()), json!(ids));
                    }
                }),
            )
            .persistence(memory.clone())
            .build()
            .await
            .unwrap();

        let (tx, rx) = update_queue(Some(2));
        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(rx, CancellationToken::new()).await })
        };
        for id in 0..4 {
            tx.send(msg(id, "hi")).await.unwrap();
        }
        drop(tx);
        runner.await.unwrap().unwrap();

        let chat = memory.document().chat(10);
        assert_eq!(chat.len(), 4);
        assert_eq!(chat.get("u3"), Some(&json!(3)));
        assert!(!dispatcher.is_running());
        assert!(!dispatcher.job_queue().is_running());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let dispatcher = Dispatcher::builder().build().await.unwrap();
        let shutdown = CancellationToken::new();
        let (_tx, rx) = update_queue(None);
        let runner = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(rx, shutdown).await })
        };
        while !dispatcher.is_running() {
            tokio::task::yield_now().await;
        }

        let (_tx2, rx2) = update_queue(None);
        let second = dispatcher.run(rx2, CancellationToken::new()).await;
        assert!(matches!(second, Err(DispatchError::AlreadyRunning)));

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_service_call() {
        let dispatcher = Dispatcher::builder()
            .add_handler(0, MessageHandler::new(filters::text_eq("ping"), |_u, _c| async {}))
            .build()
            .await
            .unwrap();
        assert!(dispatcher.clone().oneshot(msg(1, "ping")).await.unwrap());
        assert!(!dispatcher.oneshot(msg(2, "pong")).await.unwrap());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let result = tokio_test::block_on(Dispatcher::builder().workers(0).build());
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[derive(Debug)]
    struct Unavailable;

    #[async_trait]
    impl Persistence for Unavailable {
        async fn load_user_data(&self, _user_id: i64) -> PersistenceResult<Data> {
            Err(PersistenceError::backend("unavailable"))
        }
        async fn load_chat_data(&self, _chat_id: i64) -> PersistenceResult<Data> {
            Ok(Data::new())
        }
        async fn load_bot_data(&self) -> PersistenceResult<Data> {
            Ok(Data::new())
        }
        async fn load_conversations(&self, _name: &str) -> PersistenceResult<ConversationMap> {
            Ok(ConversationMap::new())
        }
        async fn update_user_data(&self, _user_id: i64, _data: &Data) -> PersistenceResult<()> {
            Ok(())
        }
        async fn update_chat_data(&self, _chat_id: i64, _data: &Data) -> PersistenceResult<()> {
            Ok(())
        }
        async fn update_bot_data(&self, _data: &Data) -> PersistenceResult<()> {
            Err(PersistenceError::backend("read only"))
        }
        async fn update_conversation(
            &self,
            _name: &str,
            _key: &ConversationKey,
            _state: Option<&State>,
        ) -> PersistenceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_errors_reach_the_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = Dispatcher::builder()
            .add_handler(
                0,
                UpdateHandler::any(move |_u, ctx: CallbackContext| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.bot_data().insert("k", json!(1));
                    async { Transition::Keep }
                }),
            )
            .persistence(Arc::new(Unavailable))
            .build()
            .await
            .unwrap();

        // Loading the user's data fails before any handler runs; the update
        // is dead-lettered.
        let result = dispatcher.process_update(msg(1, "hi")).await;
        assert!(matches!(result, Err(DispatchError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let letters = dispatcher.drain_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].source, ErrorSource::Persistence);
        assert_eq!(letters[0].update.as_ref().map(|u| u.update_id()), Some(1));

        // Without a user, the handler runs; the write-back failure is returned
        // and memory stays authoritative.
        let post = BasicUpdate::channel_post(2, 10, "news").into_boxed();
        let result = dispatcher.process_update(post).await;
        assert!(matches!(result, Err(DispatchError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.bot_data().get("k"), Some(json!(1)));
        assert_eq!(dispatcher.dead_letter_count(), 1);
    }
}
