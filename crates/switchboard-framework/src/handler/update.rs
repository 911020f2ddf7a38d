use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use switchboard_core::{BoxedUpdate, Update};

use crate::context::CallbackContext;
use crate::handler::{Callback, Handler, HandlerResult, IntoTransition, MatchResult, callback};

type Predicate = Arc<dyn Fn(&dyn Update) -> bool + Send + Sync>;

/// Handles every update accepted by an arbitrary predicate.
///
/// ```rust,ignore
/// let audit = UpdateHandler::new(|update| update.user_id().is_some(), |update, _ctx| async move {
///     tracing::info!(update_id = update.update_id(), "seen");
/// });
/// ```
#[derive(Clone)]
pub struct UpdateHandler {
    predicate: Predicate,
    callback: Callback,
    run_async: bool,
    name: String,
}

impl UpdateHandler {
    /// Handles updates for which `predicate` returns `true`.
    pub fn new<P, F, Fut, R>(predicate: P, f: F) -> Self
    where
        P: Fn(&dyn Update) -> bool + Send + Sync + 'static,
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            callback: callback(f),
            run_async: false,
            name: "UpdateHandler".to_string(),
        }
    }

    /// Handles every update.
    pub fn any<F, Fut, R>(f: F) -> Self
    where
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        Self::new(|_| true, f)
    }

    /// Runs the callback on a worker instead of the dispatch loop.
    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }

    /// Sets the name used in logs and error reports.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Handler for UpdateHandler {
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        (self.predicate)(update.as_ref()).then(MatchResult::new)
    }

    fn handle(
        &self,
        update: BoxedUpdate,
        _matched: MatchResult,
        ctx: CallbackContext,
    ) -> BoxFuture<'static, HandlerResult> {
        (self.callback)(update, ctx)
    }

    fn runs_async(&self, _matched: &MatchResult) -> bool {
        self.run_async
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandler")
            .field("name", &self.name)
            .field("run_async", &self.run_async)
            .finish_non_exhaustive()
    }
}
