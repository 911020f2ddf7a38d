//! Callback context for the Switchboard framework.
//!
//! Two layers, mirroring how one update fans out over several groups:
//!
//! - [`UpdateScope`]: **shared** by every invocation for one update. Holds
//!   the update, the user and chat data handles and the propagation flag.
//!   Calling [`stop_propagation`](CallbackContext::stop_propagation) from any
//!   callback writes through to it, so the dispatcher skips later groups.
//!
//! - [`CallbackContext`]: **per invocation**. Wraps the scope together with
//!   what the matching handler found (command arguments, regex matches), the
//!   error being reported (for error handlers) and the dispatcher's services.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use switchboard_core::{BoxedUpdate, SharedData};

use crate::dispatcher::DispatcherShared;
use crate::error::{ErrorSource, SharedError};
use crate::filters::RegexMatch;
use crate::handler::MatchResult;
use crate::job::JobQueue;

// =============================================================================
// UpdateScope: one per dispatched update
// =============================================================================

/// State shared by every callback invoked for one update.
pub struct UpdateScope {
    update: Option<BoxedUpdate>,
    user_data: Option<SharedData>,
    chat_data: Option<SharedData>,
    /// Cleared by any callback that calls [`CallbackContext::stop_propagation`].
    is_propagating: AtomicBool,
}

impl UpdateScope {
    pub(crate) fn new(
        update: Option<BoxedUpdate>,
        user_data: Option<SharedData>,
        chat_data: Option<SharedData>,
    ) -> Self {
        Self {
            update,
            user_data,
            chat_data,
            is_propagating: AtomicBool::new(true),
        }
    }

    /// A scope with no update, for job errors.
    pub(crate) fn detached() -> Self {
        Self::new(None, None, None)
    }

    /// The update being processed.
    pub fn update(&self) -> Option<&BoxedUpdate> {
        self.update.as_ref()
    }

    /// Returns `true` until a callback stops propagation.
    pub fn is_propagating(&self) -> bool {
        self.is_propagating.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_propagation(&self) {
        self.is_propagating.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for UpdateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScope")
            .field("update", &self.update)
            .field("is_propagating", &self.is_propagating())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CallbackContext: one per invocation
// =============================================================================

/// What a callback receives besides the update.
///
/// ```rust,ignore
/// async fn remember_name(update: BoxedUpdate, ctx: CallbackContext) -> Result<Transition, BoxError> {
///     let name = update.text().ok_or("expected text")?;
///     ctx.user_data().ok_or("no user")?.insert("name", name.into());
///     ctx.stop_propagation();
///     Ok(Transition::to("ASK_AGE"))
/// }
/// ```
#[derive(Clone)]
pub struct CallbackContext {
    scope: Arc<UpdateScope>,
    shared: Arc<DispatcherShared>,
    args: Vec<String>,
    matches: Vec<RegexMatch>,
    error: Option<(SharedError, ErrorSource)>,
}

impl CallbackContext {
    pub(crate) fn new(
        scope: Arc<UpdateScope>,
        shared: Arc<DispatcherShared>,
        matched: &MatchResult,
    ) -> Self {
        Self {
            scope,
            shared,
            args: matched.args.clone(),
            matches: matched.matches.clone(),
            error: None,
        }
    }

    pub(crate) fn for_error(
        scope: Arc<UpdateScope>,
        shared: Arc<DispatcherShared>,
        error: SharedError,
        source: ErrorSource,
    ) -> Self {
        Self {
            scope,
            shared,
            args: Vec::new(),
            matches: Vec::new(),
            error: Some((error, source)),
        }
    }

    /// The same scope with another handler's match, for nested handlers.
    pub(crate) fn with_match(&self, matched: &MatchResult) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            shared: Arc::clone(&self.shared),
            args: matched.args.clone(),
            matches: matched.matches.clone(),
            error: None,
        }
    }

    // ─── Update scope ─────────────────────────────────────────────────────────

    /// The update being processed. `None` only for errors raised by jobs.
    pub fn update(&self) -> Option<&BoxedUpdate> {
        self.scope.update()
    }

    /// Data of the user who sent the update, if it has one.
    pub fn user_data(&self) -> Option<&SharedData> {
        self.scope.user_data.as_ref()
    }

    /// Data of the chat the update came from, if it has one.
    pub fn chat_data(&self) -> Option<&SharedData> {
        self.scope.chat_data.as_ref()
    }

    /// Skips every handler group after the current one.
    pub fn stop_propagation(&self) {
        self.scope.stop_propagation();
    }

    /// Returns `true` until some callback stops propagation.
    pub fn is_propagating(&self) -> bool {
        self.scope.is_propagating()
    }

    // ─── Match data ───────────────────────────────────────────────────────────

    /// Command arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Regex matches collected by the handler's filters.
    pub fn matches(&self) -> &[RegexMatch] {
        &self.matches
    }

    /// The error being reported. Only set for error handlers.
    pub fn error(&self) -> Option<&SharedError> {
        self.error.as_ref().map(|(error, _)| error)
    }

    /// Where the reported error came from.
    pub fn error_source(&self) -> Option<&ErrorSource> {
        self.error.as_ref().map(|(_, source)| source)
    }

    // ─── Dispatcher services ──────────────────────────────────────────────────

    /// Process-global data.
    pub fn bot_data(&self) -> &SharedData {
        self.shared.bot_data()
    }

    /// The dispatcher's job queue.
    pub fn job_queue(&self) -> &JobQueue {
        self.shared.job_queue()
    }

    pub(crate) fn downgrade_shared(&self) -> Weak<DispatcherShared> {
        Arc::downgrade(&self.shared)
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("scope", &self.scope)
            .field("args", &self.args)
            .field("matches", &self.matches)
            .field("error", &self.error().map(ToString::to_string))
            .field("error_source", &self.error_source())
            .finish_non_exhaustive()
    }
}
