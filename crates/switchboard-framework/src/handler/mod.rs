//! Handler system for the Switchboard framework.
//!
//! A [`Handler`] is a pure match predicate ([`check`](Handler::check)) plus a
//! callback ([`handle`](Handler::handle)). Variants differ only in their
//! predicate:
//!
//! - [`UpdateHandler`]: any predicate over the raw update
//! - [`MessageHandler`]: messages passing a [`Filter`](crate::filters::Filter)
//! - [`CommandHandler`]: `/command` messages, with arguments split out
//! - [`CallbackQueryHandler`]: inline keyboard presses, optionally by pattern
//! - [`ConversationHandler`](crate::conversation::ConversationHandler): a
//!   state machine over other handlers
//!
//! Callbacks are plain async closures. Whatever they return is turned into a
//! [`Transition`] through [`IntoTransition`]; outside a conversation the
//! transition is ignored.
//!
//! ```rust,ignore
//! use switchboard_framework::{CommandHandler, Transition};
//!
//! let start = CommandHandler::new("start", |_update, ctx| async move {
//!     ctx.user_data().map(|data| data.insert("started", true.into()));
//!     Transition::to("ASK_NAME")
//! })?;
//! ```

mod callback_query;
mod command;
mod message;
mod update;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use switchboard_core::{BoxedUpdate, Persistence, State};

use crate::context::CallbackContext;
use crate::error::{BoxError, DispatchError};
use crate::filters::RegexMatch;

pub use callback_query::CallbackQueryHandler;
pub use command::CommandHandler;
pub use message::MessageHandler;
pub use update::UpdateHandler;

// ============================================================================
// Transition - what a callback asks a conversation to do next
// ============================================================================

/// The outcome of a callback, as seen by a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Transition {
    /// Stay in the current state.
    #[default]
    Keep,
    /// Move to another state.
    To(State),
    /// End the conversation.
    End,
}

impl Transition {
    /// Shorthand for `Transition::To(state.into())`.
    pub fn to(state: impl Into<State>) -> Self {
        Self::To(state.into())
    }
}

impl From<State> for Transition {
    fn from(state: State) -> Self {
        Self::To(state)
    }
}

impl From<&str> for Transition {
    fn from(state: &str) -> Self {
        Self::To(State::from(state))
    }
}

/// The result of running a callback.
pub type HandlerResult = Result<Transition, BoxError>;

/// Values a callback may return.
pub trait IntoTransition {
    /// Converts the value into a handler result.
    fn into_transition(self) -> HandlerResult;
}

/// Nothing returned: keep the state.
impl IntoTransition for () {
    fn into_transition(self) -> HandlerResult {
        Ok(Transition::Keep)
    }
}

impl IntoTransition for Transition {
    fn into_transition(self) -> HandlerResult {
        Ok(self)
    }
}

impl IntoTransition for State {
    fn into_transition(self) -> HandlerResult {
        Ok(Transition::To(self))
    }
}

impl IntoTransition for &'static str {
    fn into_transition(self) -> HandlerResult {
        Ok(Transition::To(State::from(self)))
    }
}

/// `None` keeps the state.
impl<T: IntoTransition> IntoTransition for Option<T> {
    fn into_transition(self) -> HandlerResult {
        match self {
            Some(t) => t.into_transition(),
            None => Ok(Transition::Keep),
        }
    }
}

/// `Err` is routed to the error handlers; the state doesn't change.
impl<T: IntoTransition, E: Into<BoxError>> IntoTransition for Result<T, E> {
    fn into_transition(self) -> HandlerResult {
        match self {
            Ok(t) => t.into_transition(),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Callback - type-erased user function
// ============================================================================

/// A type-erased handler callback.
pub type Callback =
    Arc<dyn Fn(BoxedUpdate, CallbackContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Boxes an async function into a [`Callback`].
///
/// Accepts any `Fn(BoxedUpdate, CallbackContext) -> impl Future` whose output
/// implements [`IntoTransition`].
pub fn callback<F, Fut, R>(f: F) -> Callback
where
    F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoTransition + 'static,
{
    Arc::new(
        move |update: BoxedUpdate, ctx: CallbackContext| -> BoxFuture<'static, HandlerResult> {
            let fut = f(update, ctx);
            Box::pin(async move { fut.await.into_transition() })
        },
    )
}

// ============================================================================
// MatchResult
// ============================================================================

/// What a successful [`Handler::check`] found.
///
/// `args` and `matches` are exposed to the callback through its context.
/// `payload` carries handler-private data from `check` to `handle`.
#[derive(Clone, Default)]
pub struct MatchResult {
    /// Command arguments.
    pub args: Vec<String>,
    /// Regex matches.
    pub matches: Vec<RegexMatch>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl MatchResult {
    /// An empty match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the command arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the regex matches.
    pub fn with_matches(mut self, matches: Vec<RegexMatch>) -> Self {
        self.matches = matches;
        self
    }

    /// Attaches handler-private data.
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Returns the payload if it is a `T`.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().and_then(|p| p.downcast::<T>().ok())
    }
}

impl fmt::Debug for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchResult")
            .field("args", &self.args)
            .field("matches", &self.matches)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

// ============================================================================
// Handler Trait
// ============================================================================

/// A unit of update handling.
///
/// The dispatcher calls [`check`](Self::check) on every candidate and
/// [`handle`](Self::handle) on the first one that matches in each group.
///
/// `handle` is a plain function returning a future: the part before the
/// returned future runs synchronously, in dispatch order, even when the future
/// itself is executed later on a worker.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Tests the update. Must be free of side effects.
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult>;

    /// Runs the callback for a matched update.
    fn handle(
        &self,
        update: BoxedUpdate,
        matched: MatchResult,
        ctx: CallbackContext,
    ) -> BoxFuture<'static, HandlerResult>;

    /// Whether the dispatcher should run this invocation on a worker.
    fn runs_async(&self, matched: &MatchResult) -> bool {
        let _ = matched;
        false
    }

    /// A name for logs and error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Loads persisted state before the dispatcher starts.
    async fn restore(&self, persistence: Option<&Arc<dyn Persistence>>) -> Result<(), DispatchError> {
        let _ = persistence;
        Ok(())
    }

    /// Writes back state whose earlier persistence failed.
    ///
    /// Called by [`Dispatcher::flush`](crate::Dispatcher::flush).
    async fn flush(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// A shared, type-erased handler.
pub type BoxedHandler = Arc<dyn Handler>;

/// Boxes a handler.
pub fn into_handler(handler: impl Handler) -> BoxedHandler {
    Arc::new(handler)
}
