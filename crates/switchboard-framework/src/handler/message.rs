use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;

use switchboard_core::{BoxedUpdate, UpdateKind};

use crate::context::CallbackContext;
use crate::filters::Filter;
use crate::handler::{Callback, Handler, HandlerResult, IntoTransition, MatchResult, callback};

/// Handles messages that pass a [`Filter`].
///
/// New messages, edits and channel posts are all eligible by default; edits
/// and channel posts can be excluded.
///
/// ```rust,ignore
/// let echo = MessageHandler::new(filters::text() & !filters::command(), |update, _ctx| async move {
///     tracing::info!(text = update.text(), "echo");
/// });
/// ```
#[derive(Clone)]
pub struct MessageHandler {
    filter: Filter,
    callback: Callback,
    edited_messages: bool,
    channel_posts: bool,
    run_async: bool,
    name: String,
}

impl MessageHandler {
    /// Handles messages passing `filter`.
    pub fn new<F, Fut, R>(filter: Filter, f: F) -> Self
    where
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        let name = format!("MessageHandler({})", filter.name());
        Self {
            filter,
            callback: callback(f),
            edited_messages: true,
            channel_posts: true,
            run_async: false,
            name,
        }
    }

    /// Whether edited messages are eligible.
    pub fn edited_messages(mut self, allow: bool) -> Self {
        self.edited_messages = allow;
        self
    }

    /// Whether channel posts are eligible.
    pub fn channel_posts(mut self, allow: bool) -> Self {
        self.channel_posts = allow;
        self
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

    fn accepts_kind(&self, kind: UpdateKind) -> bool {
        match kind {
            UpdateKind::Message => true,
            UpdateKind::EditedMessage => self.edited_messages,
            UpdateKind::ChannelPost => self.channel_posts,
            UpdateKind::CallbackQuery | UpdateKind::Other => false,
        }
    }
}

impl Handler for MessageHandler {
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        if !self.accepts_kind(update.kind()) {
            return None;
        }
        let matches = self.filter.check(update.as_ref())?;
        Some(MatchResult::new().with_matches(matches))
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

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("filter", &self.filter)
            .field("edited_messages", &self.edited_messages)
            .field("channel_posts", &self.channel_posts)
            .field("run_async", &self.run_async)
            .finish_non_exhaustive()
    }
}
