use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use regex::Regex;

use switchboard_core::{BoxedUpdate, UpdateKind};

use crate::context::CallbackContext;
use crate::error::DispatchResult;
use crate::filters::RegexMatch;
use crate::handler::{Callback, Handler, HandlerResult, IntoTransition, MatchResult, callback};

/// Handles inline keyboard presses.
///
/// With a [`pattern`](Self::pattern), only queries whose data matches it from
/// the first character are accepted and the captures are exposed through
/// [`CallbackContext::matches`].
#[derive(Clone)]
pub struct CallbackQueryHandler {
    pattern: Option<Regex>,
    callback: Callback,
    run_async: bool,
    name: String,
}

impl CallbackQueryHandler {
    /// Handles every callback query.
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        Self {
            pattern: None,
            callback: callback(f),
            run_async: false,
            name: "CallbackQueryHandler".to_string(),
        }
    }

    /// Only handles queries whose data matches `pattern` at its start.
    pub fn pattern(mut self, pattern: &str) -> DispatchResult<Self> {
        self.pattern = Some(Regex::new(pattern)?);
        self.name = format!("CallbackQueryHandler({pattern:?})");
        Ok(self)
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

impl Handler for CallbackQueryHandler {
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        if update.kind() != UpdateKind::CallbackQuery {
            return None;
        }
        let Some(pattern) = &self.pattern else {
            return Some(MatchResult::new());
        };
        let captures = pattern.captures(update.callback_data()?)?;
        // Leftmost match; anchored only if it starts at 0.
        if captures.get(0)?.start() != 0 {
            return None;
        }
        Some(MatchResult::new().with_matches(vec![RegexMatch::from_captures(pattern, &captures)]))
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

impl fmt::Debug for CallbackQueryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueryHandler")
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("run_async", &self.run_async)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::BasicUpdate;

    fn query(data: &str) -> BoxedUpdate {
        BasicUpdate::callback_query(1, 10, 20, 5, data).into_boxed()
    }

    #[test]
    fn test_pattern_anchored_at_start() {
        let h = CallbackQueryHandler::new(|_, _| async {})
            .pattern(r"pick:(\d+)")
            .unwrap();
        let matched = h.check(&query("pick:3")).unwrap();
        assert_eq!(matched.matches[0].group(1), Some("3"));
        assert!(h.check(&query("xpick:3")).is_none());
    }

    #[test]
    fn test_only_callback_queries() {
        let h = CallbackQueryHandler::new(|_, _| async {});
        assert!(h.check(&query("anything")).is_some());
        assert!(h.check(&BasicUpdate::message(1, 10, 20, "pick:3").into_boxed()).is_none());
    }
}
