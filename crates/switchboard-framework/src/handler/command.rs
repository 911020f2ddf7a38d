use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;

use switchboard_core::{BoxedUpdate, UpdateKind};

use crate::context::CallbackContext;
use crate::error::{DispatchError, DispatchResult};
use crate::filters::Filter;
use crate::handler::{Callback, Handler, HandlerResult, IntoTransition, MatchResult, callback};

/// Handles `/command` messages.
///
/// The text is split on whitespace: the first token selects the command, the
/// rest become [`CallbackContext::args`]. A `/command@botname` suffix is
/// accepted when it names this bot, or always when no bot username is set.
///
/// ```rust,ignore
/// let age = CommandHandler::new("age", |_update, ctx| async move {
///     let years: u32 = ctx.args().first().ok_or("usage: /age <years>")?.parse()?;
///     Ok::<_, BoxError>(())
/// })?;
/// ```
#[derive(Clone)]
pub struct CommandHandler {
    commands: Vec<String>,
    bot_username: Option<String>,
    filter: Option<Filter>,
    callback: Callback,
    edited_messages: bool,
    run_async: bool,
    name: String,
}

impl CommandHandler {
    /// Handles `/command`.
    ///
    /// Command names are 1–32 characters of `a-z`, digits and `_`,
    /// compared case-insensitively.
    pub fn new<F, Fut, R>(command: impl Into<String>, f: F) -> DispatchResult<Self>
    where
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        Self::with_commands([command.into()], f)
    }

    /// Handles any of several commands.
    pub fn with_commands<I, S, F, Fut, R>(commands: I, f: F) -> DispatchResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(BoxedUpdate, CallbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoTransition + 'static,
    {
        let commands = commands
            .into_iter()
            .map(|command| {
                let command = command.into().to_lowercase();
                if is_valid_command(&command) {
                    Ok(command)
                } else {
                    Err(DispatchError::invalid_config(format!(
                        "'{command}' is not a valid bot command"
                    )))
                }
            })
            .collect::<DispatchResult<Vec<_>>>()?;
        if commands.is_empty() {
            return Err(DispatchError::invalid_config("CommandHandler needs at least one command"));
        }

        let name = format!("CommandHandler(/{})", commands.join(", /"));
        Ok(Self {
            commands,
            bot_username: None,
            filter: None,
            callback: callback(f),
            edited_messages: true,
            run_async: false,
            name,
        })
    }

    /// Only accept `@suffixes` naming this bot.
    pub fn bot_username(mut self, username: impl Into<String>) -> Self {
        self.bot_username = Some(username.into());
        self
    }

    /// Additionally require `filter` to pass.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether edited messages are eligible.
    pub fn edited_messages(mut self, allow: bool) -> Self {
        self.edited_messages = allow;
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

    fn parse<'a>(&self, text: &'a str) -> Option<Vec<&'a str>> {
        let mut tokens = text.split_whitespace();
        let head = tokens.next()?.strip_prefix('/')?;
        let (command, target) = match head.split_once('@') {
            Some((command, target)) => (command, Some(target)),
            None => (head, None),
        };

        if !self.commands.iter().any(|c| c.eq_ignore_ascii_case(command)) {
            return None;
        }
        if let (Some(target), Some(username)) = (target, &self.bot_username) {
            if !target.eq_ignore_ascii_case(username) {
                return None;
            }
        }
        Some(tokens.collect())
    }
}

fn is_valid_command(command: &str) -> bool {
    (1..=32).contains(&command.len())
        && command
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Handler for CommandHandler {
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        match update.kind() {
            UpdateKind::Message => {}
            UpdateKind::EditedMessage if self.edited_messages => {}
            _ => return None,
        }
        let args = self.parse(update.text()?)?;
        let matches = match &self.filter {
            Some(filter) => filter.check(update.as_ref())?,
            None => Vec::new(),
        };
        Some(
            MatchResult::new()
                .with_args(args.into_iter().map(str::to_string).collect())
                .with_matches(matches),
        )
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

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler")
            .field("commands", &self.commands)
            .field("bot_username", &self.bot_username)
            .field("filter", &self.filter)
            .field("run_async", &self.run_async)
            .finish_non_exhaustive()
    }
}
