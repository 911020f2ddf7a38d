//! Conversation state machines.
//!
//! A [`ConversationHandler`] is a [`Handler`] that routes each update to one
//! of its child handlers depending on where the update's conversation stands:
//!
//! 1. The update is keyed by chat, user and/or message ([`ConversationKey`]).
//! 2. A key without state only accepts entry points. A match creates state.
//! 3. A key with state tries the handlers registered for its state, then the
//!    fallbacks.
//! 4. What the child callback returns becomes the next state: a label, `End`
//!    (the entry is deleted) or `Keep`.
//!
//! Updates for one key are processed strictly one after another through a
//! [`KeyedSequencer`]; a turn is taken synchronously inside
//! [`Handler::handle`], so the order is the dispatch order even when the
//! callback runs on a worker. Timeouts enter the same sequence, which makes a
//! real transition and an expiring timeout for one key mutually exclusive.
//!
//! Persistent conversations write every committed transition through
//! [`Persistence::update_conversation`] before the in-memory map changes. A
//! callback that fails commits nothing. A failed write still updates memory;
//! the key is written again on the next [`Handler::flush`] until it succeeds.
//!
//! ```rust,ignore
//! let conversation = ConversationHandler::builder()
//!     .name("signup")
//!     .persistent(true)
//!     .entry_point(CommandHandler::new("start", ask_name)?)
//!     .state("NAME", [into_handler(MessageHandler::new(filters::text(), ask_age))])
//!     .state("AGE", [into_handler(MessageHandler::new(filters::regex(r"^\d+$")?, done))])
//!     .fallback(CommandHandler::new("cancel", cancel)?)
//!     .conversation_timeout(Duration::from_secs(300))
//!     .build()?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use switchboard_core::{
    BoxedUpdate, ConversationKey, ConversationMap, KeyPart, Persistence, SharedData, State, Update,
    UpdateKind,
};

use crate::context::{CallbackContext, UpdateScope};
use crate::dispatcher::DispatcherShared;
use crate::error::{BoxError, DispatchError, DispatchResult, ErrorSource};
use crate::handler::{BoxedHandler, Handler, HandlerResult, MatchResult, Transition, into_handler};
use crate::job::JobHandle;
use crate::sequencer::KeyedSequencer;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ConversationHandler`].
pub struct ConversationHandlerBuilder {
    entry_points: Vec<BoxedHandler>,
    states: HashMap<State, Vec<BoxedHandler>>,
    fallbacks: Vec<BoxedHandler>,
    timeout_handlers: Vec<BoxedHandler>,
    waiting_handlers: Vec<BoxedHandler>,
    allow_reentry: bool,
    per_chat: bool,
    per_user: bool,
    per_message: bool,
    conversation_timeout: Option<Duration>,
    name: Option<String>,
    persistent: bool,
    map_to_parent: HashMap<Transition, Transition>,
    run_async: bool,
}

impl Default for ConversationHandlerBuilder {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            states: HashMap::new(),
            fallbacks: Vec::new(),
            timeout_handlers: Vec::new(),
            waiting_handlers: Vec::new(),
            allow_reentry: false,
            per_chat: true,
            per_user: true,
            per_message: false,
            conversation_timeout: None,
            name: None,
            persistent: false,
            map_to_parent: HashMap::new(),
            run_async: false,
        }
    }
}

impl ConversationHandlerBuilder {
    /// Adds a handler that can start the conversation.
    pub fn entry_point(mut self, handler: impl Handler) -> Self {
        self.entry_points.push(into_handler(handler));
        self
    }

    /// Adds handlers for the `label` state. Calling it again appends.
    pub fn state(
        mut self,
        label: impl Into<State>,
        handlers: impl IntoIterator<Item = BoxedHandler>,
    ) -> Self {
        self.states.entry(label.into()).or_default().extend(handlers);
        self
    }

    /// Adds a handler tried when no handler of the current state matches.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallbacks.push(into_handler(handler));
        self
    }

    /// Adds a handler run when the conversation times out.
    ///
    /// Every timeout handler that matches the last update runs.
    pub fn timeout_handler(mut self, handler: impl Handler) -> Self {
        self.timeout_handlers.push(into_handler(handler));
        self
    }

    /// Adds a handler for updates arriving while a transition is still running.
    pub fn waiting_handler(mut self, handler: impl Handler) -> Self {
        self.waiting_handlers.push(into_handler(handler));
        self
    }

    /// Lets entry points restart a conversation in progress.
    pub fn allow_reentry(mut self, allow: bool) -> Self {
        self.allow_reentry = allow;
        self
    }

    /// Keys conversations by chat. Default `true`.
    pub fn per_chat(mut self, per_chat: bool) -> Self {
        self.per_chat = per_chat;
        self
    }

    /// Keys conversations by user. Default `true`.
    pub fn per_user(mut self, per_user: bool) -> Self {
        self.per_user = per_user;
        self
    }

    /// Keys conversations by message. Only callback queries are accepted.
    pub fn per_message(mut self, per_message: bool) -> Self {
        self.per_message = per_message;
        self
    }

    /// Ends conversations idle for `timeout`.
    pub fn conversation_timeout(mut self, timeout: Duration) -> Self {
        self.conversation_timeout = Some(timeout);
        self
    }

    /// Names the conversation. Required for persistence.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Writes every transition through the dispatcher's persistence.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// For a nested conversation: when a child callback returns `outcome`,
    /// end this conversation and hand `parent` to the enclosing one.
    pub fn map_to_parent(mut self, outcome: impl Into<Transition>, parent: impl Into<Transition>) -> Self {
        self.map_to_parent.insert(outcome.into(), parent.into());
        self
    }

    /// Runs every invocation on a worker.
    pub fn run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }

    /// Validates the configuration.
    pub fn build(self) -> DispatchResult<ConversationHandler> {
        if !(self.per_chat || self.per_user || self.per_message) {
            return Err(DispatchError::invalid_config(
                "a conversation must be keyed per chat, per user or per message",
            ));
        }
        if self.entry_points.is_empty() {
            return Err(DispatchError::invalid_config("a conversation needs at least one entry point"));
        }
        if self.persistent && self.name.is_none() {
            return Err(DispatchError::invalid_config("persistent conversations need a name"));
        }
        if self.conversation_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(DispatchError::invalid_config("conversation timeout must be positive"));
        }
        if self.map_to_parent.contains_key(&Transition::Keep) {
            return Err(DispatchError::invalid_config("`Keep` cannot be mapped to the parent"));
        }

        let display_name = self.name.unwrap_or_else(|| "ConversationHandler".to_string());
        Ok(ConversationHandler {
            inner: Arc::new(Inner {
                display_name,
                entry_points: self.entry_points,
                states: self.states,
                fallbacks: self.fallbacks,
                timeout_handlers: self.timeout_handlers,
                waiting_handlers: self.waiting_handlers,
                allow_reentry: self.allow_reentry,
                per_chat: self.per_chat,
                per_user: self.per_user,
                per_message: self.per_message,
                conversation_timeout: self.conversation_timeout,
                persistent: self.persistent,
                map_to_parent: self.map_to_parent,
                run_async: self.run_async,
                conversations: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                timeouts: Mutex::new(HashMap::new()),
                unsynced: Mutex::new(HashSet::new()),
                generations: AtomicU64::new(0),
                sequencer: KeyedSequencer::new(),
                persistence: RwLock::new(None),
            }),
        })
    }
}

// ============================================================================
// ConversationHandler
// ============================================================================

/// A handler that is a finite-state machine per [`ConversationKey`].
///
/// Cheap to clone; clones share their conversations.
#[derive(Clone)]
pub struct ConversationHandler {
    inner: Arc<Inner>,
}

impl ConversationHandler {
    /// Starts building a conversation.
    pub fn builder() -> ConversationHandlerBuilder {
        ConversationHandlerBuilder::default()
    }

    /// A snapshot of every live conversation.
    pub fn conversations(&self) -> ConversationMap {
        self.inner.conversations.lock().clone()
    }

    /// The state of one conversation.
    pub fn state_of(&self, key: &ConversationKey) -> Option<State> {
        self.inner.conversations.lock().get(key).cloned()
    }

    /// The key `update` belongs to, if this conversation accepts it.
    pub fn key_for(&self, update: &dyn Update) -> Option<ConversationKey> {
        self.inner.key_for(update)
    }

    /// Whether transitions are written through persistence.
    pub fn is_persistent(&self) -> bool {
        self.inner.persistent
    }

    /// The idle timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.conversation_timeout
    }
}

#[async_trait]
impl Handler for ConversationHandler {
    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        self.inner.check(update)
    }

    fn handle(
        &self,
        update: BoxedUpdate,
        matched: MatchResult,
        ctx: CallbackContext,
    ) -> BoxFuture<'static, HandlerResult> {
        Inner::handle(&self.inner, update, matched, ctx)
    }

    fn runs_async(&self, matched: &MatchResult) -> bool {
        self.inner.run_async
            || matched
                .payload::<Selection>()
                .is_some_and(|selection| selection.handler.runs_async(&selection.matched))
    }

    fn name(&self) -> &str {
        &self.inner.display_name
    }

    async fn restore(&self, persistence: Option<&Arc<dyn Persistence>>) -> Result<(), DispatchError> {
        self.inner.restore(persistence).await
    }

    async fn flush(&self) -> Result<(), DispatchError> {
        self.inner.flush().await
    }
}

impl fmt::Debug for ConversationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("ConversationHandler")
            .field("name", &inner.display_name)
            .field("states", &inner.states.keys().collect::<Vec<_>>())
            .field("per_chat", &inner.per_chat)
            .field("per_user", &inner.per_user)
            .field("per_message", &inner.per_message)
            .field("persistent", &inner.persistent)
            .field("conversation_timeout", &inner.conversation_timeout)
            .field("live", &inner.conversations.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Selection: what `check` hands to `handle`
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Entry,
    State,
    Fallback,
    Waiting,
}

struct Selection {
    key: ConversationKey,
    origin: Origin,
    handler: BoxedHandler,
    matched: MatchResult,
    // The state `check` saw; `handle` re-selects if it moved since.
    observed: Option<State>,
}

fn first_match(handlers: &[BoxedHandler], update: &BoxedUpdate) -> Option<(BoxedHandler, MatchResult)> {
    handlers.iter().find_map(|handler| {
        let matched = handler.check(update)?;
        Some((Arc::clone(handler), matched))
    })
}

// ============================================================================
// Inner
// ============================================================================

struct ArmedTimeout {
    generation: u64,
    job: JobHandle,
}

struct Inner {
    display_name: String,
    entry_points: Vec<BoxedHandler>,
    states: HashMap<State, Vec<BoxedHandler>>,
    fallbacks: Vec<BoxedHandler>,
    timeout_handlers: Vec<BoxedHandler>,
    waiting_handlers: Vec<BoxedHandler>,
    allow_reentry: bool,
    per_chat: bool,
    per_user: bool,
    per_message: bool,
    conversation_timeout: Option<Duration>,
    persistent: bool,
    map_to_parent: HashMap<Transition, Transition>,
    run_async: bool,

    conversations: Mutex<ConversationMap>,
    // Keys with a transition queued or running, with how many.
    in_flight: Mutex<HashMap<ConversationKey, usize>>,
    timeouts: Mutex<HashMap<ConversationKey, ArmedTimeout>>,
    // Keys whose last write-through failed.
    unsynced: Mutex<HashSet<ConversationKey>>,
    generations: AtomicU64,
    sequencer: KeyedSequencer<ConversationKey>,
    persistence: RwLock<Option<Arc<dyn Persistence>>>,
}

impl Inner {
    fn key_for(&self, update: &dyn Update) -> Option<ConversationKey> {
        if self.per_message && update.kind() != UpdateKind::CallbackQuery {
            return None;
        }

        let mut parts = Vec::with_capacity(3);
        if self.per_chat {
            parts.push(KeyPart::Id(update.chat_id()?));
        }
        if self.per_user {
            if let Some(user_id) = update.user_id() {
                parts.push(KeyPart::Id(user_id));
            }
        }
        if self.per_message {
            let message = match update.inline_message_id() {
                Some(inline) => KeyPart::Text(inline.to_string()),
                None => KeyPart::Id(update.message_id()?),
            };
            parts.push(message);
        }

        (!parts.is_empty()).then(|| ConversationKey::new(parts))
    }

    fn check(&self, update: &BoxedUpdate) -> Option<MatchResult> {
        if update.kind() == UpdateKind::ChannelPost {
            return None;
        }
        let key = self.key_for(update.as_ref())?;

        if self.in_flight.lock().contains_key(&key) {
            let (handler, matched) = first_match(&self.waiting_handlers, update)?;
            trace!(conversation = %self.display_name, %key, "Transition in flight, waiting handler matched");
            return Some(selection_match(key, Origin::Waiting, handler, matched, None));
        }

        let state = self.conversations.lock().get(&key).cloned();
        let (origin, handler, matched) = self.select(update, state.as_ref())?;
        Some(selection_match(key, origin, handler, matched, state))
    }

    fn select(
        &self,
        update: &BoxedUpdate,
        state: Option<&State>,
    ) -> Option<(Origin, BoxedHandler, MatchResult)> {
        if state.is_none() || self.allow_reentry {
            if let Some((handler, matched)) = first_match(&self.entry_points, update) {
                return Some((Origin::Entry, handler, matched));
            }
        }
        let state = state?;

        if let Some((handler, matched)) = self
            .states
            .get(state)
            .and_then(|handlers| first_match(handlers, update))
        {
            return Some((Origin::State, handler, matched));
        }
        first_match(&self.fallbacks, update).map(|(handler, matched)| (Origin::Fallback, handler, matched))
    }

    fn handle(
        self: &Arc<Self>,
        update: BoxedUpdate,
        matched: MatchResult,
        ctx: CallbackContext,
    ) -> BoxFuture<'static, HandlerResult> {
        let Some(selection) = matched.payload::<Selection>() else {
            return Box::pin(async { Ok(Transition::Keep) });
        };

        // Waiting handlers run outside the sequence and never transition.
        if selection.origin == Origin::Waiting {
            let inner_ctx = ctx.with_match(&selection.matched);
            let fut = selection.handler.handle(update, selection.matched.clone(), inner_ctx);
            return Box::pin(async move { fut.await.map(|_| Transition::Keep) });
        }

        let mut turn = self.sequencer.enter(selection.key.clone());
        let in_flight = InFlight::mark(self, &selection.key);
        let inner = Arc::clone(self);

        Box::pin(async move {
            turn.ready().await;
            let result = inner.run(&selection, update, ctx).await;
            drop(in_flight);
            result
        })
    }

    async fn run(self: &Arc<Self>, selection: &Selection, update: BoxedUpdate, ctx: CallbackContext) -> HandlerResult {
        let key = &selection.key;
        let current = self.conversations.lock().get(key).cloned();

        let (origin, handler, matched) = if current == selection.observed {
            (selection.origin, Arc::clone(&selection.handler), selection.matched.clone())
        } else {
            match self.select(&update, current.as_ref()) {
                Some(reselected) => reselected,
                None => {
                    debug!(conversation = %self.display_name, %key, "State moved while queued, update dropped");
                    return Ok(Transition::Keep);
                }
            }
        };
        debug!(
            conversation = %self.display_name,
            %key,
            state = current.as_ref().map(State::as_str),
            ?origin,
            handler = handler.name(),
            "Conversation handler selected"
        );

        let transition = handler
            .handle(Arc::clone(&update), matched.clone(), ctx.with_match(&matched))
            .await?;

        let mapped = match &transition {
            Transition::Keep => None,
            outcome => self.map_to_parent.get(outcome).cloned(),
        };
        if let Some(mapped) = mapped {
            self.commit(key, current.as_ref(), None, &update, &ctx).await?;
            return Ok(mapped);
        }

        let next = match transition {
            Transition::Keep => current.clone(),
            Transition::To(state) => Some(state),
            Transition::End => None,
        };
        self.commit(key, current.as_ref(), next, &update, &ctx).await?;
        Ok(Transition::Keep)
    }

    /// Applies a transition and re-arms or disarms the timeout.
    async fn commit(
        self: &Arc<Self>,
        key: &ConversationKey,
        current: Option<&State>,
        next: Option<State>,
        update: &BoxedUpdate,
        ctx: &CallbackContext,
    ) -> DispatchResult<()> {
        let unchanged = current == next.as_ref() && !self.unsynced.lock().contains(key);
        let written = if unchanged {
            Ok(())
        } else {
            self.write_state(key, next.as_ref()).await
        };
        match next {
            Some(_) => self.arm_timeout(key, update, ctx),
            None => self.disarm_timeout(key),
        }
        written
    }

    /// Persistence first, then memory. Memory is updated even if persistence
    /// fails; the failure is returned and the key is marked for [`Self::flush`].
    async fn write_state(&self, key: &ConversationKey, state: Option<&State>) -> DispatchResult<()> {
        let mut result = Ok(());
        let persistence = self.persistence.read().clone();
        if let Some(persistence) = persistence.filter(|_| self.persistent) {
            match persistence.update_conversation(&self.display_name, key, state).await {
                Ok(()) => {
                    self.unsynced.lock().remove(key);
                }
                Err(e) => {
                    warn!(conversation = %self.display_name, %key, error = %e, "Failed to persist conversation state");
                    self.unsynced.lock().insert(key.clone());
                    result = Err(e.into());
                }
            }
        }

        {
            let mut conversations = self.conversations.lock();
            match state {
                Some(state) => {
                    conversations.insert(key.clone(), state.clone());
                }
                None => {
                    conversations.remove(key);
                }
            }
        }
        debug!(
            conversation = %self.display_name,
            %key,
            state = state.map(State::as_str),
            "Conversation state committed"
        );
        result
    }

    fn arm_timeout(self: &Arc<Self>, key: &ConversationKey, update: &BoxedUpdate, ctx: &CallbackContext) {
        let Some(timeout) = self.conversation_timeout else {
            return;
        };
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let expiry = Expiry {
            conversation: Arc::downgrade(self),
            shared: ctx.downgrade_shared(),
            key: key.clone(),
            generation,
            update: Arc::clone(update),
            user_data: ctx.user_data().cloned(),
            chat_data: ctx.chat_data().cloned(),
        };

        let job = ctx.job_queue().run_once(
            format!("{}:timeout:{}", self.display_name, key),
            timeout,
            move |_job| {
                let expiry = expiry.clone();
                async move {
                    expiry.fire().await;
                    Ok::<_, BoxError>(())
                }
            },
        );

        let previous = self
            .timeouts
            .lock()
            .insert(key.clone(), ArmedTimeout { generation, job });
        if let Some(previous) = previous {
            previous.job.cancel();
        }
        trace!(conversation = %self.display_name, %key, ?timeout, "Conversation timeout armed");
    }

    fn disarm_timeout(&self, key: &ConversationKey) {
        let previous = self.timeouts.lock().remove(key);
        if let Some(previous) = previous {
            previous.job.cancel();
            trace!(conversation = %self.display_name, %key, "Conversation timeout disarmed");
        }
    }

    fn children(&self) -> Vec<BoxedHandler> {
        self.entry_points
            .iter()
            .chain(self.states.values().flatten())
            .chain(&self.fallbacks)
            .chain(&self.timeout_handlers)
            .chain(&self.waiting_handlers)
            .cloned()
            .collect()
    }

    /// Writes the in-memory state of every key whose write-through failed.
    ///
    /// Keys with a transition queued or running are left to that transition.
    /// Every key is attempted; the first error is returned.
    async fn flush(&self) -> DispatchResult<()> {
        let mut result = Ok(());
        for child in self.children() {
            if let Err(e) = child.flush().await {
                result = result.and(Err(e));
            }
        }

        let keys: Vec<ConversationKey> = self.unsynced.lock().iter().cloned().collect();
        let persistence = self.persistence.read().clone();
        let Some(persistence) = persistence else {
            return result;
        };
        for key in keys {
            if self.in_flight.lock().contains_key(&key) {
                continue;
            }
            let mut turn = self.sequencer.enter(key.clone());
            turn.ready().await;

            let state = self.conversations.lock().get(&key).cloned();
            match persistence.update_conversation(&self.display_name, &key, state.as_ref()).await {
                Ok(()) => {
                    self.unsynced.lock().remove(&key);
                    debug!(conversation = %self.display_name, %key, "Conversation state written back");
                }
                Err(e) => {
                    warn!(conversation = %self.display_name, %key, error = %e, "Conversation state still not persisted");
                    result = result.and(Err(e.into()));
                }
            }
        }
        result
    }

    async fn restore(&self, persistence: Option<&Arc<dyn Persistence>>) -> DispatchResult<()> {
        for child in self.children() {
            child.restore(persistence).await?;
        }

        if !self.persistent {
            return Ok(());
        }
        let Some(persistence) = persistence else {
            return Err(DispatchError::PersistenceRequired {
                name: self.display_name.clone(),
            });
        };

        let conversations = persistence.load_conversations(&self.display_name).await?;
        info!(
            conversation = %self.display_name,
            count = conversations.len(),
            "Conversations restored"
        );
        *self.conversations.lock() = conversations;
        *self.persistence.write() = Some(Arc::clone(persistence));
        Ok(())
    }
}

fn selection_match(
    key: ConversationKey,
    origin: Origin,
    handler: BoxedHandler,
    matched: MatchResult,
    observed: Option<State>,
) -> MatchResult {
    MatchResult::new()
        .with_args(matched.args.clone())
        .with_matches(matched.matches.clone())
        .with_payload(Selection {
            key,
            origin,
            handler,
            matched,
            observed,
        })
}

/// Marks a key as having a transition in flight until dropped.
struct InFlight {
    conversation: Arc<Inner>,
    key: ConversationKey,
}

impl InFlight {
    fn mark(conversation: &Arc<Inner>, key: &ConversationKey) -> Self {
        *conversation.in_flight.lock().entry(key.clone()).or_default() += 1;
        Self {
            conversation: Arc::clone(conversation),
            key: key.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut in_flight = self.conversation.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.key);
            }
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// A pending timeout. Holds everything weakly that could keep the dispatcher
/// or the conversation alive.
#[derive(Clone)]
struct Expiry {
    conversation: Weak<Inner>,
    shared: Weak<DispatcherShared>,
    key: ConversationKey,
    generation: u64,
    update: BoxedUpdate,
    user_data: Option<SharedData>,
    chat_data: Option<SharedData>,
}

impl Expiry {
    async fn fire(self) {
        let Some(conversation) = self.conversation.upgrade() else {
            return;
        };
        let mut turn = conversation.sequencer.enter(self.key.clone());
        turn.ready().await;

        // A transition committed while this job waited for its turn wins.
        {
            let mut timeouts = conversation.timeouts.lock();
            let armed = timeouts.get(&self.key).map(|armed| armed.generation);
            if armed != Some(self.generation) {
                trace!(conversation = %conversation.display_name, key = %self.key, "Stale timeout discarded");
                return;
            }
            timeouts.remove(&self.key);
        }
        if !conversation.conversations.lock().contains_key(&self.key) {
            return;
        }
        debug!(conversation = %conversation.display_name, key = %self.key, "Conversation timed out");

        let shared = self.shared.upgrade();
        let scope = Arc::new(UpdateScope::new(
            Some(Arc::clone(&self.update)),
            self.user_data.clone(),
            self.chat_data.clone(),
        ));

        if let Some(shared) = &shared {
            for handler in &conversation.timeout_handlers {
                let Some(matched) = handler.check(&self.update) else {
                    continue;
                };
                let ctx = CallbackContext::new(Arc::clone(&scope), Arc::clone(shared), &matched);
                if let Err(e) = handler.handle(Arc::clone(&self.update), matched, ctx).await {
                    let source = ErrorSource::ConversationTimeout {
                        handler: conversation.display_name.clone(),
                        key: self.key.clone(),
                    };
                    shared.route_error(Some(Arc::clone(&scope)), e, source).await;
                }
            }
        }

        let written = conversation.write_state(&self.key, None).await;
        if let Some(shared) = &shared {
            let synced = shared.sync_namespaces(self.update.as_ref()).await;
            for e in written.err().into_iter().chain(synced.err()) {
                shared
                    .route_error(Some(Arc::clone(&scope)), Box::new(e), ErrorSource::Persistence)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use serde_json::json;
    use switchboard_core::{BasicUpdate, Data, MemoryPersistence, PersistenceError, PersistenceResult};
    use tokio::sync::{Barrier, Notify};

    use crate::dispatcher::Dispatcher;
    use crate::filters;
    use crate::handler::{CallbackQueryHandler, CommandHandler, MessageHandler, UpdateHandler};

    fn msg(update_id: i64, chat: i64, user: i64, text: &str) -> BoxedUpdate {
        BasicUpdate::message(update_id, chat, user, text).into_boxed()
    }

    fn key(chat: i64, user: i64) -> ConversationKey {
        ConversationKey::new([KeyPart::Id(chat), KeyPart::Id(user)])
    }

    fn start_go() -> ConversationHandlerBuilder {
        ConversationHandler::builder()
            .name("conv")
            .entry_point(CommandHandler::new("start", |_u, _c| async { Transition::to("A") }).unwrap())
            .state(
                "A",
                [into_handler(MessageHandler::new(filters::text_eq("go"), |_u, _c| async {
                    Transition::End
                }))],
            )
    }

    async fn dispatcher(
        conversation: &ConversationHandler,
        persistence: Option<Arc<MemoryPersistence>>,
    ) -> Dispatcher {
        let mut builder = Dispatcher::builder().add_handler(0, conversation.clone());
        if let Some(persistence) = persistence {
            builder = builder.persistence(persistence);
        }
        builder.build().await.unwrap()
    }

    #[tokio::test]
    async fn test_start_then_go_scenario_is_persisted() {
        let memory = Arc::new(MemoryPersistence::new());
        let conversation = start_go().persistent(true).build().unwrap();
        let dispatcher = dispatcher(&conversation, Some(memory.clone())).await;
        let k = key(10, 20);

        assert!(dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap());
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));
        let stored = memory.document().conversations_of("conv").unwrap();
        assert_eq!(stored.get(&k), Some(&State::from("A")));

        assert!(dispatcher.process_update(msg(2, 10, 20, "go")).await.unwrap());
        assert!(conversation.conversations().is_empty());
        assert!(memory.document().conversations_of("conv").unwrap().is_empty());

        // Without state, only entry points are eligible.
        assert!(!dispatcher.process_update(msg(3, 10, 20, "go")).await.unwrap());
        assert!(conversation.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_ending_one_key_leaves_the_other() {
        let memory = Arc::new(MemoryPersistence::new());
        let conversation = start_go().persistent(true).build().unwrap();
        let dispatcher = dispatcher(&conversation, Some(memory.clone())).await;

        dispatcher.process_update(msg(1, 10, 1, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 2, "/start")).await.unwrap();
        dispatcher.process_update(msg(3, 10, 1, "go")).await.unwrap();

        let stored = memory.document().conversations_of("conv").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.get(&key(10, 2)), Some(&State::from("A")));
    }

    #[tokio::test]
    async fn test_async_keys_advance_independently() {
        let both_running = Arc::new(Barrier::new(2));
        let (ender, mover) = (Arc::clone(&both_running), Arc::clone(&both_running));
        let memory = Arc::new(MemoryPersistence::new());
        let conversation = start_go()
            .state(
                "A",
                [
                    into_handler(MessageHandler::new(filters::text_eq("end"), move |_u, _c| {
                        let barrier = Arc::clone(&ender);
                        async move {
                            barrier.wait().await;
                            Transition::End
                        }
                    })),
                    into_handler(MessageHandler::new(filters::text_eq("next"), move |_u, _c| {
                        let barrier = Arc::clone(&mover);
                        async move {
                            barrier.wait().await;
                            Transition::to("B")
                        }
                    })),
                ],
            )
            .persistent(true)
            .run_async(true)
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, Some(memory.clone())).await;

        dispatcher.process_update(msg(1, 10, 1, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 2, "/start")).await.unwrap();
        dispatcher.wait_idle().await;

        // Both transitions wait for each other, so they only finish if they run at once.
        dispatcher.process_update(msg(3, 10, 1, "end")).await.unwrap();
        dispatcher.process_update(msg(4, 10, 2, "next")).await.unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(conversation.state_of(&key(10, 1)), None);
        assert_eq!(conversation.state_of(&key(10, 2)), Some(State::from("B")));
        let stored = memory.document().conversations_of("conv").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.get(&key(10, 2)), Some(&State::from("B")));
    }

    #[tokio::test]
    async fn test_state_handlers_win_over_fallbacks() {
        let conversation = start_go()
            .state(
                "A",
                [into_handler(MessageHandler::new(filters::text(), |_u, _c| async {
                    Transition::to("STATE")
                }))],
            )
            .fallback(MessageHandler::new(filters::text(), |_u, _c| async { Transition::to("FALLBACK") }))
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, None).await;

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 20, "anything")).await.unwrap();
        assert_eq!(conversation.state_of(&key(10, 20)), Some(State::from("STATE")));

        // No handler for STATE: the fallback takes over.
        dispatcher.process_update(msg(3, 10, 20, "again")).await.unwrap();
        assert_eq!(conversation.state_of(&key(10, 20)), Some(State::from("FALLBACK")));
    }

    #[tokio::test]
    async fn test_keep_semantics() {
        let conversation = ConversationHandler::builder()
            .entry_point(CommandHandler::new("peek", |_u, _c| async {}).unwrap())
            .entry_point(CommandHandler::new("start", |_u, _c| async { "A" }).unwrap())
            .state(
                "A",
                [into_handler(MessageHandler::new(filters::text(), |_u, _c| async {
                    None::<State>
                }))],
            )
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, None).await;
        let k = key(10, 20);

        // An entry point returning nothing doesn't create a conversation.
        assert!(dispatcher.process_update(msg(1, 10, 20, "/peek")).await.unwrap());
        assert_eq!(conversation.state_of(&k), None);

        dispatcher.process_update(msg(2, 10, 20, "/start")).await.unwrap();
        dispatcher.process_update(msg(3, 10, 20, "hello")).await.unwrap();
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));
    }

    #[tokio::test]
    async fn test_reentry() {
        let entered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&entered);
        let build = |allow: bool, counter: Arc<AtomicUsize>| {
            ConversationHandler::builder()
                .allow_reentry(allow)
                .entry_point(
                    CommandHandler::new("start", move |_u, _c| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Transition::to("A")
                        }
                    })
                    .unwrap(),
                )
                .state(
                    "A",
                    [into_handler(MessageHandler::new(filters::text(), |_u, _c| async {
                        Transition::to("B")
                    }))],
                )
                .build()
                .unwrap()
        };

        let strict = build(false, Arc::clone(&counter));
        let first = dispatcher(&strict, None).await;
        first.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        first.process_update(msg(2, 10, 20, "/start")).await.unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(strict.state_of(&key(10, 20)), Some(State::from("B")));

        let reentrant = build(true, Arc::clone(&counter));
        let second = dispatcher(&reentrant, None).await;
        second.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        second.process_update(msg(2, 10, 20, "/start")).await.unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 3);
        assert_eq!(reentrant.state_of(&key(10, 20)), Some(State::from("A")));
    }

    #[tokio::test]
    async fn test_failed_callback_commits_nothing() {
        let memory = Arc::new(MemoryPersistence::new());
        let conversation = start_go()
            .persistent(true)
            .state(
                "A",
                [into_handler(MessageHandler::new(filters::text_eq("boom"), |_u, _c| async {
                    Err::<Transition, _>("boom")
                }))],
            )
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::builder()
            .add_handler(0, conversation.clone())
            .add_error_handler(move |ctx: CallbackContext| {
                let sink = Arc::clone(&sink);
                async move {
                    let source = ctx.error_source().map(ToString::to_string).unwrap_or_default();
                    sink.lock().push(source);
                }
            })
            .persistence(memory.clone())
            .build()
            .await
            .unwrap();

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 20, "boom")).await.unwrap();

        assert_eq!(conversation.state_of(&key(10, 20)), Some(State::from("A")));
        let stored = memory.document().conversations_of("conv").unwrap();
        assert_eq!(stored.get(&key(10, 20)), Some(&State::from("A")));
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].contains("conv"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_conversation_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (first, second) = (Arc::clone(&fired), Arc::clone(&fired));
        let memory = Arc::new(MemoryPersistence::new());
        let conversation = start_go()
            .persistent(true)
            .conversation_timeout(Duration::from_secs(60))
            .timeout_handler(MessageHandler::new(filters::all(), move |_u, ctx: CallbackContext| {
                let fired = Arc::clone(&first);
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    ctx.user_data().map(|data| data.insert("timed_out", json!(true)));
                }
            }))
            .timeout_handler(UpdateHandler::any(move |_u, _c| {
                second.fetch_add(1, Ordering::SeqCst);
                async {}
            }))
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, Some(memory.clone())).await;
        let k = key(10, 20);

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(conversation.state_of(&k), None);
        assert!(memory.document().conversations_of("conv").unwrap().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(memory.document().user(20).get("timed_out"), Some(&json!(true)));

        // A late update is a fresh entry candidate, not a continuation.
        assert!(!dispatcher.process_update(msg(2, 10, 20, "go")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_timeout() {
        let conversation = start_go()
            .state(
                "A",
                [into_handler(MessageHandler::new(filters::text_eq("stay"), |_u, _c| async {}))],
            )
            .conversation_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, None).await;
        let k = key(10, 20);

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        for id in 2..5 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            dispatcher.process_update(msg(id, 10, 20, "stay")).await.unwrap();
        }
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(conversation.state_of(&k), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_transition_wins_over_due_timeout() {
        let release = Arc::new(Notify::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let gate = Arc::clone(&release);
        let counter = Arc::clone(&fired);

        let conversation = start_go()
            .state(
                "A",
                [into_handler(
                    MessageHandler::new(filters::text_eq("slow"), move |_u, _c| {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notified().await;
                            Transition::to("B")
                        }
                    })
                    .run_async(true),
                )],
            )
            .conversation_timeout(Duration::from_secs(60))
            .timeout_handler(UpdateHandler::any(move |_u, _c| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            }))
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, None).await;
        let k = key(10, 20);

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        dispatcher.process_update(msg(2, 10, 20, "slow")).await.unwrap();

        // The timeout falls due while the transition is still running.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        release.notify_one();
        dispatcher.wait_idle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conversation.state_of(&k), Some(State::from("B")));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // The timeout armed by the transition ends the conversation once.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(conversation.state_of(&k), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiting_handlers_while_async_transition_runs() {
        let release = Arc::new(Notify::new());
        let waited = Arc::new(AtomicUsize::new(0));
        let gate = Arc::clone(&release);
        let counter = Arc::clone(&waited);

        let conversation = start_go()
            .state(
                "A",
                [into_handler(
                    MessageHandler::new(filters::text_eq("slow"), move |_u, _c| {
                        let gate = Arc::clone(&gate);
                        async move {
                            gate.notified().await;
                            Transition::to("B")
                        }
                    })
                    .run_async(true),
                )],
            )
            .waiting_handler(MessageHandler::new(filters::text(), move |_u, _c| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Transition::End
                }
            }))
            .build()
            .unwrap();
        let dispatcher = dispatcher(&conversation, None).await;
        let k = key(10, 20);

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 20, "slow")).await.unwrap();
        assert!(dispatcher.process_update(msg(3, 10, 20, "go")).await.unwrap());
        assert_eq!(waited.load(Ordering::SeqCst), 1);

        release.notify_one();
        dispatcher.wait_idle().await;
        // The waiting handler's `End` was ignored.
        assert_eq!(conversation.state_of(&k), Some(State::from("B")));
    }

    #[tokio::test]
    async fn test_nested_conversation_maps_to_parent() {
        let child = ConversationHandler::builder()
            .name("child")
            .entry_point(CommandHandler::new("details", |_u, _c| async { "CHILD" }).unwrap())
            .state(
                "CHILD",
                [into_handler(MessageHandler::new(filters::text_eq("done"), |_u, _c| async {
                    Transition::End
                }))],
            )
            .map_to_parent(Transition::End, "SUMMARY")
            .build()
            .unwrap();
        let parent = ConversationHandler::builder()
            .name("parent")
            .entry_point(CommandHandler::new("start", |_u, _c| async { "MENU" }).unwrap())
            .state("MENU", [into_handler(child.clone())])
            .build()
            .unwrap();
        let dispatcher = dispatcher(&parent, None).await;
        let k = key(10, 20);

        dispatcher.process_update(msg(1, 10, 20, "/start")).await.unwrap();
        dispatcher.process_update(msg(2, 10, 20, "/details")).await.unwrap();
        assert_eq!(parent.state_of(&k), Some(State::from("MENU")));
        assert_eq!(child.state_of(&k), Some(State::from("CHILD")));

        dispatcher.process_update(msg(3, 10, 20, "done")).await.unwrap();
        assert_eq!(child.state_of(&k), None);
        assert_eq!(parent.state_of(&k), Some(State::from("SUMMARY")));
    }

    #[tokio::test]
    async fn test_restore_loads_persisted_states() {
        let memory = Arc::new(
            MemoryPersistence::new()
                .with_conversations_json(r#"{"conv": {"[10,20]": "A"}}"#)
                .unwrap(),
        );
        let conversation = start_go().persistent(true).build().unwrap();
        let dispatcher = dispatcher(&conversation, Some(memory.clone())).await;
        assert_eq!(conversation.state_of(&key(10, 20)), Some(State::from("A")));

        dispatcher.process_update(msg(1, 10, 20, "go")).await.unwrap();
        assert!(memory.document().conversations_of("conv").unwrap().is_empty());
    }

    /// Fails the first conversation write, then behaves like memory.
    #[derive(Debug, Default)]
    struct FirstWriteFails {
        memory: MemoryPersistence,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Persistence for FirstWriteFails {
        async fn load_user_data(&self, user_id: i64) -> PersistenceResult<Data> {
            self.memory.load_user_data(user_id).await
        }
        async fn load_chat_data(&self, chat_id: i64) -> PersistenceResult<Data> {
            self.memory.load_chat_data(chat_id).await
        }
        async fn load_bot_data(&self) -> PersistenceResult<Data> {
            self.memory.load_bot_data().await
        }
        async fn load_conversations(&self, name: &str) -> PersistenceResult<ConversationMap> {
            self.memory.load_conversations(name).await
        }
        async fn update_user_data(&self, user_id: i64, data: &Data) -> PersistenceResult<()> {
            self.memory.update_user_data(user_id, data).await
        }
        async fn update_chat_data(&self, chat_id: i64, data: &Data) -> PersistenceResult<()> {
            self.memory.update_chat_data(chat_id, data).await
        }
        async fn update_bot_data(&self, data: &Data) -> PersistenceResult<()> {
            self.memory.update_bot_data(data).await
        }
        async fn update_conversation(
            &self,
            name: &str,
            key: &ConversationKey,
            state: Option<&State>,
        ) -> PersistenceResult<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(PersistenceError::backend("disk full"));
            }
            self.memory.update_conversation(name, key, state).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_flush() {
        let persistence = Arc::new(FirstWriteFails::default());
        let conversation = start_go().persistent(true).build().unwrap();
        let dispatcher = Dispatcher::builder()
            .add_handler(0, conversation.clone())
            .persistence(persistence.clone())
            .build()
            .await
            .unwrap();
        let k = key(10, 20);

        let result = dispatcher.process_update(msg(1, 10, 20, "/start")).await;
        assert!(matches!(result, Err(DispatchError::Persistence(_))));
        assert_eq!(conversation.state_of(&k), Some(State::from("A")));
        assert!(persistence.memory.document().conversations_of("conv").unwrap().is_empty());

        dispatcher.flush().await.unwrap();
        let stored = persistence.memory.document().conversations_of("conv").unwrap();
        assert_eq!(stored.get(&k), Some(&State::from("A")));

        // Nothing left to retry.
        dispatcher.flush().await.unwrap();
        dispatcher.process_update(msg(2, 10, 20, "go")).await.unwrap();
        assert!(persistence.memory.document().conversations_of("conv").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_without_persistence_fails_to_build() {
        let conversation = start_go().persistent(true).build().unwrap();
        let result = Dispatcher::builder().add_handler(0, conversation).build().await;
        assert!(matches!(result, Err(DispatchError::PersistenceRequired { name }) if name == "conv"));
    }

    #[test]
    fn test_builder_validation() {
        let unkeyed = start_go().per_chat(false).per_user(false).build();
        assert!(matches!(unkeyed, Err(DispatchError::InvalidConfig(_))));

        let unnamed = ConversationHandler::builder()
            .persistent(true)
            .entry_point(CommandHandler::new("start", |_u, _c| async {}).unwrap())
            .build();
        assert!(matches!(unnamed, Err(DispatchError::InvalidConfig(_))));

        let no_entry = ConversationHandler::builder().build();
        assert!(matches!(no_entry, Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_keys() {
        let per_chat = start_go().per_user(false).build().unwrap();
        assert_eq!(
            per_chat.key_for(&BasicUpdate::message(1, 10, 20, "x")),
            Some(ConversationKey::new([KeyPart::Id(10)]))
        );
        assert_eq!(per_chat.key_for(&BasicUpdate::inline_callback_query(1, 20, "abc", "x")), None);

        let per_message = ConversationHandler::builder()
            .per_message(true)
            .per_chat(false)
            .entry_point(CallbackQueryHandler::new(|_u, _c| async {}))
            .build()
            .unwrap();
        assert_eq!(per_message.key_for(&BasicUpdate::message(1, 10, 20, "x")), None);
        assert_eq!(
            per_message.key_for(&BasicUpdate::callback_query(1, 10, 20, 7, "x")),
            Some(ConversationKey::new([KeyPart::Id(20), KeyPart::Id(7)]))
        );
        assert_eq!(
            per_message.key_for(&BasicUpdate::inline_callback_query(1, 20, "abc", "x")),
            Some(ConversationKey::new([KeyPart::Id(20), KeyPart::Text("abc".into())]))
        );
    }

    #[tokio::test]
    async fn test_channel_posts_are_ignored() {
        let conversation = start_go().per_user(false).build().unwrap();
        let dispatcher = dispatcher(&conversation, None).await;
        let post = BasicUpdate::channel_post(1, 10, "/start").into_boxed();
        assert!(!dispatcher.process_update(post).await.unwrap());
        assert!(conversation.conversations().is_empty());
    }
}
