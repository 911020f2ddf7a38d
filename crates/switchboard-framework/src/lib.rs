//! # Switchboard Framework
//!
//! The update dispatch engine.
//!
//! This layer provides:
//! - Handler trait and variants (update, message, command, callback query)
//! - Composable filters with regex captures
//! - Conversation state machines with per-key serialization and timeouts
//! - A due-time ordered job queue
//! - The dispatcher: handler groups, worker pool, error routing and
//!   write-back of changed data to persistence
//!
//! Transports feed updates through [`update_queue`]; everything durable goes
//! through the [`Persistence`](switchboard_core::Persistence) contract of the
//! core crate.

pub mod context;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod handler;
pub mod job;
pub mod queue;
pub mod sequencer;

mod store;

pub use context::{CallbackContext, UpdateScope};
pub use conversation::{ConversationHandler, ConversationHandlerBuilder};
pub use dispatcher::{Dispatcher, DispatcherBuilder, ErrorCallback};
pub use error::{
    BoxError, DeadLetter, DispatchError, DispatchResult, ErrorSource, SharedError,
};
pub use filters::{Filter, RegexMatch};
pub use handler::{
    BoxedHandler, Callback, CallbackQueryHandler, CommandHandler, Handler, HandlerResult,
    IntoTransition, MatchResult, MessageHandler, Transition, UpdateHandler, callback,
    into_handler,
};
pub use job::{JobCallback, JobContext, JobErrorSink, JobHandle, JobQueue, job_callback};
pub use queue::{UpdateReceiver, UpdateSender, update_queue};
pub use sequencer::{KeyedSequencer, Turn};
