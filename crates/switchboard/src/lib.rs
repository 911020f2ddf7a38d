//! # Switchboard
//!
//! Ordered update dispatch with persistent conversation state machines.
//!
//! ## Overview
//!
//! Switchboard routes incoming updates to handler callbacks. Handlers live in
//! numbered groups; within a group the first matching handler runs, and
//! every group gets its chance. Multi-step dialogs are conversation state
//! machines keyed by chat, user or message, and both their states and the
//! per-user, per-chat and global data namespaces survive restarts through a
//! persistence backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌──────────────┐     ┌────────────┐     ┌───────────────────┐
//! │ Transport │────▶│ update_queue │────▶│ Dispatcher │────▶│ group 0: handlers │
//! └───────────┘     └──────────────┘     │ (workers)  │────▶│ group 1: handlers │
//!                                        └─────┬──────┘     └───────────────────┘
//!                                              │
//!                              ┌───────────────┴───────────┐
//!                              ▼                           ▼
//!                        ┌───────────┐            ┌─────────────────┐
//!                        │ JobQueue  │            │   Persistence   │
//!                        │ (timeouts)│            │ (memory / file) │
//!                        └───────────┘            └─────────────────┘
//! ```
//!
//! - **Core** ([`core`]): updates, conversation keys, data namespaces and
//!   the persistence contract
//! - **Framework** ([`framework`]): handlers, filters, conversations, the
//!   job queue and the dispatcher
//! - **Runtime** ([`runtime`]): configuration, logging and the run loop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchboard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let greet = ConversationHandler::builder()
//!         .entry_point(CommandHandler::new("start", |_u, _c| async { "NAME" })?)
//!         .state("NAME", [into_handler(MessageHandler::new(filters::text(), |_u, ctx: CallbackContext| async move {
//!             ctx.user_data().map(|d| d.insert("greeted", true.into()));
//!             Transition::End
//!         }))])
//!         .name("greet")
//!         .persistent(true)
//!         .build()?;
//!
//!     let runtime = Runtime::builder().build().await?;
//!     runtime.add_handler(0, greet).await?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use switchboard_core as core;
pub use switchboard_framework as framework;
pub use switchboard_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use switchboard::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use switchboard_runtime::{Runtime, SwitchboardConfig};

    // Updates and state
    pub use switchboard_core::{
        BasicUpdate, BoxedUpdate, ConversationKey, Data, Persistence, SharedData, State, Update,
        UpdateKind,
    };

    // Handlers and their context
    pub use switchboard_framework::filters::{self, Filter};
    pub use switchboard_framework::{
        CallbackContext, CallbackQueryHandler, CommandHandler, ConversationHandler, Dispatcher,
        Handler, MessageHandler, Transition, UpdateHandler, into_handler,
    };

    // Jobs
    pub use switchboard_framework::{JobContext, JobQueue};

    // Errors
    pub use switchboard_framework::{BoxError, DispatchError, ErrorSource};
}
