//! # Switchboard Core
//!
//! Foundation types for the Switchboard update dispatcher.
//!
//! This crate contains everything the dispatch engine needs to agree on with
//! the outside world, and nothing that depends on how updates are routed:
//!
//! - **Updates**: the type-erased [`Update`] trait, its identity fields and
//!   a serializable [`BasicUpdate`] for transports that don't bring their own
//!   event model.
//! - **Conversation identity**: [`ConversationKey`] with an explicit codec and
//!   the [`State`] label stored per key.
//! - **Data namespaces**: [`Data`] maps and the [`SharedData`] handle that
//!   callbacks mutate.
//! - **Persistence**: the [`Persistence`] contract plus the in-memory
//!   ([`MemoryPersistence`]) and JSON file ([`FilePersistence`]) backends.
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌─────────────────┐
//! │ Transport │────▶│ Dispatcher │────▶│   Persistence   │
//! │ (Update)  │     │ (framework)│     │ (user/chat/bot, │
//! └───────────┘     └────────────┘     │  conversations) │
//!                                      └─────────────────┘
//! ```

pub mod conversation;
pub mod data;
pub mod error;
pub mod persistence;
pub mod update;

pub use conversation::{ConversationKey, KeyPart, State};
pub use data::{Data, SharedData};
pub use error::{PersistenceError, PersistenceResult};
pub use persistence::{
    ConversationMap, FilePersistence, MemoryPersistence, PersistedDocument, Persistence,
    StoreFlags,
};
pub use update::{BasicUpdate, BoxedUpdate, Update, UpdateKind};
