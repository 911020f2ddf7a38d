//! Persistence contract for user, chat, bot and conversation data.
//!
//! A backend stores four records:
//!
//! | Record          | Shape                                        |
//! |-----------------|----------------------------------------------|
//! | `user_data`     | user id → [`Data`]                           |
//! | `chat_data`     | chat id → [`Data`]                           |
//! | `bot_data`      | [`Data`]                                     |
//! | `conversations` | handler name → encoded key → [`State`] label |
//!
//! The dispatcher loads namespaces lazily (one id at a time, the first time an
//! update touches it) and writes back only what changed. Conversation handlers
//! load their whole map once at startup and then write every transition
//! through [`Persistence::update_conversation`].
//!
//! # Guarantees a backend must provide
//!
//! - Read-your-writes within the process.
//! - Writes for one key never disturb another key.
//! - Conversation keys round-trip through [`ConversationKey::encode`] and
//!   [`ConversationKey::decode`] to an equal key.

mod document;
mod file;
mod memory;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::conversation::{ConversationKey, State};
use crate::data::Data;
use crate::error::PersistenceResult;

pub use document::PersistedDocument;
pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Every persisted conversation of one handler.
pub type ConversationMap = HashMap<ConversationKey, State>;

/// Which data namespaces a backend stores.
///
/// Conversations are always stored; a conversation handler opts into
/// persistence individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreFlags {
    /// Store per-user data.
    pub user_data: bool,
    /// Store per-chat data.
    pub chat_data: bool,
    /// Store process-global data.
    pub bot_data: bool,
}

impl Default for StoreFlags {
    fn default() -> Self {
        Self::all()
    }
}

impl StoreFlags {
    /// Stores every namespace.
    pub const fn all() -> Self {
        Self {
            user_data: true,
            chat_data: true,
            bot_data: true,
        }
    }

    /// Stores no namespace (conversations only).
    pub const fn none() -> Self {
        Self {
            user_data: false,
            chat_data: false,
            bot_data: false,
        }
    }
}

/// A durable store behind the dispatcher.
///
/// All methods take `&self`; implementations synchronize internally. The
/// `update_*` methods receive the complete new value of one entry, never a
/// delta.
#[async_trait]
pub trait Persistence: Send + Sync + fmt::Debug {
    /// Which namespaces this backend stores.
    fn store_flags(&self) -> StoreFlags {
        StoreFlags::all()
    }

    /// Loads the data of one user. Unknown users yield an empty map.
    async fn load_user_data(&self, user_id: i64) -> PersistenceResult<Data>;

    /// Loads the data of one chat. Unknown chats yield an empty map.
    async fn load_chat_data(&self, chat_id: i64) -> PersistenceResult<Data>;

    /// Loads the process-global data.
    async fn load_bot_data(&self) -> PersistenceResult<Data>;

    /// Loads every stored conversation of the handler called `name`.
    async fn load_conversations(&self, name: &str) -> PersistenceResult<ConversationMap>;

    /// Replaces the data of one user.
    async fn update_user_data(&self, user_id: i64, data: &Data) -> PersistenceResult<()>;

    /// Replaces the data of one chat.
    async fn update_chat_data(&self, chat_id: i64, data: &Data) -> PersistenceResult<()>;

    /// Replaces the process-global data.
    async fn update_bot_data(&self, data: &Data) -> PersistenceResult<()>;

    /// Records the state of one conversation. `None` removes the entry.
    async fn update_conversation(
        &self,
        name: &str,
        key: &ConversationKey,
        state: Option<&State>,
    ) -> PersistenceResult<()>;

    /// Pushes buffered writes to the backing store.
    ///
    /// Called periodically by the dispatcher and once on shutdown.
    async fn flush(&self) -> PersistenceResult<()> {
        Ok(())
    }
}
