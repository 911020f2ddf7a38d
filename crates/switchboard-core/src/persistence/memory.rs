use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::conversation::{ConversationKey, State};
use crate::data::Data;
use crate::error::PersistenceResult;
use crate::persistence::{ConversationMap, PersistedDocument, Persistence, StoreFlags};

/// An in-process persistence backend.
///
/// Useful for tests and for bots that export their state themselves: every
/// record can be read back as JSON and a store can be seeded from JSON.
///
/// ```rust,ignore
/// let persistence = MemoryPersistence::new()
///     .with_conversations_json(r#"{"signup": {"[42,7]": "AGE"}}"#)?;
/// ```
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    document: RwLock<PersistedDocument>,
    flags: StoreFlags,
}

impl MemoryPersistence {
    /// Creates an empty store that keeps every namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from a complete document.
    pub fn from_document(document: PersistedDocument) -> Self {
        Self {
            document: RwLock::new(document),
            flags: StoreFlags::all(),
        }
    }

    /// Creates a store from a document serialized with [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> PersistenceResult<Self> {
        PersistedDocument::from_json(json).map(Self::from_document)
    }

    /// Restricts which namespaces are stored.
    pub fn with_store_flags(mut self, flags: StoreFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Seeds the user data from a JSON object keyed by user id.
    pub fn with_user_data_json(self, json: &str) -> PersistenceResult<Self> {
        self.document.write().user_data = serde_json::from_str(json)?;
        Ok(self)
    }

    /// Seeds the chat data from a JSON object keyed by chat id.
    pub fn with_chat_data_json(self, json: &str) -> PersistenceResult<Self> {
        self.document.write().chat_data = serde_json::from_str(json)?;
        Ok(self)
    }

    /// Seeds the global data from a JSON object.
    pub fn with_bot_data_json(self, json: &str) -> PersistenceResult<Self> {
        self.document.write().bot_data = serde_json::from_str(json)?;
        Ok(self)
    }

    /// Seeds the conversations from a JSON object keyed by handler name.
    pub fn with_conversations_json(self, json: &str) -> PersistenceResult<Self> {
        let wrapped = format!(r#"{{"conversations": {json}}}"#);
        let conversations = PersistedDocument::from_json(&wrapped)?.conversations;
        self.document.write().conversations = conversations;
        Ok(self)
    }

    /// Returns a copy of everything stored.
    pub fn document(&self) -> PersistedDocument {
        self.document.read().clone()
    }

    /// The whole store as JSON.
    pub fn to_json(&self) -> PersistenceResult<String> {
        self.document.read().to_json()
    }

    /// The user data as JSON.
    pub fn user_data_json(&self) -> PersistenceResult<String> {
        Ok(serde_json::to_string(&self.document.read().user_data)?)
    }

    /// The chat data as JSON.
    pub fn chat_data_json(&self) -> PersistenceResult<String> {
        Ok(serde_json::to_string(&self.document.read().chat_data)?)
    }

    /// The global data as JSON.
    pub fn bot_data_json(&self) -> PersistenceResult<String> {
        Ok(serde_json::to_string(&self.document.read().bot_data)?)
    }

    /// The conversations as JSON.
    pub fn conversations_json(&self) -> PersistenceResult<String> {
        Ok(serde_json::to_string(&self.document.read().conversations)?)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn store_flags(&self) -> StoreFlags {
        self.flags
    }

    async fn load_user_data(&self, user_id: i64) -> PersistenceResult<Data> {
        Ok(self.document.read().user(user_id))
    }

    async fn load_chat_data(&self, chat_id: i64) -> PersistenceResult<Data> {
        Ok(self.document.read().chat(chat_id))
    }

    async fn load_bot_data(&self) -> PersistenceResult<Data> {
        Ok(self.document.read().bot_data.clone())
    }

    async fn load_conversations(&self, name: &str) -> PersistenceResult<ConversationMap> {
        self.document.read().conversations_of(name)
    }

    async fn update_user_data(&self, user_id: i64, data: &Data) -> PersistenceResult<()> {
        if self.document.write().set_user(user_id, data) {
            trace!(user_id, "user data stored");
        }
        Ok(())
    }

    async fn update_chat_data(&self, chat_id: i64, data: &Data) -> PersistenceResult<()> {
        if self.document.write().set_chat(chat_id, data) {
            trace!(chat_id, "chat data stored");
        }
        Ok(())
    }

    async fn update_bot_data(&self, data: &Data) -> PersistenceResult<()> {
        self.document.write().set_bot(data);
        Ok(())
    }

    async fn update_conversation(
        &self,
        name: &str,
        key: &ConversationKey,
        state: Option<&State>,
    ) -> PersistenceResult<()> {
        if self.document.write().set_conversation(name, key, state) {
            trace!(handler = name, %key, state = ?state, "conversation stored");
        }
        Ok(())
    }
}
