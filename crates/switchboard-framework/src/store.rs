//! Live data namespaces and their write-back to persistence.
//!
//! Each namespace entry keeps two copies: the live [`SharedData`] callbacks
//! mutate and the snapshot last written to persistence. After an invocation
//! the dispatcher compares the two by value and writes back only entries that
//! differ; callbacks never flag anything as dirty.
//!
//! User and chat entries are loaded lazily, the first time an update carries
//! the id. Global data is loaded once when the dispatcher is built.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{trace, warn};

use switchboard_core::{Data, Persistence, PersistenceError, PersistenceResult, SharedData, StoreFlags};

struct Slot {
    live: SharedData,
    persisted: Data,
}

impl Slot {
    fn new(data: Data) -> Self {
        Self {
            live: SharedData::new(data.clone()),
            persisted: data,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Namespace {
    User(i64),
    Chat(i64),
    Bot,
}

pub(crate) struct DataStore {
    persistence: Option<Arc<dyn Persistence>>,
    flags: StoreFlags,
    users: Mutex<HashMap<i64, Slot>>,
    chats: Mutex<HashMap<i64, Slot>>,
    bot: Mutex<Slot>,
    // One write-back at a time, so snapshots land in order.
    sync_lock: AsyncMutex<()>,
}

impl DataStore {
    /// Creates the store and loads global data.
    pub(crate) async fn open(persistence: Option<Arc<dyn Persistence>>) -> PersistenceResult<Self> {
        let flags = persistence
            .as_ref()
            .map(|p| p.store_flags())
            .unwrap_or_else(StoreFlags::none);
        let bot = match &persistence {
            Some(p) if flags.bot_data => p.load_bot_data().await?,
            _ => Data::new(),
        };

        Ok(Self {
            persistence,
            flags,
            users: Mutex::new(HashMap::new()),
            chats: Mutex::new(HashMap::new()),
            bot: Mutex::new(Slot::new(bot)),
            sync_lock: AsyncMutex::new(()),
        })
    }

    pub(crate) fn bot_data(&self) -> SharedData {
        self.bot.lock().live.clone()
    }

    pub(crate) async fn user_data(&self, user_id: i64) -> PersistenceResult<SharedData> {
        if let Some(slot) = self.users.lock().get(&user_id) {
            return Ok(slot.live.clone());
        }
        let data = match &self.persistence {
            Some(p) if self.flags.user_data => p.load_user_data(user_id).await?,
            _ => Data::new(),
        };
        trace!(user_id, "user data loaded");
        Ok(self.users.lock().entry(user_id).or_insert_with(|| Slot::new(data)).live.clone())
    }

    pub(crate) async fn chat_data(&self, chat_id: i64) -> PersistenceResult<SharedData> {
        if let Some(slot) = self.chats.lock().get(&chat_id) {
            return Ok(slot.live.clone());
        }
        let data = match &self.persistence {
            Some(p) if self.flags.chat_data => p.load_chat_data(chat_id).await?,
            _ => Data::new(),
        };
        trace!(chat_id, "chat data loaded");
        Ok(self.chats.lock().entry(chat_id).or_insert_with(|| Slot::new(data)).live.clone())
    }

    /// Writes back global data and the given user and chat if they changed.
    ///
    /// Every namespace is attempted; the first failure is returned.
    pub(crate) async fn sync(&self, user_id: Option<i64>, chat_id: Option<i64>) -> PersistenceResult<()> {
        let mut namespaces = vec![Namespace::Bot];
        namespaces.extend(user_id.map(Namespace::User));
        namespaces.extend(chat_id.map(Namespace::Chat));
        self.sync_namespaces(namespaces).await
    }

    /// Writes back every loaded namespace that changed.
    pub(crate) async fn sync_all(&self) -> PersistenceResult<()> {
        let mut namespaces = vec![Namespace::Bot];
        namespaces.extend(self.users.lock().keys().copied().map(Namespace::User));
        namespaces.extend(self.chats.lock().keys().copied().map(Namespace::Chat));
        self.sync_namespaces(namespaces).await
    }

    async fn sync_namespaces(&self, namespaces: Vec<Namespace>) -> PersistenceResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let _guard = self.sync_lock.lock().await;

        let mut first_error: Option<PersistenceError> = None;
        for namespace in namespaces {
            let Some(snapshot) = self.changed(namespace) else {
                continue;
            };
            let result = match namespace {
                Namespace::User(id) => persistence.update_user_data(id, &snapshot).await,
                Namespace::Chat(id) => persistence.update_chat_data(id, &snapshot).await,
                Namespace::Bot => persistence.update_bot_data(&snapshot).await,
            };
            match result {
                Ok(()) => {
                    self.mark_persisted(namespace, snapshot);
                    trace!(?namespace, "namespace written back");
                }
                Err(e) => {
                    warn!(?namespace, error = %e, "Failed to write back namespace");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The live contents if stored and different from the persisted snapshot.
    fn changed(&self, namespace: Namespace) -> Option<Data> {
        let compare = |slot: &Slot| {
            let live = slot.live.snapshot();
            (live != slot.persisted).then_some(live)
        };
        match namespace {
            Namespace::User(id) if self.flags.user_data => self.users.lock().get(&id).and_then(compare),
            Namespace::Chat(id) if self.flags.chat_data => self.chats.lock().get(&id).and_then(compare),
            Namespace::Bot if self.flags.bot_data => compare(&*self.bot.lock()),
            _ => None,
        }
    }

    fn mark_persisted(&self, namespace: Namespace, snapshot: Data) {
        match namespace {
            Namespace::User(id) => {
                if let Some(slot) = self.users.lock().get_mut(&id) {
                    slot.persisted = snapshot;
                }
            }
            Namespace::Chat(id) => {
                if let Some(slot) = self.chats.lock().get_mut(&id) {
                    slot.persisted = snapshot;
                }
            }
            Namespace::Bot => self.bot.lock().persisted = snapshot,
        }
    }
}
