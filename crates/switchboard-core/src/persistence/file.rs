use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::conversation::{ConversationKey, State};
use crate::data::Data;
use crate::error::PersistenceResult;
use crate::persistence::{ConversationMap, PersistedDocument, Persistence, StoreFlags};

/// A persistence backend backed by a single JSON file.
///
/// The file holds one [`PersistedDocument`]. By default every changed entry is
/// written through immediately; with [`on_flush(true)`](Self::on_flush)
/// writes are buffered until [`Persistence::flush`] runs.
///
/// Writes go to a sibling temporary file which is synced and then renamed
/// over the target, so a crash never leaves a half-written document behind.
/// A failed write removes the temporary file and keeps the store dirty.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    document: RwLock<PersistedDocument>,
    flags: StoreFlags,
    on_flush: bool,
    dirty: AtomicBool,
    // Serializes file writes so a later snapshot never lands before an earlier one.
    write_lock: Mutex<()>,
}

impl FilePersistence {
    /// Opens the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                info!(path = %path.display(), "Loaded persistence file");
                PersistedDocument::from_json(&json)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Persistence file not found, starting empty");
                PersistedDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            document: RwLock::new(document),
            flags: StoreFlags::all(),
            on_flush: false,
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    /// Buffers writes until [`Persistence::flush`] when `true`.
    pub fn on_flush(mut self, on_flush: bool) -> Self {
        self.on_flush = on_flush;
        self
    }

    /// Restricts which namespaces are stored.
    pub fn with_store_flags(mut self, flags: StoreFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The file this store writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of everything stored.
    pub fn document(&self) -> PersistedDocument {
        self.document.read().clone()
    }

    /// Called after an in-memory change.
    async fn changed(&self) -> PersistenceResult<()> {
        self.dirty.store(true, Ordering::SeqCst);
        if self.on_flush {
            return Ok(());
        }
        self.write().await
    }

    async fn write(&self) -> PersistenceResult<()> {
        let _guard = self.write_lock.lock().await;
        // Clear before serializing: a change racing with this write marks the
        // store dirty again and is picked up by the next write.
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let json = self.document.read().to_json()?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(json.as_bytes()).await?;
            // The bytes must be on disk before the rename makes them the document.
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = result {
            self.dirty.store(true, Ordering::SeqCst);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = json.len(), "Persistence file written");
        Ok(())
    }
}

#[async_trait]
impl Persistence for FilePersistence {
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
        let changed = self.document.write().set_user(user_id, data);
        if changed { self.changed().await } else { Ok(()) }
    }

    async fn update_chat_data(&self, chat_id: i64, data: &Data) -> PersistenceResult<()> {
        let changed = self.document.write().set_chat(chat_id, data);
        if changed { self.changed().await } else { Ok(()) }
    }

    async fn update_bot_data(&self, data: &Data) -> PersistenceResult<()> {
        let changed = self.document.write().set_bot(data);
        if changed { self.changed().await } else { Ok(()) }
    }

    async fn update_conversation(
        &self,
        name: &str,
        key: &ConversationKey,
        state: Option<&State>,
    ) -> PersistenceResult<()> {
        let changed = self.document.write().set_conversation(name, key, state);
        if changed { self.changed().await } else { Ok(()) }
    }

    async fn flush(&self) -> PersistenceResult<()> {
        self.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::KeyPart;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("switchboard.json");
        (dir, path)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let (_dir, path) = temp_store();
        let persistence = FilePersistence::open(&path).await.unwrap();
        assert_eq!(persistence.document(), PersistedDocument::default());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_through_and_reopen() {
        let (_dir, path) = temp_store();
        let persistence = FilePersistence::open(&path).await.unwrap();
        let key = ConversationKey::new([KeyPart::Id(42), KeyPart::Id(7)]);
        persistence
            .update_conversation("signup", &key, Some(&State::from("AGE")))
            .await
            .unwrap();

        let reopened = FilePersistence::open(&path).await.unwrap();
        let conversations = reopened.load_conversations("signup").await.unwrap();
        assert_eq!(conversations.get(&key), Some(&State::from("AGE")));
    }

    #[tokio::test]
    async fn test_load_flush_without_changes_is_byte_identical() {
        let (_dir, path) = temp_store();
        {
            let persistence = FilePersistence::open(&path).await.unwrap();
            let mut data = Data::new();
            data.insert("name".into(), json!("Ada"));
            persistence.update_user_data(7, &data).await.unwrap();
            persistence.update_bot_data(&data).await.unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let persistence = FilePersistence::open(&path).await.unwrap();
        let mut data = Data::new();
        data.insert("name".into(), json!("Ada"));
        // Same value: must not count as a change.
        persistence.update_user_data(7, &data).await.unwrap();
        persistence.flush().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
        // And the canonical form is stable even when forced out again.
        persistence.dirty.store(true, Ordering::SeqCst);
        persistence.flush().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_on_flush_buffers_writes() {
        let (_dir, path) = temp_store();
        let persistence = FilePersistence::open(&path).await.unwrap().on_flush(true);
        let mut data = Data::new();
        data.insert("count".into(), json!(1));
        persistence.update_chat_data(-5, &data).await.unwrap();
        assert!(!path.exists());

        persistence.flush().await.unwrap();
        let reopened = FilePersistence::open(&path).await.unwrap();
        assert_eq!(reopened.load_chat_data(-5).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_write_cleans_up_and_retries() {
        let (dir, path) = temp_store();
        let persistence = FilePersistence::open(&path).await.unwrap();
        // A directory in the way makes the rename fail.
        std::fs::create_dir(&path).unwrap();

        let mut data = Data::new();
        data.insert("name".into(), json!("Ada"));
        assert!(persistence.update_user_data(7, &data).await.is_err());
        assert!(!dir.path().join("switchboard.json.tmp").exists());
        assert_eq!(persistence.document().user(7), data);

        std::fs::remove_dir(&path).unwrap();
        persistence.flush().await.unwrap();
        let reopened = FilePersistence::open(&path).await.unwrap();
        assert_eq!(reopened.load_user_data(7).await.unwrap(), data);
    }
}
