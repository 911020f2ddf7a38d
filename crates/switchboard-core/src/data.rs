//! Key-value data namespaces.
//!
//! Callbacks get three [`SharedData`] handles per update: one for the user,
//! one for the chat and one process-global. The dispatcher compares their
//! contents against the last persisted snapshot after each invocation, so
//! callbacks just mutate and never flag anything as dirty.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A flat JSON object. Keys are kept sorted, so serialization is stable.
pub type Data = serde_json::Map<String, Value>;

/// A cloneable handle to one namespace's live data.
///
/// All clones point at the same map. Locks are short and synchronous; never
/// hold the guard across an `.await`.
#[derive(Clone, Default)]
pub struct SharedData {
    inner: Arc<Mutex<Data>>,
}

impl SharedData {
    /// Wraps an existing map.
    pub fn new(data: Data) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    /// Locks the map for direct manipulation.
    pub fn lock(&self) -> MutexGuard<'_, Data> {
        self.inner.lock()
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Data {
        self.inner.lock().clone()
    }

    /// Returns a copy of the value under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    /// Returns the value under `key` deserialized as `T`.
    ///
    /// `None` if the key is absent or holds a value of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Stores a raw JSON value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.lock().insert(key.into(), value)
    }

    /// Serializes `value` and stores it under `key`.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.inner.lock().insert(key.into(), value);
        Ok(())
    }

    /// Removes the value under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().remove(key)
    }

    /// Returns `true` if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Replaces the whole contents.
    pub fn replace(&self, data: Data) -> Data {
        std::mem::replace(&mut *self.inner.lock(), data)
    }

    /// Returns `true` if both handles point at the same map.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<Data> for SharedData {
    fn from(data: Data) -> Self {
        Self::new(data)
    }
}

impl fmt::Debug for SharedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedData").field(&*self.inner.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_contents() {
        let data = SharedData::default();
        let other = data.clone();
        data.insert("count", json!(1));
        assert_eq!(other.get("count"), Some(json!(1)));
        assert!(data.ptr_eq(&other));
    }

    #[test]
    fn test_typed_access() {
        let data = SharedData::default();
        data.set("names", &vec!["a", "b"]).unwrap();
        assert_eq!(data.get_as::<Vec<String>>("names").unwrap(), vec!["a", "b"]);
        assert_eq!(data.get_as::<u32>("names"), None);
        assert_eq!(data.get_as::<u32>("missing"), None);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let data = SharedData::default();
        data.insert("k", json!("v"));
        let snapshot = data.snapshot();
        data.remove("k");
        assert_eq!(snapshot.get("k"), Some(&json!("v")));
        assert!(data.is_empty());
    }
}
