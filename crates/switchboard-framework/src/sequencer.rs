//! Per-key FIFO serialization.
//!
//! A [`KeyedSequencer`] hands out [`Turn`]s. Turns for the same key complete
//! in the order they were *entered*; turns for different keys never wait on
//! each other. Entering is synchronous, so the order is fixed the moment the
//! caller decides to do the work, not when its future first gets polled.
//!
//! ```rust,ignore
//! let sequencer = KeyedSequencer::new();
//! let mut turn = sequencer.enter(key.clone());
//! tokio::spawn(async move {
//!     turn.ready().await;
//!     // exclusive for `key` until `turn` drops
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Passed from a finished turn to its successor. Carries the finished turn's
/// own predecessor when it was dropped before getting its turn.
struct Handoff(Option<oneshot::Receiver<Handoff>>);

struct Tail {
    generation: u64,
    // Resolves when the newest turn for the key is done.
    done: oneshot::Receiver<Handoff>,
}

struct Tails<K> {
    by_key: HashMap<K, Tail>,
    next_generation: u64,
}

/// Issues FIFO turns per key.
pub struct KeyedSequencer<K> {
    tails: Arc<Mutex<Tails<K>>>,
}

impl<K> Clone for KeyedSequencer<K> {
    fn clone(&self) -> Self {
        Self {
            tails: Arc::clone(&self.tails),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedSequencer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedSequencer<K> {
    /// Creates an empty sequencer.
    pub fn new() -> Self {
        Self {
            tails: Arc::new(Mutex::new(Tails {
                by_key: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Queues a turn for `key` behind every turn entered before it.
    pub fn enter(&self, key: K) -> Turn<K> {
        let (release, done) = oneshot::channel();
        let mut tails = self.tails.lock();
        tails.next_generation += 1;
        let generation = tails.next_generation;
        let previous = tails.by_key.insert(key.clone(), Tail { generation, done });

        Turn {
            key,
            generation,
            waiting: previous.map(|tail| tail.done),
            release: Some(release),
            tails: Arc::clone(&self.tails),
        }
    }

    /// Number of keys with at least one outstanding turn.
    pub fn active_keys(&self) -> usize {
        self.tails.lock().by_key.len()
    }
}

/// A place in a key's queue. Dropping it lets the next turn proceed.
pub struct Turn<K: Eq + Hash> {
    key: K,
    generation: u64,
    waiting: Option<oneshot::Receiver<Handoff>>,
    release: Option<oneshot::Sender<Handoff>>,
    tails: Arc<Mutex<Tails<K>>>,
}

impl<K: Eq + Hash> Turn<K> {
    /// Waits until every earlier turn for this key has been dropped.
    ///
    /// Cancel safe: if this future is dropped the turn keeps its place.
    pub async fn ready(&mut self) {
        while let Some(waiting) = self.waiting.as_mut() {
            self.waiting = match waiting.await {
                Ok(Handoff(next)) => next,
                Err(_) => None,
            };
        }
    }

    /// The key this turn belongs to.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for Turn<K> {
    fn drop(&mut self) {
        // A turn dropped before its predecessor finished passes that
        // predecessor on, so the successor keeps waiting for it.
        let pending = self.waiting.take();
        if let Some(release) = self.release.take() {
            let _ = release.send(Handoff(pending));
        }

        let mut tails = self.tails.lock();
        let is_last = tails
            .by_key
            .get(&self.key)
            .is_some_and(|tail| tail.generation == self.generation);
        if is_last {
            tails.by_key.remove(&self.key);
        }
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for Turn<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Turn")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("ready", &self.waiting.is_none())
            .finish()
    }
}

impl<K> fmt::Debug for KeyedSequencer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSequencer")
            .field("active_keys", &self.tails.lock().by_key.len())
            .finish()
    }
}
