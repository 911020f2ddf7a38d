//! Conversation identity and state labels.
//!
//! A [`ConversationKey`] is a tuple of identifiers picked from an update
//! according to a conversation's `per_chat`/`per_user`/`per_message`
//! settings. Two updates with equal keys belong to the same state machine.
//!
//! Keys are persisted as map keys, so they carry an explicit textual codec:
//! [`ConversationKey::encode`] renders the tuple as a JSON array and
//! [`ConversationKey::decode`] parses it back into an equal key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, PersistenceResult};

// ============================================================================
// KeyPart
// ============================================================================

/// One component of a [`ConversationKey`].
///
/// Chat, user and message ids are integers; inline message ids are opaque
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// A numeric id.
    Id(i64),
    /// A textual id.
    Text(String),
}

impl From<i64> for KeyPart {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for KeyPart {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Text(text) => write!(f, "{text:?}"),
        }
    }
}

// ============================================================================
// ConversationKey
// ============================================================================

/// Identity of a single conversation instance.
///
/// Equality and hashing are structural, so the same key computed from two
/// different updates addresses the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(Vec<KeyPart>);

impl ConversationKey {
    /// Creates a key from its parts, in order.
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// Returns the parts of this key.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Encodes the key as a JSON array, e.g. `[42,7]`.
    pub fn encode(&self) -> String {
        // A Vec of i64/String cannot fail to serialize.
        serde_json::to_string(&self.0).unwrap_or_else(|_| String::from("[]"))
    }

    /// Decodes a key produced by [`encode`](Self::encode).
    pub fn decode(encoded: &str) -> PersistenceResult<Self> {
        serde_json::from_str::<Vec<KeyPart>>(encoded)
            .map(Self)
            .map_err(|e| PersistenceError::InvalidKey {
                key: encoded.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str(")")
    }
}

// ============================================================================
// State
// ============================================================================

/// A caller-defined conversation state label.
///
/// The terminal state is not a label; conversations end through
/// `Transition::End` in the framework crate and their entry is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    /// Creates a state label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl From<String> for State {
    fn from(label: String) -> Self {
        Self(label)
    }
}

impl From<i64> for State {
    fn from(label: i64) -> Self {
        Self(label.to_string())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
