use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationKey, State};
use crate::data::Data;
use crate::error::PersistenceResult;
use crate::persistence::ConversationMap;

/// The four persisted records as one serializable value.
///
/// Every map is ordered, so serializing the same contents always yields the
/// same bytes. Conversation keys are stored in their encoded form.
///
/// ```json
/// {
///   "user_data": { "7": { "name": "Ada" } },
///   "chat_data": {},
///   "bot_data": {},
///   "conversations": { "signup": { "[42,7]": "AWAITING_AGE" } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    /// Per-user data.
    #[serde(default)]
    pub user_data: BTreeMap<i64, Data>,
    /// Per-chat data.
    #[serde(default)]
    pub chat_data: BTreeMap<i64, Data>,
    /// Process-global data.
    #[serde(default)]
    pub bot_data: Data,
    /// Handler name → encoded key → state label.
    #[serde(default)]
    pub conversations: BTreeMap<String, BTreeMap<String, State>>,
}

impl PersistedDocument {
    /// Parses a document.
    pub fn from_json(json: &str) -> PersistenceResult<Self> {
        let document: Self = serde_json::from_str(json)?;
        // Reject undecodable keys up front instead of on first load.
        for entries in document.conversations.values() {
            for key in entries.keys() {
                ConversationKey::decode(key)?;
            }
        }
        Ok(document)
    }

    /// Serializes the document in its canonical, pretty-printed form.
    pub fn to_json(&self) -> PersistenceResult<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Returns the data of one user, empty if unknown.
    pub fn user(&self, user_id: i64) -> Data {
        self.user_data.get(&user_id).cloned().unwrap_or_default()
    }

    /// Returns the data of one chat, empty if unknown.
    pub fn chat(&self, chat_id: i64) -> Data {
        self.chat_data.get(&chat_id).cloned().unwrap_or_default()
    }

    /// Decodes the conversations of one handler.
    pub fn conversations_of(&self, name: &str) -> PersistenceResult<ConversationMap> {
        let Some(entries) = self.conversations.get(name) else {
            return Ok(ConversationMap::new());
        };
        entries
            .iter()
            .map(|(key, state)| Ok((ConversationKey::decode(key)?, state.clone())))
            .collect()
    }

    /// Sets the data of one user. Returns `false` if nothing changed.
    pub fn set_user(&mut self, user_id: i64, data: &Data) -> bool {
        set_entry(&mut self.user_data, user_id, data)
    }

    /// Sets the data of one chat. Returns `false` if nothing changed.
    pub fn set_chat(&mut self, chat_id: i64, data: &Data) -> bool {
        set_entry(&mut self.chat_data, chat_id, data)
    }

    /// Sets the global data. Returns `false` if nothing changed.
    pub fn set_bot(&mut self, data: &Data) -> bool {
        if &self.bot_data == data {
            return false;
        }
        self.bot_data = data.clone();
        true
    }

    /// Sets or removes one conversation. Returns `false` if nothing changed.
    pub fn set_conversation(
        &mut self,
        name: &str,
        key: &ConversationKey,
        state: Option<&State>,
    ) -> bool {
        let encoded = key.encode();
        match state {
            Some(state) => {
                let entries = self.conversations.entry(name.to_string()).or_default();
                if entries.get(&encoded) == Some(state) {
                    return false;
                }
                entries.insert(encoded, state.clone());
                true
            }
            None => {
                let Some(entries) = self.conversations.get_mut(name) else {
                    return false;
                };
                let removed = entries.remove(&encoded).is_some();
                if entries.is_empty() {
                    self.conversations.remove(name);
                }
                removed
            }
        }
    }
}

/// Empty maps are not stored; an absent entry already reads as empty.
fn set_entry(map: &mut BTreeMap<i64, Data>, id: i64, data: &Data) -> bool {
    match map.get(&id) {
        Some(current) if current == data => false,
        None if data.is_empty() => false,
        _ => {
            if data.is_empty() {
                map.remove(&id);
            } else {
                map.insert(id, data.clone());
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::KeyPart;
    use serde_json::json;

    fn sample() -> PersistedDocument {
        let mut doc = PersistedDocument::default();
        let mut data = Data::new();
        data.insert("name".into(), json!("Ada"));
        doc.set_user(7, &data);
        doc.set_conversation(
            "signup",
            &ConversationKey::new([KeyPart::Id(42), KeyPart::Id(7)]),
            Some(&State::from("AGE")),
        );
        doc
    }

    #[test]
    fn test_canonical_form_is_a_fixpoint() {
        let json = sample().to_json().unwrap();
        let reparsed = PersistedDocument::from_json(&json).unwrap();
        assert_eq!(reparsed, sample());
        assert_eq!(reparsed.to_json().unwrap(), json);
    }

    #[test]
    fn test_set_reports_changes() {
        let mut doc = sample();
        let mut data = Data::new();
        data.insert("name".into(), json!("Ada"));
        assert!(!doc.set_user(7, &data));
        assert!(!doc.set_chat(1, &Data::new()));
        data.insert("age".into(), json!(36));
        assert!(doc.set_user(7, &data));
        assert!(doc.set_user(7, &Data::new()));
        assert!(doc.user_data.is_empty());
    }

    #[test]
    fn test_removing_one_conversation_keeps_others() {
        let mut doc = sample();
        let other = ConversationKey::new([KeyPart::Id(42), KeyPart::Id(8)]);
        doc.set_conversation("signup", &other, Some(&State::from("AGE")));

        let first = ConversationKey::new([KeyPart::Id(42), KeyPart::Id(7)]);
        assert!(doc.set_conversation("signup", &first, None));
        assert!(!doc.set_conversation("signup", &first, None));

        let remaining = doc.conversations_of("signup").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.get(&other), Some(&State::from("AGE")));
    }

    #[test]
    fn test_rejects_bad_conversation_key() {
        let json = r#"{"conversations": {"signup": {"not a key": "A"}}}"#;
        assert!(PersistedDocument::from_json(json).is_err());
    }
}
