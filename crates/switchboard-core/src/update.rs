//! Update model for the Switchboard dispatcher.
//!
//! The dispatcher never looks inside an update beyond a handful of identity
//! fields. Transports bring their own event types and implement [`Update`]
//! for them; [`BasicUpdate`] covers the common case of a transport that just
//! decodes JSON.
//!
//! ```rust,ignore
//! use switchboard_core::{BasicUpdate, BoxedUpdate};
//!
//! let update: BoxedUpdate = BasicUpdate::message(1, 42, 7, "/start").into_boxed();
//! assert_eq!(update.chat_id(), Some(42));
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// Update Kind Classification
// ============================================================================

/// Coarse classification of an update.
///
/// Handlers use this to decide eligibility without downcasting, e.g. a
/// conversation ignores channel posts and a callback-query handler ignores
/// everything but callback queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// A new message in a private chat or group.
    Message,
    /// An edit of a previously sent message.
    EditedMessage,
    /// A post in a broadcast channel.
    ChannelPost,
    /// A button press on an inline keyboard.
    CallbackQuery,
    /// Anything else.
    #[default]
    Other,
}

impl UpdateKind {
    /// Returns `true` for message-like updates (new or edited messages).
    pub fn is_message(self) -> bool {
        matches!(self, Self::Message | Self::EditedMessage)
    }
}

// ============================================================================
// Core Update Trait
// ============================================================================

/// An incoming event as seen by the dispatcher.
///
/// Only identity matters here: handlers filter and key on these fields. Every
/// accessor except [`update_id`](Update::update_id) and [`kind`](Update::kind)
/// defaults to `None` so event types only implement what they carry.
///
/// Concrete types can be recovered through [`as_any`](Update::as_any) or the
/// `downcast_ref` helper on `dyn Update`.
pub trait Update: Any + Send + Sync + fmt::Debug {
    /// Monotonic identifier assigned by the source.
    fn update_id(&self) -> i64;

    /// The coarse kind of this update.
    fn kind(&self) -> UpdateKind;

    /// The chat the update originated in.
    fn chat_id(&self) -> Option<i64> {
        None
    }

    /// The user that caused the update.
    fn user_id(&self) -> Option<i64> {
        None
    }

    /// The message the update refers to (for callback queries: the message
    /// carrying the keyboard).
    fn message_id(&self) -> Option<i64> {
        None
    }

    /// Identifier of an inline message, for callback queries raised on
    /// messages sent in inline mode.
    fn inline_message_id(&self) -> Option<&str> {
        None
    }

    /// Message text, if any.
    fn text(&self) -> Option<&str> {
        None
    }

    /// Callback data attached to the pressed button, if any.
    fn callback_data(&self) -> Option<&str> {
        None
    }

    /// Returns `self` as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Update {
    /// Attempts to downcast to a concrete update type.
    pub fn downcast_ref<T: Update>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns `true` if the update is of type `T`.
    pub fn is<T: Update>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A shared, type-erased update.
///
/// Cloning is cheap; the dispatcher hands the same update to every group and
/// to worker tasks.
pub type BoxedUpdate = Arc<dyn Update>;

// ============================================================================
// BasicUpdate
// ============================================================================

/// A plain serializable update carrying only the identity fields.
///
/// ```rust,ignore
/// let update = BasicUpdate::callback_query(5, 42, 7, 100, "yes");
/// assert_eq!(update.kind, UpdateKind::CallbackQuery);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicUpdate {
    /// Identifier assigned by the source.
    pub update_id: i64,
    /// Coarse kind.
    #[serde(default)]
    pub kind: UpdateKind,
    /// Originating chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    /// Originating user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Referenced message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    /// Referenced inline message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
    /// Message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Callback data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl BasicUpdate {
    /// A new text message from `user_id` in `chat_id`.
    pub fn message(update_id: i64, chat_id: i64, user_id: i64, text: impl Into<String>) -> Self {
        Self {
            update_id,
            kind: UpdateKind::Message,
            chat_id: Some(chat_id),
            user_id: Some(user_id),
            message_id: Some(update_id),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// An edit of an earlier message.
    pub fn edited_message(
        update_id: i64,
        chat_id: i64,
        user_id: i64,
        message_id: i64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: UpdateKind::EditedMessage,
            message_id: Some(message_id),
            ..Self::message(update_id, chat_id, user_id, text)
        }
    }

    /// A channel post. Channel posts have a chat but no user.
    pub fn channel_post(update_id: i64, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            update_id,
            kind: UpdateKind::ChannelPost,
            chat_id: Some(chat_id),
            message_id: Some(update_id),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// A callback query raised on `message_id` in `chat_id`.
    pub fn callback_query(
        update_id: i64,
        chat_id: i64,
        user_id: i64,
        message_id: i64,
        data: impl Into<String>,
    ) -> Self {
        Self {
            update_id,
            kind: UpdateKind::CallbackQuery,
            chat_id: Some(chat_id),
            user_id: Some(user_id),
            message_id: Some(message_id),
            callback_data: Some(data.into()),
            ..Default::default()
        }
    }

    /// A callback query raised on an inline message. There is no chat.
    pub fn inline_callback_query(
        update_id: i64,
        user_id: i64,
        inline_message_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            update_id,
            kind: UpdateKind::CallbackQuery,
            user_id: Some(user_id),
            inline_message_id: Some(inline_message_id.into()),
            callback_data: Some(data.into()),
            ..Default::default()
        }
    }

    /// Wraps this update into a [`BoxedUpdate`].
    pub fn into_boxed(self) -> BoxedUpdate {
        Arc::new(self)
    }
}

impl Update for BasicUpdate {
    fn update_id(&self) -> i64 {
        self.update_id
    }

    fn kind(&self) -> UpdateKind {
        self.kind
    }

    fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }

    fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    fn inline_message_id(&self) -> Option<&str> {
        self.inline_message_id.as_deref()
    }

    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    fn callback_data(&self) -> Option<&str> {
        self.callback_data.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
