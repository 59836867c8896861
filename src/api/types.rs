//! Request and response payloads of the REST API
//!
//! Field names follow the server's camelCase JSON. Local-only bookkeeping on
//! [`Message`] (`delivery`, `origin`) is never serialized.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// The signed-in user's profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Server identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Phone number, absent for device sessions.
    #[serde(default)]
    pub phone: Option<String>,
    /// Preferred language code.
    #[serde(default)]
    pub language: Option<String>,
    /// Village or district, used to localize answers.
    #[serde(default)]
    pub location: Option<String>,
    /// Crops the user grows.
    #[serde(default)]
    pub crops: Vec<String>,
    /// Livestock the user keeps.
    #[serde(default)]
    pub livestock: Vec<String>,
}

/// Partial profile update for `PATCH /user`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New preferred language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// New location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Replacement crop list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crops: Option<Vec<String>>,
    /// Replacement livestock list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub livestock: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Body of `POST /auth/device`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthRequest {
    /// Stable device identifier.
    pub device_id: String,
}

/// Body of `POST /auth/phone/login` and `POST /auth/phone/register`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneAuthRequest {
    /// Phone number.
    pub phone: String,
    /// Password.
    pub password: String,
    /// Display name (register only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Device identifier, so the device's history can be linked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Refresh token of the current session.
    pub refresh_token: String,
}

/// Payload returned by every auth endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// New bearer token.
    pub access_token: String,
    /// New refresh token.
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Relative expiry in seconds, used when `expires_at` is absent.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Profile of the authenticated user.
    #[serde(default)]
    pub user: Option<User>,
    /// User identifier, when the profile is not embedded.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl AuthPayload {
    /// Convert into a [`Session`]. `fallback_user` supplies the user id when
    /// the payload carries none (refresh responses).
    ///
    /// Tokens with no expiry information are given one hour.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Decode`] if the expiry is outside the
    /// representable time range.
    pub fn into_session(self, fallback_user: Option<&str>) -> Result<Session, ApiError> {
        let now = Utc::now();
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(millis), _) => DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| ApiError::Decode(format!("expiresAt out of range: {}", millis)))?,
            (None, Some(secs)) => chrono::Duration::try_seconds(secs)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| ApiError::Decode(format!("expiresIn out of range: {}", secs)))?,
            (None, None) => now + chrono::Duration::hours(1),
        };
        let user_id = self
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .or(self.user_id)
            .or_else(|| fallback_user.map(str::to_string))
            .unwrap_or_default();
        Ok(Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Conversation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Server identifier.
    pub id: String,
    /// Title in the language it was generated in.
    #[serde(default)]
    pub title: Option<String>,
    /// Titles keyed by language code.
    #[serde(default)]
    pub localized_titles: HashMap<String, String>,
    /// Preview of the most recent message.
    #[serde(default)]
    pub last_message: Option<String>,
    /// Topic tags (crop, disease, ...).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time; orders the conversation list.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Title for `language`, falling back to the default title.
    pub fn title_for(&self, language: &str) -> Option<&str> {
        self.localized_titles
            .get(language)
            .map(String::as_str)
            .or(self.title.as_deref())
    }
}

/// Body of `POST /conversations`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    /// Optional initial title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Optional tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Local delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Accepted by the server, or received from it.
    #[default]
    Sent,
    /// Inserted optimistically, send in progress.
    Pending,
    /// Send failed; may be retried or discarded.
    Failed,
}

/// Which input last wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// REST snapshot.
    #[default]
    Rest,
    /// Streaming events.
    Streaming,
    /// Client-side optimistic insert.
    Local,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server identifier, or a client-generated one before acknowledgement.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Text content.
    pub content: String,
    /// `true` for user messages, `false` for assistant responses.
    pub is_from_user: bool,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Suggested next questions (assistant messages).
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    /// `false` while an assistant response is still streaming.
    #[serde(default = "default_complete")]
    pub is_complete: bool,
    /// Local delivery status.
    #[serde(skip)]
    pub delivery: Delivery,
    /// Local provenance.
    #[serde(skip)]
    pub origin: Origin,
}

fn default_complete() -> bool {
    true
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: String,
    /// Text content.
    pub content: String,
    /// Client-generated id, echoed so the server copy can be matched.
    pub client_id: String,
    /// Active language.
    pub language: String,
}

/// Body of `POST /messages/{id}/rating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    /// 1 (unhelpful) to 5 (very helpful).
    pub rating: u8,
}

/// Body of `POST /starter-questions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StarterQuestionsRequest {
    /// Active language.
    pub language: String,
}

/// Body of `POST /follow-up-questions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpQuestionsRequest {
    /// Conversation the questions relate to.
    pub conversation_id: String,
    /// Message the questions follow.
    pub message_id: String,
    /// Active language.
    pub language: String,
}

/// Payload of the question endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionsPayload {
    /// Suggested questions.
    pub questions: Vec<String>,
}

/// Payload of `POST /transcribe`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    /// Recognized text.
    pub text: String,
}
