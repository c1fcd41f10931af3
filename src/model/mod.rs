//! Chat record types stored in the primary container.
//!
//! All three record kinds share one container and one partition (the owning
//! session's id), which is what makes the atomic multi-record batch possible.
//! Wire format is camelCase JSON; the `type` field is the discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{PartitionKey, RecordKind, Result, StoreError};

/// One conversation. The record id doubles as the partition key of the
/// primary container, so every message and completion prompt of the session
/// lands in the same partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub session_id: String,
    pub upn: String,
    pub name: String,
    pub tokens_used: u32,
    #[serde(default)]
    pub deleted: bool,
}

impl Session {
    /// New plain session owned by `upn`.
    pub fn new(upn: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            id: id.clone(),
            record_type: RecordKind::Session.as_str().to_string(),
            session_id: id,
            upn: upn.into(),
            name: "New Chat".to_string(),
            tokens_used: 0,
            deleted: false,
        }
    }

    /// New kiosk-mode session. Same shape, different discriminator, so the
    /// two flavors can be listed separately.
    pub fn new_kiosk(upn: impl Into<String>) -> Self {
        let mut session = Self::new(upn);
        session.record_type = RecordKind::KioskSession.as_str().to_string();
        session
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.session_id)
    }

    /// Accumulate token usage from one completion round.
    pub fn add_tokens_used(&mut self, tokens: u32) {
        self.tokens_used += tokens;
    }
}

/// Who produced a message turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    User,
    Assistant,
}

/// A source reference attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub id: String,
    pub source_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub session_id: String,
    pub upn: String,
    pub sender: Sender,
    pub tokens: u32,
    pub time_stamp: DateTime<Utc>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    /// Back-reference to the audit record of the prompt that produced this
    /// message. Set on assistant messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_prompt_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        upn: impl Into<String>,
        sender: Sender,
        tokens: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_type: RecordKind::Message.as_str().to_string(),
            session_id: session_id.into(),
            upn: upn.into(),
            sender,
            tokens,
            time_stamp: Utc::now(),
            text: text.into(),
            rating: None,
            vector: None,
            citations: None,
            completion_prompt_id: None,
            deleted: false,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = Some(citations);
        self
    }

    pub fn with_completion_prompt_id(mut self, id: impl Into<String>) -> Self {
        self.completion_prompt_id = Some(id.into());
        self
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.session_id)
    }
}

/// Audit record of the exact prompt text sent to the completion backend for
/// one assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPrompt {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub deleted: bool,
}

impl CompletionPrompt {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_type: RecordKind::CompletionPrompt.as_str().to_string(),
            session_id: session_id.into(),
            prompt: prompt.into(),
            deleted: false,
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.session_id)
    }
}

/// The fixed set of record kinds that may appear in one atomic batch.
///
/// The batch write API takes these instead of untyped documents, so a batch
/// can only ever contain records that carry a session partition key, and the
/// same-partition invariant is checked before anything is serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionRecord {
    Session(Session),
    Message(Message),
    CompletionPrompt(CompletionPrompt),
}

impl SessionRecord {
    pub fn id(&self) -> &str {
        match self {
            SessionRecord::Session(s) => &s.id,
            SessionRecord::Message(m) => &m.id,
            SessionRecord::CompletionPrompt(p) => &p.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionRecord::Session(s) => &s.session_id,
            SessionRecord::Message(m) => &m.session_id,
            SessionRecord::CompletionPrompt(p) => &p.session_id,
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.session_id())
    }

    pub fn to_body(&self) -> Result<serde_json::Value> {
        let body = match self {
            SessionRecord::Session(s) => serde_json::to_value(s)?,
            SessionRecord::Message(m) => serde_json::to_value(m)?,
            SessionRecord::CompletionPrompt(p) => serde_json::to_value(p)?,
        };
        Ok(body)
    }
}

impl From<Session> for SessionRecord {
    fn from(value: Session) -> Self {
        Self::Session(value)
    }
}

impl From<Message> for SessionRecord {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<CompletionPrompt> for SessionRecord {
    fn from(value: CompletionPrompt) -> Self {
        Self::CompletionPrompt(value)
    }
}

/// Parse a record's `type` discriminator.
pub fn record_kind_of(body: &serde_json::Value) -> Option<RecordKind> {
    match body.get("type").and_then(serde_json::Value::as_str) {
        Some("Session") => Some(RecordKind::Session),
        Some("KioskSession") => Some(RecordKind::KioskSession),
        Some("Message") => Some(RecordKind::Message),
        Some("CompletionPrompt") => Some(RecordKind::CompletionPrompt),
        _ => None,
    }
}

/// Identity-context guard: operations that scope results to an owning user
/// must not run without one.
pub fn require_upn(upn: &str) -> Result<()> {
    if upn.trim().is_empty() {
        return Err(StoreError::InvalidOperation(
            "an owning-user identifier (upn) is required for this operation".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_wire_shape() {
        let session = Session::new("alice@example.com").with_name("Trip planning");
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["type"], "Session");
        assert_eq!(json["sessionId"], json["id"]);
        assert_eq!(json["upn"], "alice@example.com");
        assert_eq!(json["name"], "Trip planning");
        assert_eq!(json["tokensUsed"], 0);
        assert_eq!(json["deleted"], false);
    }

    #[test]
    fn test_kiosk_session_discriminator() {
        let session = Session::new_kiosk("kiosk@example.com");
        assert_eq!(session.record_type, "KioskSession");
    }

    #[test]
    fn test_message_optional_fields_omitted() {
        let message = Message::new("s-1", "alice@example.com", Sender::User, 12, "hello");
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "Message");
        assert_eq!(json["sender"], "User");
        assert!(json.get("rating").is_none());
        assert!(json.get("vector").is_none());
        assert!(json.get("completionPromptId").is_none());
    }

    #[test]
    fn test_message_round_trip() {
        let message = Message::new("s-1", "alice@example.com", Sender::Assistant, 40, "hi")
            .with_vector(vec![0.1, 0.2, 0.3])
            .with_completion_prompt_id("cp-1");

        let json = serde_json::to_value(&message).unwrap();
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_session_record_shares_partition_key() {
        let session = Session::new("alice@example.com");
        let message = Message::new(&session.id, "alice@example.com", Sender::User, 1, "x");
        let prompt = CompletionPrompt::new(&session.id, "system: be brief");

        let records: Vec<SessionRecord> =
            vec![session.clone().into(), message.into(), prompt.into()];
        assert!(
            records
                .iter()
                .all(|r| r.partition_key() == session.partition_key())
        );
    }

    #[test]
    fn test_require_upn() {
        assert!(require_upn("alice@example.com").is_ok());
        assert!(matches!(
            require_upn(""),
            Err(StoreError::InvalidOperation(_))
        ));
        assert!(matches!(
            require_upn("   "),
            Err(StoreError::InvalidOperation(_))
        ));
    }
}
