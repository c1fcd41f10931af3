use serde::{Deserialize, Serialize};

/// The attribute value that decides which partition (and therefore which
/// atomicity boundary) a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Record type discriminator stored in the `type` field of every document in
/// the primary container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Session,
    KioskSession,
    Message,
    CompletionPrompt,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "Session",
            RecordKind::KioskSession => "KioskSession",
            RecordKind::Message => "Message",
            RecordKind::CompletionPrompt => "CompletionPrompt",
        }
    }

    /// True for either session discriminator (plain or kiosk mode).
    pub fn is_session(&self) -> bool {
        matches!(self, RecordKind::Session | RecordKind::KioskSession)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which flavor of session a caller is listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Session,
    Kiosk,
}

impl SessionKind {
    pub fn record_kind(&self) -> RecordKind {
        match self {
            SessionKind::Session => RecordKind::Session,
            SessionKind::Kiosk => RecordKind::KioskSession,
        }
    }
}
