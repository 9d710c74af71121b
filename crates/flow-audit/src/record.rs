use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a correlated user session: connections from one client IP
/// within an activity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Identifier of one TCP connection's lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u64);

/// Escalation state of a session. Only ever raised, never lowered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    #[default]
    None,
    /// At least one message carried tags.
    Marked,
    /// At least one request was dropped.
    Blocked,
}

impl AlertLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            AlertLevel::None => 0,
            AlertLevel::Marked => 1,
            AlertLevel::Blocked => 2,
        }
    }
}

/// The category of a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SessionOpened,
    StreamOpened,
    StreamClosed,
    Request,
    Response,
    AlertRaised,
}

/// One append-only journal entry: a ledger mutation with its context ids and
/// free-form details, serialised as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct JournalRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamId>,
    pub details: serde_json::Value,
}

impl JournalRecord {
    /// Create a record stamped with the current UTC time and no context ids.
    pub fn new(kind: RecordKind, details: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session: None,
            stream: None,
            details,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_stream(mut self, stream: StreamId) -> Self {
        self.stream = Some(stream);
        self
    }
}
