//! Core data types
//!
//! Semantic types shared by the agents, pipeline, supervisor, and the
//! session hub. The wire shapes (camelCase JSON, ISO-8601 timestamps)
//! live here too so the boundary encoders stay thin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary identity of an agent: one synchronized mailbox of one user.
///
/// Equality and hashing are defined on the composite so the registries
/// never need nested lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub user_id: String,
    pub email: String,
}

impl AccountKey {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.email)
    }
}

/// Deterministic exactly-once key for a message.
pub fn message_id(user_id: &str, email: &str, uid: u64) -> String {
    format!("{}|{}|{}", user_id, email, uid)
}

/// Closed set of classification labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
    Uncategorized,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "Interested",
            Self::MeetingBooked => "Meeting Booked",
            Self::NotInterested => "Not Interested",
            Self::Spam => "Spam",
            Self::OutOfOffice => "Out of Office",
            Self::Uncategorized => "Uncategorized",
        }
    }

    /// Parse a label returned by a model. Case-insensitive, trimmed;
    /// `None` when the reply is not one of the closed set.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase();
        match normalized.as_str() {
            "interested" => Some(Self::Interested),
            "meeting booked" => Some(Self::MeetingBooked),
            "not interested" => Some(Self::NotInterested),
            "spam" => Some(Self::Spam),
            "out of office" => Some(Self::OutOfOffice),
            "uncategorized" => Some(Self::Uncategorized),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed IMAP envelope fields the pipeline needs.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
}

/// A message as fetched from the server, before ingestion.
/// Discarded once the pipeline has produced a [`StoredMessage`].
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u64,
    pub envelope: MessageEnvelope,
    pub source: Vec<u8>,
}

/// A fully ingested message as persisted in the email index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub user_id: String,
    pub email: String,
    pub folder: String,
    pub uid: u64,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub body: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of a mailbox agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Syncing,
    Idle,
    Error(String),
    Stopped,
}

impl AgentState {
    /// Wire label for status frames. The error message travels separately.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Syncing => "syncing",
            Self::Idle => "idle",
            Self::Error(_) => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "error: {}", msg),
            other => f.write_str(other.label()),
        }
    }
}

/// Emitted by the pipeline after a successful insert.
#[derive(Debug, Clone)]
pub struct NewMessageEvent {
    pub user_id: String,
    pub email: String,
    pub message: StoredMessage,
    pub at: DateTime<Utc>,
}

/// Emitted by an agent on every state transition.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub user_id: String,
    pub email: String,
    pub state: AgentState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_equality_is_composite() {
        let a = AccountKey::new("u1", "a@x.com");
        let b = AccountKey::new("u1", "a@x.com");
        let c = AccountKey::new("u1", "b@x.com");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn message_id_is_deterministic() {
        assert_eq!(message_id("u1", "a@x.com", 42), "u1|a@x.com|42");
    }

    #[test]
    fn category_labels_round_trip() {
        for cat in [
            Category::Interested,
            Category::MeetingBooked,
            Category::NotInterested,
            Category::Spam,
            Category::OutOfOffice,
            Category::Uncategorized,
        ] {
            assert_eq!(Category::from_label(cat.as_str()), Some(cat));
        }
        assert_eq!(Category::from_label("  meeting booked  "), Some(Category::MeetingBooked));
        assert_eq!(Category::from_label("MEETING BOOKED"), Some(Category::MeetingBooked));
        assert_eq!(Category::from_label("something else"), None);
    }

    #[test]
    fn category_serializes_to_exact_strings() {
        let json = serde_json::to_string(&Category::OutOfOffice).unwrap();
        assert_eq!(json, "\"Out of Office\"");
        let json = serde_json::to_string(&Category::MeetingBooked).unwrap();
        assert_eq!(json, "\"Meeting Booked\"");
    }

    #[test]
    fn stored_message_wire_shape_is_camel_case() {
        let msg = StoredMessage {
            id: "u1|a@x.com|42".into(),
            user_id: "u1".into(),
            email: "a@x.com".into(),
            folder: "INBOX".into(),
            uid: 42,
            subject: "Hello".into(),
            from: "peer@y.com".into(),
            to: vec!["a@x.com".into()],
            date: Utc::now(),
            body: "hi".into(),
            is_read: false,
            is_starred: false,
            category: Category::Uncategorized,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("userId").is_some());
        assert!(value.get("isRead").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn agent_state_labels() {
        assert_eq!(AgentState::Starting.label(), "starting");
        assert_eq!(AgentState::Error("x".into()).label(), "error");
        assert_eq!(AgentState::Error("x".into()).error_message(), Some("x"));
        assert!(AgentState::Stopped.is_terminal());
        assert!(!AgentState::Idle.is_terminal());
    }
}
