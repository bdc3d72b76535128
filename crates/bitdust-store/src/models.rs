//! Rows and state records persisted locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// One registered key. `local_key_id` is the compact foreign key the
/// message tables reference; renaming a key under identity rotation
/// rewrites `key_id` in place and leaves `local_key_id` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRow {
    pub local_key_id: i64,
    /// Global key id, e.g. `master$alice@id-a.example.com_8084`.
    pub key_id: String,
    /// Hex-encoded Ed25519 public key; unique, the logical identity of the row.
    pub public_key: String,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Incoming => "in",
            MessageDirection::Outgoing => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Self::Incoming),
            "out" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageType {
    PrivateMessage,
    GroupMessage,
    PersonalMessage,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PrivateMessage => "private_message",
            MessageType::GroupMessage => "group_message",
            MessageType::PersonalMessage => "personal_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private_message" => Some(Self::PrivateMessage),
            "group_message" => Some(Self::GroupMessage),
            "personal_message" => Some(Self::PersonalMessage),
            _ => None,
        }
    }
}

/// One stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRow {
    /// Message id: the packet id for private messages, `queue:<seq>` for
    /// group messages.
    pub id: String,
    pub conversation_id: String,
    pub sender_local_key_id: i64,
    pub recipient_local_key_id: i64,
    pub direction: MessageDirection,
    pub message_type: MessageType,
    /// Decrypted message payload (JSON bytes).
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Conversation index row; `last_updated_at` is monotone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub message_type: MessageType,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub last_message_id: Option<String>,
}

/// Conversation id rules: `min&max` of the two local key ids for private
/// chats, `k&k` for group and personal conversations.
pub fn private_conversation_id(a: i64, b: i64) -> String {
    format!("{}&{}", a.min(b), a.max(b))
}

pub fn group_conversation_id(k: i64) -> String {
    format!("{k}&{k}")
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Serialized per-group state, one JSON file under `groups/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_key_id: String,
    /// Highest sequence id known locally; -1 before the first message.
    pub last_sequence_id: i64,
    pub active: bool,
    pub archive_folder_path: String,
    /// Current broker triple by position.
    pub brokers: Vec<(u32, String)>,
    pub brokers_revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_order_independent() {
        assert_eq!(private_conversation_id(7, 3), "3&7");
        assert_eq!(private_conversation_id(3, 7), "3&7");
        assert_eq!(group_conversation_id(5), "5&5");
    }

    #[test]
    fn enum_round_trips() {
        for d in [MessageDirection::Incoming, MessageDirection::Outgoing] {
            assert_eq!(MessageDirection::parse(d.as_str()), Some(d));
        }
        for t in [
            MessageType::PrivateMessage,
            MessageType::GroupMessage,
            MessageType::PersonalMessage,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
    }
}
