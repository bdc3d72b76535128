//! Typed packet bodies carried inside envelope payloads.
//!
//! The command field of the envelope selects the coarse handling path;
//! the body selects the exact operation. Bodies are bincode-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::identity::IdentityDoc;
use crate::types::{GlobalId, IdUrl, PacketId, QueueId};

/// One message in a group queue.
///
/// `sequence_id` is `None` while the message travels producer to primary
/// broker; the primary assigns it and it stays fixed from then on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub queue_id: QueueId,
    pub sequence_id: Option<u64>,
    pub producer_id: GlobalId,
    pub producer_packet_id: PacketId,
    pub created_ts: DateTime<Utc>,
    /// Payload encrypted with the group symmetric key.
    pub encrypted_payload: Vec<u8>,
    /// Producer's signature over the encrypted payload.
    pub signature: Vec<u8>,
}

/// Consumer or producer attaching to a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConnect {
    pub queue_id: QueueId,
    pub consumer_id: GlobalId,
    /// Highest sequence id the consumer already holds; -1 encoded as None.
    pub last_sequence_id: Option<u64>,
    /// Proof of group membership: the group key id signed by the member.
    pub group_key_signature: Vec<u8>,
}

/// Request for messages the consumer missed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCatchUp {
    pub queue_id: QueueId,
    pub consumer_id: GlobalId,
    pub from_sequence_id: u64,
}

/// Catch-up response: live messages plus archive snapshots for the older
/// ranges, each snapshot covering `first..=last` sequence ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCatchUpResult {
    pub queue_id: QueueId,
    pub head_sequence_id: Option<u64>,
    pub live: Vec<QueueMessage>,
    pub snapshots: Vec<ArchiveSnapshot>,
}

/// A batch of consecutive queue messages, encrypted with the group key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSnapshot {
    pub queue_alias: String,
    pub first_sequence_id: u64,
    pub last_sequence_id: u64,
    /// Encrypted bincode of `Vec<QueueMessage>`.
    pub encrypted_batch: Vec<u8>,
    /// Broker's signature over the encrypted batch.
    pub signature: Vec<u8>,
}

/// Service negotiation: hiring suppliers, attaching to queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Hire the remote as storage supplier at a slate position.
    Supplier {
        customer_id: IdUrl,
        ecc_map: String,
        position: u32,
    },
    /// Ask the remote to host a queue as broker at a triple position.
    Broker {
        queue_id: QueueId,
        position: u32,
        /// Brokers already in the triple, by position.
        peers: Vec<(u32, IdUrl)>,
        revision: u64,
    },
    /// Attach as consumer/producer of a hosted queue.
    QueueConsumer(QueueConnect),
}

/// Reverse of [`ServiceRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceCancel {
    Supplier { customer_id: IdUrl, position: u32 },
    Broker { queue_id: QueueId },
    QueueConsumer { queue_id: QueueId, consumer_id: GlobalId },
}

/// A symmetric key granted to another user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyGrant {
    pub key_id: GlobalId,
    pub label: String,
    pub ecc_map: String,
    /// Key material wrapped for the recipient ([`crate::crypto::wrap_key_for`]).
    pub wrapped_key: Vec<u8>,
    /// The granter's current broker triple for groups, so the recipient can
    /// join without a DHT round trip.
    pub brokers: Vec<(u32, IdUrl)>,
    pub brokers_revision: u64,
}

/// Challenge: prove possession of a key by signing the nonce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyAuditChallenge {
    pub key_id: GlobalId,
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyAuditResponse {
    pub key_id: GlobalId,
    pub nonce_signature: Vec<u8>,
}

/// A private message between two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateMessage {
    pub sender_key_id: GlobalId,
    pub recipient_key_id: GlobalId,
    pub message_id: PacketId,
    pub created_ts: DateTime<Utc>,
    /// Payload wrapped for the recipient's public key.
    pub wrapped_payload: Vec<u8>,
}

/// Stored file listing request/response (supplier side).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileListing {
    pub customer_id: GlobalId,
    pub paths: Vec<String>,
}

/// The typed content of an envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Body {
    Empty,
    Text(String),
    /// A full identity document (Identity command, propagation and pings).
    Identity(IdentityDoc),
    /// Producer push, broker fan-out and broker-to-broker replication.
    Queue(QueueMessage),
    QueueReplica(QueueMessage),
    CatchUp(QueueCatchUp),
    CatchUpResult(QueueCatchUpResult),
    Archive(ArchiveSnapshot),
    Service(ServiceRequest),
    ServiceCancel(ServiceCancel),
    KeyGrant(KeyGrant),
    KeyAuditChallenge(KeyAuditChallenge),
    KeyAuditResponse(KeyAuditResponse),
    Private(PrivateMessage),
    Files(FileListing),
    /// Raw stored data block (supplier upload/retrieve).
    Block { remote_path: String, data: Vec<u8> },
}

impl Body {
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Body(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(data).map_err(|e| EnvelopeError::Body(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GlobalUser;

    fn user(n: &str) -> GlobalUser {
        GlobalUser {
            nickname: n.into(),
            host: "id.example.com".into(),
            port: 8084,
        }
    }

    #[test]
    fn queue_message_round_trip() {
        let body = Body::Queue(QueueMessage {
            queue_id: QueueId::new("group_0a1b2c", user("alice"), user("carl")),
            sequence_id: Some(7),
            producer_id: GlobalId::master(user("bob")),
            producer_packet_id: PacketId::random(),
            created_ts: Utc::now(),
            encrypted_payload: vec![1, 2, 3],
            signature: vec![9; 64],
        });
        let bytes = body.encode().unwrap();
        assert_eq!(Body::decode(&bytes).unwrap(), body);
    }

    #[test]
    fn garbage_body_rejected() {
        assert!(Body::decode(&[0xFF; 3]).is_err());
    }
}
