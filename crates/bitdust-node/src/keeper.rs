//! Message keeper: persists every chat message and fans snapshots out to
//! UI listeners.
//!
//! Senders and recipients are resolved to local key ids before anything
//! touches the database, so history rows survive identity rotation
//! untouched. Private payloads are wrapped for the recipient key;
//! group payloads are encrypted with the group key and arrive here
//! already decrypted by the participant.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use bitdust_id::{IdentityRegistry, MyIdentity};
use bitdust_net::transport::ContactResolver;
use bitdust_shared::crypto;
use bitdust_shared::envelope::Command;
use bitdust_shared::payloads::{Body, PrivateMessage};
use bitdust_shared::types::{GlobalId, IdUrl, PacketId};
use bitdust_net::gate::GateHandle;
use bitdust_store::models::{group_conversation_id, private_conversation_id};
use bitdust_store::{Database, HistoryRow, MessageDirection, MessageType};

use crate::error::{NodeError, Result};
use crate::keys::{KeyManager, ShareKey};
use crate::packets;

/// Snapshot pushed to listeners after every stored message.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub message_type: MessageType,
    pub direction: MessageDirection,
    pub sender_key_id: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub struct MessageKeeper {
    my_id: Arc<MyIdentity>,
    keys: Arc<KeyManager>,
    registry: Arc<IdentityRegistry>,
    db: Arc<Mutex<Database>>,
    gate: GateHandle,
    listeners: broadcast::Sender<MessageEvent>,
}

impl MessageKeeper {
    pub fn new(
        my_id: Arc<MyIdentity>,
        keys: Arc<KeyManager>,
        registry: Arc<IdentityRegistry>,
        db: Arc<Mutex<Database>>,
        gate: GateHandle,
    ) -> Arc<Self> {
        let (listeners, _) = broadcast::channel(256);
        Arc::new(Self {
            my_id,
            keys,
            registry,
            db,
            gate,
            listeners,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.listeners.subscribe()
    }

    // -- private messages ---------------------------------------------------

    /// Send a private message; stores the outgoing row after the Ack.
    pub async fn send_private(&self, recipient: &IdUrl, payload: &[u8]) -> Result<String> {
        let recipient_doc = self.registry.get(recipient, false).await?;
        let recipient_key = recipient_doc
            .verifying_key()
            .map_err(bitdust_id::IdError::Document)?;
        let wrapped_payload = crypto::wrap_key_for(&recipient_key, payload)?;

        let recipient_user = recipient
            .user()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let message = PrivateMessage {
            sender_key_id: self.my_id.master_id()?,
            recipient_key_id: GlobalId::master(recipient_user),
            message_id: PacketId::random(),
            created_ts: Utc::now(),
            wrapped_payload,
        };
        let body = Body::Private(message.clone());
        packets::request(
            &self.gate,
            &self.my_id,
            Command::Message,
            recipient,
            &body,
            None,
        )
        .await?;

        // Stored only after the remote acked, so history never contains
        // messages the network lost.
        let my_local = self.keys.my_local_key_id()?;
        let their_local = self.register_master_key(recipient, &recipient_doc.publickey)?;
        let row = HistoryRow {
            id: message.message_id.to_string(),
            conversation_id: private_conversation_id(my_local, their_local),
            sender_local_key_id: my_local,
            recipient_local_key_id: their_local,
            direction: MessageDirection::Outgoing,
            message_type: MessageType::PrivateMessage,
            payload: payload.to_vec(),
            created_at: message.created_ts,
        };
        self.store_and_notify(row, &message.sender_key_id.to_string())?;
        Ok(message.message_id.to_string())
    }

    /// Inbound private message: decrypt, resolve ids, persist exactly
    /// once, notify.
    pub async fn handle_private(
        &self,
        creator: &IdUrl,
        message: &PrivateMessage,
    ) -> Result<Body> {
        let payload = crypto::unwrap_key_with(
            &self.my_id.local().dh_scalar_bytes(),
            &self.my_id.local().verifying_key(),
            &message.wrapped_payload,
        )?;

        let id = message.message_id.to_string();
        {
            let db = self.db.lock().expect("db lock");
            if db.history_contains(&id)? {
                // At-least-once delivery upstream; exactly once in history.
                return Ok(Body::Empty);
            }
        }

        let sender_key = self
            .registry
            .public_key(creator)
            .await
            .ok_or_else(|| NodeError::Refused("unknown sender".into()))?;
        let sender_local = self.register_master_key(creator, &hex::encode(sender_key))?;
        let my_local = self.keys.my_local_key_id()?;

        let row = HistoryRow {
            id,
            conversation_id: private_conversation_id(sender_local, my_local),
            sender_local_key_id: sender_local,
            recipient_local_key_id: my_local,
            direction: MessageDirection::Incoming,
            message_type: MessageType::PrivateMessage,
            payload,
            created_at: message.created_ts,
        };
        self.store_and_notify(row, &message.sender_key_id.to_string())?;
        Ok(Body::Empty)
    }

    // -- group messages -----------------------------------------------------

    /// Persist one decrypted group message under the group conversation.
    /// Duplicate sequence ids are ignored.
    pub async fn record_group_message(
        &self,
        group: &ShareKey,
        producer: &GlobalId,
        sequence_id: u64,
        payload: Vec<u8>,
        created_ts: DateTime<Utc>,
    ) -> Result<bool> {
        let id = format!("{}:{sequence_id}", group.key_id);
        {
            let db = self.db.lock().expect("db lock");
            if db.history_contains(&id)? {
                return Ok(false);
            }
        }

        let producer_idurl = producer.user.idurl();
        let sender_local = match self.registry.public_key(&producer_idurl).await {
            Some(key) => self.register_master_key(&producer_idurl, &hex::encode(key))?,
            // Producer identity unknown (e.g. replayed archive): fall back
            // to the group key itself as the sender reference.
            None => group.local_key_id,
        };

        let direction = if *producer == self.my_id.master_id()? {
            MessageDirection::Outgoing
        } else {
            MessageDirection::Incoming
        };

        let row = HistoryRow {
            id,
            conversation_id: group_conversation_id(group.local_key_id),
            sender_local_key_id: sender_local,
            recipient_local_key_id: group.local_key_id,
            direction,
            message_type: MessageType::GroupMessage,
            payload,
            created_at: created_ts,
        };
        self.store_and_notify(row, &producer.to_string())?;
        Ok(true)
    }

    pub fn group_history_len(&self, group: &ShareKey) -> Result<u64> {
        let db = self.db.lock().expect("db lock");
        Ok(db.count_history(&group_conversation_id(group.local_key_id))?)
    }

    // -- queries ------------------------------------------------------------

    pub fn history(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HistoryRow>> {
        let db = self.db.lock().expect("db lock");
        Ok(db.list_history(conversation_id, limit, offset)?)
    }

    pub fn conversations(&self) -> Result<Vec<bitdust_store::ConversationRow>> {
        let db = self.db.lock().expect("db lock");
        Ok(db.list_conversations()?)
    }

    // -- internals ----------------------------------------------------------

    fn register_master_key(&self, idurl: &IdUrl, public_key_hex: &str) -> Result<i64> {
        let user = idurl.user().map_err(|e| NodeError::Config(e.to_string()))?;
        self.keys
            .register_peer(&GlobalId::master(user), public_key_hex)
    }

    fn store_and_notify(&self, row: HistoryRow, sender_key_id: &str) -> Result<()> {
        {
            let db = self.db.lock().expect("db lock");
            db.insert_history(&row)?;
        }
        debug!(conversation = %row.conversation_id, id = %row.id, "message stored");
        let _ = self.listeners.send(MessageEvent {
            id: row.id,
            conversation_id: row.conversation_id,
            message_type: row.message_type,
            direction: row.direction,
            sender_key_id: sender_key_id.to_string(),
            payload: row.payload,
            created_at: row.created_at,
        });
        Ok(())
    }
}
