//! User-facing operations and the command layer.
//!
//! The `impl NodeContext` block holds the typed operations the CLI/REST
//! surface maps onto; the free functions below wrap them into the
//! `{"status":"OK","result":…}` / `{"status":"ERROR","errors":[…]}`
//! JSON shape.

use serde_json::{json, Value};

use bitdust_net::dht::records::DhtLayer;
use bitdust_shared::envelope::Command;
use bitdust_shared::payloads::{Body, KeyAuditChallenge};
use bitdust_shared::types::{GlobalId, IdUrl};

use crate::context::NodeContext;
use crate::error::{NodeError, Result};
use crate::keys::KeyManager;
use crate::packets;
use crate::supplier::SupplierEntry;

impl NodeContext {
    // -- identity -----------------------------------------------------------

    pub fn identity_get(&self) -> bitdust_shared::identity::IdentityDoc {
        self.my_id.document()
    }

    /// Manual rotation away from the current primary source.
    pub async fn identity_rotate(&self) -> Result<(IdUrl, IdUrl)> {
        Ok(self.rotator.rotate_now(None).await?)
    }

    pub async fn user_ping(&self, idurl: &IdUrl) -> Result<std::time::Duration> {
        Ok(self.propagator.ping(idurl).await?)
    }

    // -- suppliers ----------------------------------------------------------

    /// Fill every empty slate position; required before shares/groups
    /// can connect.
    pub async fn supplier_setup(&self) -> Result<usize> {
        let filled = self.suppliers.ensure_hired().await?;
        if filled == 0 {
            return Err(NodeError::NoSuppliers);
        }
        Ok(filled)
    }

    pub async fn supplier_list(&self) -> (Vec<SupplierEntry>, u64) {
        self.suppliers.list().await
    }

    pub async fn supplier_change(&self, position: u32) -> Result<IdUrl> {
        self.suppliers.change(position).await
    }

    pub async fn supplier_switch(&self, position: u32, new_idurl: IdUrl) -> Result<()> {
        self.suppliers.switch(position, new_idurl).await
    }

    // -- shares -------------------------------------------------------------

    pub fn share_create(&self, label: &str) -> Result<GlobalId> {
        Ok(self
            .keys
            .share_create(label, self.config.ecc_map, false)?
            .key_id)
    }

    /// Connected means: the owner's slate is advertised and at least
    /// `min_suppliers` of it answer.
    pub async fn share_open(&self, key_id: &GlobalId) -> Result<usize> {
        let share = self
            .keys
            .get(key_id)
            .ok_or_else(|| NodeError::UnknownKey(key_id.to_string()))?;
        let owner = key_id.user.idurl();
        let view = self
            .dht
            .read_slate(&owner)
            .await?
            .ok_or(NodeError::NoSuppliers)?;

        let mut reachable = 0;
        for supplier in view.suppliers.iter().flatten() {
            if self.gate.connect_to(supplier).await.is_ok() {
                reachable += 1;
            }
        }
        if reachable < share.ecc_map.min_suppliers() {
            return Err(NodeError::NoSuppliers);
        }
        Ok(reachable)
    }

    /// Encrypt the share key for a trusted user and hand it over.
    pub async fn share_grant(&self, key_id: &GlobalId, trusted: &IdUrl) -> Result<()> {
        let recipient_doc = self.registry.get(trusted, false).await?;
        let recipient_key = recipient_doc
            .verifying_key()
            .map_err(bitdust_id::IdError::Document)?;

        // Ship current broker knowledge along so the recipient can join
        // without a DHT round trip.
        let (brokers, revision) = match self.groups_store.load(&key_id.to_string()) {
            Ok(info) => (
                info.brokers
                    .iter()
                    .map(|(p, b)| (*p, IdUrl::new(b.clone())))
                    .collect(),
                info.brokers_revision,
            ),
            Err(_) => (Vec::new(), 0),
        };

        let grant = self
            .keys
            .build_grant(key_id, &recipient_key, brokers, revision)?;
        packets::request(
            &self.gate,
            &self.my_id,
            Command::Message,
            trusted,
            &Body::KeyGrant(grant),
            None,
        )
        .await?;
        Ok(())
    }

    /// Challenge a remote to prove it holds a key.
    pub async fn key_audit(&self, key_id: &GlobalId, untrusted: &IdUrl) -> Result<bool> {
        let mut nonce = vec![0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ack = packets::request(
            &self.gate,
            &self.my_id,
            Command::Message,
            untrusted,
            &Body::KeyAuditChallenge(KeyAuditChallenge {
                key_id: key_id.clone(),
                nonce: nonce.clone(),
            }),
            None,
        )
        .await;

        let response = match ack {
            Ok(envelope) => envelope,
            Err(NodeError::Refused(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Ok(Body::KeyAuditResponse(audit)) = response.body() else {
            return Ok(false);
        };
        let Some(remote_key) = self.registry.public_key_cached(untrusted) else {
            return Ok(false);
        };
        Ok(KeyManager::audit_verify(
            &remote_key,
            &nonce,
            &audit.nonce_signature,
        ))
    }

    // -- files in shares ----------------------------------------------------

    /// Encrypt and store a file into a share, striped to the owner's
    /// suppliers (full copy per supplier at this layer).
    pub async fn file_upload(
        &self,
        key_id: &GlobalId,
        remote_path: &str,
        data: &[u8],
    ) -> Result<usize> {
        let share = self
            .keys
            .get(key_id)
            .ok_or_else(|| NodeError::UnknownKey(key_id.to_string()))?;
        let encrypted = bitdust_shared::crypto::encrypt(&share.symmetric_key, data)?;
        let suppliers = self.share_suppliers(key_id).await?;

        let owner = key_id.user.idurl();
        let path = format!("{}/{remote_path}", key_id.key_alias);
        let mut stored = 0;
        for supplier in &suppliers {
            let body = Body::Block {
                remote_path: path.clone(),
                data: encrypted.clone(),
            };
            match packets::request_for_owner(
                &self.gate,
                &self.my_id,
                Command::Data,
                &owner,
                supplier,
                &body,
                None,
            )
            .await
            {
                Ok(_) => stored += 1,
                Err(e) => tracing::debug!(supplier = %supplier, error = %e, "block store failed"),
            }
        }
        if stored == 0 {
            return Err(NodeError::NoSuppliers);
        }
        Ok(stored)
    }

    pub async fn file_download(&self, key_id: &GlobalId, remote_path: &str) -> Result<Vec<u8>> {
        let share = self
            .keys
            .get(key_id)
            .ok_or_else(|| NodeError::UnknownKey(key_id.to_string()))?;
        let suppliers = self.share_suppliers(key_id).await?;
        let owner = key_id.user.idurl();
        let path = format!("{}/{remote_path}", key_id.key_alias);

        let mut last_error = NodeError::NoSuppliers;
        for supplier in &suppliers {
            match packets::request_for_owner(
                &self.gate,
                &self.my_id,
                Command::Retrieve,
                &owner,
                supplier,
                &Body::Text(path.clone()),
                None,
            )
            .await
            {
                Ok(ack) => {
                    if let Ok(Body::Block { data, .. }) = ack.body() {
                        return Ok(bitdust_shared::crypto::decrypt(
                            &share.symmetric_key,
                            &data,
                        )?);
                    }
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn share_suppliers(&self, key_id: &GlobalId) -> Result<Vec<IdUrl>> {
        let owner = key_id.user.idurl();
        let view = self
            .dht
            .read_slate(&owner)
            .await?
            .ok_or(NodeError::NoSuppliers)?;
        let suppliers: Vec<IdUrl> = view.suppliers.into_iter().flatten().collect();
        if suppliers.is_empty() {
            return Err(NodeError::NoSuppliers);
        }
        Ok(suppliers)
    }

    // -- groups -------------------------------------------------------------

    pub fn group_create(&self, label: &str) -> Result<GlobalId> {
        Ok(self
            .keys
            .share_create(label, self.config.ecc_map, true)?
            .key_id)
    }

    pub async fn group_join(&self, key_id: &GlobalId) -> Result<()> {
        let participant = self.participant(key_id).await?;
        participant.connect().await
    }

    pub async fn group_leave(&self, key_id: &GlobalId) -> Result<()> {
        let participant = self
            .groups
            .remove(key_id)
            .await
            .ok_or_else(|| NodeError::UnknownGroup(key_id.to_string()))?;
        participant.leave().await
    }

    /// Granting a group is granting its share.
    pub async fn group_share(&self, key_id: &GlobalId, trusted: &IdUrl) -> Result<()> {
        self.share_grant(key_id, trusted).await
    }

    pub async fn message_send_group(&self, key_id: &GlobalId, payload: &[u8]) -> Result<u64> {
        let participant = self.participant(key_id).await?;
        participant.publish(payload.to_vec()).await
    }

    // -- private messages ---------------------------------------------------

    pub async fn message_send(&self, recipient: &IdUrl, payload: &[u8]) -> Result<String> {
        self.keeper.send_private(recipient, payload).await
    }

    /// History of the conversation with one peer.
    pub async fn message_history(&self, peer: &IdUrl) -> Result<Vec<bitdust_store::HistoryRow>> {
        let peer_doc = self.registry.get(peer, false).await?;
        let peer_user = peer.user().map_err(|e| NodeError::Config(e.to_string()))?;
        let peer_local = self
            .keys
            .register_peer(&GlobalId::master(peer_user), &peer_doc.publickey)?;
        let my_local = self.keys.my_local_key_id()?;
        let conversation = bitdust_store::models::private_conversation_id(my_local, peer_local);
        self.keeper.history(&conversation, 1000, 0)
    }

    pub fn group_history(&self, key_id: &GlobalId) -> Result<Vec<bitdust_store::HistoryRow>> {
        let share = self
            .keys
            .get(key_id)
            .ok_or_else(|| NodeError::UnknownKey(key_id.to_string()))?;
        let conversation = bitdust_store::models::group_conversation_id(share.local_key_id);
        self.keeper.history(&conversation, 10_000, 0)
    }

    // -- dht ----------------------------------------------------------------

    pub async fn dht_value_set(&self, key: &str, value: Value) -> Result<()> {
        Ok(self
            .dht
            .put_json(&format!("{}:{key}", DhtLayer::Generic), &value)
            .await?)
    }

    pub async fn dht_value_get(&self, key: &str) -> Result<Vec<Value>> {
        Ok(self
            .dht
            .get_json(&format!("{}:{key}", DhtLayer::Generic))
            .await?)
    }
}

// ---------------------------------------------------------------------------
// JSON command layer
// ---------------------------------------------------------------------------

fn ok(result: Value) -> Value {
    json!({ "status": "OK", "result": result })
}

fn err(e: impl std::fmt::Display) -> Value {
    json!({ "status": "ERROR", "errors": [e.to_string()] })
}

pub async fn identity_get(ctx: &NodeContext) -> Value {
    match serde_json::to_value(ctx.identity_get()) {
        Ok(doc) => ok(doc),
        Err(e) => err(e),
    }
}

pub async fn identity_rotate(ctx: &NodeContext) -> Value {
    match ctx.identity_rotate().await {
        Ok((old, new)) => ok(json!({ "old": old.as_str(), "new": new.as_str() })),
        Err(e) => err(e),
    }
}

pub async fn user_ping(ctx: &NodeContext, idurl: &str) -> Value {
    match ctx.user_ping(&IdUrl::new(idurl)).await {
        Ok(latency) => ok(json!({ "latency_ms": latency.as_millis() as u64 })),
        Err(e) => err(e),
    }
}

pub async fn supplier_list(ctx: &NodeContext) -> Value {
    let (entries, revision) = ctx.supplier_list().await;
    let suppliers: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "position": entry.position,
                "idurl": entry.idurl.as_ref().map(|u| u.as_str().to_string()),
                "last_seen": entry.last_seen.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    ok(json!({ "revision": revision, "suppliers": suppliers }))
}

pub async fn supplier_change(ctx: &NodeContext, position: u32) -> Value {
    match ctx.supplier_change(position).await {
        Ok(idurl) => ok(json!({ "position": position, "supplier": idurl.as_str() })),
        Err(e) => err(e),
    }
}

pub async fn supplier_switch(ctx: &NodeContext, position: u32, new_idurl: &str) -> Value {
    match ctx.supplier_switch(position, IdUrl::new(new_idurl)).await {
        Ok(()) => ok(json!({ "position": position, "supplier": new_idurl })),
        Err(e) => err(e),
    }
}

pub async fn share_create(ctx: &NodeContext, label: &str) -> Value {
    match ctx.share_create(label) {
        Ok(key_id) => ok(json!({ "key_id": key_id.to_string() })),
        Err(e) => err(e),
    }
}

pub async fn share_open(ctx: &NodeContext, key_id: &str) -> Value {
    match GlobalId::parse(key_id) {
        Ok(key) => match ctx.share_open(&key).await {
            Ok(reachable) => ok(json!({ "key_id": key_id, "suppliers_reachable": reachable })),
            Err(e) => err(e),
        },
        Err(e) => err(e),
    }
}

pub async fn share_grant(ctx: &NodeContext, key_id: &str, trusted: &str) -> Value {
    match GlobalId::parse(key_id) {
        Ok(key) => match ctx.share_grant(&key, &IdUrl::new(trusted)).await {
            Ok(()) => ok(json!({ "key_id": key_id, "trusted": trusted })),
            Err(e) => err(e),
        },
        Err(e) => err(e),
    }
}

pub async fn group_create(ctx: &NodeContext, label: &str) -> Value {
    match ctx.group_create(label) {
        Ok(key_id) => ok(json!({ "group_key_id": key_id.to_string() })),
        Err(e) => err(e),
    }
}

pub async fn group_join(ctx: &NodeContext, key_id: &str) -> Value {
    match GlobalId::parse(key_id) {
        Ok(key) => match ctx.group_join(&key).await {
            Ok(()) => ok(json!({ "group_key_id": key_id, "connected": true })),
            Err(e) => err(e),
        },
        Err(e) => err(e),
    }
}

pub async fn group_leave(ctx: &NodeContext, key_id: &str) -> Value {
    match GlobalId::parse(key_id) {
        Ok(key) => match ctx.group_leave(&key).await {
            Ok(()) => ok(json!({ "group_key_id": key_id, "connected": false })),
            Err(e) => err(e),
        },
        Err(e) => err(e),
    }
}

pub async fn group_share(ctx: &NodeContext, key_id: &str, trusted: &str) -> Value {
    share_grant(ctx, key_id, trusted).await
}

pub async fn message_send(ctx: &NodeContext, recipient: &str, payload: Value) -> Value {
    let raw = payload.to_string().into_bytes();
    match ctx.message_send(&IdUrl::new(recipient), &raw).await {
        Ok(message_id) => ok(json!({ "message_id": message_id })),
        Err(e) => err(e),
    }
}

pub async fn message_send_group(ctx: &NodeContext, key_id: &str, payload: Value) -> Value {
    let raw = payload.to_string().into_bytes();
    match GlobalId::parse(key_id) {
        Ok(key) => match ctx.message_send_group(&key, &raw).await {
            Ok(sequence_id) => ok(json!({ "sequence_id": sequence_id })),
            Err(e) => err(e),
        },
        Err(e) => err(e),
    }
}

pub async fn message_receive(ctx: &NodeContext, target: &str) -> Value {
    let rows = if let Ok(key) = GlobalId::parse(target) {
        ctx.group_history(&key)
    } else {
        ctx.message_history(&IdUrl::new(target)).await
    };
    match rows {
        Ok(rows) => {
            let messages: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "conversation_id": row.conversation_id,
                        "direction": row.direction.as_str(),
                        "type": row.message_type.as_str(),
                        "payload": serde_json::from_slice::<Value>(&row.payload)
                            .unwrap_or(Value::Null),
                        "created_at": row.created_at.to_rfc3339(),
                    })
                })
                .collect();
            ok(json!(messages))
        }
        Err(e) => err(e),
    }
}

pub async fn dht_value_get(ctx: &NodeContext, key: &str) -> Value {
    match ctx.dht_value_get(key).await {
        Ok(values) => ok(json!(values)),
        Err(e) => err(e),
    }
}

pub async fn dht_value_set(ctx: &NodeContext, key: &str, value: Value) -> Value {
    match ctx.dht_value_set(key, value.clone()).await {
        Ok(()) => ok(json!({ "key": key, "value": value })),
        Err(e) => err(e),
    }
}
