//! Group participant actor: one per `(local identity, group key)`.
//!
//! Drives the pure [`super::machine::Machine`] through the DHT reads,
//! broker negotiation and message flow. The active broker is position 0
//! of the triple; a push that exhausts its retry budget promotes
//! position 1, refills position 2 from the candidate pool and rewrites
//! the DHT triple with a bumped revision. Triples only ever move
//! forward: a lower revision than the one currently believed is
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use bitdust_id::{IdentityRegistry, MyIdentity};
use bitdust_net::dht::records::TripleView;
use bitdust_net::dht::DhtHandle;
use bitdust_net::gate::GateHandle;
use bitdust_net::transport::ContactResolver;
use bitdust_shared::constants::BROKERS_PER_GROUP;
use bitdust_shared::crypto;
use bitdust_shared::envelope::Command;
use bitdust_shared::identity::verify_signature;
use bitdust_shared::payloads::{
    Body, QueueCatchUp, QueueCatchUpResult, QueueConnect, QueueMessage, ServiceCancel,
    ServiceRequest,
};
use bitdust_shared::types::{GlobalId, IdUrl, PacketId, QueueId};
use bitdust_store::{GroupInfo, GroupInfoStore};

use super::machine::{Action, Event, Machine, State};
use crate::error::{NodeError, Result};
use crate::keeper::MessageKeeper;
use crate::keys::{KeyManager, ShareKey};
use crate::packets;

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub critical_push_fails: u32,
    pub message_ack_timeout: Duration,
    pub known_brokers: Vec<IdUrl>,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub state: State,
    pub last_sequence_id: i64,
    pub active_broker: Option<IdUrl>,
    pub brokers: Vec<Option<IdUrl>>,
    pub revision: u64,
}

enum ParticipantCommand {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Publish {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<u64>>,
    },
    Deliver {
        message: QueueMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<GroupStatus>,
    },
    BrokerRotated {
        old: IdUrl,
        new: IdUrl,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct GroupParticipantHandle {
    cmd_tx: mpsc::Sender<ParticipantCommand>,
}

impl GroupParticipantHandle {
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Connect { reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Disconnect { reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Publish one payload to the group; resolves with the sequence id
    /// the primary broker assigned.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Publish { payload, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Inbound queue delivery from a broker; Ok means persisted (or a
    /// duplicate) and the broker may advance this consumer's cursor.
    pub async fn deliver(&self, message: QueueMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Deliver { message, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Leave { reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn status(&self) -> Result<GroupStatus> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ParticipantCommand::Status { reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn broker_rotated(&self, old: IdUrl, new: IdUrl) {
        let _ = self
            .cmd_tx
            .send(ParticipantCommand::BrokerRotated { old, new })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ParticipantCommand::Shutdown).await;
    }
}

pub struct GroupParticipant {
    my_id: Arc<MyIdentity>,
    keys: Arc<KeyManager>,
    registry: Arc<IdentityRegistry>,
    gate: GateHandle,
    dht: DhtHandle,
    keeper: Arc<MessageKeeper>,
    groups_store: Arc<GroupInfoStore>,
    config: ParticipantConfig,

    share: ShareKey,
    owner: IdUrl,
    machine: Machine,
    brokers: Vec<Option<IdUrl>>,
    revision: u64,
    last_sequence_id: i64,
}

impl GroupParticipant {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        my_id: Arc<MyIdentity>,
        keys: Arc<KeyManager>,
        registry: Arc<IdentityRegistry>,
        gate: GateHandle,
        dht: DhtHandle,
        keeper: Arc<MessageKeeper>,
        groups_store: Arc<GroupInfoStore>,
        config: ParticipantConfig,
        share: ShareKey,
    ) -> GroupParticipantHandle {
        let owner = share.key_id.user.idurl();

        // Pick up persisted state (a grant or a previous session).
        let (brokers, revision, last_sequence_id) =
            match groups_store.load(&share.key_id.to_string()) {
                Ok(info) => {
                    let mut brokers = vec![None; BROKERS_PER_GROUP];
                    for (position, idurl) in &info.brokers {
                        if (*position as usize) < brokers.len() {
                            brokers[*position as usize] = Some(IdUrl::new(idurl.clone()));
                        }
                    }
                    (brokers, info.brokers_revision, info.last_sequence_id)
                }
                Err(_) => (vec![None; BROKERS_PER_GROUP], 0, -1),
            };

        let mut machine = Machine::new();
        machine.step(Event::Init);

        let participant = Self {
            my_id,
            keys,
            registry,
            gate,
            dht,
            keeper,
            groups_store,
            config,
            share,
            owner,
            machine,
            brokers,
            revision,
            last_sequence_id,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(participant.run(cmd_rx));
        GroupParticipantHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ParticipantCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ParticipantCommand::Connect { reply } => {
                    let _ = reply.send(self.connect().await);
                }
                ParticipantCommand::Disconnect { reply } => {
                    let _ = reply.send(self.disconnect().await);
                }
                ParticipantCommand::Publish { payload, reply } => {
                    let _ = reply.send(self.publish(payload).await);
                }
                ParticipantCommand::Deliver { message, reply } => {
                    let _ = reply.send(self.deliver(message).await);
                }
                ParticipantCommand::Leave { reply } => {
                    let _ = reply.send(self.leave().await);
                    break;
                }
                ParticipantCommand::Status { reply } => {
                    let _ = reply.send(GroupStatus {
                        state: self.machine.state,
                        last_sequence_id: self.last_sequence_id,
                        active_broker: self.active_broker().cloned(),
                        brokers: self.brokers.clone(),
                        revision: self.revision,
                    });
                }
                ParticipantCommand::BrokerRotated { old, new } => {
                    let mut changed = false;
                    for slot in self.brokers.iter_mut() {
                        if slot.as_ref() == Some(&old) {
                            *slot = Some(new.clone());
                            changed = true;
                        }
                    }
                    if changed {
                        self.revision += 1;
                        self.persist(true);
                    }
                }
                ParticipantCommand::Shutdown => {
                    self.machine.step(Event::Shutdown);
                    break;
                }
            }
        }
    }

    // -- identity helpers ---------------------------------------------------

    fn my_member_id(&self) -> Result<GlobalId> {
        Ok(self.my_id.master_id()?)
    }

    fn active_broker(&self) -> Option<&IdUrl> {
        self.brokers.iter().flatten().next()
    }

    fn queue_id_for(&self, broker: &IdUrl) -> Result<QueueId> {
        let broker_user = broker
            .user()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        Ok(QueueId::new(
            &self.share.key_id.key_alias,
            self.share.key_id.user.clone(),
            broker_user,
        ))
    }

    fn persist(&self, active: bool) {
        let info = GroupInfo {
            group_key_id: self.share.key_id.to_string(),
            last_sequence_id: self.last_sequence_id,
            active,
            archive_folder_path: format!("archive/{}", self.share.key_id.key_alias),
            brokers: self
                .brokers
                .iter()
                .enumerate()
                .filter_map(|(i, b)| b.as_ref().map(|b| (i as u32, b.to_string())))
                .collect(),
            brokers_revision: self.revision,
        };
        if let Err(e) = self.groups_store.save(&info) {
            warn!(group = %self.share.key_id, error = %e, "group state save failed");
        }
    }

    // -- connect ------------------------------------------------------------

    async fn connect(&mut self) -> Result<()> {
        let event = if self.machine.state == State::Connected {
            Event::Reconnect
        } else {
            Event::Connect
        };
        for action in self.machine.step(event) {
            debug_assert_eq!(action, Action::ReadSuppliers);
        }
        if self.machine.state != State::ReadingSuppliers {
            return Ok(());
        }

        // SUPPLIERS?: the owner's slate must be readable before brokers
        // are worth contacting.
        match self.dht.read_slate(&self.owner).await {
            Ok(Some(view)) if view.suppliers.iter().any(|s| s.is_some()) => {
                self.machine.step(Event::SuppliersReadSuccess);
            }
            _ => {
                self.machine.step(Event::SuppliersReadFailed);
                return Err(NodeError::NoSuppliers);
            }
        }

        // SUBSCRIBE!
        match self.subscribe().await {
            Ok(()) => {
                let actions = self.machine.step(Event::SuppliersConnected);
                if actions.contains(&Action::Unsubscribe) {
                    self.unsubscribe().await;
                    return Err(NodeError::NotConnected(self.share.key_id.to_string()));
                }
                self.persist(true);
                info!(group = %self.share.key_id, last = self.last_sequence_id, "group connected");
                Ok(())
            }
            Err(e) => {
                self.machine.step(Event::SuppliersDisconnected);
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self) -> Result<()> {
        self.resolve_brokers().await?;

        // Catch up before attaching so the attach carries a current
        // cursor and the broker only streams the live tail.
        if let Err(e) = self.catch_up().await {
            debug!(group = %self.share.key_id, error = %e, "catch-up incomplete");
        }

        let broker = self
            .active_broker()
            .cloned()
            .ok_or(NodeError::NoBroker)?;
        let connect = QueueConnect {
            queue_id: self.queue_id_for(&broker)?,
            consumer_id: self.my_member_id()?,
            last_sequence_id: (self.last_sequence_id >= 0)
                .then_some(self.last_sequence_id as u64),
            group_key_signature: self.keys.sign_membership(&self.share.key_id),
        };
        packets::request(
            &self.gate,
            &self.my_id,
            Command::RequestService,
            &broker,
            &Body::Service(ServiceRequest::QueueConsumer(connect)),
            None,
        )
        .await?;
        Ok(())
    }

    /// Bring `self.brokers` to the effective triple: stored info, then
    /// the DHT (higher revisions win), then bootstrap nomination.
    async fn resolve_brokers(&mut self) -> Result<()> {
        if let Ok(Some(view)) = self.dht.read_triple(&self.owner, &self.share.key_id.key_alias).await
        {
            self.adopt_triple(view);
        }

        if self.active_broker().is_none() {
            self.nominate_brokers().await?;
        }

        // Make sure the brokers actually host the queue (idempotent for
        // ones that already do).
        let triple: Vec<(u32, IdUrl)> = self
            .brokers
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i as u32, b.clone())))
            .collect();
        let Some((_, primary)) = triple.first().cloned() else {
            return Err(NodeError::NoBroker);
        };
        for (position, broker) in &triple {
            let peers: Vec<(u32, IdUrl)> = triple
                .iter()
                .filter(|(p, _)| p != position)
                .cloned()
                .collect();
            let body = Body::Service(ServiceRequest::Broker {
                queue_id: self.queue_id_for(&primary)?,
                position: *position,
                peers,
                revision: self.revision,
            });
            if let Err(e) = packets::request(
                &self.gate,
                &self.my_id,
                Command::RequestService,
                broker,
                &body,
                None,
            )
            .await
            {
                if *position == 0 {
                    return Err(e);
                }
                debug!(broker = %broker, error = %e, "standby broker unreachable");
            }
        }
        Ok(())
    }

    /// Monotonic replacement: only adopt a triple at least as new as the
    /// one currently believed.
    fn adopt_triple(&mut self, view: TripleView) {
        if view.revision < self.revision {
            debug!(
                group = %self.share.key_id,
                seen = view.revision,
                have = self.revision,
                "stale triple ignored"
            );
            return;
        }
        self.revision = view.revision;
        self.brokers = view.brokers;
    }

    /// First joiner (normally the owner) nominates the initial triple
    /// from the candidate pool and advertises it.
    async fn nominate_brokers(&mut self) -> Result<()> {
        let mut pool: Vec<IdUrl> = self.config.known_brokers.clone();
        if let Ok(found) = self
            .dht
            .user_random(bitdust_net::dht::records::DhtLayer::Brokers, 8)
            .await
        {
            for idurl in found {
                if !pool.contains(&idurl) {
                    pool.push(idurl);
                }
            }
        }
        pool.retain(|b| *b != self.my_id.idurl());
        if pool.is_empty() {
            return Err(NodeError::NoBroker);
        }
        pool.truncate(BROKERS_PER_GROUP);

        self.revision = self.revision.max(1);
        self.brokers = vec![None; BROKERS_PER_GROUP];
        for (i, broker) in pool.into_iter().enumerate() {
            self.brokers[i] = Some(broker);
        }
        self.advertise_triple().await;
        info!(group = %self.share.key_id, revision = self.revision, "broker triple nominated");
        Ok(())
    }

    async fn advertise_triple(&self) {
        let records: Vec<(u32, IdUrl)> = self
            .brokers
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (i as u32, b.clone())))
            .collect();
        if let Err(e) = self
            .dht
            .publish_triple(
                &self.owner,
                &self.share.key_id.key_alias,
                &records,
                self.revision,
            )
            .await
        {
            warn!(error = %e, "triple advertisement failed");
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(broker) = self.active_broker().cloned() {
            if let (Ok(queue_id), Ok(member)) = (self.queue_id_for(&broker), self.my_member_id()) {
                let body = Body::ServiceCancel(ServiceCancel::QueueConsumer {
                    queue_id,
                    consumer_id: member,
                });
                let _ = packets::request(
                    &self.gate,
                    &self.my_id,
                    Command::CancelService,
                    &broker,
                    &body,
                    Some(Duration::from_secs(5)),
                )
                .await;
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let actions = self.machine.step(Event::Disconnect);
        if actions.contains(&Action::Unsubscribe) {
            self.unsubscribe().await;
        }
        self.persist(false);
        Ok(())
    }

    async fn leave(&mut self) -> Result<()> {
        self.unsubscribe().await;
        self.machine.step(Event::Shutdown);
        self.groups_store.delete(&self.share.key_id.to_string())?;
        Ok(())
    }

    // -- publish ------------------------------------------------------------

    async fn publish(&mut self, payload: Vec<u8>) -> Result<u64> {
        if self.machine.state != State::Connected {
            return Err(NodeError::NotConnected(self.share.key_id.to_string()));
        }
        self.machine.step(Event::PushMessage);

        let encrypted_payload = crypto::encrypt(&self.share.symmetric_key, &payload)?;
        let signature = self
            .my_id
            .local()
            .sign(&encrypted_payload)
            .to_bytes()
            .to_vec();
        let producer_packet_id = PacketId::random();

        let mut rotations = 0;
        loop {
            let broker = self.active_broker().cloned().ok_or(NodeError::NoBroker)?;
            let message = QueueMessage {
                queue_id: self.queue_id_for(&broker)?,
                sequence_id: None,
                producer_id: self.my_member_id()?,
                producer_packet_id: producer_packet_id.clone(),
                created_ts: Utc::now(),
                encrypted_payload: encrypted_payload.clone(),
                signature: signature.clone(),
            };

            match self.push_with_retries(&broker, &message).await {
                Ok(sequence_id) => return Ok(sequence_id),
                Err(e) => {
                    rotations += 1;
                    if rotations >= BROKERS_PER_GROUP as u32 {
                        warn!(group = %self.share.key_id, error = %e, "push-message-failed");
                        return Err(e);
                    }
                    self.rotate_broker().await?;
                }
            }
        }
    }

    /// Exponential backoff bounded by the message ack timeout; after the
    /// critical failure count the caller rotates brokers.
    async fn push_with_retries(&self, broker: &IdUrl, message: &QueueMessage) -> Result<u64> {
        let body = Body::Queue(message.clone());
        let mut attempt = 0u32;
        loop {
            match packets::request(
                &self.gate,
                &self.my_id,
                Command::Data,
                broker,
                &body,
                Some(self.config.message_ack_timeout),
            )
            .await
            {
                Ok(ack) => {
                    if let Ok(Body::Queue(assigned)) = ack.body() {
                        if let Some(sequence_id) = assigned.sequence_id {
                            return Ok(sequence_id);
                        }
                    }
                    return Err(NodeError::Refused("broker ack without sequence id".into()));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.critical_push_fails {
                        return Err(e);
                    }
                    let backoff = Duration::from_millis(250 * (1 << attempt.min(6)) as u64)
                        .min(self.config.message_ack_timeout);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Promote the first standby to primary, refill the tail from the
    /// candidate pool, bump the revision and advertise.
    async fn rotate_broker(&mut self) -> Result<()> {
        let mut remaining: Vec<IdUrl> = self.brokers.iter().skip(1).flatten().cloned().collect();
        if remaining.is_empty() {
            return Err(NodeError::NoBroker);
        }

        // Refill the freed tail position.
        let mut pool: Vec<IdUrl> = self.config.known_brokers.clone();
        if let Ok(found) = self
            .dht
            .user_random(bitdust_net::dht::records::DhtLayer::Brokers, 8)
            .await
        {
            pool.extend(found);
        }
        let dead = self.brokers.first().cloned().flatten();
        pool.retain(|b| {
            !remaining.contains(b) && Some(b) != dead.as_ref() && *b != self.my_id.idurl()
        });
        if let Some(fresh) = pool.into_iter().next() {
            remaining.push(fresh);
        }

        self.revision += 1;
        self.brokers = vec![None; BROKERS_PER_GROUP];
        for (i, broker) in remaining.into_iter().take(BROKERS_PER_GROUP).enumerate() {
            self.brokers[i] = Some(broker);
        }

        let new_primary = self.active_broker().cloned().ok_or(NodeError::NoBroker)?;
        info!(group = %self.share.key_id, primary = %new_primary, revision = self.revision, "broker rotation");

        // The promoted broker adopts its mirror under the new queue id
        // and the re-attach restores this consumer's cursor.
        self.resolve_brokers().await?;
        let connect = QueueConnect {
            queue_id: self.queue_id_for(&new_primary)?,
            consumer_id: self.my_member_id()?,
            last_sequence_id: (self.last_sequence_id >= 0)
                .then_some(self.last_sequence_id as u64),
            group_key_signature: self.keys.sign_membership(&self.share.key_id),
        };
        packets::request(
            &self.gate,
            &self.my_id,
            Command::RequestService,
            &new_primary,
            &Body::Service(ServiceRequest::QueueConsumer(connect)),
            None,
        )
        .await?;

        self.advertise_triple().await;
        self.persist(true);
        Ok(())
    }

    // -- inbound ------------------------------------------------------------

    /// Strict monotone intake: duplicates ack silently, the next
    /// expected id is persisted, a gap triggers catch-up first.
    async fn deliver(&mut self, message: QueueMessage) -> Result<()> {
        let Some(sequence_id) = message.sequence_id else {
            return Err(NodeError::Refused("delivery without sequence id".into()));
        };
        if message.queue_id.queue_alias != self.share.key_id.key_alias
            || message.queue_id.owner != self.share.key_id.user
        {
            return Err(NodeError::Refused("delivery for a different group".into()));
        }

        if (sequence_id as i64) <= self.last_sequence_id {
            return Ok(());
        }
        if sequence_id as i64 > self.last_sequence_id + 1 {
            debug!(
                group = %self.share.key_id,
                have = self.last_sequence_id,
                got = sequence_id,
                "sequence gap, catching up"
            );
            self.catch_up().await?;
        }
        self.apply_message(&message).await?;
        self.persist(self.machine.state == State::Connected);
        Ok(())
    }

    /// Validate and store one message if it is the next expected one.
    async fn apply_message(&mut self, message: &QueueMessage) -> Result<()> {
        let Some(sequence_id) = message.sequence_id else {
            return Ok(());
        };
        if (sequence_id as i64) != self.last_sequence_id + 1 {
            return Ok(());
        }

        // Producer signature over the encrypted payload.
        let producer_idurl = message.producer_id.user.idurl();
        if let Some(key) = self.registry.public_key(&producer_idurl).await {
            if verify_signature(&key, &message.encrypted_payload, &message.signature).is_err() {
                return Err(NodeError::Refused("producer signature invalid".into()));
            }
        }

        let payload = crypto::decrypt(&self.share.symmetric_key, &message.encrypted_payload)?;
        self.keeper
            .record_group_message(
                &self.share,
                &message.producer_id,
                sequence_id,
                payload,
                message.created_ts,
            )
            .await?;
        self.last_sequence_id = sequence_id as i64;
        Ok(())
    }

    /// Fill the gap between `last_sequence_id` and the queue head from
    /// archive snapshots and the live log.
    async fn catch_up(&mut self) -> Result<()> {
        let broker = self.active_broker().cloned().ok_or(NodeError::NoBroker)?;
        let request = QueueCatchUp {
            queue_id: self.queue_id_for(&broker)?,
            consumer_id: self.my_member_id()?,
            from_sequence_id: (self.last_sequence_id + 1) as u64,
        };
        let ack = packets::request(
            &self.gate,
            &self.my_id,
            Command::Retrieve,
            &broker,
            &Body::CatchUp(request),
            None,
        )
        .await?;
        let Ok(Body::CatchUpResult(result)) = ack.body() else {
            return Err(NodeError::Refused("malformed catch-up result".into()));
        };
        self.apply_catch_up(result).await
    }

    async fn apply_catch_up(&mut self, result: QueueCatchUpResult) -> Result<()> {
        let mut snapshots = result.snapshots;
        snapshots.sort_by_key(|s| s.first_sequence_id);
        for snapshot in snapshots {
            let Ok(batch) = bincode::deserialize::<Vec<QueueMessage>>(&snapshot.encrypted_batch)
            else {
                warn!(group = %self.share.key_id, "undecodable archive snapshot skipped");
                continue;
            };
            for message in batch {
                self.apply_message(&message).await?;
            }
        }
        let mut live = result.live;
        live.sort_by_key(|m| m.sequence_id);
        for message in live {
            self.apply_message(&message).await?;
        }
        debug!(group = %self.share.key_id, last = self.last_sequence_id, "catch-up applied");
        Ok(())
    }
}
