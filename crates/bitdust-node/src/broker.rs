//! Broker: hosts group queues, orders messages, replicates to the other
//! brokers of the triple, archives delivered ranges and takes over when
//! the primary dies.
//!
//! One actor per node owns every hosted queue. A producer push gets its
//! sequence id here and nowhere else; the ack returns only after local
//! persistence, replication is best-effort. Each consumer has a
//! dedicated delivery worker so per-consumer ordering is strict while
//! consumers proceed independently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use bitdust_id::{IdentityRegistry, MyIdentity};
use bitdust_net::dht::DhtHandle;
use bitdust_net::gate::GateHandle;
use bitdust_net::transport::ContactResolver;
use bitdust_shared::envelope::Command;
use bitdust_shared::identity::verify_signature;
use bitdust_shared::payloads::{
    ArchiveSnapshot, Body, QueueCatchUp, QueueCatchUpResult, QueueConnect, QueueMessage,
};
use bitdust_shared::types::{GlobalId, IdUrl, PacketId, QueueId};

use crate::error::{NodeError, Result};
use crate::keys::KeyManager;
use crate::packets;

const DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(300);
const ARCHIVE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

struct ConsumerState {
    last_ack: i64,
    outbox: mpsc::Sender<QueueMessage>,
}

struct QueueState {
    queue_id: QueueId,
    owner: IdUrl,
    my_position: u32,
    revision: u64,
    /// The other brokers of the triple, by position.
    peers: Vec<(u32, IdUrl)>,
    sequence_head: i64,
    /// Live log: everything newer than the archive floor.
    log: BTreeMap<u64, QueueMessage>,
    consumers: HashMap<GlobalId, ConsumerState>,
    producers: HashSet<GlobalId>,
    /// Duplicate detection per producer packet.
    seen: HashSet<(GlobalId, PacketId)>,
    archived_floor: i64,
    archive: Vec<ArchiveSnapshot>,
}

impl QueueState {
    fn new(queue_id: QueueId, owner: IdUrl, my_position: u32, revision: u64, peers: Vec<(u32, IdUrl)>) -> Self {
        Self {
            queue_id,
            owner,
            my_position,
            revision,
            peers,
            sequence_head: -1,
            log: BTreeMap::new(),
            consumers: HashMap::new(),
            producers: HashSet::new(),
            seen: HashSet::new(),
            archived_floor: -1,
            archive: Vec::new(),
        }
    }

    /// Lowest sequence every known consumer has acked; `None` without
    /// consumers (nothing may be archived blind).
    fn delivered_floor(&self) -> Option<i64> {
        self.consumers.values().map(|c| c.last_ack).min()
    }
}

enum BrokerCommand {
    HostQueue {
        queue_id: QueueId,
        owner: IdUrl,
        position: u32,
        peers: Vec<(u32, IdUrl)>,
        revision: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        connect: QueueConnect,
        consumer_idurl: IdUrl,
        reply: oneshot::Sender<Result<()>>,
    },
    Push {
        message: QueueMessage,
        reply: oneshot::Sender<Result<QueueMessage>>,
    },
    Replica {
        message: QueueMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    CatchUp {
        request: QueueCatchUp,
        reply: oneshot::Sender<Result<QueueCatchUpResult>>,
    },
    CancelConsumer {
        queue_id: QueueId,
        consumer_id: GlobalId,
    },
    CancelQueue {
        queue_id: QueueId,
    },
    QueueCount {
        reply: oneshot::Sender<usize>,
    },
    PeerRotated {
        old: IdUrl,
        new: IdUrl,
    },
    LocalRotated {
        old_user: bitdust_shared::types::GlobalUser,
        new_user: bitdust_shared::types::GlobalUser,
    },
    Shutdown,
}

enum Internal {
    Acked {
        queue_id: QueueId,
        consumer_id: GlobalId,
        sequence_id: u64,
    },
    ConsumerDead {
        queue_id: QueueId,
        consumer_id: GlobalId,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub async fn host_queue(
        &self,
        queue_id: QueueId,
        owner: IdUrl,
        position: u32,
        peers: Vec<(u32, IdUrl)>,
        revision: u64,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::HostQueue {
                queue_id,
                owner,
                position,
                peers,
                revision,
                reply: tx,
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn connect(&self, connect: QueueConnect, consumer_idurl: IdUrl) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::Connect {
                connect,
                consumer_idurl,
                reply: tx,
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Producer push: returns the message with its assigned sequence id.
    pub async fn push(&self, message: QueueMessage) -> Result<QueueMessage> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::Push { message, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn replica(&self, message: QueueMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::Replica { message, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn catch_up(&self, request: QueueCatchUp) -> Result<QueueCatchUpResult> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::CatchUp { request, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn cancel_consumer(&self, queue_id: QueueId, consumer_id: GlobalId) {
        let _ = self
            .cmd_tx
            .send(BrokerCommand::CancelConsumer {
                queue_id,
                consumer_id,
            })
            .await;
    }

    pub async fn cancel_queue(&self, queue_id: QueueId) {
        let _ = self.cmd_tx.send(BrokerCommand::CancelQueue { queue_id }).await;
    }

    pub async fn queue_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(BrokerCommand::QueueCount { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn peer_rotated(&self, old: IdUrl, new: IdUrl) {
        let _ = self.cmd_tx.send(BrokerCommand::PeerRotated { old, new }).await;
    }

    /// This node's own identity rotated: hosted queue ids embed the old
    /// user part and must follow.
    pub async fn local_rotated(
        &self,
        old_user: bitdust_shared::types::GlobalUser,
        new_user: bitdust_shared::types::GlobalUser,
    ) {
        let _ = self
            .cmd_tx
            .send(BrokerCommand::LocalRotated { old_user, new_user })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(BrokerCommand::Shutdown).await;
    }
}

pub struct BrokerService {
    my_id: Arc<MyIdentity>,
    gate: GateHandle,
    dht: DhtHandle,
    registry: Arc<IdentityRegistry>,
    queues: HashMap<QueueId, QueueState>,
    archive_chunk: u64,
    message_timeout: Duration,
    internal_tx: mpsc::Sender<Internal>,
}

impl BrokerService {
    pub fn spawn(
        my_id: Arc<MyIdentity>,
        gate: GateHandle,
        dht: DhtHandle,
        registry: Arc<IdentityRegistry>,
        archive_chunk: u64,
        message_timeout: Duration,
    ) -> BrokerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let service = Self {
            my_id,
            gate,
            dht,
            registry,
            queues: HashMap::new(),
            archive_chunk,
            message_timeout,
            internal_tx,
        };
        tokio::spawn(service.run(cmd_rx, internal_rx));
        BrokerHandle { cmd_tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<BrokerCommand>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        let mut flush = tokio::time::interval(ARCHIVE_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(BrokerCommand::HostQueue { queue_id, owner, position, peers, revision, reply }) => {
                            let _ = reply.send(self.host_queue(queue_id, owner, position, peers, revision));
                        }
                        Some(BrokerCommand::Connect { connect, consumer_idurl, reply }) => {
                            let _ = reply.send(self.connect(connect, consumer_idurl).await);
                        }
                        Some(BrokerCommand::Push { message, reply }) => {
                            let _ = reply.send(self.push(message).await);
                        }
                        Some(BrokerCommand::Replica { message, reply }) => {
                            let _ = reply.send(self.replica(message));
                        }
                        Some(BrokerCommand::CatchUp { request, reply }) => {
                            let _ = reply.send(self.catch_up(request));
                        }
                        Some(BrokerCommand::CancelConsumer { queue_id, consumer_id }) => {
                            if let Some(queue) = self.queues.get_mut(&queue_id) {
                                queue.consumers.remove(&consumer_id);
                                queue.producers.remove(&consumer_id);
                            }
                        }
                        Some(BrokerCommand::CancelQueue { queue_id }) => {
                            self.queues.remove(&queue_id);
                        }
                        Some(BrokerCommand::QueueCount { reply }) => {
                            let _ = reply.send(self.queues.len());
                        }
                        Some(BrokerCommand::PeerRotated { old, new }) => {
                            self.peer_rotated(old, new);
                        }
                        Some(BrokerCommand::LocalRotated { old_user, new_user }) => {
                            self.local_rotated(old_user, new_user);
                        }
                        Some(BrokerCommand::Shutdown) | None => break,
                    }
                }

                event = internal_rx.recv() => {
                    match event {
                        Some(Internal::Acked { queue_id, consumer_id, sequence_id }) => {
                            self.on_acked(queue_id, consumer_id, sequence_id).await;
                        }
                        Some(Internal::ConsumerDead { queue_id, consumer_id }) => {
                            if let Some(queue) = self.queues.get_mut(&queue_id) {
                                warn!(queue = %queue_id, consumer = %consumer_id, "consumer unreachable, dropped");
                                queue.consumers.remove(&consumer_id);
                            }
                        }
                        None => break,
                    }
                }

                _ = flush.tick() => {
                    // Timer-driven archive: flush delivered ranges shorter
                    // than a full chunk.
                    let queue_ids: Vec<QueueId> = self.queues.keys().cloned().collect();
                    for queue_id in queue_ids {
                        self.archive_now(&queue_id, true).await;
                    }
                }
            }
        }
    }

    // -- queue lifecycle ----------------------------------------------------

    fn host_queue(
        &mut self,
        queue_id: QueueId,
        owner: IdUrl,
        position: u32,
        peers: Vec<(u32, IdUrl)>,
        revision: u64,
    ) -> Result<()> {
        if let Some(existing) = self.queues.get_mut(&queue_id) {
            // Monotonic replacement: never accept an older triple.
            if revision < existing.revision {
                return Err(NodeError::Refused(format!(
                    "stale triple revision {revision} < {}",
                    existing.revision
                )));
            }
            existing.my_position = position;
            existing.peers = peers;
            existing.revision = revision;
            return Ok(());
        }

        // A mirror of the same queue under the previous primary means
        // this is a takeover or re-host: carry the log over.
        let mirrored = self
            .queues
            .keys()
            .find(|q| q.queue_alias == queue_id.queue_alias && q.owner == queue_id.owner)
            .cloned();
        if let Some(old_key) = mirrored {
            if let Some(mut queue) = self.queues.remove(&old_key) {
                if revision < queue.revision {
                    self.queues.insert(old_key, queue);
                    return Err(NodeError::Refused("stale triple revision".into()));
                }
                info!(queue = %queue_id, head = queue.sequence_head, "queue adopted from mirror");
                queue.queue_id = queue_id.clone();
                queue.my_position = position;
                queue.peers = peers;
                queue.revision = revision;
                self.queues.insert(queue_id, queue);
                return Ok(());
            }
        }

        info!(queue = %queue_id, position, revision, "queue hosted");
        self.queues.insert(
            queue_id.clone(),
            QueueState::new(queue_id, owner, position, revision, peers),
        );
        Ok(())
    }

    async fn connect(&mut self, connect: QueueConnect, consumer_idurl: IdUrl) -> Result<()> {
        // Membership: the consumer signs the group key id with its node key.
        let consumer_key = self
            .registry
            .public_key(&consumer_idurl)
            .await
            .ok_or_else(|| NodeError::Refused("unknown consumer identity".into()))?;
        let group_key_id = GlobalId {
            key_alias: connect.queue_id.queue_alias.clone(),
            user: connect.queue_id.owner.clone(),
        };
        if !KeyManager::verify_membership(&group_key_id, &consumer_key, &connect.group_key_signature)
        {
            return Err(NodeError::Refused("membership signature invalid".into()));
        }

        let queue = self
            .queues
            .get_mut(&connect.queue_id)
            .ok_or_else(|| NodeError::Refused(format!("no such queue {}", connect.queue_id)))?;

        let last_ack = connect.last_sequence_id.map(|s| s as i64).unwrap_or(-1);
        let start_from = last_ack.max(queue.archived_floor) + 1;

        let (out_tx, out_rx) = mpsc::channel(256);
        spawn_consumer_worker(
            self.gate.clone(),
            self.my_id.clone(),
            connect.queue_id.clone(),
            connect.consumer_id.clone(),
            consumer_idurl.clone(),
            out_rx,
            self.internal_tx.clone(),
            self.message_timeout,
        );

        // Backlog first, then live fan-out keeps the order strict.
        for (_, message) in queue.log.range(start_from.max(0) as u64..) {
            let _ = out_tx.send(message.clone()).await;
        }

        queue.producers.insert(connect.consumer_id.clone());
        queue.consumers.insert(
            connect.consumer_id.clone(),
            ConsumerState {
                last_ack,
                outbox: out_tx,
            },
        );
        debug!(queue = %connect.queue_id, consumer = %connect.consumer_id, from = start_from, "consumer connected");
        Ok(())
    }

    // -- message flow -------------------------------------------------------

    async fn push(&mut self, mut message: QueueMessage) -> Result<QueueMessage> {
        let producer_idurl = message.producer_id.user.idurl();
        let producer_key = self
            .registry
            .public_key(&producer_idurl)
            .await
            .ok_or_else(|| NodeError::Refused("unknown producer identity".into()))?;
        if verify_signature(&producer_key, &message.encrypted_payload, &message.signature).is_err()
        {
            return Err(NodeError::Refused("producer signature invalid".into()));
        }

        let queue = self
            .queues
            .get_mut(&message.queue_id)
            .ok_or_else(|| NodeError::Refused(format!("no such queue {}", message.queue_id)))?;

        if !queue.producers.contains(&message.producer_id) {
            return Err(NodeError::Refused("producer not attached".into()));
        }

        let dedup_key = (message.producer_id.clone(), message.producer_packet_id.clone());
        if queue.seen.contains(&dedup_key) {
            // Duplicate of an already sequenced message: re-ack it.
            if let Some(existing) = queue
                .log
                .values()
                .find(|m| {
                    m.producer_id == message.producer_id
                        && m.producer_packet_id == message.producer_packet_id
                })
                .cloned()
            {
                return Ok(existing);
            }
            return Err(NodeError::Refused("duplicate of an archived message".into()));
        }

        // The primary is the only source of sequence ids.
        let sequence_id = (queue.sequence_head + 1) as u64;
        message.sequence_id = Some(sequence_id);
        queue.sequence_head = sequence_id as i64;
        queue.seen.insert(dedup_key);
        queue.log.insert(sequence_id, message.clone());
        debug!(queue = %message.queue_id, seq = sequence_id, "message sequenced");

        // Best-effort replication to co-brokers; the producer ack does
        // not wait for it.
        for (_, peer) in &queue.peers {
            let gate = self.gate.clone();
            let my_id = self.my_id.clone();
            let peer = peer.clone();
            let body = Body::QueueReplica(message.clone());
            tokio::spawn(async move {
                if let Err(e) =
                    packets::request(&gate, &my_id, Command::Data, &peer, &body, None).await
                {
                    debug!(peer = %peer, error = %e, "replication failed");
                }
            });
        }

        // Fan out to every consumer through its ordered worker.
        for consumer in queue.consumers.values() {
            let _ = consumer.outbox.send(message.clone()).await;
        }

        Ok(message)
    }

    fn replica(&mut self, message: QueueMessage) -> Result<()> {
        let Some(sequence_id) = message.sequence_id else {
            return Err(NodeError::Refused("replica without sequence id".into()));
        };
        // Mirrors are keyed under the primary's queue id.
        let queue = self
            .queues
            .get_mut(&message.queue_id)
            .ok_or_else(|| NodeError::Refused(format!("not mirroring {}", message.queue_id)))?;
        queue.seen.insert((
            message.producer_id.clone(),
            message.producer_packet_id.clone(),
        ));
        queue.sequence_head = queue.sequence_head.max(sequence_id as i64);
        queue.log.insert(sequence_id, message);
        Ok(())
    }

    fn catch_up(&mut self, request: QueueCatchUp) -> Result<QueueCatchUpResult> {
        let queue = self
            .queues
            .get(&request.queue_id)
            .ok_or_else(|| NodeError::Refused(format!("no such queue {}", request.queue_id)))?;

        let from = request.from_sequence_id;
        let snapshots: Vec<ArchiveSnapshot> = queue
            .archive
            .iter()
            .filter(|s| s.last_sequence_id >= from)
            .cloned()
            .collect();
        let live: Vec<QueueMessage> = queue.log.range(from..).map(|(_, m)| m.clone()).collect();

        Ok(QueueCatchUpResult {
            queue_id: request.queue_id,
            head_sequence_id: (queue.sequence_head >= 0).then_some(queue.sequence_head as u64),
            live,
            snapshots,
        })
    }

    // -- delivery bookkeeping and archive ------------------------------------

    async fn on_acked(&mut self, queue_id: QueueId, consumer_id: GlobalId, sequence_id: u64) {
        let Some(queue) = self.queues.get_mut(&queue_id) else {
            return;
        };
        if let Some(consumer) = queue.consumers.get_mut(&consumer_id) {
            consumer.last_ack = consumer.last_ack.max(sequence_id as i64);
        }
        self.archive_now(&queue_id, false).await;
    }

    /// Package K consecutive fully-delivered messages into one snapshot,
    /// push it to the owner's suppliers and advance the floor. With
    /// `force`, flush a shorter delivered range (archive timer).
    async fn archive_now(&mut self, queue_id: &QueueId, force: bool) {
        let mut uploads: Vec<(IdUrl, ArchiveSnapshot)> = Vec::new();
        if let Some(queue) = self.queues.get_mut(queue_id) {
            let Some(delivered) = queue.delivered_floor() else {
                return;
            };
            loop {
                let available = delivered - queue.archived_floor;
                let chunk = if available >= self.archive_chunk as i64 {
                    self.archive_chunk as i64
                } else if force && available > 0 {
                    available
                } else {
                    break;
                };
                let first = (queue.archived_floor + 1) as u64;
                let last = (queue.archived_floor + chunk) as u64;
                let batch: Vec<QueueMessage> = (first..=last)
                    .filter_map(|seq| queue.log.get(&seq).cloned())
                    .collect();
                if batch.len() != chunk as usize {
                    // A gap in the live log (already archived elsewhere).
                    break;
                }
                let Ok(raw) = bincode::serialize(&batch) else {
                    break;
                };
                let signature = self.my_id.local().sign(&raw).to_bytes().to_vec();
                let snapshot = ArchiveSnapshot {
                    queue_alias: queue.queue_id.queue_alias.clone(),
                    first_sequence_id: first,
                    last_sequence_id: last,
                    encrypted_batch: raw,
                    signature,
                };
                queue.archive.push(snapshot.clone());
                queue.archived_floor = last as i64;
                for seq in first..=last {
                    queue.log.remove(&seq);
                }
                info!(queue = %queue.queue_id, first, last, "range archived");
                uploads.push((queue.owner.clone(), snapshot));
            }
        }
        for (owner, snapshot) in uploads {
            self.upload_snapshot(owner, snapshot);
        }
    }

    /// Store the snapshot in the owner's share: best-effort sends to the
    /// owner's advertised suppliers. The envelope's owner id names the
    /// share owner so the supplier files it under the right customer.
    fn upload_snapshot(&self, owner: IdUrl, snapshot: ArchiveSnapshot) {
        let gate = self.gate.clone();
        let my_id = self.my_id.clone();
        let dht = self.dht.clone();
        tokio::spawn(async move {
            let suppliers = match dht.read_slate(&owner).await {
                Ok(Some(view)) => view.suppliers.into_iter().flatten().collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            let body = Body::Archive(snapshot);
            for supplier in suppliers {
                let envelope = match bitdust_shared::envelope::Envelope::build(
                    Command::Data,
                    owner.clone(),
                    my_id.idurl(),
                    PacketId::random(),
                    supplier.clone(),
                    &body,
                    my_id.local(),
                ) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "snapshot envelope build failed");
                        return;
                    }
                };
                match gate.outbox(envelope, false).await {
                    Ok(ticket) => {
                        let _ = ticket.wait().await;
                    }
                    Err(e) => debug!(supplier = %supplier, error = %e, "snapshot upload failed"),
                }
            }
        });
    }

    // -- rotation -----------------------------------------------------------

    fn local_rotated(
        &mut self,
        old_user: bitdust_shared::types::GlobalUser,
        new_user: bitdust_shared::types::GlobalUser,
    ) {
        let rekeyed: Vec<QueueId> = self
            .queues
            .keys()
            .filter(|q| q.supplier == old_user)
            .cloned()
            .collect();
        for old_key in rekeyed {
            if let Some(mut queue) = self.queues.remove(&old_key) {
                let new_key = old_key.rehost(new_user.clone());
                queue.queue_id = new_key.clone();
                self.queues.insert(new_key, queue);
            }
        }
    }

    fn peer_rotated(&mut self, old: IdUrl, new: IdUrl) {
        let Ok(new_user) = new.user() else {
            return;
        };
        let rekeyed: Vec<QueueId> = self
            .queues
            .keys()
            .filter(|q| q.owner.idurl() == old)
            .cloned()
            .collect();
        for old_key in rekeyed {
            if let Some(mut queue) = self.queues.remove(&old_key) {
                let new_key = QueueId {
                    queue_alias: old_key.queue_alias.clone(),
                    owner: new_user.clone(),
                    supplier: old_key.supplier.clone(),
                };
                queue.queue_id = new_key.clone();
                queue.owner = new.clone();
                self.queues.insert(new_key, queue);
            }
        }
        for queue in self.queues.values_mut() {
            for (_, peer) in queue.peers.iter_mut() {
                if *peer == old {
                    *peer = new.clone();
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_consumer_worker(
    gate: GateHandle,
    my_id: Arc<MyIdentity>,
    queue_id: QueueId,
    consumer_id: GlobalId,
    consumer_idurl: IdUrl,
    mut rx: mpsc::Receiver<QueueMessage>,
    internal: mpsc::Sender<Internal>,
    message_timeout: Duration,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Some(sequence_id) = message.sequence_id else {
                continue;
            };
            let body = Body::Queue(message);
            let mut attempts = 0;
            loop {
                match packets::request(
                    &gate,
                    &my_id,
                    Command::Data,
                    &consumer_idurl,
                    &body,
                    Some(message_timeout),
                )
                .await
                {
                    Ok(_) => {
                        let _ = internal
                            .send(Internal::Acked {
                                queue_id: queue_id.clone(),
                                consumer_id: consumer_id.clone(),
                                sequence_id,
                            })
                            .await;
                        break;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= DELIVERY_ATTEMPTS {
                            debug!(consumer = %consumer_id, error = %e, "delivery abandoned");
                            let _ = internal
                                .send(Internal::ConsumerDead {
                                    queue_id,
                                    consumer_id,
                                })
                                .await;
                            return;
                        }
                        tokio::time::sleep(DELIVERY_RETRY_DELAY).await;
                    }
                }
            }
        }
    });
}
