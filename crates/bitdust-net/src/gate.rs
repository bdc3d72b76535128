//! The transport gate: a single outbox/inbox for signed packets.
//!
//! The gate runs as one tokio task owning all in-flight state, driven by a
//! command channel. An outbound packet becomes a [`PacketOut`] with one
//! work item per `(transport, remote host)` attempt; each work item gets a
//! unique transfer id so transports can be told about in-flight transfers
//! without holding the packet. `wide` sends fan out to every contact of
//! the remote identity in parallel and the first Ack collapses the rest.
//!
//! Inbound frames are decoded, checked against the cached identity of
//! their creator and dropped on any signature mismatch. Ack and Fail
//! packets resolve the matching [`PacketOut`]; everything else goes to the
//! first inbox subscriber whose command filter matches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bitdust_shared::constants::{DEFAULT_ACK_TIMEOUT_SECS, TIMEOUT_SCAN_INTERVAL_SECS};
use bitdust_shared::envelope::{Command, Envelope};
use bitdust_shared::payloads::Body;
use bitdust_shared::types::{IdUrl, PacketId};

use crate::error::{NetError, Result};
use crate::stats::DeliveryStats;
use crate::transport::{
    ContactAddress, ContactResolver, InboundFrame, Transport, TransportProto,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Unreachable,
    Timeout,
    Refused,
    Cancelled,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailReason::Unreachable => "unreachable",
            FailReason::Timeout => "timeout",
            FailReason::Refused => "refused",
            FailReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which transport and host a packet arrived from or left to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub proto: TransportProto,
    pub host: String,
}

/// Terminal outcome of an outbound packet.
#[derive(Debug)]
pub enum Delivery {
    Acked {
        response: Envelope,
        info: TransportInfo,
    },
    Failed {
        reason: FailReason,
        detail: String,
    },
    /// Fire-and-forget packet (Ack/Fail) handed to the transports; no
    /// response is ever expected.
    Dispatched,
}

/// Handle returned by [`GateHandle::outbox`]; await `delivery` for the
/// terminal outcome.
#[derive(Debug)]
pub struct OutboxTicket {
    pub packet_id: PacketId,
    pub delivery: oneshot::Receiver<Delivery>,
}

impl OutboxTicket {
    /// Wait for the terminal outcome. A dropped gate counts as cancelled.
    pub async fn wait(self) -> Delivery {
        self.delivery.await.unwrap_or(Delivery::Failed {
            reason: FailReason::Cancelled,
            detail: "gate dropped".into(),
        })
    }
}

/// A verified inbound packet handed to a subscriber.
#[derive(Debug)]
pub struct InboundPacket {
    pub envelope: Envelope,
    pub info: TransportInfo,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub ack_timeout: Duration,
    pub scan_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            scan_interval: Duration::from_secs(TIMEOUT_SCAN_INTERVAL_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum GateCommand {
    Outbox {
        envelope: Envelope,
        contacts: Vec<ContactAddress>,
        wide: bool,
        ack_timeout: Option<Duration>,
        delivery: oneshot::Sender<Delivery>,
    },
    CancelPacket(PacketId),
    CancelTransfer(u64),
    RegisterTransport(Arc<dyn Transport>),
    UnregisterTransport(TransportProto),
    Subscribe {
        commands: Vec<Command>,
        tx: mpsc::Sender<InboundPacket>,
    },
    Shutdown,
}

enum Internal {
    SendResult {
        transfer_id: u64,
        result: std::result::Result<(), NetError>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front of the gate task.
#[derive(Clone)]
pub struct GateHandle {
    cmd_tx: mpsc::Sender<GateCommand>,
    resolver: Arc<dyn ContactResolver>,
    config: GateConfig,
}

impl GateHandle {
    /// Queue a signed packet for delivery to `envelope.remote_id`.
    ///
    /// Returns immediately; the ticket resolves when the remote acked,
    /// refused, or every attempt was exhausted.
    pub async fn outbox(&self, envelope: Envelope, wide: bool) -> Result<OutboxTicket> {
        self.outbox_with_timeout(envelope, wide, None).await
    }

    pub async fn outbox_with_timeout(
        &self,
        envelope: Envelope,
        wide: bool,
        ack_timeout: Option<Duration>,
    ) -> Result<OutboxTicket> {
        let remote = envelope.remote_id.clone();
        let contacts = self.resolver.contacts(&remote).await.unwrap_or_default();
        let packet_id = envelope.packet_id.clone();
        let (delivery_tx, delivery_rx) = oneshot::channel();
        self.cmd_tx
            .send(GateCommand::Outbox {
                envelope,
                contacts,
                wide,
                ack_timeout,
                delivery: delivery_tx,
            })
            .await
            .map_err(|_| NetError::GateClosed)?;
        Ok(OutboxTicket {
            packet_id,
            delivery: delivery_rx,
        })
    }

    /// Resolve the contact methods for a remote without sending anything.
    pub async fn connect_to(&self, idurl: &IdUrl) -> Result<Vec<ContactAddress>> {
        self.resolver
            .contacts(idurl)
            .await
            .filter(|c| !c.is_empty())
            .ok_or_else(|| NetError::NoContacts(idurl.to_string()))
    }

    pub async fn cancel_packet(&self, packet_id: PacketId) -> Result<()> {
        self.cmd_tx
            .send(GateCommand::CancelPacket(packet_id))
            .await
            .map_err(|_| NetError::GateClosed)
    }

    pub async fn cancel_transfer(&self, transfer_id: u64) -> Result<()> {
        self.cmd_tx
            .send(GateCommand::CancelTransfer(transfer_id))
            .await
            .map_err(|_| NetError::GateClosed)
    }

    pub async fn register_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.cmd_tx
            .send(GateCommand::RegisterTransport(transport))
            .await
            .map_err(|_| NetError::GateClosed)
    }

    pub async fn unregister_transport(&self, proto: TransportProto) -> Result<()> {
        self.cmd_tx
            .send(GateCommand::UnregisterTransport(proto))
            .await
            .map_err(|_| NetError::GateClosed)
    }

    /// Subscribe to verified inbound packets with the given commands.
    /// Earlier subscriptions win when filters overlap.
    pub async fn subscribe(&self, commands: &[Command]) -> Result<mpsc::Receiver<InboundPacket>> {
        let (tx, rx) = mpsc::channel(256);
        self.cmd_tx
            .send(GateCommand::Subscribe {
                commands: commands.to_vec(),
                tx,
            })
            .await
            .map_err(|_| NetError::GateClosed)?;
        Ok(rx)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(GateCommand::Shutdown).await;
    }

    pub fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout
    }
}

// ---------------------------------------------------------------------------
// Gate task
// ---------------------------------------------------------------------------

struct WorkItem {
    transfer_id: u64,
    address: ContactAddress,
    in_flight: bool,
}

struct PacketOut {
    envelope: Envelope,
    remote: IdUrl,
    /// Ordered contacts not yet attempted.
    untried: Vec<ContactAddress>,
    items: Vec<WorkItem>,
    wide: bool,
    deadline: Instant,
    delivery: Option<oneshot::Sender<Delivery>>,
    last_error: String,
}

pub struct Gate {
    config: GateConfig,
    resolver: Arc<dyn ContactResolver>,
    transports: HashMap<TransportProto, Arc<dyn Transport>>,
    subscribers: Vec<(Vec<Command>, mpsc::Sender<InboundPacket>)>,
    pending: HashMap<PacketId, PacketOut>,
    transfer_index: HashMap<u64, PacketId>,
    next_transfer_id: u64,
    stats: DeliveryStats,
    internal_tx: mpsc::Sender<Internal>,
}

impl Gate {
    /// Spawn the gate task. Returns the handle and the sender transports
    /// push received frames into.
    pub fn spawn(
        config: GateConfig,
        resolver: Arc<dyn ContactResolver>,
    ) -> (GateHandle, mpsc::Sender<InboundFrame>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (frame_tx, frame_rx) = mpsc::channel(1024);
        let (internal_tx, internal_rx) = mpsc::channel(1024);

        let gate = Gate {
            config: config.clone(),
            resolver: resolver.clone(),
            transports: HashMap::new(),
            subscribers: Vec::new(),
            pending: HashMap::new(),
            transfer_index: HashMap::new(),
            next_transfer_id: 1,
            stats: DeliveryStats::new(),
            internal_tx,
        };

        tokio::spawn(gate.run(cmd_rx, frame_rx, internal_rx));

        (
            GateHandle {
                cmd_tx,
                resolver,
                config,
            },
            frame_tx,
        )
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<GateCommand>,
        mut frame_rx: mpsc::Receiver<InboundFrame>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        let scan_every = jittered(self.config.scan_interval);
        let mut scan = tokio::time::interval(scan_every);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(GateCommand::Outbox { envelope, contacts, wide, ack_timeout, delivery }) => {
                            self.start_outbox(envelope, contacts, wide, ack_timeout, delivery);
                        }
                        Some(GateCommand::CancelPacket(packet_id)) => {
                            self.resolve(&packet_id, FailReason::Cancelled, "cancelled by caller");
                        }
                        Some(GateCommand::CancelTransfer(transfer_id)) => {
                            if let Some(packet_id) = self.transfer_index.get(&transfer_id).cloned() {
                                self.resolve(&packet_id, FailReason::Cancelled, "transfer cancelled");
                            }
                        }
                        Some(GateCommand::RegisterTransport(t)) => {
                            info!(proto = %t.proto(), "transport registered");
                            self.transports.insert(t.proto(), t);
                        }
                        Some(GateCommand::UnregisterTransport(proto)) => {
                            info!(proto = %proto, "transport unregistered");
                            self.transports.remove(&proto);
                        }
                        Some(GateCommand::Subscribe { commands, tx }) => {
                            self.subscribers.push((commands, tx));
                        }
                        Some(GateCommand::Shutdown) | None => {
                            info!("gate shutting down");
                            break;
                        }
                    }
                }

                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => break,
                    }
                }

                event = internal_rx.recv() => {
                    if let Some(Internal::SendResult { transfer_id, result }) = event {
                        self.handle_send_result(transfer_id, result);
                    }
                }

                _ = scan.tick() => {
                    self.scan_timeouts();
                }
            }
        }
    }

    // -- outbound -----------------------------------------------------------

    fn start_outbox(
        &mut self,
        envelope: Envelope,
        contacts: Vec<ContactAddress>,
        wide: bool,
        ack_timeout: Option<Duration>,
        delivery: oneshot::Sender<Delivery>,
    ) {
        let remote = envelope.remote_id.clone();
        let packet_id = envelope.packet_id.clone();
        let usable: Vec<ContactAddress> = self
            .stats
            .order_contacts(&remote, contacts)
            .into_iter()
            .filter(|c| self.transports.contains_key(&c.proto))
            .collect();

        if usable.is_empty() {
            debug!(remote = %remote, packet = %packet_id, "no usable contacts");
            let _ = delivery.send(Delivery::Failed {
                reason: FailReason::Unreachable,
                detail: "no usable contacts".into(),
            });
            return;
        }

        let timeout = ack_timeout.unwrap_or(self.config.ack_timeout);
        let mut out = PacketOut {
            envelope,
            remote,
            untried: usable,
            items: Vec::new(),
            wide,
            deadline: Instant::now() + timeout,
            delivery: Some(delivery),
            last_error: String::new(),
        };

        if wide {
            // Fan out to every contact in parallel.
            while !out.untried.is_empty() {
                self.launch_next(&mut out, &packet_id);
            }
        } else {
            self.launch_next(&mut out, &packet_id);
        }

        // Responses to responses do not exist: Ack and Fail packets are
        // not tracked for a reply.
        if matches!(out.envelope.command, Command::Ack | Command::Fail) {
            for item in &out.items {
                self.transfer_index.remove(&item.transfer_id);
            }
            if let Some(tx) = out.delivery.take() {
                let _ = tx.send(Delivery::Dispatched);
            }
            return;
        }

        self.pending.insert(packet_id, out);
    }

    fn launch_next(&mut self, out: &mut PacketOut, packet_id: &PacketId) {
        let Some(address) = out.untried.first().cloned() else {
            return;
        };
        out.untried.remove(0);

        let Some(transport) = self.transports.get(&address.proto).cloned() else {
            return;
        };

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        self.transfer_index.insert(transfer_id, packet_id.clone());

        debug!(
            packet = %packet_id,
            transfer = transfer_id,
            address = %address,
            "work item started"
        );

        self.stats.on_sent(&out.remote, address.proto);
        out.items.push(WorkItem {
            transfer_id,
            address: address.clone(),
            in_flight: true,
        });

        let frame = out.envelope.encode();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.send(&address, frame).await;
            let _ = internal
                .send(Internal::SendResult {
                    transfer_id,
                    result,
                })
                .await;
        });
    }

    fn handle_send_result(
        &mut self,
        transfer_id: u64,
        result: std::result::Result<(), NetError>,
    ) {
        let Some(packet_id) = self.transfer_index.get(&transfer_id).cloned() else {
            return;
        };
        let Some(mut out) = self.pending.remove(&packet_id) else {
            self.transfer_index.remove(&transfer_id);
            return;
        };

        let proto = out
            .items
            .iter_mut()
            .find(|i| i.transfer_id == transfer_id)
            .map(|item| {
                item.in_flight = false;
                item.address.proto
            });

        match result {
            Ok(()) => {
                // Frame left this node; now the ack clock is running.
                self.pending.insert(packet_id, out);
            }
            Err(e) => {
                if let Some(proto) = proto {
                    self.stats.on_failed(&out.remote, proto);
                }
                warn!(packet = %packet_id, transfer = transfer_id, error = %e, "work item failed");
                out.last_error = e.to_string();

                let any_in_flight = out.items.iter().any(|i| i.in_flight);
                if !out.wide && !out.untried.is_empty() {
                    // Single transport failure is never fatal: next one.
                    self.launch_next(&mut out, &packet_id);
                    self.pending.insert(packet_id, out);
                } else if any_in_flight || !out.untried.is_empty() {
                    self.pending.insert(packet_id, out);
                } else {
                    let detail = out.last_error.clone();
                    self.finish(out, FailReason::Unreachable, &detail);
                }
            }
        }
    }

    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<PacketId> = self
            .pending
            .iter()
            .filter(|(_, out)| now >= out.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for packet_id in expired {
            self.resolve(&packet_id, FailReason::Timeout, "ack timeout");
        }
    }

    fn resolve(&mut self, packet_id: &PacketId, reason: FailReason, detail: &str) {
        if let Some(out) = self.pending.remove(packet_id) {
            self.finish(out, reason, detail);
        }
    }

    fn finish(&mut self, mut out: PacketOut, reason: FailReason, detail: &str) {
        debug!(
            packet = %out.envelope.packet_id,
            reason = %reason,
            detail = %detail,
            "packet resolved without ack"
        );
        for item in &out.items {
            self.transfer_index.remove(&item.transfer_id);
        }
        if let Some(tx) = out.delivery.take() {
            let _ = tx.send(Delivery::Failed {
                reason,
                detail: detail.to_string(),
            });
        }
    }

    // -- inbound ------------------------------------------------------------

    async fn handle_frame(&mut self, frame: InboundFrame) {
        let envelope = match Envelope::decode(&frame.data) {
            Ok(e) => e,
            Err(e) => {
                warn!(from = %frame.from_host, error = %e, "malformed inbound frame");
                return;
            }
        };
        let info = TransportInfo {
            proto: frame.proto,
            host: frame.from_host,
        };

        if !self.verify_inbound(&envelope).await {
            return;
        }

        match envelope.command {
            Command::Ack => self.settle_ack(envelope, info).await,
            Command::Fail => self.settle_fail(envelope, info).await,
            _ => self.dispatch(envelope, info).await,
        }
    }

    /// Signature check against the cached identity of the creator.
    /// Identity packets may verify against the document they carry, so a
    /// first contact can introduce itself.
    async fn verify_inbound(&mut self, envelope: &Envelope) -> bool {
        let creator = &envelope.creator_id;
        if let Some(key) = self.resolver.public_key(creator).await {
            if envelope.verify(&key).is_ok() {
                return true;
            }
            // Possible key rotation behind the same URL: refresh the cache.
            self.resolver.invalidate(creator).await;
            warn!(creator = %creator, packet = %envelope.packet_id, "invalid-signature");
            return false;
        }

        if envelope.command == Command::Identity {
            if let Ok(Body::Identity(doc)) = envelope.body() {
                if doc.verify().is_ok() {
                    if let Ok(key) = doc.public_key_bytes() {
                        if envelope.verify(&key).is_ok() {
                            return true;
                        }
                    }
                }
            }
        }

        warn!(creator = %creator, packet = %envelope.packet_id, "invalid-signature");
        false
    }

    async fn settle_ack(&mut self, envelope: Envelope, info: TransportInfo) {
        if let Some(mut out) = self.pending.remove(&envelope.packet_id) {
            self.stats.on_acked(&out.remote, info.proto);
            for item in &out.items {
                self.transfer_index.remove(&item.transfer_id);
            }
            debug!(packet = %envelope.packet_id, from = %info.host, "acked");
            if let Some(tx) = out.delivery.take() {
                let _ = tx.send(Delivery::Acked {
                    response: envelope,
                    info,
                });
            }
            return;
        }
        // Nobody waiting; still offer it to subscribers.
        self.dispatch(envelope, info).await;
    }

    async fn settle_fail(&mut self, envelope: Envelope, info: TransportInfo) {
        let detail = match envelope.body() {
            Ok(Body::Text(t)) => t,
            _ => "refused".to_string(),
        };
        if self.pending.contains_key(&envelope.packet_id) {
            self.resolve(&envelope.packet_id.clone(), FailReason::Refused, &detail);
            return;
        }
        self.dispatch(envelope, info).await;
    }

    async fn dispatch(&mut self, envelope: Envelope, info: TransportInfo) {
        for (commands, tx) in &self.subscribers {
            if commands.contains(&envelope.command) {
                if tx
                    .send(InboundPacket { envelope, info })
                    .await
                    .is_err()
                {
                    warn!("inbox subscriber dropped");
                }
                return;
            }
        }
        debug!(command = %envelope.command, packet = %envelope.packet_id, "unconsumed inbound packet");
    }
}

fn jittered(base: Duration) -> Duration {
    let ratio = bitdust_shared::constants::TIMER_JITTER_RATIO;
    let factor = 1.0 + rand::thread_rng().gen_range(-ratio..ratio);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHub, StaticResolver};
    use bitdust_shared::identity::LocalIdentity;

    fn idurl(n: &str) -> IdUrl {
        IdUrl::for_user("id.example.com", 8084, n)
    }

    struct Node {
        identity: LocalIdentity,
        idurl: IdUrl,
        gate: GateHandle,
    }

    async fn make_node(
        name: &str,
        hub: &Arc<MemoryHub>,
        resolver: &Arc<StaticResolver>,
    ) -> Node {
        let identity = LocalIdentity::generate();
        let url = idurl(name);
        resolver.insert(
            url.clone(),
            identity.public_key_bytes(),
            vec![ContactAddress {
                proto: TransportProto::Memory,
                host: name.to_string(),
            }],
        );
        let (gate, frame_tx) = Gate::spawn(
            GateConfig {
                ack_timeout: Duration::from_millis(500),
                scan_interval: Duration::from_millis(50),
            },
            resolver.clone() as Arc<dyn ContactResolver>,
        );
        let transport = hub.attach(name, frame_tx);
        gate.register_transport(transport).await.unwrap();
        Node {
            identity,
            idurl: url,
            gate,
        }
    }

    fn message(node: &Node, to: &IdUrl) -> Envelope {
        Envelope::build(
            Command::Message,
            node.idurl.clone(),
            node.idurl.clone(),
            PacketId::random(),
            to.clone(),
            &Body::Text("hi".into()),
            &node.identity,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ack_resolves_outbox() {
        let hub = MemoryHub::new();
        let resolver = StaticResolver::new();
        let alice = make_node("alice", &hub, &resolver).await;
        let bob = make_node("bob", &hub, &resolver).await;

        let mut inbox = bob.gate.subscribe(&[Command::Message]).await.unwrap();
        let bob_idurl = bob.idurl.clone();
        let bob_identity = bob.identity.clone();
        let bob_gate = bob.gate.clone();
        tokio::spawn(async move {
            while let Some(packet) = inbox.recv().await {
                let ack = packet
                    .envelope
                    .ack(bob_idurl.clone(), &Body::Empty, &bob_identity)
                    .unwrap();
                let _ = bob_gate.outbox(ack, false).await;
            }
        });

        let ticket = alice
            .gate
            .outbox(message(&alice, &bob.idurl), false)
            .await
            .unwrap();
        match ticket.wait().await {
            Delivery::Acked { response, .. } => {
                assert_eq!(response.command, Command::Ack);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_remote_fails() {
        let hub = MemoryHub::new();
        let resolver = StaticResolver::new();
        let alice = make_node("alice", &hub, &resolver).await;
        let bob = make_node("bob", &hub, &resolver).await;
        hub.kill("bob");

        let ticket = alice
            .gate
            .outbox(message(&alice, &bob.idurl), false)
            .await
            .unwrap();
        match ticket.wait().await {
            Delivery::Failed { reason, .. } => assert_eq!(reason, FailReason::Unreachable),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_remote_times_out() {
        let hub = MemoryHub::new();
        let resolver = StaticResolver::new();
        let alice = make_node("alice", &hub, &resolver).await;
        let bob = make_node("bob", &hub, &resolver).await;
        // Bob's gate is running but nobody subscribes or acks.
        let _ = &bob;

        let ticket = alice
            .gate
            .outbox(message(&alice, &bob.idurl), false)
            .await
            .unwrap();
        match ticket.wait().await {
            Delivery::Failed { reason, .. } => assert_eq!(reason, FailReason::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_packet_is_dropped() {
        let hub = MemoryHub::new();
        let resolver = StaticResolver::new();
        let alice = make_node("alice", &hub, &resolver).await;
        let bob = make_node("bob", &hub, &resolver).await;

        let mut inbox = bob.gate.subscribe(&[Command::Message]).await.unwrap();

        let mut envelope = message(&alice, &bob.idurl);
        envelope.payload = Body::Text("forged".into()).encode().unwrap();
        // Deliver the tampered frame straight through the hub.
        hub.inject("alice", "bob", envelope.encode()).await;

        let got = tokio::time::timeout(Duration::from_millis(200), inbox.recv()).await;
        assert!(got.is_err(), "tampered packet must not be dispatched");
    }

    #[tokio::test]
    async fn cancel_resolves_with_cancelled() {
        let hub = MemoryHub::new();
        let resolver = StaticResolver::new();
        let alice = make_node("alice", &hub, &resolver).await;
        let bob = make_node("bob", &hub, &resolver).await;
        let _ = &bob;

        let ticket = alice
            .gate
            .outbox(message(&alice, &bob.idurl), false)
            .await
            .unwrap();
        alice.gate.cancel_packet(ticket.packet_id.clone()).await.unwrap();
        match ticket.wait().await {
            Delivery::Failed { reason, .. } => assert_eq!(reason, FailReason::Cancelled),
            other => panic!("expected cancelled, got {other:?}"),
        }
    }
}
