//! Identity propagation: pushing the local identity to its servers, to
//! known peers through the gate, and into the DHT.
//!
//! Runs periodically and on events (rotation, new contact, explicit
//! ping). The responder half answers inbound Identity packets: cache the
//! document, detect peer rotations, ack.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use bitdust_net::gate::{Delivery, GateHandle};
use bitdust_net::dht::DhtHandle;
use bitdust_shared::constants::TIMER_JITTER_RATIO;
use bitdust_shared::envelope::{Command, Envelope};
use bitdust_shared::payloads::Body;
use bitdust_shared::types::{IdUrl, PacketId};

use crate::error::{IdError, Result};
use crate::events::IdentityEvent;
use crate::my_id::MyIdentity;
use crate::registry::IdentityRegistry;
use crate::server_client::IdServerClient;

pub struct Propagator {
    my_id: Arc<MyIdentity>,
    registry: Arc<IdentityRegistry>,
    servers: Arc<dyn IdServerClient>,
    gate: GateHandle,
    dht: DhtHandle,
    bus: broadcast::Sender<IdentityEvent>,
}

impl Propagator {
    pub fn new(
        my_id: Arc<MyIdentity>,
        registry: Arc<IdentityRegistry>,
        servers: Arc<dyn IdServerClient>,
        gate: GateHandle,
        dht: DhtHandle,
        bus: broadcast::Sender<IdentityEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            my_id,
            registry,
            servers,
            gate,
            dht,
            bus,
        })
    }

    /// Periodic push to servers and DHT, default every hour.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(interval)).await;
                let published = this.propagate_to_servers().await;
                if let Err(e) = this.publish_to_dht().await {
                    warn!(error = %e, "identity DHT publish failed");
                }
                debug!(servers = published, "periodic identity propagation");
            }
        });
    }

    /// Push the current document to every server in its sources. Returns
    /// the number of servers that accepted it.
    pub async fn propagate_to_servers(&self) -> usize {
        let doc = self.my_id.document();
        let mut published = 0;
        for source in &doc.sources {
            let (host, port) = match (source.host(), source.port()) {
                (Ok(h), p) => (h, p),
                (Err(_), _) => continue,
            };
            match self.servers.publish(&host, port, &doc).await {
                Ok(()) => published += 1,
                Err(e) => debug!(server = %source, error = %e, "identity publish failed"),
            }
        }
        let _ = self.bus.send(IdentityEvent::Propagated { servers: published });
        published
    }

    /// Record the current document in the DHT under `identity:<idurl>`.
    pub async fn publish_to_dht(&self) -> Result<()> {
        let doc = self.my_id.document();
        let idurl = self.my_id.idurl();
        self.dht
            .put_json(&format!("identity:{idurl}"), &doc)
            .await
            .map_err(IdError::Net)
    }

    /// Send an Identity packet to every target; returns how many acked.
    /// `wide` tries every contact method of each target in parallel.
    pub async fn propagate(&self, targets: &[IdUrl], wide: bool) -> usize {
        let sends = targets.iter().map(|target| self.single(target, wide));
        let results = futures::future::join_all(sends).await;
        results.iter().filter(|r| r.is_ok()).count()
    }

    /// Push the local identity to one peer and await its Ack.
    pub async fn single(&self, target: &IdUrl, wide: bool) -> Result<()> {
        // Make sure the target identity (and with it, its contacts) is
        // cached before addressing it.
        self.registry.get(target, false).await?;

        let envelope = self.identity_packet(target)?;
        let ticket = self.gate.outbox(envelope, wide).await?;
        match ticket.wait().await {
            Delivery::Acked { .. } | Delivery::Dispatched => Ok(()),
            Delivery::Failed { reason, detail } => Err(IdError::Net(
                bitdust_net::error::NetError::Unreachable(format!("{target}: {reason} ({detail})")),
            )),
        }
    }

    /// Round-trip probe: Identity packet out, Ack back, latency measured.
    pub async fn ping(&self, target: &IdUrl) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        self.single(target, true).await?;
        Ok(started.elapsed())
    }

    fn identity_packet(&self, target: &IdUrl) -> Result<Envelope> {
        let me = self.my_id.idurl();
        Envelope::build(
            Command::Identity,
            me.clone(),
            me,
            PacketId::random(),
            target.clone(),
            &Body::Identity(self.my_id.document()),
            self.my_id.local(),
        )
        .map_err(|e| IdError::Malformed(e.to_string()))
    }
}

/// Answer inbound Identity packets: verify, cache, detect peer rotation,
/// ack. Spawned once per node.
pub fn spawn_identity_responder(
    gate: GateHandle,
    registry: Arc<IdentityRegistry>,
    my_id: Arc<MyIdentity>,
    bus: broadcast::Sender<IdentityEvent>,
) {
    tokio::spawn(async move {
        let mut inbox = match gate.subscribe(&[Command::Identity]).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "identity responder could not subscribe");
                return;
            }
        };
        info!("identity responder listening");

        while let Some(packet) = inbox.recv().await {
            let Ok(Body::Identity(doc)) = packet.envelope.body() else {
                continue;
            };
            if doc.verify().is_err() {
                warn!(creator = %packet.envelope.creator_id, "identity packet with bad document");
                continue;
            }

            // Peer rotation: a cached document with the same key but a
            // different primary source means the peer moved.
            let new_primary = doc.sources.first().cloned();
            if let Some(new_primary) = new_primary {
                for known in registry.known() {
                    if let Some(cached) = registry.get_cached(&known) {
                        if cached.publickey == doc.publickey
                            && cached.sources.first() != doc.sources.first()
                            && doc.revision > cached.revision
                        {
                            let old_primary = cached.sources.first().cloned();
                            if let Some(old) = old_primary {
                                debug!(old = %old, new = %new_primary, "peer identity rotated");
                                let _ = bus.send(IdentityEvent::PeerRotated {
                                    old,
                                    new: new_primary.clone(),
                                });
                            }
                            break;
                        }
                    }
                }
            }

            if let Err(e) = registry.put(doc) {
                warn!(error = %e, "identity packet rejected");
                continue;
            }

            let me = my_id.idurl();
            match packet.envelope.ack(me, &Body::Empty, my_id.local()) {
                Ok(ack) => {
                    if let Err(e) = gate.outbox(ack, false).await {
                        debug!(error = %e, "identity ack send failed");
                    }
                }
                Err(e) => warn!(error = %e, "identity ack build failed"),
            }
        }
    });
}

fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-TIMER_JITTER_RATIO..TIMER_JITTER_RATIO);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_client::MemoryIdServers;
    use bitdust_net::dht::backend::{DhtBackend, MemoryDhtBackend};
    use bitdust_net::dht::DhtConfig;
    use bitdust_net::gate::{Gate, GateConfig};
    use bitdust_net::memory::MemoryHub;
    use bitdust_net::transport::ContactResolver;

    struct TestNode {
        me: Arc<MyIdentity>,
        registry: Arc<IdentityRegistry>,
        propagator: Arc<Propagator>,
    }

    async fn make_node(
        name: &str,
        hub: &Arc<MemoryHub>,
        servers: &Arc<MemoryIdServers>,
        dht_backend: &Arc<MemoryDhtBackend>,
    ) -> TestNode {
        let me = Arc::new(MyIdentity::create(
            name,
            "id-a.example.com",
            8084,
            vec![format!("memory://{name}")],
        ));
        servers
            .publish("id-a.example.com", 8084, &me.document())
            .await
            .unwrap();

        let registry = IdentityRegistry::new(servers.clone() as Arc<dyn IdServerClient>);
        registry.put(me.document()).unwrap();

        let (gate, frame_tx) = Gate::spawn(
            GateConfig {
                ack_timeout: Duration::from_millis(500),
                scan_interval: Duration::from_millis(50),
            },
            registry.clone() as Arc<dyn ContactResolver>,
        );
        let transport = hub.attach(name, frame_tx);
        gate.register_transport(transport).await.unwrap();

        let dht = DhtHandle::spawn(
            dht_backend.clone() as Arc<dyn DhtBackend>,
            name,
            DhtConfig::default(),
        );
        let (bus, _events) = crate::events::new_bus();
        let propagator = Propagator::new(
            me.clone(),
            registry.clone(),
            servers.clone() as Arc<dyn IdServerClient>,
            gate.clone(),
            dht,
            bus.clone(),
        );
        spawn_identity_responder(gate, registry.clone(), me.clone(), bus);

        TestNode {
            me,
            registry,
            propagator,
        }
    }

    #[tokio::test]
    async fn ping_round_trip_caches_both_sides() {
        let hub = MemoryHub::new();
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let dht_backend = MemoryDhtBackend::new();

        let alice = make_node("alice", &hub, &servers, &dht_backend).await;
        let bob = make_node("bob", &hub, &servers, &dht_backend).await;

        let latency = alice.propagator.ping(&bob.me.idurl()).await.unwrap();
        assert!(latency < Duration::from_secs(1));

        // Bob received and cached alice's document via the Identity packet.
        let cached = bob.registry.get_cached(&alice.me.idurl());
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn propagate_counts_acks() {
        let hub = MemoryHub::new();
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let dht_backend = MemoryDhtBackend::new();

        let alice = make_node("alice", &hub, &servers, &dht_backend).await;
        let bob = make_node("bob", &hub, &servers, &dht_backend).await;
        let carl = make_node("carl", &hub, &servers, &dht_backend).await;

        hub.kill("carl");
        let acked = alice
            .propagator
            .propagate(&[bob.me.idurl(), carl.me.idurl()], true)
            .await;
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn servers_receive_current_document() {
        let hub = MemoryHub::new();
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let dht_backend = MemoryDhtBackend::new();

        let alice = make_node("alice", &hub, &servers, &dht_backend).await;
        let published = alice.propagator.propagate_to_servers().await;
        assert_eq!(published, 1);
    }
}
