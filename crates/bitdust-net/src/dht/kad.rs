//! Kademlia backend: the production [`DhtBackend`] over libp2p.
//!
//! A dedicated tokio task drives the swarm; the backend talks to it over
//! a command channel. Stored values are wrapped with their publisher and
//! original publish timestamp, since a raw Kademlia record carries
//! neither. A get may surface records from several peers; divergent
//! values merge at the record layer by revision.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use libp2p::{
    identify,
    kad::{self, store::MemoryStore, Quorum, Record, RecordKey},
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, SwarmBuilder,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dht::backend::{DhtBackend, StoredValue};
use crate::error::{NetError, Result as NetResult};

const PROTOCOL_VERSION: &str = "/bitdust/1.0.0";

/// Value wrapper persisted inside a Kademlia record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KadStored {
    value: Vec<u8>,
    publisher: String,
    original_ts: DateTime<Utc>,
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "KadNetEvent")]
pub struct KadNetBehaviour {
    /// Distributed hash table holding the coordination records.
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Protocol identification, feeds observed addresses into Kademlia.
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum KadNetEvent {
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<kad::Event> for KadNetEvent {
    fn from(event: kad::Event) -> Self {
        KadNetEvent::Kademlia(event)
    }
}

impl From<identify::Event> for KadNetEvent {
    fn from(event: identify::Event) -> Self {
        KadNetEvent::Identify(event)
    }
}

fn build_swarm(keypair: libp2p::identity::Keypair) -> anyhow::Result<libp2p::Swarm<KadNetBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| {
            let local_peer_id = key.public().to_peer_id();

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config = identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            KadNetBehaviour { kademlia, identify }
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "built kademlia swarm");
    Ok(swarm)
}

enum KadCommand {
    Put {
        key: Vec<u8>,
        wrapped: Vec<u8>,
        reply: oneshot::Sender<NetResult<()>>,
    },
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<NetResult<Vec<Vec<u8>>>>,
    },
}

enum PendingQuery {
    Put(oneshot::Sender<NetResult<()>>),
    Get {
        reply: oneshot::Sender<NetResult<Vec<Vec<u8>>>>,
        found: Vec<Vec<u8>>,
    },
}

/// Production backend. Create with [`KadBackend::spawn`].
pub struct KadBackend {
    cmd_tx: mpsc::Sender<KadCommand>,
}

impl KadBackend {
    /// Build the swarm, start listening and bootstrap from the given peers.
    pub fn spawn(
        keypair: libp2p::identity::Keypair,
        listen_port: u16,
        bootstrap: Vec<Multiaddr>,
    ) -> anyhow::Result<(std::sync::Arc<Self>, PeerId)> {
        let mut swarm = build_swarm(keypair)?;
        let local_peer_id = *swarm.local_peer_id();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{listen_port}")
            .parse()
            .expect("valid multiaddr");
        swarm.listen_on(listen_addr)?;

        for addr in &bootstrap {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "failed to dial bootstrap peer");
                continue;
            }
            if let Some(peer_id) = extract_peer_id(addr) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
        }
        if !bootstrap.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = %e, "kademlia bootstrap failed to start");
            }
        }

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<KadCommand>(256);

        tokio::spawn(async move {
            let mut pending: HashMap<kad::QueryId, PendingQuery> = HashMap::new();

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(KadCommand::Put { key, wrapped, reply }) => {
                                let record = Record::new(RecordKey::new(&key), wrapped);
                                match swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .put_record(record, Quorum::One)
                                {
                                    Ok(id) => {
                                        pending.insert(id, PendingQuery::Put(reply));
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(NetError::Dht(e.to_string())));
                                    }
                                }
                            }
                            Some(KadCommand::Get { key, reply }) => {
                                let id = swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .get_record(RecordKey::new(&key));
                                pending.insert(
                                    id,
                                    PendingQuery::Get {
                                        reply,
                                        found: Vec::new(),
                                    },
                                );
                            }
                            None => break,
                        }
                    }

                    event = swarm.select_next_some() => {
                        match event {
                            SwarmEvent::Behaviour(KadNetEvent::Kademlia(
                                kad::Event::OutboundQueryProgressed { id, result, step, .. },
                            )) => {
                                handle_query_progress(&mut pending, id, result, step.last);
                            }
                            SwarmEvent::Behaviour(KadNetEvent::Identify(
                                identify::Event::Received { peer_id, info, .. },
                            )) => {
                                for addr in &info.listen_addrs {
                                    swarm
                                        .behaviour_mut()
                                        .kademlia
                                        .add_address(&peer_id, addr.clone());
                                }
                            }
                            SwarmEvent::NewListenAddr { address, .. } => {
                                info!(addr = %address, "kademlia listening");
                            }
                            other => {
                                debug!(event = ?other, "swarm event");
                            }
                        }
                    }
                }
            }
            info!("kademlia task terminated");
        });

        Ok((std::sync::Arc::new(Self { cmd_tx }), local_peer_id))
    }
}

fn handle_query_progress(
    pending: &mut HashMap<kad::QueryId, PendingQuery>,
    id: kad::QueryId,
    result: kad::QueryResult,
    last: bool,
) {
    match result {
        kad::QueryResult::PutRecord(outcome) => {
            if let Some(PendingQuery::Put(reply)) = pending.remove(&id) {
                let _ = reply.send(
                    outcome
                        .map(|_| ())
                        .map_err(|e| NetError::Dht(e.to_string())),
                );
            }
        }
        kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
            if let Some(PendingQuery::Get { reply, mut found }) = pending.remove(&id) {
                found.push(peer_record.record.value);
                if last {
                    let _ = reply.send(Ok(found));
                } else {
                    pending.insert(id, PendingQuery::Get { reply, found });
                }
            }
        }
        kad::QueryResult::GetRecord(Ok(
            kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. },
        )) => {
            if let Some(PendingQuery::Get { reply, found }) = pending.remove(&id) {
                let _ = reply.send(Ok(found));
            }
        }
        kad::QueryResult::GetRecord(Err(e)) => {
            if let Some(PendingQuery::Get { reply, found }) = pending.remove(&id) {
                if found.is_empty() {
                    match e {
                        kad::GetRecordError::NotFound { .. } => {
                            let _ = reply.send(Ok(Vec::new()));
                        }
                        other => {
                            let _ = reply.send(Err(NetError::Dht(other.to_string())));
                        }
                    }
                } else {
                    let _ = reply.send(Ok(found));
                }
            }
        }
        _ => {}
    }
}

#[async_trait]
impl DhtBackend for KadBackend {
    async fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        publisher: String,
        _expire: Duration,
        original_ts: Option<DateTime<Utc>>,
    ) -> NetResult<()> {
        let wrapped = bincode::serialize(&KadStored {
            value,
            publisher,
            original_ts: original_ts.unwrap_or_else(Utc::now),
        })
        .map_err(|e| NetError::Dht(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(KadCommand::Put {
                key,
                wrapped,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetError::Dht("kademlia task gone".into()))?;
        reply_rx
            .await
            .map_err(|_| NetError::Dht("kademlia task gone".into()))?
    }

    async fn get(&self, key: Vec<u8>) -> NetResult<Vec<StoredValue>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(KadCommand::Get {
                key,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetError::Dht("kademlia task gone".into()))?;
        let raw = reply_rx
            .await
            .map_err(|_| NetError::Dht("kademlia task gone".into()))??;

        let now = Utc::now();
        Ok(raw
            .iter()
            .filter_map(|bytes| bincode::deserialize::<KadStored>(bytes).ok())
            .map(|stored| StoredValue {
                value: stored.value,
                publisher: stored.publisher,
                original_ts: stored.original_ts,
                expires_at: now + chrono::Duration::hours(24),
            })
            .collect())
    }
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}
