//! Node context: builds every subsystem, wires the event fan-out and
//! routes inbound packets to their owners.
//!
//! Subsystems never hold each other; they hold handles from this
//! context, and cross-subsystem reactions travel as events. The
//! dispatcher below is the only place that understands which body goes
//! to which subsystem.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use bitdust_id::propagate::{spawn_identity_responder, Propagator};
use bitdust_id::{
    IdServerClient, IdentityEvent, IdentityRegistry, MyIdentity, Rotator, RotatorConfig,
    RotatorHandle,
};
use bitdust_net::dht::backend::DhtBackend;
use bitdust_net::dht::records::DhtLayer;
use bitdust_net::dht::{DhtConfig, DhtHandle};
use bitdust_net::gate::{Gate, GateConfig, GateHandle, InboundPacket};
use bitdust_net::transport::{ContactResolver, InboundFrame};
use bitdust_shared::envelope::Command;
use bitdust_shared::identity::{IdentityExport, LocalIdentity};
use bitdust_shared::payloads::{Body, ServiceCancel, ServiceRequest};
use bitdust_shared::types::{GlobalId, IdUrl};
use bitdust_store::{Database, GroupInfo, GroupInfoStore};

use crate::broker::{BrokerHandle, BrokerService};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::group::participant::{
    GroupParticipant, GroupParticipantHandle, ParticipantConfig,
};
use crate::group::GroupRegistry;
use crate::keeper::MessageKeeper;
use crate::keys::KeyManager;
use crate::rotation::spawn_rotation_fanout;
use crate::supplier::{SupplierCoordinator, SupplierCoordinatorHandle, SupplierService};

/// Persisted local identity: key pair plus the current document.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: String,
    doc: bitdust_shared::identity::IdentityDoc,
}

pub struct NodeContext {
    pub config: NodeConfig,
    pub my_id: Arc<MyIdentity>,
    pub registry: Arc<IdentityRegistry>,
    pub id_servers: Arc<dyn IdServerClient>,
    pub gate: GateHandle,
    pub dht: DhtHandle,
    pub db: Arc<Mutex<Database>>,
    pub keys: Arc<KeyManager>,
    pub keeper: Arc<MessageKeeper>,
    pub groups_store: Arc<GroupInfoStore>,
    pub groups: Arc<GroupRegistry>,
    pub broker: BrokerHandle,
    pub suppliers: SupplierCoordinatorHandle,
    pub supplier_service: Arc<SupplierService>,
    pub propagator: Arc<Propagator>,
    pub rotator: RotatorHandle,
    pub bus: broadcast::Sender<IdentityEvent>,
}

impl NodeContext {
    /// Build and start every subsystem. The returned frame sender is what
    /// transports push received frames into; the caller attaches its
    /// transports and registers them on `gate`.
    pub async fn start(
        config: NodeConfig,
        id_servers: Arc<dyn IdServerClient>,
        dht_backend: Arc<dyn DhtBackend>,
    ) -> Result<(Arc<Self>, mpsc::Sender<InboundFrame>)> {
        std::fs::create_dir_all(&config.data_dir)?;
        let metadata_dir = config.data_dir.join("metadata");
        std::fs::create_dir_all(&metadata_dir)?;

        // -- local identity -------------------------------------------------
        let identity_path = metadata_dir.join("identity.json");
        let my_id = Arc::new(load_or_create_identity(&config, &identity_path)?);
        if let (Ok(host), port) = (my_id.idurl().host(), my_id.idurl().port()) {
            if let Err(e) = id_servers.publish(&host, port, &my_id.document()).await {
                warn!(error = %e, "initial identity publish failed");
            }
        }

        // -- persistence ----------------------------------------------------
        let db_key = my_id.local().derive_db_key();
        let db = Arc::new(Mutex::new(Database::open_at(
            &config.data_dir.join("messages.sqlite"),
            &db_key,
        )?));
        let groups_store = Arc::new(GroupInfoStore::open(&config.data_dir)?);
        let supplier_service = SupplierService::new(&config.data_dir)?;

        // -- identity layer -------------------------------------------------
        let registry = IdentityRegistry::new(id_servers.clone());
        registry.put(my_id.document())?;
        let cache_path = metadata_dir.join("identitycache.json");
        if let Ok(loaded) = registry.load(&cache_path) {
            if loaded > 0 {
                info!(count = loaded, "identity cache restored");
            }
        }

        // -- networking -----------------------------------------------------
        let (gate, frame_tx) = Gate::spawn(
            GateConfig {
                ack_timeout: config.ack_timeout(),
                scan_interval: std::time::Duration::from_secs(
                    bitdust_shared::constants::TIMEOUT_SCAN_INTERVAL_SECS,
                ),
            },
            registry.clone() as Arc<dyn ContactResolver>,
        );
        let dht = DhtHandle::spawn(
            dht_backend,
            my_id.idurl().as_str(),
            DhtConfig::default(),
        );
        dht.announce_user(DhtLayer::Suppliers, &my_id.idurl()).await?;
        dht.announce_user(DhtLayer::Brokers, &my_id.idurl()).await?;

        // -- domain subsystems ----------------------------------------------
        let keys = KeyManager::new(my_id.clone(), db.clone(), &config.data_dir)?;
        let keeper = MessageKeeper::new(
            my_id.clone(),
            keys.clone(),
            registry.clone(),
            db.clone(),
            gate.clone(),
        );
        let broker = BrokerService::spawn(
            my_id.clone(),
            gate.clone(),
            dht.clone(),
            registry.clone(),
            config.archive_chunk_size,
            config.message_ack_timeout(),
        );
        let suppliers = SupplierCoordinator::spawn(
            my_id.clone(),
            gate.clone(),
            dht.clone(),
            config.ecc_map,
            config.known_suppliers.clone(),
            std::time::Duration::from_secs(config.supplier_probe_interval_secs),
        );

        // -- identity services ----------------------------------------------
        let (bus, _) = bitdust_id::new_bus();
        let propagator = Propagator::new(
            my_id.clone(),
            registry.clone(),
            id_servers.clone(),
            gate.clone(),
            dht.clone(),
            bus.clone(),
        );
        propagator.start_periodic(std::time::Duration::from_secs(
            config.propagate_interval_secs,
        ));
        spawn_identity_responder(gate.clone(), registry.clone(), my_id.clone(), bus.clone());
        let rotator = Rotator::spawn(
            my_id.clone(),
            registry.clone(),
            id_servers.clone(),
            dht.clone(),
            bus.clone(),
            RotatorConfig {
                known_servers: config.known_id_servers.clone(),
                automatic_rotate: config.automatic_rotate,
                failure_threshold: config.rotate_failure_threshold,
                ping_interval: std::time::Duration::from_secs(config.id_ping_interval_secs),
            },
        );

        let context = Arc::new(Self {
            config,
            my_id,
            registry,
            id_servers,
            gate,
            dht,
            db,
            keys,
            keeper,
            groups_store,
            groups: Arc::new(GroupRegistry::new()),
            broker,
            suppliers,
            supplier_service,
            propagator,
            rotator,
            bus,
        });

        spawn_dispatcher(context.clone()).await?;
        spawn_rotation_fanout(context.clone());

        Ok((context, frame_tx))
    }

    // -- group lifecycle ----------------------------------------------------

    pub fn participant_config(&self) -> ParticipantConfig {
        ParticipantConfig {
            critical_push_fails: self.config.critical_push_fails,
            message_ack_timeout: self.config.message_ack_timeout(),
            known_brokers: self.config.known_brokers.clone(),
        }
    }

    /// Spawn (or fetch) the participant for a group key held locally.
    pub async fn participant(&self, group_key_id: &GlobalId) -> Result<GroupParticipantHandle> {
        if let Some(handle) = self.groups.get(group_key_id).await {
            return Ok(handle);
        }
        let share = self
            .keys
            .get(group_key_id)
            .ok_or_else(|| NodeError::UnknownKey(group_key_id.to_string()))?;
        let handle = GroupParticipant::spawn(
            self.my_id.clone(),
            self.keys.clone(),
            self.registry.clone(),
            self.gate.clone(),
            self.dht.clone(),
            self.keeper.clone(),
            self.groups_store.clone(),
            self.participant_config(),
            share,
        );
        self.groups.insert(group_key_id.clone(), handle.clone()).await;
        Ok(handle)
    }

    /// Save grant-delivered broker knowledge so a later join can skip
    /// the DHT round trip.
    pub fn store_grant_brokers(
        &self,
        group_key_id: &GlobalId,
        brokers: &[(u32, IdUrl)],
        revision: u64,
    ) -> Result<()> {
        if brokers.is_empty() {
            return Ok(());
        }
        let key = group_key_id.to_string();
        let mut info = self.groups_store.load(&key).unwrap_or(GroupInfo {
            group_key_id: key.clone(),
            last_sequence_id: -1,
            active: false,
            archive_folder_path: format!("archive/{}", group_key_id.key_alias),
            brokers: Vec::new(),
            brokers_revision: 0,
        });
        if revision >= info.brokers_revision {
            info.brokers = brokers
                .iter()
                .map(|(p, b)| (*p, b.to_string()))
                .collect();
            info.brokers_revision = revision;
            self.groups_store.save(&info)?;
        }
        Ok(())
    }
}

fn load_or_create_identity(
    config: &NodeConfig,
    path: &std::path::Path,
) -> Result<MyIdentity> {
    if path.exists() {
        let raw = std::fs::read(path)?;
        let file: IdentityFile =
            serde_json::from_slice(&raw).map_err(|e| NodeError::Config(e.to_string()))?;
        let secret: [u8; 32] = hex::decode(&file.secret_key)
            .map_err(|e| NodeError::Config(e.to_string()))?
            .try_into()
            .map_err(|_| NodeError::Config("bad secret key length".into()))?;
        let local = LocalIdentity::from_export(&IdentityExport {
            secret_key: secret,
            public_key: [0u8; 32],
        });
        return Ok(MyIdentity::new(local, file.doc)?);
    }

    let (host, port) = config
        .known_id_servers
        .first()
        .cloned()
        .ok_or_else(|| NodeError::Config("no identity servers configured".into()))?;
    let me = MyIdentity::create(&config.name, &host, port, config.contacts.clone());
    let file = IdentityFile {
        secret_key: hex::encode(me.local().to_export().secret_key),
        doc: me.document(),
    };
    std::fs::write(
        path,
        serde_json::to_vec_pretty(&file).map_err(|e| NodeError::Config(e.to_string()))?,
    )?;
    info!(idurl = %me.idurl(), "fresh identity created");
    Ok(me)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn spawn_dispatcher(ctx: Arc<NodeContext>) -> Result<()> {
    let messages = ctx.gate.subscribe(&[Command::Message]).await?;
    let services = ctx
        .gate
        .subscribe(&[Command::RequestService, Command::CancelService])
        .await?;
    let data = ctx
        .gate
        .subscribe(&[Command::Data, Command::Retrieve, Command::ListFiles])
        .await?;

    tokio::spawn(run_message_loop(ctx.clone(), messages));
    tokio::spawn(run_service_loop(ctx.clone(), services));
    tokio::spawn(run_data_loop(ctx, data));
    Ok(())
}

async fn respond(ctx: &NodeContext, inbound: &bitdust_shared::envelope::Envelope, result: Result<Body>) {
    let me = ctx.my_id.idurl();
    let reply = match &result {
        Ok(body) => inbound.ack(me, body, ctx.my_id.local()),
        Err(e) => inbound.fail(me, &e.to_string(), ctx.my_id.local()),
    };
    match reply {
        Ok(reply) => {
            if let Ok(ticket) = ctx.gate.outbox(reply, false).await {
                let _ = ticket.delivery;
            }
        }
        Err(e) => warn!(error = %e, "response build failed"),
    }
    if let Err(e) = result {
        debug!(packet = %inbound.packet_id, error = %e, "request refused");
    }
}

async fn run_message_loop(ctx: Arc<NodeContext>, mut inbox: mpsc::Receiver<InboundPacket>) {
    while let Some(packet) = inbox.recv().await {
        let envelope = packet.envelope;
        let result: Result<Body> = match envelope.body() {
            Ok(Body::Private(message)) => {
                ctx.keeper.handle_private(&envelope.creator_id, &message).await
            }
            Ok(Body::KeyGrant(grant)) => match ctx.keys.accept_grant(&grant) {
                Ok(share) => {
                    let brokers: Vec<(u32, IdUrl)> = grant.brokers.clone();
                    if let Err(e) =
                        ctx.store_grant_brokers(&share.key_id, &brokers, grant.brokers_revision)
                    {
                        warn!(error = %e, "grant broker info not stored");
                    }
                    info!(key = %share.key_id, from = %envelope.creator_id, "share grant accepted");
                    Ok(Body::Empty)
                }
                Err(e) => Err(e),
            },
            Ok(Body::KeyAuditChallenge(challenge)) => {
                match ctx.keys.audit_response(&challenge.key_id, &challenge.nonce) {
                    Some(signature) => Ok(Body::KeyAuditResponse(
                        bitdust_shared::payloads::KeyAuditResponse {
                            key_id: challenge.key_id,
                            nonce_signature: signature,
                        },
                    )),
                    None => Err(NodeError::UnknownKey(challenge.key_id.to_string())),
                }
            }
            Ok(other) => Err(NodeError::Refused(format!(
                "unexpected message body {:?}",
                std::mem::discriminant(&other)
            ))),
            Err(e) => Err(NodeError::Envelope(e)),
        };
        respond(&ctx, &envelope, result).await;
    }
}

async fn run_service_loop(ctx: Arc<NodeContext>, mut inbox: mpsc::Receiver<InboundPacket>) {
    while let Some(packet) = inbox.recv().await {
        let envelope = packet.envelope;
        let result: Result<Body> = match envelope.body() {
            Ok(Body::Service(ServiceRequest::Supplier { customer_id, .. })) => ctx
                .supplier_service
                .accept_customer(&customer_id)
                .map(|()| Body::Empty),
            Ok(Body::Service(ServiceRequest::Broker {
                queue_id,
                position,
                peers,
                revision,
            })) => {
                let owner = queue_id.owner.idurl();
                ctx.broker
                    .host_queue(queue_id, owner, position, peers, revision)
                    .await
                    .map(|()| Body::Empty)
            }
            Ok(Body::Service(ServiceRequest::QueueConsumer(connect))) => ctx
                .broker
                .connect(connect, envelope.creator_id.clone())
                .await
                .map(|()| Body::Empty),
            Ok(Body::ServiceCancel(ServiceCancel::Supplier { customer_id, .. })) => ctx
                .supplier_service
                .drop_customer(&customer_id)
                .map(|()| Body::Empty),
            Ok(Body::ServiceCancel(ServiceCancel::Broker { queue_id })) => {
                ctx.broker.cancel_queue(queue_id).await;
                Ok(Body::Empty)
            }
            Ok(Body::ServiceCancel(ServiceCancel::QueueConsumer {
                queue_id,
                consumer_id,
            })) => {
                ctx.broker.cancel_consumer(queue_id, consumer_id).await;
                Ok(Body::Empty)
            }
            Ok(other) => Err(NodeError::Refused(format!(
                "unexpected service body {:?}",
                std::mem::discriminant(&other)
            ))),
            Err(e) => Err(NodeError::Envelope(e)),
        };
        respond(&ctx, &envelope, result).await;
    }
}

async fn run_data_loop(ctx: Arc<NodeContext>, mut inbox: mpsc::Receiver<InboundPacket>) {
    while let Some(packet) = inbox.recv().await {
        let envelope = packet.envelope;
        let result: Result<Body> = match envelope.body() {
            // A queue message still without a sequence id is a producer
            // push for a hosted queue; a sequenced one is a broker
            // delivery for a local participant.
            Ok(Body::Queue(message)) => {
                if message.sequence_id.is_none() {
                    ctx.broker.push(message).await.map(Body::Queue)
                } else {
                    match ctx.groups.for_queue(&message.queue_id).await {
                        Some(participant) => {
                            participant.deliver(message).await.map(|()| Body::Empty)
                        }
                        None => Err(NodeError::UnknownGroup(message.queue_id.to_string())),
                    }
                }
            }
            Ok(Body::QueueReplica(message)) => {
                ctx.broker.replica(message).await.map(|()| Body::Empty)
            }
            Ok(Body::CatchUp(request)) => {
                ctx.broker.catch_up(request).await.map(Body::CatchUpResult)
            }
            Ok(Body::Archive(snapshot)) => {
                let path = format!(
                    "archive/{}/{}",
                    snapshot.queue_alias, snapshot.last_sequence_id
                );
                match serde_json::to_vec(&snapshot) {
                    Ok(raw) => ctx
                        .supplier_service
                        .save_block(&envelope.owner_id, &path, &raw)
                        .map(|()| Body::Empty),
                    Err(e) => Err(NodeError::Config(e.to_string())),
                }
            }
            Ok(Body::Block { remote_path, data }) => ctx
                .supplier_service
                .save_block(&envelope.owner_id, &remote_path, &data)
                .map(|()| Body::Empty),
            Ok(Body::Text(remote_path)) if envelope.command == Command::Retrieve => ctx
                .supplier_service
                .read_block(&envelope.owner_id, &remote_path)
                .map(|data| Body::Block { remote_path, data }),
            Ok(Body::Files(_)) if envelope.command == Command::ListFiles => {
                let user = envelope
                    .creator_id
                    .user()
                    .map_err(|e| NodeError::Config(e.to_string()));
                match user {
                    Ok(user) => ctx
                        .supplier_service
                        .list_blocks(&envelope.creator_id)
                        .map(|paths| {
                            Body::Files(bitdust_shared::payloads::FileListing {
                                customer_id: GlobalId::master(user),
                                paths,
                            })
                        }),
                    Err(e) => Err(e),
                }
            }
            Ok(other) => Err(NodeError::Refused(format!(
                "unexpected data body {:?}",
                std::mem::discriminant(&other)
            ))),
            Err(e) => Err(NodeError::Envelope(e)),
        };
        respond(&ctx, &envelope, result).await;
    }
}
