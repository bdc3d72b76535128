//! Supplier relationships, both sides of them.
//!
//! [`SupplierCoordinator`] is the customer side: it owns the ordered
//! slate, hires and releases suppliers, keeps the DHT advertisement in
//! step with the slate and probes supplier health. [`SupplierService`]
//! is the provider side: it admits customers, stores their blocks and
//! archive snapshots under per-customer directories and answers
//! retrieve/list requests.
//!
//! Replacing a supplier never moves blocks proactively; repair is lazy
//! and driven by the backup layer. The coordinator only guarantees the
//! slate is correct and advertised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use bitdust_id::MyIdentity;
use bitdust_net::dht::records::DhtLayer;
use bitdust_net::dht::DhtHandle;
use bitdust_net::gate::GateHandle;
use bitdust_shared::ecc::EccMap;
use bitdust_shared::envelope::Command;
use bitdust_shared::payloads::{Body, FileListing, ServiceCancel, ServiceRequest};
use bitdust_shared::types::{GlobalId, IdUrl};
use bitdust_store::CustomerDirs;

use crate::error::{NodeError, Result};
use crate::packets;

// ---------------------------------------------------------------------------
// Coordinator (customer side)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupplierEntry {
    pub position: u32,
    pub idurl: Option<IdUrl>,
    pub last_seen: Option<DateTime<Utc>>,
}

enum CoordinatorCommand {
    List {
        reply: oneshot::Sender<(Vec<SupplierEntry>, u64)>,
    },
    EnsureHired {
        reply: oneshot::Sender<Result<usize>>,
    },
    Change {
        position: u32,
        reply: oneshot::Sender<Result<IdUrl>>,
    },
    Switch {
        position: u32,
        new_idurl: IdUrl,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCount {
        count: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Probe,
    HealthyCount {
        reply: oneshot::Sender<usize>,
    },
    LocalRotated {
        new_idurl: IdUrl,
    },
    PeerRotated {
        old: IdUrl,
        new: IdUrl,
    },
    Shutdown,
}

enum Internal {
    HireDone {
        position: u32,
        exclude: Vec<IdUrl>,
        result: Result<IdUrl>,
        reply: oneshot::Sender<Result<IdUrl>>,
    },
    ProbeResult {
        position: u32,
        ok: bool,
    },
}

#[derive(Clone)]
pub struct SupplierCoordinatorHandle {
    cmd_tx: mpsc::Sender<CoordinatorCommand>,
}

impl SupplierCoordinatorHandle {
    pub async fn list(&self) -> (Vec<SupplierEntry>, u64) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CoordinatorCommand::List { reply: tx })
            .await
            .is_err()
        {
            return (Vec::new(), 0);
        }
        rx.await.unwrap_or((Vec::new(), 0))
    }

    /// Hire suppliers into every empty position. Returns how many
    /// positions are filled afterwards.
    pub async fn ensure_hired(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoordinatorCommand::EnsureHired { reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Replace the supplier at `position` with a freshly chosen candidate.
    pub async fn change(&self, position: u32) -> Result<IdUrl> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoordinatorCommand::Change {
                position,
                reply: tx,
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Replace with a caller-chosen candidate.
    pub async fn switch(&self, position: u32, new_idurl: IdUrl) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoordinatorCommand::Switch {
                position,
                new_idurl,
                reply: tx,
            })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Resize the slate; releases from the highest positions on shrink.
    pub async fn set_count(&self, count: usize) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CoordinatorCommand::SetCount { count, reply: tx })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    pub async fn probe(&self) {
        let _ = self.cmd_tx.send(CoordinatorCommand::Probe).await;
    }

    /// Suppliers seen alive in the last probe round.
    pub async fn healthy_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CoordinatorCommand::HealthyCount { reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn local_rotated(&self, new_idurl: IdUrl) {
        let _ = self
            .cmd_tx
            .send(CoordinatorCommand::LocalRotated { new_idurl })
            .await;
    }

    pub async fn peer_rotated(&self, old: IdUrl, new: IdUrl) {
        let _ = self
            .cmd_tx
            .send(CoordinatorCommand::PeerRotated { old, new })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(CoordinatorCommand::Shutdown).await;
    }
}

pub struct SupplierCoordinator {
    my_id: Arc<MyIdentity>,
    gate: GateHandle,
    dht: DhtHandle,
    customer: IdUrl,
    ecc_map: EccMap,
    slate: Vec<Option<IdUrl>>,
    revision: u64,
    candidates: Vec<IdUrl>,
    health: HashMap<u32, DateTime<Utc>>,
    healthy: HashSet<u32>,
    hiring: HashSet<u32>,
    probe_interval: Duration,
    internal_tx: mpsc::Sender<Internal>,
}

impl SupplierCoordinator {
    pub fn spawn(
        my_id: Arc<MyIdentity>,
        gate: GateHandle,
        dht: DhtHandle,
        ecc_map: EccMap,
        candidates: Vec<IdUrl>,
        probe_interval: Duration,
    ) -> SupplierCoordinatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let customer = my_id.idurl();
        let coordinator = Self {
            my_id,
            gate,
            dht,
            customer,
            ecc_map,
            slate: vec![None; ecc_map.suppliers_count()],
            revision: 0,
            candidates,
            health: HashMap::new(),
            healthy: HashSet::new(),
            hiring: HashSet::new(),
            probe_interval,
            internal_tx,
        };
        tokio::spawn(coordinator.run(cmd_rx, internal_rx));
        SupplierCoordinatorHandle { cmd_tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<CoordinatorCommand>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(CoordinatorCommand::List { reply }) => {
                            let entries = self
                                .slate
                                .iter()
                                .enumerate()
                                .map(|(i, idurl)| SupplierEntry {
                                    position: i as u32,
                                    idurl: idurl.clone(),
                                    last_seen: self.health.get(&(i as u32)).copied(),
                                })
                                .collect();
                            let _ = reply.send((entries, self.revision));
                        }
                        Some(CoordinatorCommand::EnsureHired { reply }) => {
                            self.ensure_hired(reply).await;
                        }
                        Some(CoordinatorCommand::Change { position, reply }) => {
                            if position as usize >= self.slate.len() {
                                let _ = reply.send(Err(NodeError::Config(format!(
                                    "position {position} out of range"
                                ))));
                            } else {
                                let exclude: Vec<IdUrl> =
                                    self.slate.iter().flatten().cloned().collect();
                                self.start_hire(position, exclude, reply);
                            }
                        }
                        Some(CoordinatorCommand::Switch { position, new_idurl, reply }) => {
                            let _ = reply.send(self.switch(position, new_idurl).await);
                        }
                        Some(CoordinatorCommand::SetCount { count, reply }) => {
                            let _ = reply.send(self.set_count(count).await);
                        }
                        Some(CoordinatorCommand::Probe) => {
                            self.start_probe_round();
                        }
                        Some(CoordinatorCommand::HealthyCount { reply }) => {
                            let _ = reply.send(self.healthy.len());
                        }
                        Some(CoordinatorCommand::LocalRotated { new_idurl }) => {
                            info!(old = %self.customer, new = %new_idurl, "slate follows local rotation");
                            self.customer = new_idurl;
                            self.revision += 1;
                            self.advertise().await;
                        }
                        Some(CoordinatorCommand::PeerRotated { old, new }) => {
                            let mut changed = false;
                            for slot in self.slate.iter_mut() {
                                if slot.as_ref() == Some(&old) {
                                    *slot = Some(new.clone());
                                    changed = true;
                                }
                            }
                            if changed {
                                self.revision += 1;
                                self.advertise().await;
                            }
                        }
                        Some(CoordinatorCommand::Shutdown) | None => break,
                    }
                }

                event = internal_rx.recv() => {
                    match event {
                        Some(Internal::HireDone { position, exclude, result, reply }) => {
                            self.finish_hire(position, exclude, result, reply).await;
                        }
                        Some(Internal::ProbeResult { position, ok }) => {
                            if ok {
                                self.health.insert(position, Utc::now());
                                self.healthy.insert(position);
                            } else {
                                self.healthy.remove(&position);
                            }
                        }
                        None => break,
                    }
                }

                _ = probe.tick() => {
                    self.start_probe_round();
                }
            }
        }
    }

    async fn ensure_hired(&mut self, reply: oneshot::Sender<Result<usize>>) {
        let empty: Vec<u32> = self
            .slate
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect();

        if empty.is_empty() {
            let _ = reply.send(Ok(self.filled()));
            return;
        }

        // Hire sequentially so every position sees the updated exclude set.
        for position in empty {
            let exclude: Vec<IdUrl> = self.slate.iter().flatten().cloned().collect();
            match self.hire_blocking(position, exclude).await {
                Ok(idurl) => {
                    self.slate[position as usize] = Some(idurl);
                }
                Err(e) => {
                    warn!(position, error = %e, "hire failed");
                }
            }
        }
        self.revision += 1;
        self.advertise().await;
        let _ = reply.send(Ok(self.filled()));
    }

    fn filled(&self) -> usize {
        self.slate.iter().filter(|s| s.is_some()).count()
    }

    /// One hiring at a time per position; the actual negotiation runs in
    /// a spawned task so the coordinator keeps serving commands.
    fn start_hire(
        &mut self,
        position: u32,
        exclude: Vec<IdUrl>,
        reply: oneshot::Sender<Result<IdUrl>>,
    ) {
        if self.hiring.contains(&position) {
            let _ = reply.send(Err(NodeError::Capacity(format!(
                "hire already in flight for position {position}"
            ))));
            return;
        }
        self.hiring.insert(position);

        let my_id = self.my_id.clone();
        let gate = self.gate.clone();
        let dht = self.dht.clone();
        let customer = self.customer.clone();
        let ecc_map = self.ecc_map;
        let candidates = self.candidates.clone();
        let internal = self.internal_tx.clone();
        let exclude_for_task = exclude.clone();

        tokio::spawn(async move {
            let result = hire_candidate(
                &my_id,
                &gate,
                &dht,
                &customer,
                ecc_map,
                position,
                &candidates,
                &exclude_for_task,
            )
            .await;
            let _ = internal
                .send(Internal::HireDone {
                    position,
                    exclude,
                    result,
                    reply,
                })
                .await;
        });
    }

    async fn finish_hire(
        &mut self,
        position: u32,
        _exclude: Vec<IdUrl>,
        result: Result<IdUrl>,
        reply: oneshot::Sender<Result<IdUrl>>,
    ) {
        self.hiring.remove(&position);
        match result {
            Ok(idurl) => {
                let released = self.slate[position as usize].replace(idurl.clone());
                if let Some(old) = released {
                    self.release(&old, position).await;
                }
                self.revision += 1;
                self.advertise().await;
                info!(position, supplier = %idurl, revision = self.revision, "supplier installed");
                let _ = reply.send(Ok(idurl));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// In-loop hire used by `ensure_hired` (initial slate fill).
    async fn hire_blocking(&self, position: u32, exclude: Vec<IdUrl>) -> Result<IdUrl> {
        hire_candidate(
            &self.my_id,
            &self.gate,
            &self.dht,
            &self.customer,
            self.ecc_map,
            position,
            &self.candidates,
            &exclude,
        )
        .await
    }

    async fn switch(&mut self, position: u32, new_idurl: IdUrl) -> Result<()> {
        if position as usize >= self.slate.len() {
            return Err(NodeError::Config(format!("position {position} out of range")));
        }
        let body = Body::Service(ServiceRequest::Supplier {
            customer_id: self.customer.clone(),
            ecc_map: self.ecc_map.name().to_string(),
            position,
        });
        packets::request(
            &self.gate,
            &self.my_id,
            Command::RequestService,
            &new_idurl,
            &body,
            None,
        )
        .await?;

        let released = self.slate[position as usize].replace(new_idurl);
        if let Some(old) = released {
            self.release(&old, position).await;
        }
        self.revision += 1;
        self.advertise().await;
        Ok(())
    }

    async fn set_count(&mut self, count: usize) -> Result<()> {
        let ecc_map = EccMap::for_count(count)
            .ok_or_else(|| NodeError::Config(format!("no ecc map holds {count} suppliers")))?;
        if count < self.slate.len() {
            // Release from the highest positions down.
            for position in (count..self.slate.len()).rev() {
                if let Some(old) = self.slate[position].take() {
                    self.release(&old, position as u32).await;
                }
            }
            self.slate.truncate(count);
        } else {
            self.slate.resize(count, None);
        }
        self.ecc_map = ecc_map;
        self.revision += 1;
        self.advertise().await;
        Ok(())
    }

    async fn release(&self, supplier: &IdUrl, position: u32) {
        let body = Body::ServiceCancel(ServiceCancel::Supplier {
            customer_id: self.customer.clone(),
            position,
        });
        if let Err(e) = packets::request(
            &self.gate,
            &self.my_id,
            Command::CancelService,
            supplier,
            &body,
            None,
        )
        .await
        {
            debug!(supplier = %supplier, error = %e, "release notification failed");
        }
    }

    /// Keep the DHT advertisement equal to the local slate.
    async fn advertise(&self) {
        if let Err(e) = self
            .dht
            .publish_slate(
                &self.customer,
                self.ecc_map.name(),
                &self.slate,
                self.revision,
            )
            .await
        {
            warn!(error = %e, "slate advertisement failed");
        }
    }

    fn start_probe_round(&self) {
        for (i, supplier) in self.slate.iter().enumerate() {
            let Some(supplier) = supplier.clone() else {
                continue;
            };
            let position = i as u32;
            let my_id = self.my_id.clone();
            let gate = self.gate.clone();
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                let body = Body::Files(FileListing {
                    customer_id: GlobalId::master(
                        my_id.user().unwrap_or(bitdust_shared::types::GlobalUser {
                            nickname: "unknown".into(),
                            host: "unknown".into(),
                            port: 0,
                        }),
                    ),
                    paths: Vec::new(),
                });
                let ok = packets::request(
                    &gate,
                    &my_id,
                    Command::ListFiles,
                    &supplier,
                    &body,
                    Some(Duration::from_secs(10)),
                )
                .await
                .is_ok();
                let _ = internal.send(Internal::ProbeResult { position, ok }).await;
            });
        }
    }
}

/// Try configured candidates first, then DHT random lookup, skipping
/// anything already on the slate. First Ack wins.
#[allow(clippy::too_many_arguments)]
async fn hire_candidate(
    my_id: &MyIdentity,
    gate: &GateHandle,
    dht: &DhtHandle,
    customer: &IdUrl,
    ecc_map: EccMap,
    position: u32,
    candidates: &[IdUrl],
    exclude: &[IdUrl],
) -> Result<IdUrl> {
    let mut pool: Vec<IdUrl> = candidates
        .iter()
        .filter(|c| !exclude.contains(*c) && **c != *customer)
        .cloned()
        .collect();

    match dht.user_random(DhtLayer::Suppliers, 8).await {
        Ok(found) => {
            for idurl in found {
                if !pool.contains(&idurl) && !exclude.contains(&idurl) && idurl != *customer {
                    pool.push(idurl);
                }
            }
        }
        Err(e) => debug!(error = %e, "supplier random lookup failed"),
    }

    if pool.is_empty() {
        return Err(NodeError::NoSuppliers);
    }

    let body = Body::Service(ServiceRequest::Supplier {
        customer_id: customer.clone(),
        ecc_map: ecc_map.name().to_string(),
        position,
    });
    for candidate in pool {
        match packets::request(gate, my_id, Command::RequestService, &candidate, &body, None).await
        {
            Ok(_) => return Ok(candidate),
            Err(e) => {
                debug!(candidate = %candidate, error = %e, "candidate declined");
            }
        }
    }
    Err(NodeError::NoSuppliers)
}

// ---------------------------------------------------------------------------
// Service (provider side)
// ---------------------------------------------------------------------------

const MAX_CUSTOMERS: usize = 16;

pub struct SupplierService {
    dirs: CustomerDirs,
    customers: std::sync::Mutex<HashSet<String>>,
}

impl SupplierService {
    pub fn new(data_dir: &std::path::Path) -> Result<Arc<Self>> {
        let dirs = CustomerDirs::open(data_dir)?;
        let existing: HashSet<String> = dirs.list_customers()?.into_iter().collect();
        Ok(Arc::new(Self {
            dirs,
            customers: std::sync::Mutex::new(existing),
        }))
    }

    fn customer_key(customer_id: &IdUrl) -> Result<String> {
        let user = customer_id
            .user()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        Ok(GlobalId::master(user).to_string())
    }

    /// Admission: capacity-checked, idempotent for existing customers.
    pub fn accept_customer(&self, customer_id: &IdUrl) -> Result<()> {
        let key = Self::customer_key(customer_id)?;
        let mut customers = self.customers.lock().expect("customers lock");
        if customers.contains(&key) {
            return Ok(());
        }
        if customers.len() >= MAX_CUSTOMERS {
            return Err(NodeError::Capacity("supplier is full".into()));
        }
        customers.insert(key.clone());
        info!(customer = %key, "customer accepted");
        Ok(())
    }

    pub fn drop_customer(&self, customer_id: &IdUrl) -> Result<()> {
        let key = Self::customer_key(customer_id)?;
        self.customers.lock().expect("customers lock").remove(&key);
        self.dirs.remove_customer(&key)?;
        Ok(())
    }

    pub fn serves(&self, customer_id: &IdUrl) -> bool {
        Self::customer_key(customer_id)
            .map(|key| self.customers.lock().expect("customers lock").contains(&key))
            .unwrap_or(false)
    }

    pub fn save_block(&self, customer_id: &IdUrl, remote_path: &str, data: &[u8]) -> Result<()> {
        if !self.serves(customer_id) {
            return Err(NodeError::Refused("not your supplier".into()));
        }
        let key = Self::customer_key(customer_id)?;
        self.dirs.save_block(&key, remote_path, data)?;
        Ok(())
    }

    pub fn read_block(&self, customer_id: &IdUrl, remote_path: &str) -> Result<Vec<u8>> {
        let key = Self::customer_key(customer_id)?;
        Ok(self.dirs.read_block(&key, remote_path)?)
    }

    pub fn list_blocks(&self, customer_id: &IdUrl) -> Result<Vec<String>> {
        let key = Self::customer_key(customer_id)?;
        Ok(self.dirs.list_blocks(&key)?)
    }

    /// A customer's identity rotated: rename its directory.
    pub fn customer_rotated(&self, old: &IdUrl, new: &IdUrl) -> Result<()> {
        let old_key = Self::customer_key(old)?;
        let new_key = Self::customer_key(new)?;
        let mut customers = self.customers.lock().expect("customers lock");
        if customers.remove(&old_key) {
            customers.insert(new_key.clone());
        }
        drop(customers);
        self.dirs.rename_customer(&old_key, &new_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idurl(n: &str) -> IdUrl {
        IdUrl::for_user("id.example.com", 8084, n)
    }

    #[test]
    fn admission_and_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let service = SupplierService::new(dir.path()).unwrap();

        for i in 0..MAX_CUSTOMERS {
            service.accept_customer(&idurl(&format!("c{i}"))).unwrap();
        }
        // Existing customer stays admitted, a new one is refused.
        service.accept_customer(&idurl("c0")).unwrap();
        assert!(matches!(
            service.accept_customer(&idurl("overflow")),
            Err(NodeError::Capacity(_))
        ));
    }

    #[test]
    fn blocks_require_admission() {
        let dir = tempfile::tempdir().unwrap();
        let service = SupplierService::new(dir.path()).unwrap();

        assert!(matches!(
            service.save_block(&idurl("alice"), "master/cat.txt", b"meow"),
            Err(NodeError::Refused(_))
        ));

        service.accept_customer(&idurl("alice")).unwrap();
        service
            .save_block(&idurl("alice"), "master/cat.txt", b"meow")
            .unwrap();
        assert_eq!(
            service.read_block(&idurl("alice"), "master/cat.txt").unwrap(),
            b"meow"
        );
        assert_eq!(service.list_blocks(&idurl("alice")).unwrap().len(), 1);
    }

    #[test]
    fn customer_rotation_renames_storage() {
        let dir = tempfile::tempdir().unwrap();
        let service = SupplierService::new(dir.path()).unwrap();
        service.accept_customer(&idurl("alice")).unwrap();
        service
            .save_block(&idurl("alice"), "master/cat.txt", b"meow")
            .unwrap();

        let new = IdUrl::for_user("id-b.example.com", 8084, "alice");
        service.customer_rotated(&idurl("alice"), &new).unwrap();

        assert!(service.serves(&new));
        assert!(!service.serves(&idurl("alice")));
        assert_eq!(
            service.read_block(&new, "master/cat.txt").unwrap(),
            b"meow"
        );
    }
}
