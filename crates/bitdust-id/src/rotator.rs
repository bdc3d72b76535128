//! Identity rotator: detects dead identity servers and moves the local
//! identity to a healthy one without changing the key pair.
//!
//! The control loop pings every source of the local document; a source
//! past the failure threshold triggers (when automatic rotation is on)
//! the rotation procedure: choose the highest-ranked reachable server
//! from the configured candidates, mint the successor document, publish
//! it (at least one server must accept before anything commits locally),
//! then emit the rotate event and drop the DHT breadcrumb. The local
//! fan-out (key renames, slate rewrites, group file moves) runs in the
//! subscribers of that event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use bitdust_net::dht::records::RotateRecord;
use bitdust_net::dht::DhtHandle;
use bitdust_shared::constants::{ID_SERVER_FAILURE_THRESHOLD, TIMER_JITTER_RATIO};
use bitdust_shared::types::IdUrl;

use crate::error::{IdError, Result};
use crate::events::IdentityEvent;
use crate::my_id::MyIdentity;
use crate::registry::IdentityRegistry;
use crate::server_client::IdServerClient;

#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Candidate identity servers in preference order.
    pub known_servers: Vec<(String, u16)>,
    pub automatic_rotate: bool,
    pub failure_threshold: u32,
    pub ping_interval: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            known_servers: Vec::new(),
            automatic_rotate: true,
            failure_threshold: ID_SERVER_FAILURE_THRESHOLD,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Pick the highest-ranked candidate not already among `sources`.
/// `reachable` reports the ping outcome per candidate index.
pub fn choose_candidate(
    known_servers: &[(String, u16)],
    sources: &[IdUrl],
    reachable: &[bool],
) -> Option<(String, u16)> {
    known_servers
        .iter()
        .enumerate()
        .filter(|(i, _)| reachable.get(*i).copied().unwrap_or(false))
        .map(|(_, s)| s)
        .find(|(host, port)| {
            !sources.iter().any(|s| {
                s.host().map(|h| h == *host).unwrap_or(false) && s.port() == *port
            })
        })
        .cloned()
}

enum RotatorCommand {
    RotateNow {
        dead: Option<IdUrl>,
        reply: oneshot::Sender<Result<(IdUrl, IdUrl)>>,
    },
    CheckHealth,
    Shutdown,
}

#[derive(Clone)]
pub struct RotatorHandle {
    cmd_tx: mpsc::Sender<RotatorCommand>,
}

impl RotatorHandle {
    /// Force a rotation away from `dead` (the current primary when
    /// `None`), regardless of health counters.
    pub async fn rotate_now(&self, dead: Option<IdUrl>) -> Result<(IdUrl, IdUrl)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RotatorCommand::RotateNow {
                dead,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IdError::RotationRejected("rotator gone".into()))?;
        reply_rx
            .await
            .map_err(|_| IdError::RotationRejected("rotator gone".into()))?
    }

    /// Trigger one health pass outside the periodic schedule.
    pub async fn check_health(&self) {
        let _ = self.cmd_tx.send(RotatorCommand::CheckHealth).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RotatorCommand::Shutdown).await;
    }
}

pub struct Rotator {
    my_id: Arc<MyIdentity>,
    registry: Arc<IdentityRegistry>,
    servers: Arc<dyn IdServerClient>,
    dht: DhtHandle,
    bus: broadcast::Sender<IdentityEvent>,
    config: RotatorConfig,
    failures: HashMap<IdUrl, u32>,
}

impl Rotator {
    pub fn spawn(
        my_id: Arc<MyIdentity>,
        registry: Arc<IdentityRegistry>,
        servers: Arc<dyn IdServerClient>,
        dht: DhtHandle,
        bus: broadcast::Sender<IdentityEvent>,
        config: RotatorConfig,
    ) -> RotatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let rotator = Self {
            my_id,
            registry,
            servers,
            dht,
            bus,
            config,
            failures: HashMap::new(),
        };
        tokio::spawn(rotator.run(cmd_rx));
        RotatorHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RotatorCommand>) {
        let interval = jittered(self.config.ping_interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RotatorCommand::RotateNow { dead, reply }) => {
                            let dead = dead.unwrap_or_else(|| self.my_id.idurl());
                            let _ = reply.send(self.rotate(&dead).await);
                        }
                        Some(RotatorCommand::CheckHealth) => {
                            self.health_pass().await;
                        }
                        Some(RotatorCommand::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.health_pass().await;
                }
            }
        }
    }

    async fn health_pass(&mut self) {
        let sources = self.my_id.document().sources;
        let mut dead_source: Option<IdUrl> = None;

        for source in &sources {
            let (host, port) = match (source.host(), source.port()) {
                (Ok(h), p) => (h, p),
                (Err(_), _) => continue,
            };
            match self.servers.ping(&host, port).await {
                Ok(()) => {
                    self.failures.remove(source);
                }
                Err(_) => {
                    let count = self.failures.entry(source.clone()).or_insert(0);
                    *count += 1;
                    let _ = self.bus.send(IdentityEvent::SourceUnhealthy {
                        source: source.clone(),
                        failures: *count,
                    });
                    if *count >= self.config.failure_threshold {
                        dead_source.get_or_insert(source.clone());
                    }
                }
            }
        }

        if let Some(dead) = dead_source {
            if !self.config.automatic_rotate {
                warn!(source = %dead, "identity server dead but automatic rotation is disabled");
                return;
            }
            if let Err(e) = self.rotate(&dead).await {
                warn!(source = %dead, error = %e, "rotation attempt failed");
            }
        }
    }

    async fn rotate(&mut self, dead: &IdUrl) -> Result<(IdUrl, IdUrl)> {
        let current = self.my_id.document();

        // 2. Highest-ranked reachable candidate not already in sources.
        let mut reachable = Vec::with_capacity(self.config.known_servers.len());
        for (host, port) in &self.config.known_servers {
            reachable.push(self.servers.ping(host, *port).await.is_ok());
        }
        let (host, port) =
            choose_candidate(&self.config.known_servers, &current.sources, &reachable)
                .ok_or(IdError::NoCandidateServer)?;

        // 3. Same key pair, new source prepended, dead one dropped.
        let new_source = IdUrl::for_user(&host, port, &current.name);
        let new_doc = self
            .my_id
            .local()
            .rotate_document(&current, new_source.clone(), dead);

        // 4. At least one successful publish before committing locally.
        let mut published = 0;
        for source in &new_doc.sources {
            let (h, p) = match (source.host(), source.port()) {
                (Ok(h), p) => (h, p),
                (Err(_), _) => continue,
            };
            match self.servers.publish(&h, p, &new_doc).await {
                Ok(()) => published += 1,
                Err(e) => warn!(server = %source, error = %e, "publish of rotated identity failed"),
            }
        }
        if published == 0 {
            return Err(IdError::RotationRejected(
                "no identity server accepted the rotated document".into(),
            ));
        }

        // 5. Commit, cache, breadcrumb, event.
        let (old, new) = self.my_id.commit_document(new_doc.clone())?;
        self.registry.put(new_doc)?;
        self.failures.clear();

        let record = RotateRecord::create(old.clone(), new.clone(), self.my_id.local());
        if let Err(e) = self.dht.publish_rotation(&record).await {
            warn!(error = %e, "rotation breadcrumb write failed");
        }

        info!(old = %old, new = %new, "identity rotation complete");
        let _ = self.bus.send(IdentityEvent::RotateComplete {
            old: old.clone(),
            new: new.clone(),
        });
        Ok((old, new))
    }
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

    fn idurl(host: &str, name: &str) -> IdUrl {
        IdUrl::for_user(host, 8084, name)
    }

    #[test]
    fn candidate_selection_skips_current_and_dead() {
        let known = vec![
            ("id-a.example.com".to_string(), 8084),
            ("id-b.example.com".to_string(), 8084),
            ("id-c.example.com".to_string(), 8084),
        ];
        let sources = vec![idurl("id-a.example.com", "alice")];

        // id-b unreachable: pick id-c.
        let picked = choose_candidate(&known, &sources, &[true, false, true]).unwrap();
        assert_eq!(picked.0, "id-c.example.com");

        // All reachable: id-b ranks first among non-sources.
        let picked = choose_candidate(&known, &sources, &[true, true, true]).unwrap();
        assert_eq!(picked.0, "id-b.example.com");

        // Nothing reachable.
        assert!(choose_candidate(&known, &sources, &[false, false, false]).is_none());
    }

    async fn rotation_fixture() -> (
        Arc<MemoryIdServers>,
        Arc<MyIdentity>,
        RotatorHandle,
        broadcast::Receiver<IdentityEvent>,
    ) {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        servers.add_server("id-b.example.com", 8084);

        let me = Arc::new(MyIdentity::create(
            "rob",
            "id-a.example.com",
            8084,
            vec!["memory://rob".into()],
        ));
        servers
            .publish("id-a.example.com", 8084, &me.document())
            .await
            .unwrap();

        let registry = IdentityRegistry::new(servers.clone() as Arc<dyn IdServerClient>);
        registry.put(me.document()).unwrap();

        let dht = DhtHandle::spawn(
            MemoryDhtBackend::new() as Arc<dyn DhtBackend>,
            "rob",
            DhtConfig::default(),
        );
        let (bus, events) = crate::events::new_bus();

        let handle = Rotator::spawn(
            me.clone(),
            registry,
            servers.clone() as Arc<dyn IdServerClient>,
            dht,
            bus,
            RotatorConfig {
                known_servers: vec![
                    ("id-a.example.com".to_string(), 8084),
                    ("id-b.example.com".to_string(), 8084),
                ],
                automatic_rotate: true,
                failure_threshold: 2,
                ping_interval: Duration::from_millis(25),
            },
        );
        (servers, me, handle, events)
    }

    #[tokio::test]
    async fn dead_server_triggers_automatic_rotation() {
        let (servers, me, handle, mut events) = rotation_fixture().await;
        let old = me.idurl();

        servers.kill_server("id-a.example.com", 8084);
        // Drive health passes explicitly to stay off wall-clock timing.
        for _ in 0..3 {
            handle.check_health().await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            tokio::select! {
                event = events.recv() => {
                    if let Ok(IdentityEvent::RotateComplete { old: o, new }) = event {
                        assert_eq!(o, old);
                        assert_eq!(new, idurl("id-b.example.com", "rob"));
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => panic!("no rotation within deadline"),
            }
        }

        let doc = me.document();
        assert_eq!(doc.sources[0], idurl("id-b.example.com", "rob"));
        assert!(!doc.sources.contains(&old));
    }

    #[tokio::test]
    async fn manual_rotation_publishes_before_commit() {
        let (servers, me, handle, _events) = rotation_fixture().await;
        let (old, new) = handle.rotate_now(None).await.unwrap();
        assert_eq!(new, idurl("id-b.example.com", "rob"));
        assert_ne!(old, new);

        // The rotated document is on the new server.
        let fetched = servers.fetch(&new).await.unwrap();
        assert_eq!(fetched, me.document());
    }

    #[tokio::test]
    async fn rotation_fails_without_candidates() {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let me = Arc::new(MyIdentity::create("solo", "id-a.example.com", 8084, vec![]));
        let registry = IdentityRegistry::new(servers.clone() as Arc<dyn IdServerClient>);
        let dht = DhtHandle::spawn(
            MemoryDhtBackend::new() as Arc<dyn DhtBackend>,
            "solo",
            DhtConfig::default(),
        );
        let (bus, _events) = crate::events::new_bus();
        let handle = Rotator::spawn(
            me,
            registry,
            servers as Arc<dyn IdServerClient>,
            dht,
            bus,
            RotatorConfig {
                known_servers: vec![("id-a.example.com".to_string(), 8084)],
                ..RotatorConfig::default()
            },
        );

        assert!(matches!(
            handle.rotate_now(None).await,
            Err(IdError::NoCandidateServer)
        ));
    }
}
