//! Node configuration with defaults and environment overrides.
//!
//! Everything has a sensible default so a node starts with zero
//! configuration against a local test network.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bitdust_shared::constants::{
    CRITICAL_PUSH_FAILS_ENV, DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_ARCHIVE_CHUNK_SIZE,
    DEFAULT_CRITICAL_PUSH_FAILS, DEFAULT_MESSAGE_ACK_TIMEOUT_SECS, DEFAULT_TCP_PORT,
    ID_SERVER_FAILURE_THRESHOLD, PROPAGATE_INTERVAL_SECS,
};
use bitdust_shared::ecc::EccMap;
use bitdust_shared::types::IdUrl;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Nickname the identity is filed under on its servers.
    pub name: String,

    /// Data directory; databases, keys and group files live beneath it.
    pub data_dir: PathBuf,

    /// Contact methods advertised in the identity document, e.g.
    /// `tcp://203.0.113.7:7771`.
    pub contacts: Vec<String>,

    /// Identity servers in preference order.
    /// Env: none, file only.
    pub known_id_servers: Vec<(String, u16)>,

    /// Preferred broker candidates, tried before DHT random lookup.
    pub known_brokers: Vec<IdUrl>,

    /// Preferred supplier candidates, tried before DHT random lookup.
    pub known_suppliers: Vec<IdUrl>,

    /// Redundancy plan; fixes the supplier slate length.
    pub ecc_map: EccMap,

    /// TCP listen port for the packet transport.
    /// Env: `BITDUST_TCP_PORT`
    pub tcp_port: u16,

    /// Ack timeout for ordinary packets, seconds.
    pub ack_timeout_secs: u64,

    /// Ack timeout for group message pushes, seconds.
    /// Env: `BITDUST_MESSAGE_ACK_TIMEOUT`
    pub message_ack_timeout_secs: u64,

    /// Failed pushes tolerated before rotating to the next broker.
    /// Env: `BITDUST_CRITICAL_PUSH_FAILS`
    pub critical_push_fails: u32,

    /// Queue messages batched into one archive snapshot.
    /// Env: `BITDUST_ARCHIVE_CHUNK_SIZE`
    pub archive_chunk_size: u64,

    /// Consecutive ping failures before an identity source is dead.
    pub rotate_failure_threshold: u32,

    /// Whether a dead identity server triggers rotation without asking.
    pub automatic_rotate: bool,

    /// Identity-server health ping interval, seconds.
    pub id_ping_interval_secs: u64,

    /// Periodic identity propagation interval, seconds.
    pub propagate_interval_secs: u64,

    /// Supplier health probe interval, seconds.
    pub supplier_probe_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            data_dir: PathBuf::from("./bitdust-data"),
            contacts: Vec::new(),
            known_id_servers: Vec::new(),
            known_brokers: Vec::new(),
            known_suppliers: Vec::new(),
            ecc_map: EccMap::Ecc2x2,
            tcp_port: DEFAULT_TCP_PORT,
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            message_ack_timeout_secs: DEFAULT_MESSAGE_ACK_TIMEOUT_SECS,
            critical_push_fails: DEFAULT_CRITICAL_PUSH_FAILS,
            archive_chunk_size: DEFAULT_ARCHIVE_CHUNK_SIZE,
            rotate_failure_threshold: ID_SERVER_FAILURE_THRESHOLD,
            automatic_rotate: true,
            id_ping_interval_secs: 30,
            propagate_interval_secs: PROPAGATE_INTERVAL_SECS,
            supplier_probe_interval_secs: 60,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let mut config: Self = if path.exists() {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| crate::error::NodeError::Config(e.to_string()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the documented environment overrides in place.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<u16>("BITDUST_TCP_PORT") {
            self.tcp_port = v;
        }
        if let Some(v) = env_parse::<u64>("BITDUST_MESSAGE_ACK_TIMEOUT") {
            self.message_ack_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u32>(CRITICAL_PUSH_FAILS_ENV) {
            self.critical_push_fails = v;
        }
        if let Some(v) = env_parse::<u64>("BITDUST_ARCHIVE_CHUNK_SIZE") {
            self.archive_chunk_size = v;
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn message_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.message_ack_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid env override ignored");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.critical_push_fails, 2);
        assert_eq!(config.archive_chunk_size, 10);
        assert_eq!(config.ecc_map.suppliers_count(), 2);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = NodeConfig::default();
        config.name = "alice".into();
        config.known_id_servers = vec![("id-a.example.com".into(), 8084)];
        std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.known_id_servers.len(), 1);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let loaded = NodeConfig::load(std::path::Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(loaded.name, "node");
    }
}
