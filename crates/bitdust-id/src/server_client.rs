//! Identity-server client seam.
//!
//! Identity servers are plain HTTP hosts serving signed documents at
//! `http://<host>:<port>/<name>.xml`. The trait keeps the rest of the
//! subsystem testable: the in-memory implementation models a fleet of
//! servers with per-server kill switches.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use bitdust_shared::identity::IdentityDoc;
use bitdust_shared::types::IdUrl;

use crate::error::{IdError, Result};

#[async_trait]
pub trait IdServerClient: Send + Sync {
    /// Publish a document to one server; the server files it under the
    /// document's name.
    async fn publish(&self, host: &str, port: u16, doc: &IdentityDoc) -> Result<()>;

    /// Fetch and verify the document an IDURL points at.
    async fn fetch(&self, idurl: &IdUrl) -> Result<IdentityDoc>;

    /// Health probe.
    async fn ping(&self, host: &str, port: u16) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpIdServerClient {
    client: reqwest::Client,
}

impl HttpIdServerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpIdServerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdServerClient for HttpIdServerClient {
    async fn publish(&self, host: &str, port: u16, doc: &IdentityDoc) -> Result<()> {
        let url = format!("http://{host}:{port}/{}.xml", doc.name);
        let response = self
            .client
            .put(&url)
            .json(doc)
            .send()
            .await
            .map_err(|e| IdError::ServerUnreachable(format!("{host}:{port}: {e}")))?;
        if !response.status().is_success() {
            return Err(IdError::ServerUnreachable(format!(
                "{host}:{port}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch(&self, idurl: &IdUrl) -> Result<IdentityDoc> {
        let response = self
            .client
            .get(idurl.as_str())
            .send()
            .await
            .map_err(|e| IdError::ServerUnreachable(format!("{idurl}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IdError::NotFound(idurl.to_string()));
        }
        let doc: IdentityDoc = response
            .json()
            .await
            .map_err(|e| IdError::Malformed(format!("{idurl}: {e}")))?;
        doc.verify()?;
        Ok(doc)
    }

    async fn ping(&self, host: &str, port: u16) -> Result<()> {
        let url = format!("http://{host}:{port}/");
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| IdError::ServerUnreachable(format!("{host}:{port}: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// A fleet of in-process identity servers for tests: every node shares
/// the same `Arc<MemoryIdServers>` and individual servers can be killed
/// to exercise rotation.
#[derive(Default)]
pub struct MemoryIdServers {
    // "host:port" -> name -> document
    servers: Mutex<HashMap<String, HashMap<String, IdentityDoc>>>,
    dead: Mutex<HashSet<String>>,
}

impl MemoryIdServers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn server_key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Bring a server into existence (empty until something publishes).
    pub fn add_server(&self, host: &str, port: u16) {
        self.servers
            .lock()
            .expect("servers lock")
            .entry(Self::server_key(host, port))
            .or_default();
    }

    /// Simulate a permanently dead server.
    pub fn kill_server(&self, host: &str, port: u16) {
        self.dead
            .lock()
            .expect("servers lock")
            .insert(Self::server_key(host, port));
    }

    pub fn revive_server(&self, host: &str, port: u16) {
        self.dead
            .lock()
            .expect("servers lock")
            .remove(&Self::server_key(host, port));
    }

    fn is_dead(&self, key: &str) -> bool {
        self.dead.lock().expect("servers lock").contains(key)
    }
}

#[async_trait]
impl IdServerClient for MemoryIdServers {
    async fn publish(&self, host: &str, port: u16, doc: &IdentityDoc) -> Result<()> {
        let key = Self::server_key(host, port);
        if self.is_dead(&key) {
            return Err(IdError::ServerUnreachable(key));
        }
        let mut servers = self.servers.lock().expect("servers lock");
        let Some(files) = servers.get_mut(&key) else {
            return Err(IdError::ServerUnreachable(key));
        };
        debug!(server = %key, name = %doc.name, revision = doc.revision, "identity published");
        files.insert(doc.name.clone(), doc.clone());
        Ok(())
    }

    async fn fetch(&self, idurl: &IdUrl) -> Result<IdentityDoc> {
        let host = idurl
            .host()
            .map_err(|e| IdError::Malformed(e.to_string()))?;
        let key = Self::server_key(&host, idurl.port());
        if self.is_dead(&key) {
            return Err(IdError::ServerUnreachable(key));
        }
        let name = idurl
            .nickname()
            .map_err(|e| IdError::Malformed(e.to_string()))?;
        let servers = self.servers.lock().expect("servers lock");
        let doc = servers
            .get(&key)
            .and_then(|files| files.get(&name))
            .cloned()
            .ok_or_else(|| IdError::NotFound(idurl.to_string()))?;
        doc.verify()?;
        Ok(doc)
    }

    async fn ping(&self, host: &str, port: u16) -> Result<()> {
        let key = Self::server_key(host, port);
        if self.is_dead(&key) || !self.servers.lock().expect("servers lock").contains_key(&key) {
            return Err(IdError::ServerUnreachable(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitdust_shared::identity::LocalIdentity;

    fn doc(name: &str, host: &str) -> (LocalIdentity, IdentityDoc) {
        let local = LocalIdentity::generate();
        let doc = local.make_document(
            name,
            vec![IdUrl::for_user(host, 8084, name)],
            vec![],
            1,
        );
        (local, doc)
    }

    #[tokio::test]
    async fn publish_then_fetch() {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let (_, d) = doc("alice", "id-a.example.com");

        servers.publish("id-a.example.com", 8084, &d).await.unwrap();
        let fetched = servers
            .fetch(&IdUrl::for_user("id-a.example.com", 8084, "alice"))
            .await
            .unwrap();
        assert_eq!(fetched, d);
    }

    #[tokio::test]
    async fn dead_server_is_unreachable() {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let (_, d) = doc("alice", "id-a.example.com");
        servers.publish("id-a.example.com", 8084, &d).await.unwrap();

        servers.kill_server("id-a.example.com", 8084);
        assert!(servers.ping("id-a.example.com", 8084).await.is_err());
        assert!(servers
            .fetch(&IdUrl::for_user("id-a.example.com", 8084, "alice"))
            .await
            .is_err());

        servers.revive_server("id-a.example.com", 8084);
        assert!(servers.ping("id-a.example.com", 8084).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        let err = servers
            .fetch(&IdUrl::for_user("id-a.example.com", 8084, "ghost"))
            .await;
        assert!(matches!(err, Err(IdError::NotFound(_))));
    }
}
