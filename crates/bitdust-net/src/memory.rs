//! In-process transport for the test harness.
//!
//! A [`MemoryHub`] is the "network": a map of mailbox names to gate frame
//! channels. Every node attaches one [`MemoryTransport`]; killing a
//! mailbox makes the node unreachable, which is how the tests simulate
//! dead brokers and suppliers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bitdust_shared::types::IdUrl;

use crate::error::NetError;
use crate::transport::{
    ContactAddress, ContactResolver, InboundFrame, InboundSender, Transport, TransportProto,
};

#[derive(Default)]
pub struct MemoryHub {
    mailboxes: Mutex<HashMap<String, InboundSender>>,
    dead: Mutex<HashSet<String>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a mailbox and get the transport to plug into the gate.
    pub fn attach(self: &Arc<Self>, host: &str, frame_tx: InboundSender) -> Arc<MemoryTransport> {
        self.mailboxes
            .lock()
            .expect("hub lock")
            .insert(host.to_string(), frame_tx);
        Arc::new(MemoryTransport {
            hub: self.clone(),
            local_host: host.to_string(),
        })
    }

    /// Make a mailbox unreachable.
    pub fn kill(&self, host: &str) {
        self.dead.lock().expect("hub lock").insert(host.to_string());
    }

    pub fn revive(&self, host: &str) {
        self.dead.lock().expect("hub lock").remove(host);
    }

    pub fn is_dead(&self, host: &str) -> bool {
        self.dead.lock().expect("hub lock").contains(host)
    }

    /// Push a raw frame into a mailbox, bypassing any transport checks.
    pub async fn inject(&self, from: &str, to: &str, data: Vec<u8>) {
        let tx = self.mailboxes.lock().expect("hub lock").get(to).cloned();
        if let Some(tx) = tx {
            let _ = tx
                .send(InboundFrame {
                    proto: TransportProto::Memory,
                    from_host: from.to_string(),
                    data,
                })
                .await;
        }
    }

    async fn deliver(&self, from: &str, to: &str, data: Vec<u8>) -> Result<(), NetError> {
        if self.is_dead(to) || self.is_dead(from) {
            return Err(NetError::Unreachable(to.to_string()));
        }
        let tx = self.mailboxes.lock().expect("hub lock").get(to).cloned();
        match tx {
            Some(tx) => tx
                .send(InboundFrame {
                    proto: TransportProto::Memory,
                    from_host: from.to_string(),
                    data,
                })
                .await
                .map_err(|_| NetError::Unreachable(to.to_string())),
            None => Err(NetError::Unreachable(to.to_string())),
        }
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_host: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn proto(&self) -> TransportProto {
        TransportProto::Memory
    }

    async fn send(&self, address: &ContactAddress, frame: Vec<u8>) -> Result<(), NetError> {
        self.hub.deliver(&self.local_host, &address.host, frame).await
    }
}

// ---------------------------------------------------------------------------
// Static resolver
// ---------------------------------------------------------------------------

/// Fixed idurl -> (key, contacts) table for tests and bootstrap wiring.
#[derive(Default)]
pub struct StaticResolver {
    entries: Mutex<HashMap<IdUrl, ([u8; 32], Vec<ContactAddress>)>>,
}

impl StaticResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, idurl: IdUrl, public_key: [u8; 32], contacts: Vec<ContactAddress>) {
        self.entries
            .lock()
            .expect("resolver lock")
            .insert(idurl, (public_key, contacts));
    }

    pub fn remove(&self, idurl: &IdUrl) {
        self.entries.lock().expect("resolver lock").remove(idurl);
    }
}

#[async_trait]
impl ContactResolver for StaticResolver {
    async fn contacts(&self, idurl: &IdUrl) -> Option<Vec<ContactAddress>> {
        self.entries
            .lock()
            .expect("resolver lock")
            .get(idurl)
            .map(|(_, c)| c.clone())
    }

    async fn public_key(&self, idurl: &IdUrl) -> Option<[u8; 32]> {
        self.entries
            .lock()
            .expect("resolver lock")
            .get(idurl)
            .map(|(k, _)| *k)
    }

    async fn invalidate(&self, _idurl: &IdUrl) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn frames_reach_the_mailbox() {
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        let _bob_side = hub.attach("bob", tx);
        let (alice_tx, _alice_rx) = mpsc::channel(8);
        let alice = hub.attach("alice", alice_tx);

        alice
            .send(
                &ContactAddress {
                    proto: TransportProto::Memory,
                    host: "bob".into(),
                },
                vec![1, 2, 3],
            )
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.data, vec![1, 2, 3]);
        assert_eq!(frame.from_host, "alice");
    }

    #[tokio::test]
    async fn dead_mailbox_is_unreachable() {
        let hub = MemoryHub::new();
        let (tx, _rx) = mpsc::channel(8);
        let _bob_side = hub.attach("bob", tx);
        let (alice_tx, _alice_rx) = mpsc::channel(8);
        let alice = hub.attach("alice", alice_tx);

        hub.kill("bob");
        let addr = ContactAddress {
            proto: TransportProto::Memory,
            host: "bob".into(),
        };
        assert!(alice.send(&addr, vec![0]).await.is_err());

        hub.revive("bob");
        assert!(alice.send(&addr, vec![0]).await.is_ok());
    }
}
