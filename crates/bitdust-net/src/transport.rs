//! The pluggable transport seam.
//!
//! A transport ships opaque frames to a `proto://host:port` address and
//! feeds received frames into the gate through a shared channel. Framing,
//! session encryption and reconnects are the transport's business; packet
//! semantics (signatures, acks, retries) belong to the gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use bitdust_shared::types::IdUrl;

use crate::error::NetError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProto {
    Tcp,
    /// In-process loopback used by the test harness.
    Memory,
}

impl TransportProto {
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Memory => "memory",
        }
    }

    pub fn from_scheme(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(TransportProto::Tcp),
            "memory" => Some(TransportProto::Memory),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

/// A contact method from an identity document: `tcp://10.0.0.1:7771`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactAddress {
    pub proto: TransportProto,
    /// `host:port` (or a bare mailbox name for the memory transport).
    pub host: String,
}

impl ContactAddress {
    pub fn parse(contact: &str) -> Result<Self, NetError> {
        let (scheme, host) = contact
            .split_once("://")
            .ok_or_else(|| NetError::MalformedAddress(contact.to_string()))?;
        let proto = TransportProto::from_scheme(scheme)
            .ok_or_else(|| NetError::MalformedAddress(contact.to_string()))?;
        if host.is_empty() {
            return Err(NetError::MalformedAddress(contact.to_string()));
        }
        Ok(Self {
            proto,
            host: host.to_string(),
        })
    }
}

impl std::fmt::Display for ContactAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.proto.scheme(), self.host)
    }
}

/// A frame received by some transport, on its way into the gate.
#[derive(Debug)]
pub struct InboundFrame {
    pub proto: TransportProto,
    pub from_host: String,
    pub data: Vec<u8>,
}

pub type InboundSender = mpsc::Sender<InboundFrame>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn proto(&self) -> TransportProto;

    /// Deliver one frame. Resolution of the result means the frame left
    /// this node (or could not), not that the remote processed it.
    async fn send(&self, address: &ContactAddress, frame: Vec<u8>) -> Result<(), NetError>;
}

/// Resolves an IDURL to its cached identity facts. Implemented by the
/// identity registry; the gate only sees this trait.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Contact methods of the identity, in its declared preference order.
    async fn contacts(&self, idurl: &IdUrl) -> Option<Vec<ContactAddress>>;

    /// Cached public key for signature checks.
    async fn public_key(&self, idurl: &IdUrl) -> Option<[u8; 32]>;

    /// Invalidate the cache entry, forcing a refetch on next use.
    async fn invalidate(&self, idurl: &IdUrl);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_contact_addresses() {
        let a = ContactAddress::parse("tcp://10.0.0.1:7771").unwrap();
        assert_eq!(a.proto, TransportProto::Tcp);
        assert_eq!(a.host, "10.0.0.1:7771");
        assert_eq!(a.to_string(), "tcp://10.0.0.1:7771");

        assert!(ContactAddress::parse("udp://1.2.3.4:1").is_err());
        assert!(ContactAddress::parse("not-an-address").is_err());
        assert!(ContactAddress::parse("tcp://").is_err());
    }
}
