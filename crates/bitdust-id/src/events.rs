//! Identity event bus.
//!
//! Rotation is asynchronous to everything else: the rotator publishes
//! events here and the supplier coordinator, group participants, brokers
//! and key manager each subscribe and remap their stored references.

use tokio::sync::broadcast;

use bitdust_shared::types::IdUrl;

#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// `identity-url-changed` / `my-identity-rotate-complete`: the local
    /// identity moved from `old` to `new`, same public key.
    RotateComplete { old: IdUrl, new: IdUrl },
    /// A known peer's identity rotated (observed via propagate or DHT).
    PeerRotated { old: IdUrl, new: IdUrl },
    /// One of the local identity's sources keeps failing health pings.
    SourceUnhealthy { source: IdUrl, failures: u32 },
    /// The local identity was pushed to its servers.
    Propagated { servers: usize },
}

pub fn new_bus() -> (
    broadcast::Sender<IdentityEvent>,
    broadcast::Receiver<IdentityEvent>,
) {
    broadcast::channel(64)
}
