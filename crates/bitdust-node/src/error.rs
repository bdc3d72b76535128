use thiserror::Error;

/// Errors produced by the node layer.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Shared error: {0}")]
    Shared(#[from] bitdust_shared::error::BitDustError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] bitdust_shared::error::EnvelopeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] bitdust_shared::error::CryptoError),

    #[error("Network error: {0}")]
    Net(#[from] bitdust_net::error::NetError),

    #[error("Store error: {0}")]
    Store(#[from] bitdust_store::error::StoreError),

    #[error("Identity error: {0}")]
    Id(#[from] bitdust_id::error::IdError),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Group is not connected: {0}")]
    NotConnected(String),

    #[error("No suppliers available")]
    NoSuppliers,

    #[error("No broker available")]
    NoBroker,

    #[error("Service refused: {0}")]
    Refused(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subsystem stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
