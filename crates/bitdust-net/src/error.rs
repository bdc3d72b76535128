use thiserror::Error;

/// Errors produced by the networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Remote is unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Remote refused: {0}")]
    Refused(String),

    #[error("No contacts known for {0}")]
    NoContacts(String),

    #[error("Packet dropped: invalid signature from {0}")]
    InvalidSignature(String),

    #[error("Malformed contact address: {0}")]
    MalformedAddress(String),

    #[error("Transport {0} is not registered")]
    NoSuchTransport(String),

    #[error("Gate is shut down")]
    GateClosed,

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("Noise error: {0}")]
    Noise(#[from] bitdust_shared::error::NoiseError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] bitdust_shared::error::EnvelopeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
