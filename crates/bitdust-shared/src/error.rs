use thiserror::Error;

#[derive(Error, Debug)]
pub enum BitDustError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Noise handshake error: {0}")]
    Noise(#[from] NoiseError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Malformed global id: {0}")]
    GlobalId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key unwrap failed")]
    UnwrapFailed,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature on identity document")]
    InvalidSignature,

    #[error("Malformed identity source url: {0}")]
    MalformedSource(String),

    #[error("Identity document has no sources")]
    NoSources,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Unknown command token: {0}")]
    UnknownCommand(String),

    #[error("Truncated envelope")]
    Truncated,

    #[error("Payload exceeds maximum size: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid signature on packet")]
    InvalidSignature,

    #[error("Malformed field: {0}")]
    MalformedField(&'static str),

    #[error("Body encoding error: {0}")]
    Body(String),
}

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Noise handshake error: {0}")]
    Handshake(String),

    #[error("Noise transport error: {0}")]
    Transport(String),
}
