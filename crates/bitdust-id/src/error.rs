use thiserror::Error;

/// Errors produced by the identity subsystem.
#[derive(Error, Debug)]
pub enum IdError {
    #[error("Identity document error: {0}")]
    Document(#[from] bitdust_shared::error::IdentityError),

    #[error("Identity server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Identity not found: {0}")]
    NotFound(String),

    #[error("Rotation rejected: {0}")]
    RotationRejected(String),

    #[error("No candidate identity server available")]
    NoCandidateServer,

    #[error("Automatic rotation is disabled")]
    RotationDisabled,

    #[error("Network error: {0}")]
    Net(#[from] bitdust_net::error::NetError),

    #[error("Malformed id: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IdError>;
