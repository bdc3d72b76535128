// Identity subsystem: registry cache, rotation, propagation and the
// identity-server client seam.

pub mod error;
pub mod events;
pub mod my_id;
pub mod propagate;
pub mod registry;
pub mod rotator;
pub mod server_client;

pub use error::{IdError, Result};
pub use events::{new_bus, IdentityEvent};
pub use my_id::MyIdentity;
pub use registry::IdentityRegistry;
pub use rotator::{Rotator, RotatorConfig, RotatorHandle};
pub use server_client::{HttpIdServerClient, IdServerClient, MemoryIdServers};
