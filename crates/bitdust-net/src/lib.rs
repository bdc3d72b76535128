// Packet transport layer: the gate, pluggable transports and the DHT service.

pub mod dht;
pub mod dns;
pub mod error;
pub mod gate;
pub mod memory;
pub mod stats;
pub mod tcp;
pub mod transport;

pub use error::{NetError, Result};
pub use gate::{Delivery, FailReason, Gate, GateConfig, GateHandle, InboundPacket, TransportInfo};
pub use transport::{ContactAddress, ContactResolver, InboundFrame, Transport, TransportProto};
