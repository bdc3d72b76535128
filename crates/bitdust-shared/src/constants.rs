/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum signed packet payload size in bytes (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum encoded envelope size on the wire: payload plus headroom for
/// the fixed fields and length prefixes.
pub const MAX_ENVELOPE_SIZE: usize = MAX_PAYLOAD_SIZE + 4096;

/// Key alias of the implicit master share every node owns.
pub const MASTER_KEY_ALIAS: &str = "master";

/// Key alias prefix marking a share as a messaging group.
pub const GROUP_KEY_ALIAS_PREFIX: &str = "group_";

/// Number of brokers serving a group queue (primary + hot standbys).
pub const BROKERS_PER_GROUP: usize = 3;

/// Default TCP listen port for the packet transport.
pub const DEFAULT_TCP_PORT: u16 = 7771;

/// Default identity server HTTP port.
pub const DEFAULT_ID_SERVER_PORT: u16 = 8084;

/// Ack timeout for a single outbound packet, seconds.
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 20;

/// Ack timeout for a group message push, seconds.
pub const DEFAULT_MESSAGE_ACK_TIMEOUT_SECS: u64 = 30;

/// Interval between stuck-transfer scans in the gate, seconds.
pub const TIMEOUT_SCAN_INTERVAL_SECS: u64 = 10;

/// Consecutive ping failures before an identity source is declared dead.
pub const ID_SERVER_FAILURE_THRESHOLD: u32 = 3;

/// Interval between periodic identity propagations, seconds (1 hour).
pub const PROPAGATE_INTERVAL_SECS: u64 = 3600;

/// DHT republish interval for the original publisher, seconds (24 hours).
pub const DHT_REPUBLISH_ORIGINAL_SECS: u64 = 24 * 3600;

/// DHT replication interval for non-original holders, seconds (1 hour).
pub const DHT_REPUBLISH_REPLICA_SECS: u64 = 3600;

/// Default per-value DHT record expiry, seconds (48 hours).
pub const DHT_RECORD_EXPIRE_SECS: u64 = 48 * 3600;

/// Number of fully delivered queue messages batched into one archive snapshot.
pub const DEFAULT_ARCHIVE_CHUNK_SIZE: u64 = 10;

/// Failed pushes tolerated before a participant rotates to the next broker.
pub const DEFAULT_CRITICAL_PUSH_FAILS: u32 = 2;

/// Environment variable overriding [`DEFAULT_CRITICAL_PUSH_FAILS`].
pub const CRITICAL_PUSH_FAILS_ENV: &str = "BITDUST_CRITICAL_PUSH_FAILS";

/// Relative jitter applied to every periodic timer.
pub const TIMER_JITTER_RATIO: f64 = 0.1;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_KEY_WRAP: &str = "bitdust-key-wrap-v1";
pub const KDF_CONTEXT_DHT_KEY: &str = "bitdust-dht-key-v1";
pub const KDF_CONTEXT_DB_KEY: &str = "bitdust-db-key-v1";
