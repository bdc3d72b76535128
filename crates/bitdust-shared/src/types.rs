//! Identifier types used across every subsystem.
//!
//! An [`IdUrl`] locates an identity document on an identity server. Two
//! IDURLs name the same entity iff their documents carry the same public
//! key, so raw string equality is only a cache key, never an identity
//! check. [`GlobalId`] is the composite `alias$nickname@host_port` form
//! embedded in packet envelopes and key ids.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BitDustError;

// ---------------------------------------------------------------------------
// IdUrl
// ---------------------------------------------------------------------------

/// URL of an identity document, e.g. `http://id-a.example.com:8084/alice.xml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdUrl(String);

impl IdUrl {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build the canonical URL for a nickname hosted on the given server.
    pub fn for_user(host: &str, port: u16, nickname: &str) -> Self {
        Self(format!("http://{host}:{port}/{nickname}.xml"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the URL, without scheme or port.
    pub fn host(&self) -> Result<String, BitDustError> {
        let rest = self
            .0
            .strip_prefix("http://")
            .or_else(|| self.0.strip_prefix("https://"))
            .unwrap_or(&self.0);
        let authority = rest.split('/').next().unwrap_or(rest);
        let host = authority.split(':').next().unwrap_or(authority);
        if host.is_empty() {
            return Err(BitDustError::GlobalId(format!("no host in {}", self.0)));
        }
        Ok(host.to_string())
    }

    /// Port part of the URL; 80 if absent.
    pub fn port(&self) -> u16 {
        let rest = self
            .0
            .strip_prefix("http://")
            .or_else(|| self.0.strip_prefix("https://"))
            .unwrap_or(&self.0);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority
            .split_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(80)
    }

    /// Nickname: the document file name without its extension.
    pub fn nickname(&self) -> Result<String, BitDustError> {
        let file = self
            .0
            .rsplit('/')
            .next()
            .ok_or_else(|| BitDustError::GlobalId(format!("no file in {}", self.0)))?;
        let stem = file.split('.').next().unwrap_or(file);
        if stem.is_empty() || stem.contains(':') {
            return Err(BitDustError::GlobalId(format!("no nickname in {}", self.0)));
        }
        Ok(stem.to_string())
    }

    /// The `nickname@host_port` user part derived from this URL.
    pub fn user(&self) -> Result<GlobalUser, BitDustError> {
        Ok(GlobalUser {
            nickname: self.nickname()?,
            host: self.host()?,
            port: self.port(),
        })
    }

    /// The global id of the given key alias under this identity.
    pub fn global_id(&self, key_alias: &str) -> Result<GlobalId, BitDustError> {
        Ok(GlobalId {
            key_alias: key_alias.to_string(),
            user: self.user()?,
        })
    }
}

impl std::fmt::Display for IdUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdUrl {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// GlobalUser / GlobalId
// ---------------------------------------------------------------------------

/// The `nickname@host_port` part of a global id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalUser {
    pub nickname: String,
    pub host: String,
    pub port: u16,
}

impl GlobalUser {
    pub fn parse(s: &str) -> Result<Self, BitDustError> {
        let (nickname, rest) = s
            .split_once('@')
            .ok_or_else(|| BitDustError::GlobalId(format!("missing '@' in {s}")))?;
        if nickname.is_empty() {
            return Err(BitDustError::GlobalId(format!("empty nickname in {s}")));
        }
        // The port is separated from the host with the last underscore.
        let (host, port) = match rest.rsplit_once('_') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (rest.to_string(), 80),
            },
            None => (rest.to_string(), 80),
        };
        if host.is_empty() {
            return Err(BitDustError::GlobalId(format!("empty host in {s}")));
        }
        Ok(Self {
            nickname: nickname.to_string(),
            host,
            port,
        })
    }

    /// The identity URL this user part points back to.
    pub fn idurl(&self) -> IdUrl {
        IdUrl::for_user(&self.host, self.port, &self.nickname)
    }
}

impl std::fmt::Display for GlobalUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_inner(f)
    }
}

impl GlobalUser {
    fn fmt_inner(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}_{}", self.nickname, self.host, self.port)
    }
}

/// Composite identifier `alias$nickname@host_port`.
///
/// Key ids are global ids: the master share of a node is
/// `master$<nickname>@<host>_<port>`, a group key is
/// `group_<hex>$<owner user part>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId {
    pub key_alias: String,
    pub user: GlobalUser,
}

impl GlobalId {
    pub fn parse(s: &str) -> Result<Self, BitDustError> {
        let (key_alias, user) = s
            .split_once('$')
            .ok_or_else(|| BitDustError::GlobalId(format!("missing '$' in {s}")))?;
        if key_alias.is_empty() {
            return Err(BitDustError::GlobalId(format!("empty alias in {s}")));
        }
        Ok(Self {
            key_alias: key_alias.to_string(),
            user: GlobalUser::parse(user)?,
        })
    }

    pub fn master(user: GlobalUser) -> Self {
        Self {
            key_alias: crate::constants::MASTER_KEY_ALIAS.to_string(),
            user,
        }
    }

    /// Mint a fresh group alias: `group_<12 hex chars>`.
    pub fn new_group(user: GlobalUser) -> Self {
        let hex_part = hex::encode(&Uuid::new_v4().as_bytes()[..6]);
        Self {
            key_alias: format!("{}{hex_part}", crate::constants::GROUP_KEY_ALIAS_PREFIX),
            user,
        }
    }

    pub fn is_master(&self) -> bool {
        self.key_alias == crate::constants::MASTER_KEY_ALIAS
    }

    pub fn is_group(&self) -> bool {
        self.key_alias
            .starts_with(crate::constants::GROUP_KEY_ALIAS_PREFIX)
    }

    /// Same alias rebased onto another user (rotation rename).
    pub fn rebase(&self, user: GlobalUser) -> Self {
        Self {
            key_alias: self.key_alias.clone(),
            user,
        }
    }
}

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}$", self.key_alias)?;
        self.user.fmt_inner(f)
    }
}

// ---------------------------------------------------------------------------
// QueueId
// ---------------------------------------------------------------------------

/// Identifier of a group queue hosted on one broker:
/// `<queue_alias>&<owner user part>&<broker user part>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub queue_alias: String,
    pub owner: GlobalUser,
    pub supplier: GlobalUser,
}

impl QueueId {
    pub fn new(queue_alias: &str, owner: GlobalUser, supplier: GlobalUser) -> Self {
        Self {
            queue_alias: queue_alias.to_string(),
            owner,
            supplier,
        }
    }

    pub fn parse(s: &str) -> Result<Self, BitDustError> {
        let mut parts = s.split('&');
        let alias = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| BitDustError::GlobalId(format!("missing queue alias in {s}")))?;
        let owner = parts
            .next()
            .ok_or_else(|| BitDustError::GlobalId(format!("missing owner in {s}")))?;
        let supplier = parts
            .next()
            .ok_or_else(|| BitDustError::GlobalId(format!("missing supplier in {s}")))?;
        if parts.next().is_some() {
            return Err(BitDustError::GlobalId(format!("too many parts in {s}")));
        }
        Ok(Self {
            queue_alias: alias.to_string(),
            owner: GlobalUser::parse(owner)?,
            supplier: GlobalUser::parse(supplier)?,
        })
    }

    /// Same queue rehosted on another broker.
    pub fn rehost(&self, supplier: GlobalUser) -> Self {
        Self {
            queue_alias: self.queue_alias.clone(),
            owner: self.owner.clone(),
            supplier,
        }
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}&", self.queue_alias)?;
        self.owner.fmt_inner(f)?;
        write!(f, "&")?;
        self.supplier.fmt_inner(f)
    }
}

// ---------------------------------------------------------------------------
// PacketId
// ---------------------------------------------------------------------------

/// Unique id of a signed packet. Responses (Ack/Fail) carry the id of the
/// packet they answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PacketId(pub String);

impl PacketId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> GlobalUser {
        GlobalUser {
            nickname: "alice".into(),
            host: "id-a.example.com".into(),
            port: 8084,
        }
    }

    #[test]
    fn idurl_parts() {
        let u = IdUrl::for_user("id-a.example.com", 8084, "alice");
        assert_eq!(u.as_str(), "http://id-a.example.com:8084/alice.xml");
        assert_eq!(u.host().unwrap(), "id-a.example.com");
        assert_eq!(u.port(), 8084);
        assert_eq!(u.nickname().unwrap(), "alice");
        assert_eq!(u.user().unwrap(), user());
    }

    #[test]
    fn idurl_without_port() {
        let u = IdUrl::new("http://id.example.com/bob.xml");
        assert_eq!(u.port(), 80);
        assert_eq!(u.nickname().unwrap(), "bob");
    }

    #[test]
    fn global_id_round_trip() {
        let gid = GlobalId::master(user());
        let s = gid.to_string();
        assert_eq!(s, "master$alice@id-a.example.com_8084");
        assert_eq!(GlobalId::parse(&s).unwrap(), gid);
    }

    #[test]
    fn global_user_back_to_idurl() {
        assert_eq!(
            user().idurl().as_str(),
            "http://id-a.example.com:8084/alice.xml"
        );
    }

    #[test]
    fn group_alias_detection() {
        let g = GlobalId::new_group(user());
        assert!(g.is_group());
        assert!(!g.is_master());
        assert_eq!(g.key_alias.len(), "group_".len() + 12);
    }

    #[test]
    fn queue_id_round_trip() {
        let broker = GlobalUser {
            nickname: "carl".into(),
            host: "id-b.example.com".into(),
            port: 8084,
        };
        let q = QueueId::new("group_abcdef", user(), broker.clone());
        let s = q.to_string();
        assert_eq!(
            s,
            "group_abcdef&alice@id-a.example.com_8084&carl@id-b.example.com_8084"
        );
        assert_eq!(QueueId::parse(&s).unwrap(), q);
        assert_eq!(q.rehost(user()).supplier, user());
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!(GlobalId::parse("no-dollar-here").is_err());
        assert!(GlobalUser::parse("nobody").is_err());
        assert!(QueueId::parse("a&b").is_err());
    }

    #[test]
    fn rebase_keeps_alias() {
        let g = GlobalId::new_group(user());
        let other = GlobalUser {
            nickname: "alice".into(),
            host: "id-c.example.com".into(),
            port: 8084,
        };
        let moved = g.rebase(other.clone());
        assert_eq!(moved.key_alias, g.key_alias);
        assert_eq!(moved.user, other);
    }
}
