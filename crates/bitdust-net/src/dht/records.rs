//! Typed DHT records and their merge rules.
//!
//! Slates and broker triples are advertised one record per position so a
//! reader can make progress on partial observation; every record carries
//! the revision of the write it belongs to, and a reader observing a
//! mixture of revisions keeps only the highest one.

use serde::{Deserialize, Serialize};

use bitdust_shared::identity::{key_fingerprint, LocalIdentity};
use bitdust_shared::types::IdUrl;

use crate::error::NetError;

/// Namespaces the DHT is used with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhtLayer {
    Suppliers,
    Brokers,
    Rotation,
    Presence,
    Generic,
}

impl DhtLayer {
    pub fn name(&self) -> &'static str {
        match self {
            DhtLayer::Suppliers => "suppliers",
            DhtLayer::Brokers => "brokers",
            DhtLayer::Rotation => "rotation",
            DhtLayer::Presence => "presence",
            DhtLayer::Generic => "generic",
        }
    }
}

impl std::fmt::Display for DhtLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// -- key derivation ---------------------------------------------------------

pub fn suppliers_key(customer: &IdUrl, position: u32) -> String {
    format!("suppliers:{}:{position}", customer)
}

pub fn brokers_key(owner: &IdUrl, queue_alias: &str, position: u32) -> String {
    format!("brokers:{}:{queue_alias}:{position}", owner)
}

pub fn rotate_key(old: &IdUrl) -> String {
    format!("identity-rotate:{}", old)
}

// -- records ----------------------------------------------------------------

/// One slate position, advertised at `suppliers:<customer>:<position>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupplierRecord {
    pub customer: IdUrl,
    pub position: u32,
    pub supplier: Option<IdUrl>,
    pub ecc_map: String,
    pub revision: u64,
}

/// One broker position, advertised at `brokers:<owner>:<alias>:<position>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerRecord {
    pub owner: IdUrl,
    pub queue_alias: String,
    pub position: u32,
    pub broker: IdUrl,
    pub revision: u64,
}

/// Rotation breadcrumb at `identity-rotate:<old>`: peers that missed the
/// direct push follow old -> new, checking the key fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotateRecord {
    pub old: IdUrl,
    pub new: IdUrl,
    pub fingerprint: String,
    pub signature: String,
}

impl RotateRecord {
    fn signed_bytes(old: &IdUrl, new: &IdUrl, fingerprint: &str) -> Vec<u8> {
        format!("{old}|{new}|{fingerprint}").into_bytes()
    }

    /// Sign with the identity's long-lived key (unchanged by rotation).
    pub fn create(old: IdUrl, new: IdUrl, identity: &LocalIdentity) -> Self {
        let fingerprint = key_fingerprint(&identity.public_key_bytes());
        let signature = identity.sign(&Self::signed_bytes(&old, &new, &fingerprint));
        Self {
            old,
            new,
            fingerprint,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    /// Verify against the public key cached for the *old* IDURL.
    pub fn verify(&self, old_public_key: &[u8; 32]) -> Result<(), NetError> {
        if self.fingerprint != key_fingerprint(old_public_key) {
            return Err(NetError::Dht("rotation fingerprint mismatch".into()));
        }
        let signature = hex::decode(&self.signature)
            .map_err(|_| NetError::Dht("malformed rotation signature".into()))?;
        bitdust_shared::identity::verify_signature(
            old_public_key,
            &Self::signed_bytes(&self.old, &self.new, &self.fingerprint),
            &signature,
        )
        .map_err(|_| NetError::Dht("rotation record signed by wrong key".into()))
    }
}

/// Presence announcement used for random user lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub idurl: IdUrl,
}

// -- merged views -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlateView {
    pub revision: u64,
    pub ecc_map: String,
    pub suppliers: Vec<Option<IdUrl>>,
}

/// Merge position records into the slate at the highest observed revision.
pub fn merge_slate(records: Vec<SupplierRecord>) -> Option<SlateView> {
    let best = records.iter().map(|r| r.revision).max()?;
    let current: Vec<&SupplierRecord> =
        records.iter().filter(|r| r.revision == best).collect();
    let ecc_map = current.first()?.ecc_map.clone();
    let count = bitdust_shared::ecc::EccMap::parse(&ecc_map)
        .map(|m| m.suppliers_count())
        .unwrap_or_else(|| current.iter().map(|r| r.position as usize + 1).max().unwrap_or(0));
    let mut suppliers = vec![None; count];
    for record in current {
        if (record.position as usize) < suppliers.len() {
            suppliers[record.position as usize] = record.supplier.clone();
        }
    }
    Some(SlateView {
        revision: best,
        ecc_map,
        suppliers,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleView {
    pub revision: u64,
    pub brokers: Vec<Option<IdUrl>>,
}

/// Merge broker records into the triple at the highest observed revision.
pub fn merge_triple(records: Vec<BrokerRecord>) -> Option<TripleView> {
    let best = records.iter().map(|r| r.revision).max()?;
    let mut brokers = vec![None; bitdust_shared::constants::BROKERS_PER_GROUP];
    for record in records.into_iter().filter(|r| r.revision == best) {
        if (record.position as usize) < brokers.len() {
            brokers[record.position as usize] = Some(record.broker);
        }
    }
    Some(TripleView {
        revision: best,
        brokers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idurl(n: &str) -> IdUrl {
        IdUrl::for_user("id.example.com", 8084, n)
    }

    fn supplier_record(pos: u32, name: &str, revision: u64) -> SupplierRecord {
        SupplierRecord {
            customer: idurl("alice"),
            position: pos,
            supplier: Some(idurl(name)),
            ecc_map: "ecc/2x2".into(),
            revision,
        }
    }

    #[test]
    fn slate_merge_prefers_highest_revision() {
        let records = vec![
            supplier_record(0, "s1", 1),
            supplier_record(1, "s2", 1),
            supplier_record(0, "s3", 2),
        ];
        let view = merge_slate(records).unwrap();
        assert_eq!(view.revision, 2);
        assert_eq!(view.suppliers, vec![Some(idurl("s3")), None]);
    }

    #[test]
    fn slate_merge_reconstructs_full_revision() {
        let records = vec![supplier_record(1, "s2", 3), supplier_record(0, "s1", 3)];
        let view = merge_slate(records).unwrap();
        assert_eq!(view.suppliers, vec![Some(idurl("s1")), Some(idurl("s2"))]);
    }

    #[test]
    fn empty_slate_merges_to_none() {
        assert!(merge_slate(Vec::new()).is_none());
    }

    #[test]
    fn triple_merge() {
        let rec = |pos: u32, name: &str, revision: u64| BrokerRecord {
            owner: idurl("alice"),
            queue_alias: "group_ab".into(),
            position: pos,
            broker: idurl(name),
            revision,
        };
        let view = merge_triple(vec![rec(0, "b1", 4), rec(1, "b2", 4), rec(0, "old", 3)]).unwrap();
        assert_eq!(view.revision, 4);
        assert_eq!(
            view.brokers,
            vec![Some(idurl("b1")), Some(idurl("b2")), None]
        );
    }

    #[test]
    fn rotation_record_verifies_and_rejects() {
        let identity = LocalIdentity::generate();
        let record = RotateRecord::create(idurl("old"), idurl("new"), &identity);
        assert!(record.verify(&identity.public_key_bytes()).is_ok());

        let other = LocalIdentity::generate();
        assert!(record.verify(&other.public_key_bytes()).is_err());

        let mut forged = record.clone();
        forged.new = idurl("evil");
        assert!(forged.verify(&identity.public_key_bytes()).is_err());
    }
}
