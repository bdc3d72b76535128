//! The node's own identity: long-lived key pair plus the current signed
//! document, shared across subsystems.

use std::sync::RwLock;

use bitdust_shared::identity::{IdentityDoc, LocalIdentity};
use bitdust_shared::types::{GlobalId, GlobalUser, IdUrl};

use crate::error::{IdError, Result};

pub struct MyIdentity {
    local: LocalIdentity,
    doc: RwLock<IdentityDoc>,
}

impl MyIdentity {
    /// Wrap a key pair and its current document.
    pub fn new(local: LocalIdentity, doc: IdentityDoc) -> Result<Self> {
        doc.verify()?;
        Ok(Self {
            local,
            doc: RwLock::new(doc),
        })
    }

    /// Create a fresh identity hosted on one server.
    pub fn create(name: &str, server_host: &str, server_port: u16, contacts: Vec<String>) -> Self {
        let local = LocalIdentity::generate();
        let sources = vec![IdUrl::for_user(server_host, server_port, name)];
        let doc = local.make_document(name, sources, contacts, 1);
        Self {
            local,
            doc: RwLock::new(doc),
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn document(&self) -> IdentityDoc {
        self.doc.read().expect("identity lock").clone()
    }

    /// Primary IDURL of the current document.
    pub fn idurl(&self) -> IdUrl {
        self.doc
            .read()
            .expect("identity lock")
            .sources
            .first()
            .cloned()
            .expect("identity document always has sources")
    }

    pub fn user(&self) -> Result<GlobalUser> {
        Ok(self.document().user()?)
    }

    /// `master$<user>` of the current primary source.
    pub fn master_id(&self) -> Result<GlobalId> {
        Ok(GlobalId::master(self.user()?))
    }

    pub fn global_id(&self, key_alias: &str) -> Result<GlobalId> {
        Ok(GlobalId {
            key_alias: key_alias.to_string(),
            user: self.user()?,
        })
    }

    /// Replace the current document after a successful rotation publish.
    /// Rejects documents signed by a different key.
    pub fn commit_document(&self, new_doc: IdentityDoc) -> Result<(IdUrl, IdUrl)> {
        new_doc.verify()?;
        let mut doc = self.doc.write().expect("identity lock");
        if new_doc.publickey != doc.publickey {
            return Err(IdError::RotationRejected(
                "new document carries a different public key".into(),
            ));
        }
        if new_doc.revision <= doc.revision {
            return Err(IdError::RotationRejected(format!(
                "revision {} is not newer than {}",
                new_doc.revision, doc.revision
            )));
        }
        let old = doc.sources.first().cloned().expect("sources never empty");
        let new = new_doc
            .sources
            .first()
            .cloned()
            .ok_or_else(|| IdError::RotationRejected("no sources in new document".into()))?;
        *doc = new_doc;
        Ok((old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_derive_ids() {
        let me = MyIdentity::create("alice", "id-a.example.com", 8084, vec![]);
        assert_eq!(
            me.idurl().as_str(),
            "http://id-a.example.com:8084/alice.xml"
        );
        assert_eq!(
            me.master_id().unwrap().to_string(),
            "master$alice@id-a.example.com_8084"
        );
    }

    #[test]
    fn commit_rejects_foreign_and_stale_documents() {
        let me = MyIdentity::create("alice", "id-a.example.com", 8084, vec![]);
        let doc = me.document();

        // Same key, bumped revision: accepted.
        let rotated = me.local().rotate_document(
            &doc,
            IdUrl::for_user("id-b.example.com", 8084, "alice"),
            &doc.sources[0].clone(),
        );
        let (old, new) = me.commit_document(rotated).unwrap();
        assert_ne!(old, new);

        // Stale revision: rejected.
        let stale = me.local().make_document("alice", vec![old.clone()], vec![], 1);
        assert!(me.commit_document(stale).is_err());

        // Different key: rejected.
        let other = LocalIdentity::generate();
        let foreign = other.make_document("alice", vec![old], vec![], 99);
        assert!(me.commit_document(foreign).is_err());
    }
}
