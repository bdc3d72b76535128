//! Per-group state files.
//!
//! Each group a node participates in has one JSON file
//! `groups/<group_key_id>` holding its last sequence id, active flag,
//! archive folder and broker triple. Identity rotation renames the file
//! together with the key id it is named after.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::models::GroupInfo;

pub struct GroupInfoStore {
    dir: PathBuf,
}

impl GroupInfoStore {
    /// Open (creating if needed) the `groups/` directory under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("groups");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, group_key_id: &str) -> PathBuf {
        self.dir.join(group_key_id)
    }

    pub fn save(&self, info: &GroupInfo) -> Result<()> {
        let raw = serde_json::to_vec_pretty(info)
            .map_err(|e| StoreError::StateFile(e.to_string()))?;
        fs::write(self.path_for(&info.group_key_id), raw)?;
        Ok(())
    }

    pub fn load(&self, group_key_id: &str) -> Result<GroupInfo> {
        let path = self.path_for(group_key_id);
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::StateFile(e.to_string()))
    }

    pub fn delete(&self, group_key_id: &str) -> Result<bool> {
        let path = self.path_for(group_key_id);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn list(&self) -> Result<Vec<GroupInfo>> {
        let mut groups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let raw = fs::read(entry.path())?;
            match serde_json::from_slice::<GroupInfo>(&raw) {
                Ok(info) => groups.push(info),
                Err(e) => debug!(path = %entry.path().display(), error = %e, "skipping unreadable group file"),
            }
        }
        groups.sort_by(|a, b| a.group_key_id.cmp(&b.group_key_id));
        Ok(groups)
    }

    /// Rotation rename: move `groups/<old>` to `groups/<new>` for every
    /// group whose key id embeds `old_user`, rewriting the embedded id.
    /// Returns the (old, new) key id pairs.
    pub fn rename_for_user(
        &self,
        old_user: &str,
        new_user: &str,
    ) -> Result<Vec<(String, String)>> {
        let mut renamed = Vec::new();
        for info in self.list()? {
            if !info.group_key_id.ends_with(&format!("${old_user}")) {
                continue;
            }
            let new_key_id = info.group_key_id.replace(old_user, new_user);
            let mut updated = info.clone();
            updated.group_key_id = new_key_id.clone();
            self.save(&updated)?;
            fs::remove_file(self.path_for(&info.group_key_id))?;
            renamed.push((info.group_key_id, new_key_id));
        }
        Ok(renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(key_id: &str) -> GroupInfo {
        GroupInfo {
            group_key_id: key_id.to_string(),
            last_sequence_id: -1,
            active: true,
            archive_folder_path: "archive".into(),
            brokers: vec![(0, "http://id/b.xml".into())],
            brokers_revision: 1,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupInfoStore::open(dir.path()).unwrap();

        let original = info("group_0a1b2c$alice@id-a_8084");
        store.save(&original).unwrap();
        let loaded = store.load(&original.group_key_id).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_group_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupInfoStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("nope"), Err(StoreError::NotFound)));
    }

    #[test]
    fn rotation_rename_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupInfoStore::open(dir.path()).unwrap();

        store.save(&info("group_aa$alice@id-a_8084")).unwrap();
        store.save(&info("group_bb$bob@id-x_8084")).unwrap();

        let renamed = store
            .rename_for_user("alice@id-a_8084", "alice@id-b_8084")
            .unwrap();
        assert_eq!(renamed.len(), 1);

        assert!(store.load("group_aa$alice@id-b_8084").is_ok());
        assert!(matches!(
            store.load("group_aa$alice@id-a_8084"),
            Err(StoreError::NotFound)
        ));
        assert!(store.load("group_bb$bob@id-x_8084").is_ok());
    }

    #[test]
    fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupInfoStore::open(dir.path()).unwrap();
        store.save(&info("group_aa$a@h_1")).unwrap();
        store.save(&info("group_bb$a@h_1")).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        assert!(store.delete("group_aa$a@h_1").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(!store.delete("group_aa$a@h_1").unwrap());
    }
}
