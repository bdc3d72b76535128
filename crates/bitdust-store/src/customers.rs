//! Supplier-side storage: one directory per customer.
//!
//! A node acting as supplier keeps its customers' blocks under
//! `customers/<customer_global_id>/master/...`. When a customer's
//! identity rotates, the whole directory is renamed so the blocks stay
//! reachable under the new global id.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, StoreError};

pub struct CustomerDirs {
    root: PathBuf,
}

impl CustomerDirs {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("customers");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn customer_dir(&self, customer_global_id: &str) -> PathBuf {
        self.root.join(customer_global_id)
    }

    /// Reject remote paths that escape the customer directory.
    fn safe_relative(remote_path: &str) -> Result<PathBuf> {
        let path = Path::new(remote_path);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StoreError::StateFile(format!(
                "unsafe remote path: {remote_path}"
            )));
        }
        Ok(path.to_path_buf())
    }

    pub fn save_block(
        &self,
        customer_global_id: &str,
        remote_path: &str,
        data: &[u8],
    ) -> Result<()> {
        let full = self
            .customer_dir(customer_global_id)
            .join(Self::safe_relative(remote_path)?);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data)?;
        Ok(())
    }

    pub fn read_block(&self, customer_global_id: &str, remote_path: &str) -> Result<Vec<u8>> {
        let full = self
            .customer_dir(customer_global_id)
            .join(Self::safe_relative(remote_path)?);
        if !full.exists() {
            return Err(StoreError::NotFound);
        }
        Ok(fs::read(full)?)
    }

    pub fn delete_block(&self, customer_global_id: &str, remote_path: &str) -> Result<bool> {
        let full = self
            .customer_dir(customer_global_id)
            .join(Self::safe_relative(remote_path)?);
        if full.exists() {
            fs::remove_file(full)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// All stored paths for a customer, relative to its directory.
    pub fn list_blocks(&self, customer_global_id: &str) -> Result<Vec<String>> {
        let dir = self.customer_dir(customer_global_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        collect_files(&dir, &dir, &mut paths)?;
        paths.sort();
        Ok(paths)
    }

    /// Rotation rename: `customers/<old>/...` becomes `customers/<new>/...`.
    pub fn rename_customer(&self, old_global_id: &str, new_global_id: &str) -> Result<bool> {
        let old_dir = self.customer_dir(old_global_id);
        if !old_dir.exists() {
            return Ok(false);
        }
        let new_dir = self.customer_dir(new_global_id);
        fs::rename(old_dir, new_dir)?;
        Ok(true)
    }

    pub fn remove_customer(&self, customer_global_id: &str) -> Result<bool> {
        let dir = self.customer_dir(customer_global_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    pub fn list_customers(&self) -> Result<Vec<String>> {
        let mut customers = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                customers.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        customers.sort();
        Ok(customers)
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(base, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CustomerDirs::open(dir.path()).unwrap();

        store
            .save_block("master$alice@id-a_8084", "master/cat.txt", b"meow")
            .unwrap();
        let data = store
            .read_block("master$alice@id-a_8084", "master/cat.txt")
            .unwrap();
        assert_eq!(data, b"meow");
        assert_eq!(
            store.list_blocks("master$alice@id-a_8084").unwrap(),
            vec!["master/cat.txt".to_string()]
        );
    }

    #[test]
    fn rotation_rename_keeps_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CustomerDirs::open(dir.path()).unwrap();

        store
            .save_block("master$alice@id-a_8084", "master/cat.txt", b"meow")
            .unwrap();
        assert!(store
            .rename_customer("master$alice@id-a_8084", "master$alice@id-b_8084")
            .unwrap());

        assert_eq!(
            store
                .read_block("master$alice@id-b_8084", "master/cat.txt")
                .unwrap(),
            b"meow"
        );
        assert!(matches!(
            store.read_block("master$alice@id-a_8084", "master/cat.txt"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn path_escapes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CustomerDirs::open(dir.path()).unwrap();
        assert!(store
            .save_block("master$a@h_1", "../outside.txt", b"x")
            .is_err());
        assert!(store.read_block("master$a@h_1", "/etc/passwd").is_err());
    }

    #[test]
    fn customer_listing_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CustomerDirs::open(dir.path()).unwrap();
        store.save_block("master$a@h_1", "f", b"1").unwrap();
        store.save_block("master$b@h_1", "f", b"2").unwrap();

        assert_eq!(store.list_customers().unwrap().len(), 2);
        assert!(store.remove_customer("master$a@h_1").unwrap());
        assert_eq!(store.list_customers().unwrap().len(), 1);
    }
}
