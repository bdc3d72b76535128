//! CRUD operations for the `keys` table.

use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::KeyRow;

impl Database {
    /// Register a key, returning its local key id. A key is logically
    /// identified by its public key: re-registering the same public key
    /// returns the existing row (updating `key_id` if it changed).
    pub fn register_key(&self, key_id: &str, public_key: &str) -> Result<i64> {
        if let Ok(existing) = self.get_key_by_public_key(public_key) {
            if existing.key_id != key_id {
                self.conn().execute(
                    "UPDATE keys SET key_id = ?1 WHERE local_key_id = ?2",
                    params![key_id, existing.local_key_id],
                )?;
            }
            return Ok(existing.local_key_id);
        }

        self.conn().execute(
            "INSERT INTO keys (key_id, public_key) VALUES (?1, ?2)",
            params![key_id, public_key],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn get_key(&self, local_key_id: i64) -> Result<KeyRow> {
        self.conn()
            .query_row(
                "SELECT local_key_id, key_id, public_key FROM keys WHERE local_key_id = ?1",
                params![local_key_id],
                row_to_key,
            )
            .map_err(not_found)
    }

    pub fn get_key_by_key_id(&self, key_id: &str) -> Result<KeyRow> {
        self.conn()
            .query_row(
                "SELECT local_key_id, key_id, public_key FROM keys WHERE key_id = ?1",
                params![key_id],
                row_to_key,
            )
            .map_err(not_found)
    }

    pub fn get_key_by_public_key(&self, public_key: &str) -> Result<KeyRow> {
        self.conn()
            .query_row(
                "SELECT local_key_id, key_id, public_key FROM keys WHERE public_key = ?1",
                params![public_key],
                row_to_key,
            )
            .map_err(not_found)
    }

    pub fn list_keys(&self) -> Result<Vec<KeyRow>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT local_key_id, key_id, public_key FROM keys ORDER BY local_key_id")?;
        let rows = stmt.query_map([], row_to_key)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Rename one key in place. The local key id is preserved, so every
    /// `history` row referencing it stays valid.
    pub fn rename_key(&self, old_key_id: &str, new_key_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE keys SET key_id = ?1 WHERE key_id = ?2",
            params![new_key_id, old_key_id],
        )?;
        Ok(affected > 0)
    }

    /// Rotation rename: rewrite every key id embedding `old_user` to embed
    /// `new_user` instead. Returns the renamed rows.
    pub fn rename_keys_for_user(&self, old_user: &str, new_user: &str) -> Result<Vec<KeyRow>> {
        let candidates: Vec<KeyRow> = self
            .list_keys()?
            .into_iter()
            .filter(|k| k.key_id.ends_with(&format!("${old_user}")))
            .collect();

        let mut renamed = Vec::with_capacity(candidates.len());
        for key in candidates {
            let new_key_id = key.key_id.replace(old_user, new_user);
            self.conn().execute(
                "UPDATE keys SET key_id = ?1 WHERE local_key_id = ?2",
                params![new_key_id, key.local_key_id],
            )?;
            renamed.push(KeyRow {
                local_key_id: key.local_key_id,
                key_id: new_key_id,
                public_key: key.public_key,
            });
        }
        Ok(renamed)
    }

    /// Delete a key row. Returns `true` if a row was deleted.
    pub fn erase_key(&self, key_id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM keys WHERE key_id = ?1", params![key_id])?;
        Ok(affected > 0)
    }
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRow> {
    Ok(KeyRow {
        local_key_id: row.get(0)?,
        key_id: row.get(1)?,
        public_key: row.get(2)?,
    })
}

fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent_by_public_key() {
        let db = Database::open_in_memory().unwrap();
        let a = db.register_key("master$alice@id-a_8084", "aa11").unwrap();
        let b = db.register_key("master$alice@id-a_8084", "aa11").unwrap();
        assert_eq!(a, b);
        assert_eq!(db.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn rename_preserves_local_key_id() {
        let db = Database::open_in_memory().unwrap();
        let id = db.register_key("master$alice@id-a_8084", "aa11").unwrap();
        assert!(db
            .rename_key("master$alice@id-a_8084", "master$alice@id-b_8084")
            .unwrap());
        let row = db.get_key(id).unwrap();
        assert_eq!(row.key_id, "master$alice@id-b_8084");
        assert_eq!(row.public_key, "aa11");
    }

    #[test]
    fn rotation_rename_rewrites_matching_keys_only() {
        let db = Database::open_in_memory().unwrap();
        let mine = db.register_key("master$alice@id-a_8084", "aa11").unwrap();
        let group = db
            .register_key("group_0a1b2c$alice@id-a_8084", "bb22")
            .unwrap();
        let other = db.register_key("master$bob@id-x_8084", "cc33").unwrap();

        let renamed = db
            .rename_keys_for_user("alice@id-a_8084", "alice@id-b_8084")
            .unwrap();
        assert_eq!(renamed.len(), 2);

        assert_eq!(db.get_key(mine).unwrap().key_id, "master$alice@id-b_8084");
        assert_eq!(
            db.get_key(group).unwrap().key_id,
            "group_0a1b2c$alice@id-b_8084"
        );
        assert_eq!(db.get_key(other).unwrap().key_id, "master$bob@id-x_8084");
    }

    #[test]
    fn erase_key() {
        let db = Database::open_in_memory().unwrap();
        db.register_key("k$a@h_1", "dd44").unwrap();
        assert!(db.erase_key("k$a@h_1").unwrap());
        assert!(!db.erase_key("k$a@h_1").unwrap());
        assert!(matches!(
            db.get_key_by_key_id("k$a@h_1"),
            Err(StoreError::NotFound)
        ));
    }
}
