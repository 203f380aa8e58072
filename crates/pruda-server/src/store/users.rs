use anyhow::{Context, Result};
use redb::ReadableTable;

use super::db::{COUNTERS, USERS};
use super::model::UserRecord;

/// Result of creating a user.
#[derive(Debug)]
pub enum UserInsertOutcome {
    Inserted(UserRecord),
    DuplicateUsername,
}

impl super::db::Store {
    /// Inserts a new user, assigning its id. Username uniqueness is checked
    /// inside the same write transaction.
    pub fn insert_user(&self, mut rec: UserRecord) -> Result<UserInsertOutcome> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(USERS)?;
            for item in table.iter()? {
                let (_k, v) = item?;
                let existing = decode_user(v.value())?;
                if existing.username == rec.username {
                    return Ok(UserInsertOutcome::DuplicateUsername);
                }
            }

            let mut counters = txn.open_table(COUNTERS)?;
            let next = counters.get("user_id")?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert("user_id", next)?;
            rec.id = next;

            let bytes = bincode::serde::encode_to_vec(&rec, bincode::config::standard())
                .context("bincode encode user")?;
            table.insert(rec.id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(UserInsertOutcome::Inserted(rec))
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut out = Vec::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USERS)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            out.push(decode_user(v.value())?);
        }
        Ok(out)
    }

    /// Deletes a user by id. Returns true if it existed.
    pub fn delete_user(&self, id: u64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(USERS)?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        txn.commit()?;
        Ok(existed)
    }
}

fn decode_user(bytes: &[u8]) -> Result<UserRecord> {
    let (rec, _): (UserRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("bincode decode user")?;
    Ok(rec)
}
