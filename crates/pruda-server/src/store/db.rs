use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

use super::model::{DiscordConfig, LicenseRecord, LicenseStatus, Setting};

pub(crate) const LICENSES: TableDefinition<u64, &[u8]> = TableDefinition::new("licenses");
/// Secondary index enforcing key uniqueness: canonical key → license id.
pub(crate) const LICENSE_KEYS: TableDefinition<&str, u64> = TableDefinition::new("license_keys");
pub(crate) const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");
pub(crate) const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
pub(crate) const INTEGRATION: TableDefinition<&str, &[u8]> =
    TableDefinition::new("integration_config");
pub(crate) const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
/// license id → unix seconds of the last `expiringSoon` notice.
pub(crate) const EXPIRY_NOTICES: TableDefinition<u64, i64> =
    TableDefinition::new("expiry_notices");

/// Result of inserting a freshly minted license.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(LicenseRecord),
    /// The key already exists; the caller regenerates and retries.
    DuplicateKey,
}

/// Listing filter: effective status and a case-insensitive substring match
/// on the key.
#[derive(Debug, Default, Clone)]
pub struct LicenseFilter {
    pub status: Option<LicenseStatus>,
    pub search: Option<String>,
}

/// Aggregate counts with lazy expiry applied at call time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub active: usize,
    pub pending: usize,
    pub expired: usize,
    pub revoked: usize,
}

#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    /// Creates all tables up front so read transactions never race table
    /// creation.
    fn init_tables(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(LICENSES)?;
            txn.open_table(LICENSE_KEYS)?;
            txn.open_table(USERS)?;
            txn.open_table(SETTINGS)?;
            txn.open_table(INTEGRATION)?;
            txn.open_table(COUNTERS)?;
            txn.open_table(EXPIRY_NOTICES)?;
        }
        txn.commit()?;
        Ok(())
    }

    // ── Licenses ─────────────────────────────────────────────────────────

    /// Inserts a new license, assigning its id. The key index makes the
    /// uniqueness check and the insert atomic.
    pub fn insert_license(&self, mut rec: LicenseRecord) -> Result<InsertOutcome> {
        let txn = self.db.begin_write()?;
        {
            let mut keys = txn.open_table(LICENSE_KEYS)?;
            if keys.get(rec.key.as_str())?.is_some() {
                return Ok(InsertOutcome::DuplicateKey);
            }

            let mut counters = txn.open_table(COUNTERS)?;
            let next = counters.get("license_id")?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert("license_id", next)?;
            rec.id = next;

            keys.insert(rec.key.as_str(), rec.id)?;

            let bytes = bincode::serde::encode_to_vec(&rec, bincode::config::standard())
                .context("bincode encode license")?;
            let mut licenses = txn.open_table(LICENSES)?;
            licenses.insert(rec.id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(InsertOutcome::Inserted(rec))
    }

    pub fn get_license(&self, id: u64) -> Result<Option<LicenseRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LICENSES)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(decode_license(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_license_by_key(&self, key: &str) -> Result<Option<LicenseRecord>> {
        let txn = self.db.begin_read()?;
        let keys = txn.open_table(LICENSE_KEYS)?;
        let Some(id) = keys.get(key)?.map(|g| g.value()) else {
            return Ok(None);
        };
        let table = txn.open_table(LICENSES)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(decode_license(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Overwrites an existing license row. The key is immutable, so the
    /// index needs no maintenance.
    pub fn update_license(&self, rec: &LicenseRecord) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(rec, bincode::config::standard())
            .context("bincode encode license")?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LICENSES)?;
            table.insert(rec.id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Lists licenses matching the filter, newest first. Status filtering
    /// is against the effective (lazily expired) status at `now`.
    pub fn list_licenses(&self, filter: &LicenseFilter, now: i64) -> Result<Vec<LicenseRecord>> {
        let needle = filter.search.as_deref().map(str::to_ascii_uppercase);

        let mut out = Vec::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LICENSES)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            let rec = decode_license(v.value())?;
            if let Some(status) = filter.status {
                if rec.effective_status(now) != status {
                    continue;
                }
            }
            if let Some(ref needle) = needle {
                if !rec.key.contains(needle.as_str()) {
                    continue;
                }
            }
            out.push(rec);
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    pub fn count_by_status(&self, now: i64) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LICENSES)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            let rec = decode_license(v.value())?;
            counts.total += 1;
            match rec.effective_status(now) {
                LicenseStatus::Active => counts.active += 1,
                LicenseStatus::Pending => counts.pending += 1,
                LicenseStatus::Expired => counts.expired += 1,
                LicenseStatus::Revoked => counts.revoked += 1,
            }
        }
        Ok(counts)
    }

    /// Stored `pending`/`active` records whose expiry has passed: the
    /// sweep's work list.
    pub fn stale_licenses(&self, now: i64) -> Result<Vec<LicenseRecord>> {
        let mut out = Vec::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LICENSES)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            let rec = decode_license(v.value())?;
            let stored_live = matches!(
                rec.status,
                LicenseStatus::Pending | LicenseStatus::Active
            );
            if stored_live && matches!(rec.expires_at, Some(exp) if now >= exp) {
                out.push(rec);
            }
        }
        Ok(out)
    }

    /// Live records with `expiresAt ∈ (now, now + horizon]`.
    pub fn expiring_licenses(&self, now: i64, horizon: i64) -> Result<Vec<LicenseRecord>> {
        let mut out = Vec::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LICENSES)?;
        for item in table.iter()? {
            let (_k, v) = item?;
            let rec = decode_license(v.value())?;
            let stored_live = matches!(
                rec.status,
                LicenseStatus::Pending | LicenseStatus::Active
            );
            if stored_live
                && matches!(rec.expires_at, Some(exp) if exp > now && exp <= now + horizon)
            {
                out.push(rec);
            }
        }
        Ok(out)
    }

    // ── Expiry notices ───────────────────────────────────────────────────

    pub fn last_expiry_notice(&self, license_id: u64) -> Result<Option<i64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EXPIRY_NOTICES)?;
        Ok(table.get(license_id)?.map(|g| g.value()))
    }

    pub fn record_expiry_notice(&self, license_id: u64, at: i64) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EXPIRY_NOTICES)?;
            table.insert(license_id, at)?;
        }
        txn.commit()?;
        Ok(())
    }

    // ── Settings ─────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|g| g.value().to_owned()))
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list_settings(&self) -> Result<Vec<Setting>> {
        let mut out = Vec::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        for item in table.iter()? {
            let (k, v) = item?;
            out.push(Setting {
                key: k.value().to_owned(),
                value: v.value().to_owned(),
            });
        }
        Ok(out)
    }

    // ── Integration config ───────────────────────────────────────────────

    pub fn get_discord_config(&self) -> Result<Option<DiscordConfig>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INTEGRATION)?;
        match table.get("discord")? {
            Some(guard) => {
                let (cfg, _): (DiscordConfig, _) = bincode::serde::decode_from_slice(
                    guard.value(),
                    bincode::config::standard(),
                )
                .context("bincode decode discord config")?;
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }

    pub fn put_discord_config(&self, cfg: &DiscordConfig) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(cfg, bincode::config::standard())
            .context("bincode encode discord config")?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INTEGRATION)?;
            table.insert("discord", bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

pub(crate) fn decode_license(bytes: &[u8]) -> Result<LicenseRecord> {
    let (rec, _): (LicenseRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("bincode decode license")?;
    Ok(rec)
}
