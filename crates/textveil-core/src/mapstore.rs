//! Persisted pseudonym maps
//!
//! Session maps outlive the in-memory cache so a conversation can resume
//! after a restart. Each mapping entry is serialized to JSON and sealed
//! with the tenant's vault key before it touches disk, one row per original
//! value; rows carry their own expiry and are swept lazily.

use crate::pseudonym::PseudonymEntry;
use crate::vault::TenantKeyVault;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const VAULT_LABEL: &str = "pseudonym-map";

pub struct PseudonymMapStore {
    conn: Mutex<Connection>,
}

impl PseudonymMapStore {
    pub fn new(database_path: &Path) -> Result<Self> {
        let conn = if database_path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(database_path)?
        };

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;

        info!("Initialized pseudonym map store at {:?}", database_path);
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pseudonym_maps (
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                entry_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, session_id, entry_key)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pseudonym_maps_expiry
             ON pseudonym_maps(expires_at)",
            [],
        )?;
        Ok(())
    }

    pub fn save(
        &self,
        vault: &TenantKeyVault,
        tenant_id: &str,
        session_id: &str,
        entries: &[PseudonymEntry],
        ttl: Duration,
    ) -> Result<()> {
        let now = unix_now()?;
        let expires = now + ttl.as_secs();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for entry in entries {
            // The key hash stands in for the original value, so the row key
            // itself leaks nothing.
            let entry_key = format!("{}:{}", entry.entity_type.as_str(), entry.hash);
            let json = zeroize::Zeroizing::new(
                serde_json::to_vec(entry).context("serializing pseudonym entry")?,
            );
            let sealed = vault.encrypt(tenant_id, VAULT_LABEL, &json)?;
            tx.execute(
                "INSERT INTO pseudonym_maps
                 (tenant_id, session_id, entry_key, payload, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(tenant_id, session_id, entry_key)
                 DO UPDATE SET payload = ?4, expires_at = ?6",
                params![tenant_id, session_id, entry_key, sealed, now, expires],
            )?;
        }
        tx.commit()?;

        debug!(
            "Persisted {} pseudonym entries for tenant '{}' session '{}'",
            entries.len(),
            tenant_id,
            session_id
        );
        Ok(())
    }

    /// Load a persisted map. Returns `None` when no live rows exist; a row
    /// that fails to decrypt is a hard error, not an empty map.
    pub fn load(
        &self,
        vault: &TenantKeyVault,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Vec<PseudonymEntry>>> {
        let now = unix_now()?;
        let sealed_rows: Vec<Vec<u8>> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM pseudonym_maps
                 WHERE tenant_id = ?1 AND session_id = ?2 AND expires_at > ?3
                 ORDER BY entry_key",
            )?;
            let rows = stmt.query_map(params![tenant_id, session_id, now], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if sealed_rows.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(sealed_rows.len());
        for sealed in &sealed_rows {
            let json = vault.decrypt(tenant_id, VAULT_LABEL, sealed)?;
            entries.push(
                serde_json::from_slice(&json).context("deserializing pseudonym entry")?,
            );
        }
        Ok(Some(entries))
    }

    pub fn delete(&self, tenant_id: &str, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pseudonym_maps WHERE tenant_id = ?1 AND session_id = ?2",
            params![tenant_id, session_id],
        )?;
        Ok(())
    }

    /// Drop expired rows. Returns the number removed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = unix_now()?;
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM pseudonym_maps WHERE expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            debug!("Swept {} expired pseudonym maps", removed);
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("map store lock poisoned"))
    }
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs())
}
