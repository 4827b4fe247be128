//! Tenant key vault
//!
//! Envelope derivation: one random salt per tenant lives in SQLite, and
//! per-purpose keys are derived as SHA-256(master || salt || label). Derived
//! keys sit in a TTL cache. Payloads are sealed with AES-256-GCM, a fresh
//! random nonce prepended to each ciphertext. Decryption failure is a hard
//! error: wrong key and tampered data are indistinguishable.
//!
//! Key material and decrypted payloads live in [`Zeroizing`] buffers, so
//! they are wiped when dropped, including cache eviction and rotation.

use crate::cache::TtlCache;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

pub struct TenantKeyVault {
    conn: Mutex<Connection>,
    master_secret: Zeroizing<Vec<u8>>,
    key_cache: TtlCache<(String, String), Zeroizing<[u8; 32]>>,
}

impl TenantKeyVault {
    pub fn new(database_path: &Path, master_secret: &str, key_ttl: Duration) -> Result<Self> {
        let conn = if database_path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(database_path)?
        };

        let vault = Self {
            conn: Mutex::new(conn),
            master_secret: Zeroizing::new(master_secret.as_bytes().to_vec()),
            key_cache: TtlCache::new(key_ttl),
        };
        vault.initialize_schema()?;

        info!("Initialized tenant key vault at {:?}", database_path);
        Ok(vault)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("vault lock poisoned"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tenant_salts (
                tenant_id TEXT PRIMARY KEY,
                salt BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        debug!("Vault schema initialized");
        Ok(())
    }

    /// Derive (and cache) the key for a tenant and purpose label.
    pub fn derive_key(&self, tenant_id: &str, label: &str) -> Result<Zeroizing<[u8; 32]>> {
        let cache_key = (tenant_id.to_string(), label.to_string());
        if let Some(key) = self.key_cache.get(&cache_key) {
            return Ok(key);
        }

        let salt = self.get_or_create_salt(tenant_id)?;

        let mut hasher = Sha256::new();
        hasher.update(self.master_secret.as_slice());
        hasher.update(&salt);
        hasher.update(label.as_bytes());
        let digest = hasher.finalize();

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);

        self.key_cache.insert(cache_key, key.clone());
        Ok(key)
    }

    pub fn encrypt(&self, tenant_id: &str, label: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.derive_key(tenant_id, label)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| anyhow!("invalid key length: {}", e))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow!("encryption failed for tenant '{}': {}", tenant_id, e))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, tenant_id: &str, label: &str, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() <= NONCE_LEN {
            return Err(anyhow!("sealed payload too short"));
        }

        let key = self.derive_key(tenant_id, label)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| anyhow!("invalid key length: {}", e))?;

        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map(Zeroizing::new)
            .map_err(|e| anyhow!("decryption failed for tenant '{}': {}", tenant_id, e))
    }

    /// Replace a tenant's salt. Every key derived from the old salt stops
    /// working, which is the point: rotation fences off old ciphertexts.
    pub fn rotate_salt(&self, tenant_id: &str) -> Result<()> {
        let salt = random_salt();
        let now = unix_now()?;

        let conn = self.conn.lock().map_err(|_| anyhow!("vault lock poisoned"))?;
        conn.execute(
            "INSERT INTO tenant_salts (tenant_id, salt, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET salt = ?2, created_at = ?3",
            params![tenant_id, salt, now],
        )?;
        drop(conn);

        self.key_cache.purge_expired();
        self.invalidate_tenant_keys(tenant_id);

        info!("Rotated vault salt for tenant '{}'", tenant_id);
        Ok(())
    }

    fn invalidate_tenant_keys(&self, tenant_id: &str) {
        // Labels are few and fixed; sweep the known ones.
        for label in ["pseudonym-map", "audit", "plugin-config"] {
            self.key_cache
                .invalidate(&(tenant_id.to_string(), label.to_string()));
        }
    }

    fn get_or_create_salt(&self, tenant_id: &str) -> Result<Vec<u8>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("vault lock poisoned"))?;

        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT salt FROM tenant_salts WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(salt) = existing {
            return Ok(salt);
        }

        let salt = random_salt();
        conn.execute(
            "INSERT OR IGNORE INTO tenant_salts (tenant_id, salt, created_at)
             VALUES (?1, ?2, ?3)",
            params![tenant_id, salt, unix_now()?],
        )?;

        // Another writer may have won the insert race; read back.
        let salt: Vec<u8> = conn.query_row(
            "SELECT salt FROM tenant_salts WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;

        debug!("Created vault salt for tenant '{}'", tenant_id);
        Ok(salt)
    }
}

fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs())
}
