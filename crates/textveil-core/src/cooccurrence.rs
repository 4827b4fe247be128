//! Tenant co-occurrence history
//!
//! Counts how often entity-type pairs appear together in a tenant's
//! sensitive traffic. Pairs with history push future scores up slightly.
//! Lookups degrade to nothing on any failure; scoring never blocks on this
//! store.

use crate::entity::EntityType;
use crate::scorer::CooccurrenceSource;
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct CooccurrenceStore {
    conn: Mutex<Connection>,
}

impl CooccurrenceStore {
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
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_cooccurrence (
                tenant_id TEXT NOT NULL,
                type_a TEXT NOT NULL,
                type_b TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, type_a, type_b)
            )",
            [],
        )?;
        Ok(())
    }

    /// Record every unordered pair of entity types seen in one sensitive
    /// request. Pairs are stored with types in lexical order.
    pub fn record(&self, tenant_id: &str, types: &HashSet<EntityType>) -> Result<()> {
        let mut sorted: Vec<&EntityType> = types.iter().collect();
        sorted.sort_by_key(|t| t.as_str());

        let conn = self.lock()?;
        for i in 0..sorted.len() {
            for j in (i + 1)..sorted.len() {
                conn.execute(
                    "INSERT INTO entity_cooccurrence (tenant_id, type_a, type_b, count)
                     VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(tenant_id, type_a, type_b)
                     DO UPDATE SET count = count + 1",
                    params![tenant_id, sorted[i].as_str(), sorted[j].as_str()],
                )?;
            }
        }

        debug!(
            tenant = tenant_id,
            pairs = sorted.len() * sorted.len().saturating_sub(1) / 2,
            "Recorded entity co-occurrence"
        );
        Ok(())
    }

    pub fn pair_count(&self, tenant_id: &str, a: EntityType, b: EntityType) -> Result<u64> {
        let (first, second) = ordered(a, b);
        let conn = self.lock()?;
        let count: Option<u64> = conn
            .query_row(
                "SELECT count FROM entity_cooccurrence
                 WHERE tenant_id = ?1 AND type_a = ?2 AND type_b = ?3",
                params![tenant_id, first.as_str(), second.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("co-occurrence store lock poisoned"))
    }
}

fn ordered(a: EntityType, b: EntityType) -> (EntityType, EntityType) {
    if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    }
}

impl CooccurrenceSource for CooccurrenceStore {
    fn pair_boost(&self, tenant_id: &str, a: EntityType, b: EntityType) -> Option<f64> {
        match self.pair_count(tenant_id, a, b) {
            Ok(0) => None,
            // log damping so one chatty tenant does not saturate scores
            Ok(count) => Some(f64::min((count as f64).ln_1p(), 2.0)),
            Err(e) => {
                warn!("Co-occurrence lookup failed, ignoring: {}", e);
                None
            }
        }
    }
}
