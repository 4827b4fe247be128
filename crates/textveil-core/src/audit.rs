//! Append-only audit chain
//!
//! Every gateway decision lands in a per-tenant hash-linked log. Each event
//! hashes its canonical body together with the previous event's hash, so a
//! single edited row breaks every hash after it. Appends for one tenant are
//! serialized through a keyed async mutex; different tenants never contend.
//! Positions are 1-based; the first event links to an empty previous hash.

use crate::entity::EntityDigest;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub tool_id: String,
    pub session_id: String,
    pub position: u64,
    pub created_at: u64,
    pub action: String,
    pub capture_method: String,
    pub prompt_hash: String,
    pub prompt_length: usize,
    pub score: u8,
    pub level: String,
    pub entities: Vec<EntityDigest>,
    pub prev_hash: String,
    pub event_hash: String,
}

/// Body fields in hashing order. Field order is part of the format.
#[derive(Serialize)]
struct CanonicalBody<'a> {
    id: &'a str,
    tenant_id: &'a str,
    user_id: &'a str,
    tool_id: &'a str,
    session_id: &'a str,
    position: u64,
    created_at: u64,
    action: &'a str,
    capture_method: &'a str,
    prompt_hash: &'a str,
    prompt_length: usize,
    score: u8,
    level: &'a str,
    entities: &'a [EntityDigest],
}

impl<'a> CanonicalBody<'a> {
    fn of(event: &'a AuditEvent) -> Self {
        Self {
            id: &event.id,
            tenant_id: &event.tenant_id,
            user_id: &event.user_id,
            tool_id: &event.tool_id,
            session_id: &event.session_id,
            position: event.position,
            created_at: event.created_at,
            action: &event.action,
            capture_method: &event.capture_method,
            prompt_hash: &event.prompt_hash,
            prompt_length: event.prompt_length,
            score: event.score,
            level: &event.level,
            entities: &event.entities,
        }
    }
}

fn compute_event_hash(body: &CanonicalBody<'_>, prev_hash: &str) -> Result<String> {
    let canonical = serde_json::to_string(body).context("serializing audit body")?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_events: u64,
    /// Position of the first event whose hash or linkage fails.
    pub broken_at: Option<u64>,
}

/// One async mutex per tenant id, created on demand.
#[derive(Default)]
pub struct TenantLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, tenant_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| anyhow!("tenant lock registry poisoned"))?;
        Ok(map
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

pub struct NewAuditEvent {
    pub tenant_id: String,
    pub user_id: String,
    pub tool_id: String,
    pub session_id: String,
    pub action: String,
    pub capture_method: String,
    pub prompt_hash: String,
    pub prompt_length: usize,
    pub score: u8,
    pub level: String,
    pub entities: Vec<EntityDigest>,
}

pub struct AuditChain {
    conn: Mutex<Connection>,
    locks: TenantLocks,
}

impl AuditChain {
    pub fn new(database_path: &Path) -> Result<Self> {
        let conn = if database_path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(database_path)?
        };

        let chain = Self {
            conn: Mutex::new(conn),
            locks: TenantLocks::new(),
        };
        chain.initialize_schema()?;

        info!("Initialized audit chain at {:?}", database_path);
        Ok(chain)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                tool_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                action TEXT NOT NULL,
                capture_method TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                prompt_length INTEGER NOT NULL,
                score INTEGER NOT NULL,
                level TEXT NOT NULL,
                entities TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                event_hash TEXT NOT NULL,
                PRIMARY KEY (tenant_id, position)
            )",
            [],
        )?;
        Ok(())
    }

    /// Append an event to the tenant's chain. Holds the tenant's lock across
    /// the head read and the insert so positions never collide.
    pub async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        let tenant_lock = self.locks.lock_for(&event.tenant_id)?;
        let _guard = tenant_lock.lock().await;

        let (position, prev_hash) = match self.head(&event.tenant_id)? {
            Some((pos, hash)) => (pos + 1, hash),
            None => (1, String::new()),
        };

        let full = AuditEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id,
            user_id: event.user_id,
            tool_id: event.tool_id,
            session_id: event.session_id,
            position,
            created_at: unix_now()?,
            action: event.action,
            capture_method: event.capture_method,
            prompt_hash: event.prompt_hash,
            prompt_length: event.prompt_length,
            score: event.score,
            level: event.level,
            entities: event.entities,
            prev_hash: prev_hash.clone(),
            event_hash: String::new(),
        };
        let event_hash = compute_event_hash(&CanonicalBody::of(&full), &prev_hash)?;
        let full = AuditEvent { event_hash, ..full };

        let entities_json =
            serde_json::to_string(&full.entities).context("serializing entity digests")?;

        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO audit_events
                 (id, tenant_id, user_id, tool_id, session_id, position, created_at,
                  action, capture_method, prompt_hash, prompt_length, score, level,
                  entities, prev_hash, event_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    full.id,
                    full.tenant_id,
                    full.user_id,
                    full.tool_id,
                    full.session_id,
                    full.position,
                    full.created_at,
                    full.action,
                    full.capture_method,
                    full.prompt_hash,
                    full.prompt_length,
                    full.score,
                    full.level,
                    entities_json,
                    full.prev_hash,
                    full.event_hash
                ],
            )?;
        }

        debug!(
            tenant = %full.tenant_id,
            position = full.position,
            action = %full.action,
            "Appended audit event"
        );
        Ok(full)
    }

    /// Current head of a tenant's chain as (position, hash).
    pub fn head(&self, tenant_id: &str) -> Result<Option<(u64, String)>> {
        let conn = self.lock_conn()?;
        let head = conn
            .query_row(
                "SELECT position, event_hash FROM audit_events
                 WHERE tenant_id = ?1 ORDER BY position DESC LIMIT 1",
                params![tenant_id],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(head)
    }

    /// Replay the whole chain, recomputing every hash and checking linkage.
    /// Stops at the first break.
    pub fn verify(&self, tenant_id: &str) -> Result<ChainVerification> {
        let events = self.events(tenant_id, 0, u64::MAX)?;
        let total_events = events.len() as u64;
        let mut expected_prev = String::new();

        for (index, event) in events.iter().enumerate() {
            let recomputed = compute_event_hash(&CanonicalBody::of(event), &event.prev_hash)?;

            let intact = event.position == index as u64 + 1
                && event.prev_hash == expected_prev
                && event.event_hash == recomputed;

            if !intact {
                return Ok(ChainVerification {
                    valid: false,
                    total_events,
                    broken_at: Some(event.position),
                });
            }
            expected_prev = event.event_hash.clone();
        }

        Ok(ChainVerification {
            valid: true,
            total_events,
            broken_at: None,
        })
    }

    /// Events in chain order, paginated by position.
    pub fn events(&self, tenant_id: &str, offset: u64, limit: u64) -> Result<Vec<AuditEvent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, tool_id, session_id, position, created_at,
                    action, capture_method, prompt_hash, prompt_length, score, level,
                    entities, prev_hash, event_hash
             FROM audit_events
             WHERE tenant_id = ?1 AND position > ?2
             ORDER BY position ASC LIMIT ?3",
        )?;

        let limit = limit.min(i64::MAX as u64) as i64;
        let rows = stmt.query_map(params![tenant_id, offset, limit], |row| {
            let entities_json: String = row.get(13)?;
            let event = AuditEvent {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                user_id: row.get(2)?,
                tool_id: row.get(3)?,
                session_id: row.get(4)?,
                position: row.get(5)?,
                created_at: row.get(6)?,
                action: row.get(7)?,
                capture_method: row.get(8)?,
                prompt_hash: row.get(9)?,
                prompt_length: row.get::<_, u64>(10)? as usize,
                score: row.get(11)?,
                level: row.get(12)?,
                entities: Vec::new(),
                prev_hash: row.get(14)?,
                event_hash: row.get(15)?,
            };
            Ok((event, entities_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (mut event, entities_json) = row?;
            event.entities = serde_json::from_str(&entities_json)
                .context("deserializing entity digests")?;
            events.push(event);
        }
        Ok(events)
    }

    /// Test and operator hook: overwrite one stored field to prove the
    /// verifier catches it.
    pub fn tamper_action_at(&self, tenant_id: &str, position: u64, action: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE audit_events SET action = ?1 WHERE tenant_id = ?2 AND position = ?3",
            params![action, tenant_id, position],
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("audit chain lock poisoned"))
    }
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    fn new_event(tenant: &str, action: &str) -> NewAuditEvent {
        NewAuditEvent {
            tenant_id: tenant.to_string(),
            user_id: "user-1".to_string(),
            tool_id: "chat".to_string(),
            session_id: "sess-1".to_string(),
            action: action.to_string(),
            capture_method: "gateway".to_string(),
            prompt_hash: crate::pseudonym::content_hash("John Smith's SSN is 123-45-6789"),
            prompt_length: 31,
            score: 63,
            level: "high".to_string(),
            entities: vec![EntityDigest {
                entity_type: EntityType::Person,
                hash: crate::pseudonym::content_hash("John Smith"),
                length: 10,
            }],
        }
    }

    #[tokio::test]
    async fn test_append_links_events() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();

        let first = chain.append(new_event("tenant-a", "pseudonymized")).await.unwrap();
        let second = chain.append(new_event("tenant-a", "passthrough")).await.unwrap();

        assert_eq!(first.position, 1);
        assert!(first.prev_hash.is_empty());
        assert_eq!(second.position, 2);
        assert_eq!(second.prev_hash, first.event_hash);
    }

    #[tokio::test]
    async fn test_verify_intact_chain() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();
        for i in 0..5 {
            chain
                .append(new_event("tenant-a", &format!("action-{}", i)))
                .await
                .unwrap();
        }

        let verification = chain.verify("tenant-a").unwrap();
        assert!(verification.valid);
        assert_eq!(verification.total_events, 5);
        assert!(verification.broken_at.is_none());
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();
        for i in 0..5 {
            chain
                .append(new_event("tenant-a", &format!("action-{}", i)))
                .await
                .unwrap();
        }

        chain.tamper_action_at("tenant-a", 3, "blocked").unwrap();

        let verification = chain.verify("tenant-a").unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(3));
    }

    #[tokio::test]
    async fn test_tenant_chains_independent() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();

        let a = chain.append(new_event("tenant-a", "pseudonymized")).await.unwrap();
        let b = chain.append(new_event("tenant-b", "pseudonymized")).await.unwrap();

        assert_eq!(a.position, 1);
        assert_eq!(b.position, 1);
        assert!(b.prev_hash.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_no_position_collision() {
        let chain = Arc::new(AuditChain::new(Path::new(":memory:")).unwrap());

        let mut handles = Vec::new();
        for i in 0..10 {
            let chain = chain.clone();
            handles.push(tokio::spawn(async move {
                chain
                    .append(new_event("tenant-a", &format!("concurrent-{}", i)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = chain.events("tenant-a", 0, 100).unwrap();
        assert_eq!(events.len(), 10);
        let positions: Vec<u64> = events.iter().map(|e| e.position).collect();
        assert_eq!(positions, (1..=10).collect::<Vec<u64>>());
        assert!(chain.verify("tenant-a").unwrap().valid);
    }

    #[tokio::test]
    async fn test_pagination() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();
        for i in 0..7 {
            chain
                .append(new_event("tenant-a", &format!("action-{}", i)))
                .await
                .unwrap();
        }

        // Everything after position 2, capped at 3 rows.
        let page = chain.events("tenant-a", 2, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].position, 3);
        assert_eq!(page[2].position, 5);
    }

    #[tokio::test]
    async fn test_digests_carry_no_original_text() {
        let chain = AuditChain::new(Path::new(":memory:")).unwrap();
        let event = chain.append(new_event("tenant-a", "pseudonymized")).await.unwrap();

        let serialized = serde_json::to_string(&event).unwrap();
        assert!(!serialized.contains("John Smith"));
        assert!(!serialized.contains("123-45-6789"));
    }
}
