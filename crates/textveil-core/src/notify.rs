//! Decision notifications
//!
//! High and critical decisions fan out to notification sinks through the
//! background queue, so webhook or SIEM delivery never adds request
//! latency. Sink implementations live with their transports; the library
//! ships a tracing-backed sink for local visibility.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

/// What a sink learns about a decision. No prompt text, only metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub tenant_id: String,
    pub session_id: String,
    pub action: String,
    pub score: u8,
    pub level: String,
    pub entity_count: usize,
}

pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log stream.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            tenant = %notification.tenant_id,
            session = %notification.session_id,
            action = %notification.action,
            score = notification.score,
            level = %notification.level,
            entities = notification.entity_count,
            "Sensitivity notification"
        );
        Ok(())
    }
}
