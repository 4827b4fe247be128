//! Tenant-supplied detection plugins
//!
//! Plugins extend detection with tenant-specific entity patterns. They run
//! under a hard wall-clock budget on a blocking worker thread; a plugin
//! that times out, panics, or ships a broken pattern contributes zero
//! entities and never fails the call.

use crate::entity::{DetectedEntity, DetectionSource, EntityType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPlugin {
    pub name: String,
    pub is_active: bool,
    pub patterns: Vec<String>,
    pub entity_types: Vec<EntityType>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.85
}

pub struct PluginRunner {
    budget: Duration,
}

impl PluginRunner {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Run all active plugins against the text. Each plugin gets its own
    /// budget and failure domain.
    pub async fn run_plugins(
        &self,
        text: &str,
        plugins: &[TenantPlugin],
    ) -> Vec<DetectedEntity> {
        let mut results = Vec::new();

        for plugin in plugins {
            if !plugin.is_active {
                continue;
            }

            let plugin_clone = plugin.clone();
            let text_owned = text.to_string();
            let task = tokio::task::spawn_blocking(move || execute_plugin(&text_owned, &plugin_clone));

            match tokio::time::timeout(self.budget, task).await {
                Ok(Ok(entities)) => {
                    debug!(
                        "Plugin '{}' produced {} entities",
                        plugin.name,
                        entities.len()
                    );
                    results.extend(entities);
                }
                Ok(Err(e)) => {
                    warn!("Plugin '{}' panicked, ignoring: {}", plugin.name, e);
                }
                Err(_) => {
                    warn!(
                        "Plugin '{}' exceeded its {}ms budget, ignoring",
                        plugin.name,
                        self.budget.as_millis()
                    );
                }
            }
        }

        results
    }
}

fn execute_plugin(text: &str, plugin: &TenantPlugin) -> Vec<DetectedEntity> {
    let mut results = Vec::new();

    for pattern_str in &plugin.patterns {
        let regex = match Regex::new(pattern_str) {
            Ok(r) => r,
            Err(_) => continue,
        };

        for mat in regex.find_iter(text) {
            for entity_type in &plugin.entity_types {
                results.push(DetectedEntity {
                    entity_type: *entity_type,
                    text: mat.as_str().to_string(),
                    start: mat.start(),
                    end: mat.end(),
                    confidence: plugin.confidence,
                    source: DetectionSource::Plugin(plugin.name.clone()),
                });
            }
        }
    }

    results
}
