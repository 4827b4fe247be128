//! Configuration management for textveil

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub detection: DetectionConfig,
    pub scoring: ScoringConfig,
    pub pseudonym: PseudonymConfig,
    pub vault: VaultConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub confidence_threshold: f64,
    /// Wall-clock budget for a single tenant plugin invocation.
    pub plugin_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Requests scoring critical are rejected instead of masked.
    pub block_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudonymConfig {
    /// In-memory session lifetime.
    pub session_ttl_seconds: u64,
    /// Lifetime of encrypted maps in the persisted store.
    pub persisted_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Master secret the per-tenant keys are derived from. Never logged.
    pub master_secret: String,
    pub key_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Pipeline failure policy: true forwards the original request
    /// unmodified (logged as degraded), false rejects with the upstream
    /// protocol's policy-violation error shape.
    pub fail_open: bool,
    pub upstream_url: String,
    pub upstream_max_retries: u32,
    pub upstream_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detection: DetectionConfig {
                enabled: true,
                confidence_threshold: 0.5,
                plugin_budget_ms: 50,
            },
            scoring: ScoringConfig {
                block_critical: true,
            },
            pseudonym: PseudonymConfig {
                session_ttl_seconds: 3600,
                persisted_ttl_seconds: 86_400,
            },
            vault: VaultConfig {
                master_secret: String::new(),
                key_cache_ttl_seconds: 300,
            },
            storage: StorageConfig {
                database_path: PathBuf::from("textveil.db"),
            },
            gateway: GatewayConfig {
                fail_open: true,
                upstream_url: "https://api.openai.com".to_string(),
                upstream_max_retries: 3,
                upstream_backoff_ms: 250,
            },
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("io", "textveil", "textveil")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine application directories"))
    }

    pub fn resolve_paths(&mut self) -> Result<()> {
        let project_dirs = Self::get_app_dirs()?;

        if self.storage.database_path.is_relative() {
            let data_dir = project_dirs.data_dir();
            std::fs::create_dir_all(data_dir)?;
            self.storage.database_path = data_dir.join(&self.storage.database_path);
        }

        Ok(())
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.resolve_paths()?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("textveil.toml"))
    }

    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow::anyhow!(
                "Confidence threshold must be between 0.0 and 1.0"
            ));
        }

        if self.vault.master_secret.len() < 16 {
            return Err(anyhow::anyhow!(
                "Vault master secret must be at least 16 bytes"
            ));
        }

        if self.pseudonym.session_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("Session TTL must be non-zero"));
        }

        if let Some(parent) = self.storage.database_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.vault.master_secret = "0123456789abcdef0123".to_string();
        config
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert!(config.detection.enabled);
        assert!(config.gateway.fail_open);
        assert!(config.scoring.block_critical);
        assert_eq!(config.pseudonym.session_ttl_seconds, 3600);
        assert_eq!(config.pseudonym.persisted_ttl_seconds, 86_400);
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        config.validate().unwrap();

        config.detection.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        config = valid_config();
        config.vault.master_secret = "short".to_string();
        assert!(config.validate().is_err());

        config = valid_config();
        config.pseudonym.session_ttl_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let config = valid_config();
        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        config.to_file(temp_path).unwrap();

        let loaded = Config::from_file(temp_path).unwrap();
        assert_eq!(config.detection.enabled, loaded.detection.enabled);
        assert_eq!(config.gateway.fail_open, loaded.gateway.fail_open);
        assert_eq!(config.vault.master_secret, loaded.vault.master_secret);
    }
}
