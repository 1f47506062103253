//! Configuration management
//! Supports TOML, YAML, JSON config files with environment overrides

pub mod preferences;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::api::Credentials;
use crate::trading::{EngineSettings, RunnerSettings};
use crate::utils::RetryConfig;

pub use preferences::{PreferenceUpdates, Preferences, PreferencesManager};

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker session and endpoints
    pub broker: BrokerConfig,
    /// Engine retry and timer settings
    pub engine: EngineConfig,
    /// Snapshot, history and preference files
    pub storage: StorageConfig,
    /// Logging level
    pub log_level: Option<String>,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub user_id: String,
    pub account_id: String,
    pub session_token: String,
    /// REST base, e.g. `https://api.shoonya.com/NorenWClientTP`
    pub base_url: String,
    /// Streaming endpoint, e.g. `wss://api.shoonya.com/NorenWSTP/`
    pub ws_url: String,
    /// `I` intraday, `C` delivery, `M` margin (default: I)
    pub product_type: String,
    /// Paper broker and feed instead of the live API
    pub simulation_mode: bool,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries for transient broker failures (default: 3)
    pub max_retries: u32,
    /// First backoff delay in milliseconds (default: 500)
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 10000)
    pub max_delay_ms: u64,
    /// Snapshot records older than this are dropped on load (default: 24)
    pub stale_after_hours: i64,
    /// Orphan reconciliation interval in seconds (default: 60)
    pub reconcile_interval_secs: u64,
    /// Stats summary interval in seconds (default: 300)
    pub stats_interval_secs: u64,
    /// Remarks attached to entry orders
    pub entry_remarks: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_path: PathBuf,
    pub history_path: PathBuf,
    pub preferences_path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            account_id: String::new(),
            session_token: String::new(),
            base_url: "https://api.shoonya.com/NorenWClientTP".to_string(),
            ws_url: "wss://api.shoonya.com/NorenWSTP/".to_string(),
            product_type: "I".to_string(),
            simulation_mode: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10000,
            stale_after_hours: 24,
            reconcile_interval_secs: 60,
            stats_interval_secs: 300,
            entry_remarks: "OE-Entry".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            snapshot_path: base.join("positions.json"),
            history_path: base.join("trade_history.json"),
            preferences_path: base.join("preferences.json"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

/// `<data dir>/order-executor`, or the working directory when unknown
fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("order-executor"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        let config = match extension {
            "toml" => toml::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            // Auto-detect
            _ if content.trim().starts_with('{') => serde_json::from_str(&content)?,
            _ if content.contains("---") => serde_yaml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from default locations
    pub fn load() -> anyhow::Result<Self> {
        let locations = [
            "order-executor.toml",
            "order-executor.yaml",
            "order-executor.yml",
            "config.toml",
            "config.yaml",
            "config.json",
        ];

        for location in &locations {
            if Path::new(location).exists() {
                return Self::from_file(location);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_file = config_dir.join("order-executor/config.toml");
            if config_file.exists() {
                return Self::from_file(config_file);
            }
        }

        anyhow::bail!("No configuration file found. Expected one of: {:?}", locations)
    }

    /// Override file values from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override file values from `lookup`; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BROKER_USER_ID") {
            self.broker.user_id = v;
        }
        if let Some(v) = get("BROKER_ACCOUNT_ID") {
            self.broker.account_id = v;
        }
        if let Some(v) = get("BROKER_SESSION_TOKEN") {
            self.broker.session_token = v;
        }
        if let Some(v) = get("BROKER_BASE_URL") {
            self.broker.base_url = v;
        }
        if let Some(v) = get("BROKER_WS_URL") {
            self.broker.ws_url = v;
        }
        if let Some(v) = get("SIMULATION_MODE") {
            self.broker.simulation_mode = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = Some(v);
        }
        if let Some(v) = get("SNAPSHOT_PATH") {
            self.storage.snapshot_path = PathBuf::from(v);
        }
        if let Some(v) = get("HISTORY_PATH") {
            self.storage.history_path = PathBuf::from(v);
        }
        if let Some(v) = get("PREFERENCES_PATH") {
            self.storage.preferences_path = PathBuf::from(v);
        }
        if let Some(v) = get("STALE_AFTER_HOURS") {
            self.engine.stale_after_hours = v
                .parse()
                .map_err(|e| anyhow::anyhow!("STALE_AFTER_HOURS {:?}: {}", v, e))?;
        }
        Ok(())
    }

    /// Save configuration to file (session token redacted)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();

        let mut safe_config = self.clone();
        safe_config.broker.session_token = "******REMOVED******".to_string();

        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(&safe_config)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(&safe_config)?,
            _ => serde_json::to_string_pretty(&safe_config)?,
        };

        std::fs::write(path, content)?;
        info!("Configuration saved to: {} (session token redacted)", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.broker.simulation_mode {
            if self.broker.user_id.is_empty() {
                anyhow::bail!("Broker user id is required (BROKER_USER_ID)");
            }
            if self.broker.session_token.is_empty() {
                anyhow::bail!("Broker session token is required (BROKER_SESSION_TOKEN)");
            }
            if !self.broker.ws_url.starts_with("ws") {
                anyhow::bail!("Websocket url must start with ws:// or wss://");
            }
        }
        if !matches!(self.broker.product_type.as_str(), "I" | "C" | "M") {
            anyhow::bail!("Product type must be one of I, C, M");
        }
        if self.engine.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.engine.initial_delay_ms == 0 || self.engine.max_delay_ms < self.engine.initial_delay_ms {
            anyhow::bail!("Retry delays must be positive and max_delay_ms >= initial_delay_ms");
        }
        if self.engine.stale_after_hours <= 0 {
            anyhow::bail!("stale_after_hours must be positive");
        }
        if self.engine.reconcile_interval_secs == 0 || self.engine.stats_interval_secs == 0 {
            anyhow::bail!("Timer intervals must be positive");
        }
        Ok(())
    }

    /// Session credentials; account id defaults to the user id
    pub fn credentials(&self) -> Credentials {
        let account_id = if self.broker.account_id.is_empty() {
            self.broker.user_id.clone()
        } else {
            self.broker.account_id.clone()
        };
        Credentials {
            user_id: self.broker.user_id.clone(),
            account_id,
            session_token: self.broker.session_token.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry: RetryConfig {
                max_retries: self.engine.max_retries,
                initial_delay_ms: self.engine.initial_delay_ms,
                max_delay_ms: self.engine.max_delay_ms,
                backoff_multiplier: 2.0,
            },
            stale_after: chrono::Duration::hours(self.engine.stale_after_hours),
            entry_remarks: self.engine.entry_remarks.clone(),
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            reconcile_interval: std::time::Duration::from_secs(self.engine.reconcile_interval_secs),
            stats_interval: std::time::Duration::from_secs(self.engine.stats_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.product_type, "I");
        assert_eq!(config.engine.stale_after_hours, 24);
        assert_eq!(config.engine.reconcile_interval_secs, 60);
        assert_eq!(
            config.storage.snapshot_path.file_name().and_then(|n| n.to_str()),
            Some("positions.json")
        );
    }

    #[test]
    fn test_validate_live_requires_credentials() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut simulated = Config::default();
        simulated.broker.simulation_mode = true;
        assert!(simulated.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_engine_values() {
        let mut config = Config::default();
        config.broker.simulation_mode = true;
        config.engine.stale_after_hours = 0;
        assert!(config.validate().is_err());

        config.engine.stale_after_hours = 24;
        config.engine.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BROKER_USER_ID", "FA1234"),
            ("BROKER_SESSION_TOKEN", "token"),
            ("SIMULATION_MODE", "true"),
            ("STALE_AFTER_HOURS", "6"),
            ("BROKER_ACCOUNT_ID", "  "),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(config.broker.simulation_mode);
        assert_eq!(config.engine.stale_after_hours, 6);
        assert_eq!(config.credentials().account_id, "FA1234");
        assert_eq!(config.engine_settings().stale_after, chrono::Duration::hours(6));

        let bad: HashMap<&str, &str> = HashMap::from([("STALE_AFTER_HOURS", "soon")]);
        assert!(config.apply_overrides(|key| bad.get(key).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order-executor.toml");
        std::fs::write(
            &path,
            "log_level = \"debug\"\n[broker]\nuser_id = \"FA1234\"\nsimulation_mode = true\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.broker.user_id, "FA1234");
        assert_eq!(config.broker.product_type, "I");
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_save_redacts_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.json");
        let mut config = Config::default();
        config.broker.session_token = "secret-token".to_string();

        config.save_to_file(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("secret-token"));
    }
}
