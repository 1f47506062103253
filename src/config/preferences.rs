//! User trading preferences
//! Default capital and stop-loss / target percentages, saved on every update

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Saved defaults for new positions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub capital: Option<f64>,
    #[serde(alias = "sl_percent")]
    pub stop_loss_pct: Option<f64>,
    #[serde(alias = "target_percent")]
    pub target_pct: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Preferences {
    /// Capital and both percentages set
    pub fn is_complete(&self) -> bool {
        self.capital.is_some() && self.stop_loss_pct.is_some() && self.target_pct.is_some()
    }

    pub fn summary(&self) -> String {
        fn show(value: Option<f64>, suffix: &str) -> String {
            value
                .map(|v| format!("{}{}", v, suffix))
                .unwrap_or_else(|| "not set".to_string())
        }

        format!(
            "Capital: {} | Stop-loss: {} | Target: {}",
            show(self.capital, ""),
            show(self.stop_loss_pct, "%"),
            show(self.target_pct, "%")
        )
    }
}

/// Preference update parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferenceUpdates {
    pub capital: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub target_pct: Option<f64>,
}

impl PreferenceUpdates {
    /// Create empty updates
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capital(mut self, value: f64) -> Self {
        self.capital = Some(value);
        self
    }

    pub fn with_stop_loss(mut self, value: f64) -> Self {
        self.stop_loss_pct = Some(value);
        self
    }

    pub fn with_target(mut self, value: f64) -> Self {
        self.target_pct = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.capital.is_none() && self.stop_loss_pct.is_none() && self.target_pct.is_none()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some(capital) = self.capital {
            if !capital.is_finite() || capital <= 0.0 {
                anyhow::bail!("capital must be positive, got {}", capital);
            }
        }
        for (name, pct) in [("stop-loss", self.stop_loss_pct), ("target", self.target_pct)] {
            if let Some(pct) = pct {
                if !pct.is_finite() || pct <= 0.0 || pct > 100.0 {
                    anyhow::bail!("{} percentage must be in (0, 100], got {}", name, pct);
                }
            }
        }
        Ok(())
    }
}

/// Shared preference record backed by a JSON file
#[derive(Clone)]
pub struct PreferencesManager {
    preferences: Arc<RwLock<Preferences>>,
    path: Option<PathBuf>,
}

impl PreferencesManager {
    /// Load from `path`; missing or unreadable files give empty preferences
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let preferences = read_preferences(&path);
        Self {
            preferences: Arc::new(RwLock::new(preferences)),
            path: Some(path),
        }
    }

    /// In-memory only
    pub fn in_memory(preferences: Preferences) -> Self {
        Self {
            preferences: Arc::new(RwLock::new(preferences)),
            path: None,
        }
    }

    /// Get current preferences
    pub async fn get(&self) -> Preferences {
        self.preferences.read().await.clone()
    }

    pub async fn has_complete(&self) -> bool {
        self.preferences.read().await.is_complete()
    }

    pub async fn summary(&self) -> String {
        self.preferences.read().await.summary()
    }

    /// Apply updates, stamp `last_updated` and save
    pub async fn update(&self, updates: PreferenceUpdates) -> anyhow::Result<Preferences> {
        updates.validate()?;

        let mut preferences = self.preferences.write().await;

        if let Some(capital) = updates.capital {
            info!("📝 Preferences updated: capital = {} (was {:?})", capital, preferences.capital);
            preferences.capital = Some(capital);
        }
        if let Some(pct) = updates.stop_loss_pct {
            info!("📝 Preferences updated: stop_loss = {}% (was {:?})", pct, preferences.stop_loss_pct);
            preferences.stop_loss_pct = Some(pct);
        }
        if let Some(pct) = updates.target_pct {
            info!("📝 Preferences updated: target = {}% (was {:?})", pct, preferences.target_pct);
            preferences.target_pct = Some(pct);
        }
        preferences.last_updated = Some(Utc::now());

        if let Some(path) = &self.path {
            save_preferences(path, &preferences)?;
        }

        Ok(preferences.clone())
    }
}

fn read_preferences(path: &Path) -> Preferences {
    if !path.exists() {
        return Preferences::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<Preferences>(&content) {
            Ok(preferences) => {
                info!("Loaded preferences: {}", preferences.summary());
                preferences
            }
            Err(e) => {
                warn!("Failed to parse preferences {}: {}", path.display(), e);
                Preferences::default()
            }
        },
        Err(e) => {
            warn!("Failed to read preferences {}: {}", path.display(), e);
            Preferences::default()
        }
    }
}

fn save_preferences(path: &Path, preferences: &Preferences) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(path, serde_json::to_string_pretty(preferences)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        std::fs::set_permissions(path, permissions)?;
    }

    Ok(())
}
