//! Operator settings persisted as YAML

use anyhow::{Context, Result};
use gpsim_core::{AppSettings, SimError, SimResult};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<AppSettings>,
}

impl SettingsStore {
    /// Load `path`, writing the defaults there if it does not exist yet
    ///
    /// An unreadable or invalid file is reported and replaced in memory by
    /// the defaults; it is left untouched on disk until the next update.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = if path.exists() {
            match load(&path) {
                Ok(settings) => {
                    info!(path = %path.display(), "Settings loaded");
                    settings
                }
                Err(e) => {
                    warn!("{:#}; using defaults", e);
                    AppSettings::default()
                }
            }
        } else {
            let settings = AppSettings::default();
            match save(&path, &settings) {
                Ok(()) => info!(path = %path.display(), "Default settings written"),
                Err(e) => warn!("{:#}", e),
            }
            settings
        };
        Self {
            path,
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> AppSettings {
        self.current.read().await.clone()
    }

    /// Validate, persist, then publish `settings`
    pub async fn update(&self, settings: AppSettings) -> SimResult<AppSettings> {
        settings.validate()?;
        let mut current = self.current.write().await;
        save(&self.path, &settings)
            .map_err(|e| SimError::Io(std::io::Error::other(format!("{:#}", e))))?;
        *current = settings.clone();
        info!(path = %self.path.display(), "Settings updated");
        Ok(settings)
    }
}

fn load(path: &Path) -> Result<AppSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    let settings: AppSettings = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing settings {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validating settings {}", path.display()))?;
    Ok(settings)
}

fn save(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating settings directory {}", parent.display()))?;
    }
    let yaml = serde_yaml::to_string(settings).context("encoding settings")?;
    std::fs::write(path, yaml).with_context(|| format!("writing settings {}", path.display()))?;
    Ok(())
}
