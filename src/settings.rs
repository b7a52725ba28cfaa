//! Application settings storage
//!
//! Stores the database location and import tuning in a JSON file in the app
//! data directory. Every getter falls back to the default when settings were
//! never initialized.

use crate::import::UnresolvedParentPolicy;
use crate::source::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

/// Global settings instance
static SETTINGS: RwLock<Option<Settings>> = RwLock::new(None);

/// Path to config file (set during init)
static CONFIG_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);

const APP_DIR: &str = "taxotree";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database_path: Option<String>,
    /// Records processed between flushes (default: 5000)
    #[serde(default = "default_batch_size")]
    pub import_batch_size: usize,
    /// Consecutive fetch failures before an import gives up
    #[serde(default = "default_fetch_attempts")]
    pub max_fetch_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Connect timeout for remote sources
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub unresolved_parent_policy: UnresolvedParentPolicy,
}

fn default_batch_size() -> usize {
    5000
}

fn default_fetch_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            import_batch_size: default_batch_size(),
            max_fetch_attempts: default_fetch_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_secs: default_request_timeout(),
            unresolved_parent_policy: UnresolvedParentPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk or create default
    fn load(path: &PathBuf) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "[Settings] Unreadable settings, using defaults");
                    Settings::default()
                }),
                Err(_) => Settings::default(),
            }
        } else {
            Settings::default()
        }
    }

    /// Save settings to disk
    fn save(&self, path: &PathBuf) -> Result<(), String> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, content)
            .map_err(|e| format!("Failed to write settings: {}", e))?;

        Ok(())
    }
}

/// Default app data directory (`<data dir>/taxotree`)
pub fn default_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Initialize settings with the app data directory
pub fn init(app_data_dir: PathBuf) {
    let config_path = app_data_dir.join("settings.json");
    let settings = Settings::load(&config_path);

    *CONFIG_PATH.write().unwrap_or_else(|p| p.into_inner()) = Some(config_path);
    *SETTINGS.write().unwrap_or_else(|p| p.into_inner()) = Some(settings);
}

/// Snapshot of the current settings
pub fn current() -> Settings {
    read(|s| s.clone())
}

fn read<T>(f: impl FnOnce(&Settings) -> T) -> T {
    let guard = SETTINGS.read().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(settings) => f(settings),
        None => f(&Settings::default()),
    }
}

/// Apply a change and persist it
fn update(f: impl FnOnce(&mut Settings)) -> Result<(), String> {
    let mut settings_guard = SETTINGS.write()
        .map_err(|_| "Failed to acquire settings lock")?;

    let settings = settings_guard.get_or_insert_with(Settings::default);
    f(settings);

    // Save to disk
    let config_path = CONFIG_PATH.read()
        .map_err(|_| "Failed to acquire config path lock")?
        .clone()
        .ok_or("Settings not initialized")?;

    settings.save(&config_path)
}

// ==================== Database Path ====================

/// Database path: env var first, then stored setting, then the app data dir
pub fn database_path() -> PathBuf {
    if let Ok(path) = std::env::var("TAXOTREE_DB") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    read(|s| s.database_path.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| default_app_data_dir().join("taxotree.db"))
}

pub fn set_database_path(path: Option<String>) -> Result<(), String> {
    update(|s| s.database_path = path.clone())?;
    tracing::info!(path = ?path, "[Settings] Database path saved");
    Ok(())
}

// ==================== Import Tuning ====================

pub fn import_batch_size() -> usize {
    read(|s| s.import_batch_size).max(1)
}

pub fn set_import_batch_size(size: usize) -> Result<(), String> {
    if size == 0 {
        return Err("Batch size must be positive".to_string());
    }
    update(|s| s.import_batch_size = size)
}

pub fn retry_policy() -> RetryPolicy {
    read(|s| RetryPolicy {
        max_attempts: s.max_fetch_attempts.max(1),
        backoff_base_ms: s.backoff_base_ms,
        backoff_max_ms: s.backoff_max_ms.max(s.backoff_base_ms),
    })
}

pub fn set_retry_policy(max_attempts: u32, backoff_base_ms: u64, backoff_max_ms: u64) -> Result<(), String> {
    update(|s| {
        s.max_fetch_attempts = max_attempts;
        s.backoff_base_ms = backoff_base_ms;
        s.backoff_max_ms = backoff_max_ms;
    })
}

pub fn request_timeout() -> Duration {
    Duration::from_secs(read(|s| s.request_timeout_secs))
}

pub fn unresolved_parent_policy() -> UnresolvedParentPolicy {
    read(|s| s.unresolved_parent_policy)
}

pub fn set_unresolved_parent_policy(policy: UnresolvedParentPolicy) -> Result<(), String> {
    update(|s| s.unresolved_parent_policy = policy)
}
