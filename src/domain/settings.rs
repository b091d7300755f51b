use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_tracker".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Length of one discovery window.
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Pause after an adapter error before the next cycle.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            scan_window_ms: default_scan_window_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ScanSettings {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_scan_window_ms() -> u64 {
    1000
}
fn default_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_gatt_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for GattSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_tries: default_max_tries(),
            concurrency: default_gatt_concurrency(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl GattSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_max_tries() -> u32 {
    3
}
fn default_gatt_concurrency() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    256
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            threshold: default_threshold(),
            max_workers: default_max_workers(),
        }
    }
}

fn default_chunk_size() -> u64 {
    100
}
fn default_threshold() -> f64 {
    0.1
}
fn default_max_workers() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `None` places the database next to the settings file.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Writes held in memory while the store is unavailable.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            pending_capacity: default_pending_capacity(),
        }
    }
}

fn default_pending_capacity() -> usize {
    10_000
}

/// Optional replacements for the built-in lookup tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceSettings {
    #[serde(default)]
    pub manufacturers_file: Option<PathBuf>,
    #[serde(default)]
    pub class_of_device_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub gatt: GattSettings,
    #[serde(default)]
    pub correlation: CorrelationSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub reference: ReferenceSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Loads `path`, falling back to defaults when it is missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!(path = %settings_path.display(), "Using default settings: {}", err);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = Self::config_dir()?;
        path.push("settings.json");
        Ok(path)
    }

    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ble_tracker");
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Database location: the configured path, or `ble_tracker.db` beside the settings file.
    pub fn database_path(&self) -> PathBuf {
        match &self.settings.store.database_path {
            Some(path) => path.clone(),
            None => self
                .settings_path
                .with_file_name("ble_tracker.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "gatt": { "max_tries": 5 } }"#).unwrap();
        assert_eq!(settings.gatt.max_tries, 5);
        assert_eq!(settings.gatt.concurrency, 10);
        assert_eq!(settings.scan.backoff(), Duration::from_secs(1));
        assert_eq!(settings.correlation.chunk_size, 100);
        assert!((settings.correlation.threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(settings.log_settings.file_name_prefix, "ble_tracker");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().scan.scan_window_ms = 2500;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path);
        assert_eq!(reloaded.get().scan.scan_window_ms, 2500);
        assert_eq!(
            reloaded.database_path(),
            dir.path().join("nested").join("ble_tracker.db")
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::from_path(dir.path().join("absent.json"));
        assert!(service.get().gatt.enabled);
        assert_eq!(service.get().store.pending_capacity, 10_000);
    }
}
