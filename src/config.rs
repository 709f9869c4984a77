//! Configuration management for the whiteboard.
//!
//! Settings live in `config.json` inside a config directory. A missing file
//! is created with defaults; a file that cannot be parsed is ignored and the
//! defaults are used instead.
//!
//! Groups:
//! - database_file, api_base_url
//! - sync: background loop switch and interval
//! - notes: page size for the initial load and defaults for new notes

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BoardError, BoardResult};
use crate::validation::validate_color;

const CONFIG_FILE_NAME: &str = "config.json";
const DATABASE_FILE_NAME: &str = "whiteboard.db";

/// Sync loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
        }
    }
}

/// Note defaults and loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesConfig {
    /// Notes requested per page when unlocking
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_color")]
    pub default_color: String,
    #[serde(default = "default_note_size")]
    pub default_width: f64,
    #[serde(default = "default_note_size")]
    pub default_height: f64,
    /// Bounds for randomly placed new notes
    #[serde(default = "default_canvas_width")]
    pub canvas_width: f64,
    #[serde(default = "default_canvas_height")]
    pub canvas_height: f64,
}

fn default_page_size() -> u32 {
    50
}

fn default_color() -> String {
    "#FFF9B1".to_string()
}

fn default_note_size() -> f64 {
    200.0
}

fn default_canvas_width() -> f64 {
    1200.0
}

fn default_canvas_height() -> f64 {
    800.0
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            default_color: default_color(),
            default_width: default_note_size(),
            default_height: default_note_size(),
            canvas_width: default_canvas_width(),
            canvas_height: default_canvas_height(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Base URL of the notes backend
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub notes: NotesConfig,
}

fn default_api_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            api_base_url: default_api_base_url(),
            sync: SyncConfig::default(),
            notes: NotesConfig::default(),
        }
    }
}

impl ConfigData {
    fn defaults_in(config_dir: &Path) -> Self {
        Self {
            database_file: config_dir
                .join(DATABASE_FILE_NAME)
                .to_string_lossy()
                .to_string(),
            ..Default::default()
        }
    }

    /// Replace loaded values that `Config::set` would have rejected.
    fn sanitize(&mut self) {
        if self.sync.interval_secs == 0 {
            tracing::warn!("sync.interval_secs is 0, using the default");
            self.sync.interval_secs = default_interval_secs();
        }

        let notes = &mut self.notes;
        if notes.page_size == 0 {
            tracing::warn!("notes.page_size is 0, using the default");
            notes.page_size = default_page_size();
        }
        if validate_color(&notes.default_color).is_err() {
            tracing::warn!(
                color = %notes.default_color,
                "Invalid notes.default_color, using the default"
            );
            notes.default_color = default_color();
        }
        for (key, value, fallback) in [
            ("notes.default_width", &mut notes.default_width, default_note_size()),
            ("notes.default_height", &mut notes.default_height, default_note_size()),
            ("notes.canvas_width", &mut notes.canvas_width, default_canvas_width()),
            ("notes.canvas_height", &mut notes.canvas_height, default_canvas_height()),
        ] {
            if !value.is_finite() || *value <= 0.0 {
                tracing::warn!(key, value = *value, "Not a positive number, using the default");
                *value = fallback;
            }
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// Without the `desktop` feature, `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> BoardResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("whiteboard")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(BoardError::Config(
                        "config_dir is required without the desktop feature".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE_NAME);

        let data = match fs::read_to_string(&config_file) {
            Ok(content) => match serde_json::from_str::<ConfigData>(&content) {
                Ok(mut data) => {
                    if data.database_file.is_empty() {
                        data.database_file = ConfigData::defaults_in(&config_dir).database_file;
                    }
                    data.sanitize();
                    data
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        file = %config_file.display(),
                        "Ignoring malformed config file"
                    );
                    ConfigData::defaults_in(&config_dir)
                }
            },
            Err(_) => ConfigData::defaults_in(&config_dir),
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> BoardResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data(&self) -> &ConfigData {
        &self.data
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn api_base_url(&self) -> &str {
        &self.data.api_base_url
    }

    /// Check if the background sync loop should run
    pub fn is_sync_enabled(&self) -> bool {
        self.data.sync.enabled
    }

    /// Enable or disable the background sync loop
    pub fn set_sync_enabled(&mut self, enabled: bool) -> BoardResult<()> {
        self.data.sync.enabled = enabled;
        self.save()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.data.sync.interval_secs)
    }

    /// Set the time between sync rounds
    pub fn set_sync_interval_secs(&mut self, secs: u64) -> BoardResult<()> {
        if secs == 0 {
            return Err(BoardError::validation(
                "sync.interval_secs",
                "must be at least 1 second",
            ));
        }
        self.data.sync.interval_secs = secs;
        self.save()
    }

    pub fn notes_config(&self) -> &NotesConfig {
        &self.data.notes
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        let notes = &self.data.notes;
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "api_base_url" => Some(self.data.api_base_url.clone()),
            "sync.enabled" => Some(self.data.sync.enabled.to_string()),
            "sync.interval_secs" => Some(self.data.sync.interval_secs.to_string()),
            "notes.page_size" => Some(notes.page_size.to_string()),
            "notes.default_color" => Some(notes.default_color.clone()),
            "notes.default_width" => Some(notes.default_width.to_string()),
            "notes.default_height" => Some(notes.default_height.to_string()),
            "notes.canvas_width" => Some(notes.canvas_width.to_string()),
            "notes.canvas_height" => Some(notes.canvas_height.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> BoardResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "api_base_url" => self.data.api_base_url = value.trim_end_matches('/').to_string(),
            "sync.enabled" => self.data.sync.enabled = parse_value(key, value)?,
            "sync.interval_secs" => return self.set_sync_interval_secs(parse_value(key, value)?),
            "notes.page_size" => {
                let size: u32 = parse_value(key, value)?;
                if size == 0 {
                    return Err(BoardError::validation(key, "must be at least 1"));
                }
                self.data.notes.page_size = size;
            }
            "notes.default_color" => {
                validate_color(value)?;
                self.data.notes.default_color = value.to_string();
            }
            "notes.default_width" => self.data.notes.default_width = parse_positive(key, value)?,
            "notes.default_height" => self.data.notes.default_height = parse_positive(key, value)?,
            "notes.canvas_width" => self.data.notes.canvas_width = parse_positive(key, value)?,
            "notes.canvas_height" => self.data.notes.canvas_height = parse_positive(key, value)?,
            _ => return Err(BoardError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> BoardResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BoardError::validation(key, format!("invalid value '{}'", value)))
}

fn parse_positive(key: &str, value: &str) -> BoardResult<f64> {
    let parsed: f64 = parse_value(key, value)?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(BoardError::validation(key, "must be a positive number"));
    }
    Ok(parsed)
}
