use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};

const APP_DIR_NAME: &str = "EchoReads Uploader";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub api_base_url: String,
    pub upload_path: String,
    pub file_field: String,
    pub folder_field: String,
    pub request_timeout_ms: u64,
    pub item_delay_ms: u64,
    pub max_file_size_mb: u64,
    pub allowed_mime_types: Vec<String>,
    pub log_level: String,
    pub show_upload_notifications: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.echoreads.online".to_string(),
            upload_path: "/api/upload".to_string(),
            file_field: "image".to_string(),
            folder_field: "folderName".to_string(),
            request_timeout_ms: 10_000,
            item_delay_ms: 500,
            max_file_size_mb: 50,
            allowed_mime_types: [
                "image/jpeg",
                "image/png",
                "image/webp",
                "application/pdf",
                "audio/mpeg",
                "audio/mp3",
                "audio/wav",
                "audio/m4a",
                "audio/ogg",
                "audio/aac",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            log_level: "info".to_string(),
            show_upload_notifications: true,
        }
    }
}

impl UploaderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn allows_mime_type(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
    }

    pub fn upload_url(&self) -> String {
        format!(
            "{}{}",
            self.api_base_url.trim_end_matches('/'),
            self.upload_path
        )
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?
        .join(APP_DIR_NAME);

    fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

pub fn get_config_path() -> AppResult<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn get_notifications_path() -> AppResult<PathBuf> {
    Ok(get_config_dir()?.join("notifications.json"))
}

pub fn load_config() -> AppResult<UploaderConfig> {
    load_config_from(&get_config_path()?)
}

/// Load the configuration at `config_path`, writing defaults on first run.
pub fn load_config_from(config_path: &Path) -> AppResult<UploaderConfig> {
    if config_path.exists() {
        let config_str = fs::read_to_string(config_path)?;
        let config: UploaderConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
            log::warn!("Failed to parse config file: {}. Using defaults.", e);
            UploaderConfig::default()
        });

        validate_config(&config)?;
        Ok(config)
    } else {
        let default_config = UploaderConfig::default();
        save_config_internal(config_path, &default_config)?;
        Ok(default_config)
    }
}

pub fn save_config_to(config_path: &Path, config: &UploaderConfig) -> AppResult<()> {
    validate_config(config)?;
    save_config_internal(config_path, config)
}

fn save_config_internal(config_path: &Path, config: &UploaderConfig) -> AppResult<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if config_path.exists() {
        let backup_path = config_path.with_extension("json.bak");
        if let Err(e) = fs::copy(config_path, &backup_path) {
            log::warn!("Failed to create config backup: {}", e);
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(config_path, config_str)?;

    log::info!("Configuration saved to {}", config_path.display());
    Ok(())
}

pub fn validate_config(config: &UploaderConfig) -> AppResult<()> {
    let base = config.api_base_url.trim();
    if base.is_empty() || !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(AppError::validation(
            "api_base_url",
            "Must be an http:// or https:// URL",
        ));
    }

    if !config.upload_path.starts_with('/') {
        return Err(AppError::validation("upload_path", "Must start with '/'"));
    }

    if config.file_field.trim().is_empty() {
        return Err(AppError::validation("file_field", "Cannot be empty"));
    }

    if config.folder_field.trim().is_empty() {
        return Err(AppError::validation("folder_field", "Cannot be empty"));
    }

    if config.request_timeout_ms < 100 || config.request_timeout_ms > 600_000 {
        return Err(AppError::validation(
            "request_timeout_ms",
            "Must be between 100ms and 10 minutes",
        ));
    }

    if config.item_delay_ms > 60_000 {
        return Err(AppError::validation("item_delay_ms", "Must be 60 seconds or less"));
    }

    if config.max_file_size_mb == 0 || config.max_file_size_mb > 1024 {
        return Err(AppError::validation(
            "max_file_size_mb",
            "Must be between 1 and 1024",
        ));
    }

    if config.allowed_mime_types.is_empty() {
        return Err(AppError::validation(
            "allowed_mime_types",
            "At least one MIME type is required",
        ));
    }

    let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
    if !valid_log_levels.contains(&config.log_level.as_str()) {
        return Err(AppError::validation("log_level", "Must be a valid log level"));
    }

    Ok(())
}

// Reset configuration to defaults
pub fn reset_config_at(config_path: &Path) -> AppResult<UploaderConfig> {
    if config_path.exists() {
        let backup_path = config_path.with_extension("json.reset_backup");
        fs::copy(config_path, &backup_path)?;
        log::info!("Existing config backed up to {}", backup_path.display());
    }

    let default_config = UploaderConfig::default();
    save_config_internal(config_path, &default_config)?;

    log::info!("Configuration reset to defaults");
    Ok(default_config)
}
