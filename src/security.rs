use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::config::UploaderConfig;
use crate::errors::{AppError, AppResult};
use crate::uploader::file_handle::FileHandle;

fn unsafe_filename_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("static regex"))
}

fn safe_folder_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\s\-_\./]+$").expect("static regex"))
}

pub struct InputValidator;

impl InputValidator {
    /// Checks a file before it is allowed into the upload queue.
    pub fn validate_upload_file(file: &FileHandle, config: &UploaderConfig) -> AppResult<()> {
        let name = file.name().trim();
        if name.is_empty() {
            return Err(AppError::validation("file_name", "File name cannot be empty"));
        }

        if file.size() == 0 {
            return Err(AppError::EmptyFile {
                name: name.to_string(),
            });
        }

        if file.size() > config.max_file_size_bytes() {
            return Err(AppError::FileTooLarge {
                name: name.to_string(),
                max_mb: config.max_file_size_mb,
            });
        }

        if !config.allows_mime_type(file.mime_type()) {
            return Err(AppError::invalid_file_type(name, file.mime_type()));
        }

        Ok(())
    }

    pub fn validate_folder_name(folder: &str) -> AppResult<()> {
        let trimmed = folder.trim();

        if trimmed.is_empty() {
            return Err(AppError::validation("folder", "Folder name cannot be empty"));
        }

        if trimmed.len() > 200 {
            return Err(AppError::validation(
                "folder",
                "Folder name too long (max 200 characters)",
            ));
        }

        if trimmed.contains("..") {
            return Err(AppError::validation("folder", "Invalid folder path detected"));
        }

        if !safe_folder_chars().is_match(trimmed) {
            return Err(AppError::validation(
                "folder",
                "Folder name contains invalid characters",
            ));
        }

        Ok(())
    }

    pub fn sanitize_filename(filename: &str) -> String {
        let sanitized = unsafe_filename_chars().replace_all(filename.trim(), "_");

        if sanitized.chars().count() > 255 {
            let truncated: String = sanitized.chars().take(252).collect();
            format!("{}...", truncated)
        } else {
            sanitized.to_string()
        }
    }
}

/// MIME type from the file extension, as a browser file picker would report it.
pub fn detect_mime_type(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/m4a",
        Some("ogg") => "audio/ogg",
        Some("aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}
