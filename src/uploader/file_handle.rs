use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::UploaderConfig;
use crate::errors::{AppError, AppResult};
use crate::security::detect_mime_type;

/// A local file's bytes and metadata, cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    name: String,
    mime_type: String,
    bytes: Arc<Vec<u8>>,
}

impl FileHandle {
    pub fn new(name: &str, mime_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            bytes: Arc::new(bytes),
        }
    }

    /// Reads a file from disk, detecting its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::file_not_found(&path.to_string_lossy()));
            }
            Err(e) => return Err(e.into()),
        };

        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mime_type = detect_mime_type(&name);

        Ok(Self::new(&name, mime_type, bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|e| e.to_str())
    }
}

/// Regular, non-hidden files directly inside `dir`, sorted by name.
pub async fn scan_directory(dir: impl AsRef<Path>) -> AppResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(AppError::validation("directory", "Path is not a directory"));
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }

    files.sort();
    log::debug!("Scanned {} files in {}", files.len(), dir.display());
    Ok(files)
}

/// Like [`scan_directory`], keeping only files whose detected MIME type the
/// config allows. Skipped files are logged at warn.
pub async fn scan_upload_directory(
    dir: impl AsRef<Path>,
    config: &UploaderConfig,
) -> AppResult<Vec<PathBuf>> {
    let (accepted, skipped): (Vec<PathBuf>, Vec<PathBuf>) = scan_directory(dir)
        .await?
        .into_iter()
        .partition(|path| {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            config.allows_mime_type(detect_mime_type(&name))
        });

    for path in &skipped {
        log::warn!("Skipping {}: not an uploadable file type", path.display());
    }
    Ok(accepted)
}
