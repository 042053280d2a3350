use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::uploader::progress_tracker::QueueEvent;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Empty file: {name}")]
    EmptyFile { name: String },

    #[error("Invalid file type: {name} ({mime_type}) is not allowed")]
    InvalidFileType { name: String, mime_type: String },

    #[error("File too large: {name}. Maximum size is {max_mb}MB.")]
    FileTooLarge { name: String, max_mb: u64 },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upload failed: {reason}")]
    UploadFailed { reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("No upload item with id {id}")]
    ItemNotFound { id: String },

    #[error("Item {id} is uploading and cannot be removed")]
    NotRemovable { id: String },

    #[error("Upload queue is busy: {operation} is not allowed during an active run")]
    QueueBusy { operation: String },

    #[error("Upload queue is empty")]
    EmptyQueue,

    #[error("An upload run is already in progress")]
    AlreadyRunning,

    #[error("No bearer token configured (set ECHOREADS_TOKEN)")]
    MissingToken,

    #[error("Bearer token expired")]
    TokenExpired,
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_file_type(name: &str, mime_type: &str) -> Self {
        Self::InvalidFileType {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
        }
    }

    pub fn upload_failed(reason: impl Into<String>) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
        }
    }

    pub fn not_removable(id: &str) -> Self {
        Self::NotRemovable { id: id.to_string() }
    }

    pub fn item_not_found(id: &str) -> Self {
        Self::ItemNotFound { id: id.to_string() }
    }

    pub fn queue_busy(operation: &str) -> Self {
        Self::QueueBusy {
            operation: operation.to_string(),
        }
    }

    /// Errors that will repeat for every later request, whatever the file.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::MissingToken | AppError::TokenExpired | AppError::Config(_)
        )
    }

    /// Message recorded on an item when its upload fails.
    ///
    /// Server-provided reasons are passed through untouched; transport
    /// problems get a generic network description.
    pub fn item_message(&self) -> String {
        match self {
            AppError::UploadFailed { reason } => reason.clone(),
            AppError::Network(e) => format!("Network error: {}", e),
            AppError::Timeout { timeout_ms } => {
                format!("Network error: request timed out after {}ms", timeout_ms)
            }
            other => other.to_string(),
        }
    }
}

/// Optional sink for queue events
pub type EventSink = Option<UnboundedSender<QueueEvent>>;

/// Send a queue event, logging instead of failing when nobody listens
pub fn safe_emit_event(sink: &EventSink, event: QueueEvent) -> bool {
    let Some(sender) = sink else {
        return false;
    };

    let event_name = event.name();
    match sender.send(event) {
        Ok(_) => {
            log::debug!("Emitted queue event '{}'", event_name);
            true
        }
        Err(e) => {
            log::warn!(
                "Failed to emit event '{}' (non-critical): receiver dropped ({})",
                event_name,
                e
            );
            false
        }
    }
}

/// Wait for a background task, logging a panic or cancellation instead of failing
pub async fn safe_join<T>(handle: JoinHandle<T>, task_name: &str) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Background task '{}' failed (non-critical): {}", task_name, e);
            None
        }
    }
}
