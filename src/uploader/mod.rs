// Uploader module - sequential upload queue and its backend
//
// Files are enqueued, validated, optionally ordered by page number and
// uploaded one at a time into a destination folder on the backend.

pub mod backend_client;
pub mod file_handle;
pub mod mock_backend;
pub mod ordering;
pub mod progress_tracker;
pub mod retry;
pub mod upload_queue;

pub use backend_client::{BackendClient, UploadBackend, UploadResponse};
pub use file_handle::{scan_directory, scan_upload_directory, FileHandle};
pub use mock_backend::MockBackend;
pub use ordering::OrderingHint;
pub use progress_tracker::{BatchProgress, QueueEvent};
pub use retry::retry_failed_uploads;
pub use upload_queue::{BatchOutcome, UploadItemView, UploadQueue, UploadStatus};
