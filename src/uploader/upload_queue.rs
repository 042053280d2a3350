use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout, Instant};

use crate::config::UploaderConfig;
use crate::errors::{safe_emit_event, AppError, AppResult, EventSink};
use crate::security::InputValidator;

use super::backend_client::UploadBackend;
use super::file_handle::FileHandle;
use super::ordering::{apply_ordering, OrderingHint};
use super::progress_tracker::{
    aggregate_progress, estimate_time_remaining, BatchProgress, QueueEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl UploadStatus {
    /// Edges of the per-item state machine. `Error -> Pending` is only taken
    /// by an explicit requeue, never by a run.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Pending, UploadStatus::Uploading)
                | (UploadStatus::Uploading, UploadStatus::Completed)
                | (UploadStatus::Uploading, UploadStatus::Error)
                | (UploadStatus::Error, UploadStatus::Pending)
        )
    }

    pub fn is_removable(self) -> bool {
        self != UploadStatus::Uploading
    }

    pub fn is_attempted(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub(super) struct UploadItem {
    pub(super) id: String,
    pub(super) file: FileHandle,
    pub(super) display_name: String,
    pub(super) status: UploadStatus,
    pub(super) progress_percent: u8,
    pub(super) error_message: Option<String>,
    pub(super) response_data: Option<Value>,
    pub(super) enqueued_at: DateTime<Utc>,
}

impl UploadItem {
    fn new(file: FileHandle) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: file.name().to_string(),
            file,
            status: UploadStatus::Pending,
            progress_percent: 0,
            error_message: None,
            response_data: None,
            enqueued_at: Utc::now(),
        }
    }

    fn view(&self) -> UploadItemView {
        UploadItemView {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            size_bytes: self.file.size(),
            mime_type: self.file.mime_type().to_string(),
            status: self.status,
            progress_percent: self.progress_percent,
            error_message: self.error_message.clone(),
            response_data: self.response_data.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Read-only copy of an item, safe to hand to a UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItemView {
    pub id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub status: UploadStatus,
    pub progress_percent: u8,
    pub error_message: Option<String>,
    pub response_data: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Items completed by this run
    pub completed_count: usize,
    /// Items that failed in this run
    pub error_count: usize,
    pub cancelled: bool,
    /// The whole queue as it stood when the run ended
    pub items: Vec<UploadItemView>,
}

#[derive(Debug, Default)]
pub(super) struct QueueState {
    pub(super) items: Vec<UploadItem>,
    pub(super) progress: BatchProgress,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut UploadItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn attempted_count(&self) -> usize {
        self.items.iter().filter(|i| i.status.is_attempted()).count()
    }
}

pub(super) fn transition_event(item: &UploadItem, from: UploadStatus, to: UploadStatus) -> QueueEvent {
    QueueEvent::ItemStatusChanged {
        id: item.id.clone(),
        name: item.display_name.clone(),
        from,
        to,
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    backend: Arc<dyn UploadBackend>,
    config: UploaderConfig,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    events: EventSink,
}

/// Ordered upload queue, processed one item at a time.
///
/// Clones share the same queue, so one task can drive [`UploadQueue::start`]
/// while another polls [`UploadQueue::snapshot`] or removes pending items.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(backend: Arc<dyn UploadBackend>, config: UploaderConfig) -> Self {
        Self::build(backend, config, None)
    }

    pub fn with_events(
        backend: Arc<dyn UploadBackend>,
        config: UploaderConfig,
        events: UnboundedSender<QueueEvent>,
    ) -> Self {
        Self::build(backend, config, Some(events))
    }

    fn build(backend: Arc<dyn UploadBackend>, config: UploaderConfig, events: EventSink) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                backend,
                config,
                running: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Runs `f` on the queue state, recovering the data if a previous
    /// holder panicked.
    pub(super) fn with_state<R>(&self, operation: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut guard = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    "Queue lock poisoned during {} (non-critical), recovering",
                    operation
                );
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    }

    pub(super) fn emit(&self, event: QueueEvent) {
        safe_emit_event(&self.inner.events, event);
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Appends one pending item per file and returns their ids.
    ///
    /// Every file is validated first; if any is rejected nothing is added.
    pub fn enqueue(&self, files: Vec<FileHandle>, hint: OrderingHint) -> AppResult<Vec<String>> {
        for file in &files {
            InputValidator::validate_upload_file(file, &self.inner.config)?;
        }

        let items: Vec<UploadItem> = apply_ordering(files, hint)
            .into_iter()
            .map(UploadItem::new)
            .collect();
        let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();

        let queue_len = self.with_state("enqueue", |state| {
            state.items.extend(items);
            state.items.len()
        });

        log::info!(
            "Enqueued {} file(s) ({:?}), queue length {}",
            ids.len(),
            hint,
            queue_len
        );
        Ok(ids)
    }

    pub fn remove(&self, id: &str) -> AppResult<()> {
        self.with_state("remove", |state| {
            let index = state
                .items
                .iter()
                .position(|item| item.id == id)
                .ok_or_else(|| AppError::item_not_found(id))?;

            if !state.items[index].status.is_removable() {
                return Err(AppError::not_removable(id));
            }

            let removed = state.items.remove(index);
            log::debug!("Removed {} ({}) from queue", removed.display_name, id);
            Ok(())
        })
    }

    /// Empties the queue. Refused with `QueueBusy` while a run is active.
    pub fn clear(&self) -> AppResult<()> {
        if self.is_running() {
            return Err(AppError::queue_busy("clear"));
        }

        let cleared = self.with_state("clear", |state| {
            let count = state.items.len();
            state.items.clear();
            state.progress = BatchProgress::default();
            count
        });

        log::info!("Cleared {} item(s) from queue", cleared);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<UploadItemView> {
        self.with_state("snapshot", |state| {
            state.items.iter().map(UploadItem::view).collect()
        })
    }

    pub fn progress(&self) -> BatchProgress {
        self.with_state("progress read", |state| state.progress.clone())
    }

    pub fn len(&self) -> usize {
        self.with_state("len", |state| state.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Asks the active run to stop after the current item.
    ///
    /// Items not yet started stay pending. Returns false if nothing is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
        log::info!("Cancellation requested for active upload run");
        true
    }

    fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    /// Uploads every currently pending item into `folder`, one at a time.
    ///
    /// Per-item failures are recorded on the item and never abort the run.
    /// Errors are returned only for an empty queue, a run already in
    /// progress, or an invalid folder.
    pub async fn start(&self, folder: &str) -> AppResult<BatchOutcome> {
        InputValidator::validate_folder_name(folder)?;

        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Ignoring start request: a run is already active");
            return Err(AppError::AlreadyRunning);
        }
        let mut guard = RunGuard {
            queue: self,
            in_flight: None,
        };

        let (pending_ids, queue_empty, mut last_percent) = self.with_state("start", |state| {
            let ids: Vec<String> = state
                .items
                .iter()
                .filter(|item| item.status == UploadStatus::Pending)
                .map(|item| item.id.clone())
                .collect();
            let percent = aggregate_progress(state.attempted_count(), state.items.len());
            state.progress = BatchProgress {
                percent,
                current_item: None,
                current_index: 0,
                pending_in_run: ids.len(),
                estimated_time_remaining: None,
            };
            (ids, state.items.is_empty(), percent)
        });

        if queue_empty {
            return Err(AppError::EmptyQueue);
        }

        if pending_ids.is_empty() {
            log::info!("No pending items to upload");
            return Ok(BatchOutcome {
                items: self.snapshot(),
                ..BatchOutcome::default()
            });
        }

        let folder = folder.trim();
        let total_in_run = pending_ids.len();
        let delay = self.inner.config.item_delay();
        let request_timeout = self.inner.config.request_timeout();
        let start_time = Instant::now();

        log::info!(
            "Starting upload of {} item(s) to folder {}",
            total_in_run,
            folder
        );
        self.emit(QueueEvent::BatchStarted {
            pending: total_in_run,
        });

        let mut completed_count = 0;
        let mut error_count = 0;
        let mut attempted_in_run = 0;
        let mut cancelled = false;

        for (index, id) in pending_ids.iter().enumerate() {
            if self.cancel_requested() {
                cancelled = true;
                break;
            }

            if attempted_in_run > 0 && !delay.is_zero() {
                sleep(delay).await;
                if self.cancel_requested() {
                    cancelled = true;
                    break;
                }
            }

            let Some(file) = self.begin_upload(id, index + 1, total_in_run) else {
                log::debug!("Skipping {}: removed or no longer pending", id);
                continue;
            };
            guard.in_flight = Some(id.clone());

            let result = match timeout(request_timeout, self.inner.backend.upload(&file, folder))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout {
                    timeout_ms: self.inner.config.request_timeout_ms,
                }),
            };
            guard.in_flight = None;

            let outcome = match result {
                Ok(response) if response.success => Ok(response.data),
                Ok(response) => Err(response.failure_reason()),
                Err(e) => Err(e.item_message()),
            };
            if outcome.is_ok() {
                completed_count += 1;
            } else {
                error_count += 1;
            }
            self.finish_upload(id, outcome);
            attempted_in_run += 1;

            last_percent = self.record_progress(
                last_percent,
                start_time,
                attempted_in_run,
                total_in_run - (index + 1),
            );
        }

        if cancelled {
            log::info!(
                "Upload run cancelled after {} of {} item(s)",
                attempted_in_run,
                total_in_run
            );
        }

        let outcome = BatchOutcome {
            completed_count,
            error_count,
            cancelled,
            items: self.snapshot(),
        };
        log::info!(
            "Upload run finished: {} completed, {} failed{}",
            completed_count,
            error_count,
            if cancelled { " (cancelled)" } else { "" }
        );

        self.with_state("finish run", |state| {
            state.progress.current_item = None;
            state.progress.estimated_time_remaining = Some(0);
        });
        drop(guard);
        self.emit(QueueEvent::BatchFinished(outcome.clone()));
        Ok(outcome)
    }

    /// Marks a pending item as uploading and hands back its file.
    fn begin_upload(&self, id: &str, position: usize, total_in_run: usize) -> Option<FileHandle> {
        let (file, event) = self.with_state("begin upload", |state| {
            let item = state.find_mut(id)?;
            if !item.status.can_transition_to(UploadStatus::Uploading) {
                return None;
            }
            let from = item.status;
            item.status = UploadStatus::Uploading;
            item.progress_percent = 0;
            let file = item.file.clone();
            let name = item.display_name.clone();
            let event = transition_event(item, from, UploadStatus::Uploading);

            state.progress.current_item = Some(name);
            state.progress.current_index = position;
            Some((file, event))
        })?;

        log::debug!(
            "Uploading {} ({}/{})",
            file.name(),
            position,
            total_in_run
        );
        self.emit(event);
        Some(file)
    }

    fn finish_upload(&self, id: &str, outcome: Result<Option<Value>, String>) {
        let event = self.with_state("finish upload", |state| {
            let item = state.find_mut(id)?;
            let next = if outcome.is_ok() {
                UploadStatus::Completed
            } else {
                UploadStatus::Error
            };
            if !item.status.can_transition_to(next) {
                log::error!(
                    "Illegal transition {:?} -> {:?} for {}",
                    item.status,
                    next,
                    item.id
                );
                return None;
            }

            let from = item.status;
            item.status = next;
            match outcome {
                Ok(data) => {
                    item.progress_percent = 100;
                    item.response_data = data;
                    item.error_message = None;
                    log::info!("Uploaded {}", item.display_name);
                }
                Err(message) => {
                    log::warn!("Failed to upload {} - {}", item.display_name, message);
                    item.error_message = Some(message);
                }
            }
            Some(transition_event(item, from, next))
        });

        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Recomputes aggregate progress after an item settles and returns the new percent.
    fn record_progress(
        &self,
        last_percent: u8,
        start_time: Instant,
        attempted_in_run: usize,
        remaining_in_run: usize,
    ) -> u8 {
        let (percent, attempted, total) = self.with_state("progress update", |state| {
            let attempted = state.attempted_count();
            let total = state.items.len();
            let computed = aggregate_progress(attempted, total);
            let percent = if computed == 100 {
                100
            } else {
                computed.max(last_percent).min(99)
            };

            state.progress.percent = percent;
            state.progress.estimated_time_remaining =
                estimate_time_remaining(start_time.elapsed(), attempted_in_run, remaining_in_run);
            (percent, attempted, total)
        });

        self.emit(QueueEvent::ProgressUpdated {
            percent,
            completed: attempted,
            total,
        });
        percent
    }
}

/// Releases the running flag and clears any cancel request when a run
/// ends, however it ends.
///
/// If the run future is dropped mid-upload, the in-flight item is marked
/// as failed so nothing stays `Uploading`.
struct RunGuard<'a> {
    queue: &'a UploadQueue,
    in_flight: Option<String>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.in_flight.take() {
            log::warn!("Upload run dropped while {} was in flight", id);
            self.queue
                .finish_upload(&id, Err("Upload aborted".to_string()));
        }
        self.queue.inner.cancel_requested.store(false, Ordering::SeqCst);
        self.queue.inner.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::backend_client::UploadResponse;
    use crate::uploader::mock_backend::MockBackend;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config() -> UploaderConfig {
        UploaderConfig {
            item_delay_ms: 0,
            ..UploaderConfig::default()
        }
    }

    fn png(name: &str, len: usize) -> FileHandle {
        FileHandle::new(name, "image/png", vec![1u8; len])
    }

    fn queue_with(mock: &MockBackend) -> UploadQueue {
        UploadQueue::new(Arc::new(mock.clone()), test_config())
    }

    fn names(queue: &UploadQueue) -> Vec<String> {
        queue
            .snapshot()
            .into_iter()
            .map(|item| item.display_name)
            .collect()
    }

    async fn wait_until_uploading(queue: &UploadQueue, id: &str) {
        for _ in 0..200 {
            let uploading = queue
                .snapshot()
                .iter()
                .any(|item| item.id == id && item.status == UploadStatus::Uploading);
            if uploading {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("item {} never started uploading", id);
    }

    #[test]
    fn test_enqueue_preserves_insertion_order() {
        let queue = queue_with(&MockBackend::new());
        queue
            .enqueue(
                vec![png("c.png", 3), png("a.png", 3), png("b.png", 3)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();
        queue
            .enqueue(vec![png("d.png", 3)], OrderingHint::InsertionOrder)
            .unwrap();

        assert_eq!(names(&queue), vec!["c.png", "a.png", "b.png", "d.png"]);
        assert!(queue
            .snapshot()
            .iter()
            .all(|i| i.status == UploadStatus::Pending && i.progress_percent == 0));
    }

    #[test]
    fn test_enqueue_with_page_hint_sorts_pages() {
        let queue = queue_with(&MockBackend::new());
        queue
            .enqueue(
                vec![png("page_3.png", 3), png("page_1.png", 3), png("page_2.png", 3)],
                OrderingHint::PageNumber,
            )
            .unwrap();
        assert_eq!(names(&queue), vec!["page_1.png", "page_2.png", "page_3.png"]);
    }

    #[test]
    fn test_enqueue_ids_are_unique_and_stable() {
        let queue = queue_with(&MockBackend::new());
        let ids = queue
            .enqueue(
                (0..20).map(|i| png(&format!("f{}.png", i), 1)).collect(),
                OrderingHint::InsertionOrder,
            )
            .unwrap();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 20);

        let snapshot_ids: Vec<_> = queue.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(snapshot_ids, ids);
    }

    #[test]
    fn test_enqueue_rejects_batch_atomically() {
        let queue = queue_with(&MockBackend::new());
        let result = queue.enqueue(
            vec![png("ok.png", 5), png("empty.png", 0)],
            OrderingHint::InsertionOrder,
        );
        assert!(matches!(result, Err(AppError::EmptyFile { .. })));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let queue = queue_with(&MockBackend::new());
        assert!(matches!(
            queue.remove("nope"),
            Err(AppError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn test_clear_resets_progress() {
        let queue = queue_with(&MockBackend::new());
        queue
            .enqueue(vec![png("a.png", 3)], OrderingHint::InsertionOrder)
            .unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.progress().percent, 0);
    }

    #[tokio::test]
    async fn test_start_on_empty_queue_fails() {
        let queue = queue_with(&MockBackend::new());
        assert!(matches!(queue.start("mag-1").await, Err(AppError::EmptyQueue)));
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_folder() {
        let queue = queue_with(&MockBackend::new());
        queue
            .enqueue(vec![png("a.png", 3)], OrderingHint::InsertionOrder)
            .unwrap();
        assert!(matches!(
            queue.start("../escape").await,
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_two_files() {
        let mock = MockBackend::new().with_default(UploadResponse::ok(json!({"key": "x"})));
        let queue = queue_with(&mock);
        queue
            .enqueue(
                vec![png("a.png", 1200), png("b.png", 900)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let outcome = queue.start("mag-1").await.unwrap();

        assert_eq!(outcome.completed_count, 2);
        assert_eq!(outcome.error_count, 0);
        assert!(!outcome.cancelled);
        for item in &outcome.items {
            assert_eq!(item.status, UploadStatus::Completed);
            assert_eq!(item.progress_percent, 100);
            assert_eq!(item.response_data, Some(json!({"key": "x"})));
            assert!(item.error_message.is_none());
        }
        assert_eq!(outcome.items[0].size_bytes, 1200);
        assert_eq!(outcome.items[1].size_bytes, 900);

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.folder == "mag-1"));
        assert_eq!(queue.progress().percent, 100);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_following_items() {
        let mock = MockBackend::new();
        mock.add_failure("2.png", "Storage unavailable");
        let queue = queue_with(&mock);
        queue
            .enqueue(
                vec![png("1.png", 10), png("2.png", 10), png("3.png", 10)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let outcome = queue.start("mag-1").await.unwrap();

        assert_eq!(outcome.completed_count, 2);
        assert_eq!(outcome.error_count, 1);
        let statuses: Vec<_> = outcome.items.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![
                UploadStatus::Completed,
                UploadStatus::Error,
                UploadStatus::Completed
            ]
        );
        assert_eq!(
            outcome.items[1].error_message.as_deref(),
            Some("Storage unavailable")
        );
        let order: Vec<_> = mock.get_calls().into_iter().map(|c| c.file_name).collect();
        assert_eq!(order, vec!["1.png", "2.png", "3.png"]);
    }

    #[tokio::test]
    async fn test_success_false_records_server_message() {
        let mock = MockBackend::new();
        mock.add_response("a.png", Ok(UploadResponse::rejected("Folder is locked")));
        let queue = queue_with(&mock);
        queue
            .enqueue(vec![png("a.png", 10)], OrderingHint::InsertionOrder)
            .unwrap();

        let outcome = queue.start("mag-1").await.unwrap();
        let item = &outcome.items[0];
        assert_eq!(item.status, UploadStatus::Error);
        assert_eq!(item.error_message.as_deref(), Some("Folder is locked"));
        assert!(item.response_data.is_none());
    }

    #[tokio::test]
    async fn test_every_item_attempted_when_backend_down() {
        let mock = MockBackend::new();
        for name in ["a.png", "b.png", "c.png"] {
            mock.add_failure(name, "Network error: dns error");
        }
        let queue = queue_with(&mock);
        queue
            .enqueue(
                vec![png("a.png", 1), png("b.png", 1), png("c.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let outcome = queue.start("mag-1").await.unwrap();
        assert_eq!(outcome.error_count, 3);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(queue.progress().percent, 100);
    }

    #[tokio::test]
    async fn test_timeout_marks_item_as_network_error() {
        let mock = MockBackend::new();
        mock.add_delayed_response(
            "slow.png",
            Duration::from_secs(5),
            Ok(UploadResponse::ok(json!({}))),
        );
        let config = UploaderConfig {
            item_delay_ms: 0,
            request_timeout_ms: 100,
            ..UploaderConfig::default()
        };
        let queue = UploadQueue::new(Arc::new(mock.clone()), config);
        queue
            .enqueue(
                vec![png("slow.png", 1), png("fast.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let outcome = queue.start("mag-1").await.unwrap();
        assert_eq!(outcome.items[0].status, UploadStatus::Error);
        assert!(outcome.items[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Network error"));
        assert_eq!(outcome.items[1].status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_only_pending_items_are_uploaded() {
        let mock = MockBackend::new();
        mock.add_failure("b.png", "boom");
        let queue = queue_with(&mock);
        queue
            .enqueue(
                vec![png("a.png", 1), png("b.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();
        queue.start("mag-1").await.unwrap();

        queue
            .enqueue(vec![png("c.png", 1)], OrderingHint::InsertionOrder)
            .unwrap();
        let outcome = queue.start("mag-1").await.unwrap();

        assert_eq!(outcome.completed_count, 1);
        assert_eq!(outcome.error_count, 0);
        assert_eq!(mock.call_count(), 3);
        assert_eq!(outcome.items[1].status, UploadStatus::Error);
    }

    #[tokio::test]
    async fn test_no_pending_items_returns_empty_outcome() {
        let mock = MockBackend::new();
        let queue = queue_with(&mock);
        queue
            .enqueue(vec![png("a.png", 1)], OrderingHint::InsertionOrder)
            .unwrap();
        queue.start("mag-1").await.unwrap();

        let outcome = queue.start("mag-1").await.unwrap();
        assert_eq!(outcome.completed_count, 0);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cannot_remove_or_clear_while_uploading() {
        let mock = MockBackend::new();
        let trigger = mock.add_response_with_trigger("a.png", Ok(UploadResponse::ok(json!({}))));
        let queue = queue_with(&mock);
        let ids = queue
            .enqueue(
                vec![png("a.png", 1), png("b.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let runner = queue.clone();
        let handle = tokio::spawn(async move { runner.start("mag-1").await });
        wait_until_uploading(&queue, &ids[0]).await;

        assert!(matches!(
            queue.remove(&ids[0]),
            Err(AppError::NotRemovable { .. })
        ));
        assert!(matches!(queue.clear(), Err(AppError::QueueBusy { .. })));
        let item = queue.snapshot().into_iter().find(|i| i.id == ids[0]).unwrap();
        assert_eq!(item.status, UploadStatus::Uploading);

        // A pending item can still be dropped mid-run and is never uploaded
        queue.remove(&ids[1]).unwrap();

        trigger.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.completed_count, 1);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let mock = MockBackend::new();
        let trigger = mock.add_response_with_trigger("a.png", Ok(UploadResponse::ok(json!({}))));
        let queue = queue_with(&mock);
        let ids = queue
            .enqueue(
                vec![png("a.png", 1), png("b.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let runner = queue.clone();
        let handle = tokio::spawn(async move { runner.start("mag-1").await });
        wait_until_uploading(&queue, &ids[0]).await;

        assert!(queue.is_running());
        assert!(matches!(
            queue.start("mag-1").await,
            Err(AppError::AlreadyRunning)
        ));

        trigger.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(mock.max_in_flight(), 1);
        assert_eq!(mock.call_count(), 2);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_cancel_leaves_remaining_items_pending() {
        let mock = MockBackend::new();
        let trigger = mock.add_response_with_trigger("a.png", Ok(UploadResponse::ok(json!({}))));
        let queue = queue_with(&mock);
        let ids = queue
            .enqueue(
                vec![png("a.png", 1), png("b.png", 1), png("c.png", 1)],
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        let runner = queue.clone();
        let handle = tokio::spawn(async move { runner.start("mag-1").await });
        wait_until_uploading(&queue, &ids[0]).await;

        assert!(queue.cancel());
        trigger.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed_count, 1);
        let statuses: Vec<_> = outcome.items.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![
                UploadStatus::Completed,
                UploadStatus::Pending,
                UploadStatus::Pending
            ]
        );
        assert!(!queue.cancel());

        // The next run picks the remaining items up
        let outcome = queue.start("mag-1").await.unwrap();
        assert_eq!(outcome.completed_count, 2);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_cancel_arriving_as_run_starts_is_honoured() {
        let mock = MockBackend::new();
        let queue = queue_with(&mock);
        queue
            .enqueue(vec![png("a.png", 1), png("b.png", 1)], OrderingHint::InsertionOrder)
            .unwrap();

        // A cancel() that lands right after the run claims the queue
        queue.inner.cancel_requested.store(true, Ordering::SeqCst);
        let outcome = queue.start("mag-1").await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(mock.call_count(), 0);
        assert!(outcome.items.iter().all(|i| i.status == UploadStatus::Pending));
        assert!(!queue.inner.cancel_requested.load(Ordering::SeqCst));

        let outcome = queue.start("mag-1").await.unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.completed_count, 2);
    }

    #[tokio::test]
    async fn test_aborted_run_does_not_leave_items_uploading() {
        let mock = MockBackend::new();
        let _trigger = mock.add_response_with_trigger("a.png", Ok(UploadResponse::ok(json!({}))));
        let queue = queue_with(&mock);
        let ids = queue
            .enqueue(vec![png("a.png", 1)], OrderingHint::InsertionOrder)
            .unwrap();

        let runner = queue.clone();
        let handle = tokio::spawn(async move { runner.start("mag-1").await });
        wait_until_uploading(&queue, &ids[0]).await;

        handle.abort();
        let _ = handle.await;

        let item = &queue.snapshot()[0];
        assert_eq!(item.status, UploadStatus::Error);
        assert_eq!(item.error_message.as_deref(), Some("Upload aborted"));
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_events_follow_legal_transitions_and_monotonic_progress() {
        let mock = MockBackend::new();
        mock.add_failure("2.png", "nope");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = UploadQueue::with_events(Arc::new(mock.clone()), test_config(), tx);
        queue
            .enqueue(
                (1..=4).map(|i| png(&format!("{}.png", i), 1)).collect(),
                OrderingHint::InsertionOrder,
            )
            .unwrap();

        queue.start("mag-1").await.unwrap();

        let mut percents = Vec::new();
        let mut transitions = Vec::new();
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                QueueEvent::ItemStatusChanged { from, to, .. } => transitions.push((from, to)),
                QueueEvent::ProgressUpdated { percent, .. } => percents.push(percent),
                QueueEvent::BatchFinished(_) => finished = true,
                QueueEvent::BatchStarted { pending } => assert_eq!(pending, 4),
            }
        }

        assert!(finished);
        assert_eq!(transitions.len(), 8);
        for (from, to) in &transitions {
            assert!(from.can_transition_to(*to), "{:?} -> {:?}", from, to);
            assert_ne!(*from, UploadStatus::Error);
        }
        assert_eq!(percents, vec![25, 50, 75, 100]);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_state_machine_edges() {
        use UploadStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Error));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Uploading.can_transition_to(Pending));
        assert!(!Uploading.is_removable());
        assert!(Error.is_removable());
    }
}
