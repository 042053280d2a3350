use crate::errors::{AppError, AppResult};

use super::upload_queue::{transition_event, BatchOutcome, UploadQueue, UploadStatus};

impl UploadQueue {
    /// Puts every failed item back to pending so the next run retries it.
    pub fn requeue_failed(&self) -> AppResult<usize> {
        if self.is_running() {
            return Err(AppError::queue_busy("requeue"));
        }

        let events = self.with_state("requeue failed", |state| {
            state
                .items
                .iter_mut()
                .filter(|item| item.status == UploadStatus::Error)
                .map(|item| {
                    item.status = UploadStatus::Pending;
                    item.progress_percent = 0;
                    item.error_message = None;
                    transition_event(item, UploadStatus::Error, UploadStatus::Pending)
                })
                .collect::<Vec<_>>()
        });

        let count = events.len();
        for event in events {
            self.emit(event);
        }
        log::info!("Requeued {} failed upload(s)", count);
        Ok(count)
    }

    pub fn retry_item(&self, id: &str) -> AppResult<()> {
        if self.is_running() {
            return Err(AppError::queue_busy("retry"));
        }

        let event = self.with_state("retry item", |state| {
            let item = state
                .items
                .iter_mut()
                .find(|item| item.id == id)
                .ok_or_else(|| AppError::item_not_found(id))?;

            if item.status != UploadStatus::Error {
                return Err(AppError::validation(
                    "status",
                    "Only failed uploads can be retried",
                ));
            }

            item.status = UploadStatus::Pending;
            item.progress_percent = 0;
            item.error_message = None;
            Ok(transition_event(item, UploadStatus::Error, UploadStatus::Pending))
        })?;

        self.emit(event);
        Ok(())
    }
}

/// Requeue every failed item and run the queue again.
pub async fn retry_failed_uploads(queue: &UploadQueue, folder: &str) -> AppResult<BatchOutcome> {
    let requeued = queue.requeue_failed()?;
    if requeued == 0 {
        log::info!("No failed uploads to retry");
    }
    queue.start(folder).await
}
