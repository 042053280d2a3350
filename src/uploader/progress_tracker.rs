use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::upload_queue::{BatchOutcome, UploadStatus};

/// Notifications emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    BatchStarted {
        pending: usize,
    },
    ItemStatusChanged {
        id: String,
        name: String,
        from: UploadStatus,
        to: UploadStatus,
    },
    ProgressUpdated {
        percent: u8,
        completed: usize,
        total: usize,
    },
    BatchFinished(BatchOutcome),
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::BatchStarted { .. } => "batch-started",
            QueueEvent::ItemStatusChanged { .. } => "item-status-changed",
            QueueEvent::ProgressUpdated { .. } => "progress-updated",
            QueueEvent::BatchFinished(_) => "batch-finished",
        }
    }
}

/// Aggregate progress of the current run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub percent: u8,
    pub current_item: Option<String>,
    /// 1-based position of the current item within this run
    pub current_index: usize,
    pub pending_in_run: usize,
    pub estimated_time_remaining: Option<u64>, // seconds
}

/// Percentage of queue items that have been attempted.
///
/// Never reports 100 while something is still unattempted, even where
/// plain rounding would.
pub fn aggregate_progress(attempted: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }

    let attempted = attempted.min(total);
    let percent = ((attempted as f64 / total as f64) * 100.0).round() as u8;

    if attempted < total {
        percent.min(99)
    } else {
        100
    }
}

/// Seconds left at the observed per-item rate, or `None` before any item finished.
pub fn estimate_time_remaining(
    elapsed: Duration,
    attempted: usize,
    remaining: usize,
) -> Option<u64> {
    if attempted == 0 {
        return None;
    }

    let per_item = elapsed.as_secs_f64() / attempted as f64;
    let estimated_seconds = (per_item * remaining as f64).ceil() as u64;

    if estimated_seconds > 0 {
        log::debug!(
            "ETA updated: {}m {}s (remaining: {})",
            estimated_seconds / 60,
            estimated_seconds % 60,
            remaining
        );
    }
    Some(estimated_seconds)
}
