use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::AppResult;
use crate::uploader::BatchOutcome;

const MAX_NOTIFICATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

/// Which notifications the user wants to see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub all_notifications: bool,
    pub upload_results: bool,
    pub system_alerts: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            all_notifications: true,
            upload_results: true,
            system_alerts: false,
        }
    }
}

impl NotificationSettings {
    fn allows(&self, kind: NotificationKind, category: NotificationCategory) -> bool {
        if !self.all_notifications {
            return false;
        }
        match category {
            NotificationCategory::UploadResult => self.upload_results,
            NotificationCategory::SystemAlert => {
                self.system_alerts || kind != NotificationKind::Error
            }
            NotificationCategory::General => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCategory {
    UploadResult,
    SystemAlert,
    General,
}

/// Newest-first notification list, persisted after every change when backed by a file.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    notifications: Vec<Notification>,
    settings: NotificationSettings,
    store_path: Option<PathBuf>,
}

impl NotificationFeed {
    pub fn new(settings: NotificationSettings) -> Self {
        Self {
            notifications: Vec::new(),
            settings,
            store_path: None,
        }
    }

    /// Loads the feed stored at `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>, settings: NotificationSettings) -> Self {
        let path = path.into();
        let notifications = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                log::warn!(
                    "Failed to parse notifications at {}: {}. Starting empty.",
                    path.display(),
                    e
                );
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        Self {
            notifications,
            settings,
            store_path: Some(path),
        }
    }

    /// Adds a notification unless the settings filter it out.
    ///
    /// Returns the new notification's id.
    pub fn add(
        &mut self,
        title: &str,
        message: &str,
        kind: NotificationKind,
        category: NotificationCategory,
    ) -> Option<String> {
        if !self.settings.allows(kind, category) {
            log::debug!("Notification '{}' suppressed by settings", title);
            return None;
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.notifications.insert(
            0,
            Notification {
                id: id.clone(),
                title: title.to_string(),
                message: message.to_string(),
                kind,
                timestamp: Utc::now(),
                read: false,
            },
        );
        self.notifications.truncate(MAX_NOTIFICATIONS);
        self.persist();
        Some(id)
    }

    pub fn mark_as_read(&mut self, id: &str) -> bool {
        let found = match self.notifications.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        };
        if found {
            self.persist();
        }
        found
    }

    pub fn mark_all_as_read(&mut self) {
        for notification in &mut self.notifications {
            notification.read = true;
        }
        self.persist();
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.notifications.len();
        self.notifications.retain(|n| n.id != id);
        let removed = self.notifications.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    pub fn clear_all(&mut self) {
        self.notifications.clear();
        self.persist();
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: NotificationSettings) {
        self.settings = settings;
    }

    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        if let Err(e) = save_notifications(path, &self.notifications) {
            log::warn!(
                "Failed to persist notifications to {} (non-critical): {}",
                path.display(),
                e
            );
        }
    }
}

fn save_notifications(path: &Path, notifications: &[Notification]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(notifications)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Records the result of an upload run in the feed.
pub fn notify_batch_outcome(
    feed: &mut NotificationFeed,
    outcome: &BatchOutcome,
    folder: &str,
) -> Option<String> {
    let attempted = outcome.completed_count + outcome.error_count;
    if attempted == 0 && !outcome.cancelled {
        return None;
    }

    if outcome.error_count == 0 && !outcome.cancelled {
        feed.add(
            "Pages Uploaded",
            &format!(
                "{} file(s) uploaded to {}",
                outcome.completed_count, folder
            ),
            NotificationKind::Success,
            NotificationCategory::UploadResult,
        )
    } else {
        let mut message = format!(
            "{} uploaded, {} failed in {}",
            outcome.completed_count, outcome.error_count, folder
        );
        if outcome.cancelled {
            message.push_str(" (cancelled)");
        }
        feed.add(
            "Upload Finished With Errors",
            &message,
            NotificationKind::Warning,
            NotificationCategory::UploadResult,
        )
    }
}
