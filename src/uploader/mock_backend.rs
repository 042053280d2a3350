//! Scriptable [`UploadBackend`] for tests.
//!
//! Responses are queued per file name and consumed in FIFO order. Files
//! without a scripted response get the default response, which is a
//! success envelope unless overridden.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::errors::{AppError, AppResult};

use super::backend_client::{UploadBackend, UploadResponse};
use super::file_handle::FileHandle;

enum MockResponse {
    Immediate(AppResult<UploadResponse>),
    /// Waits for the trigger (a send or a dropped sender) before completing
    Triggered {
        response: AppResult<UploadResponse>,
        trigger: oneshot::Receiver<()>,
    },
    Delayed {
        response: AppResult<UploadResponse>,
        delay: Duration,
    },
}

/// Record of a call made to the mock backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub file_name: String,
    pub folder: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    default_response: Arc<Mutex<Option<UploadResponse>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unscripted upload returns `response`.
    pub fn with_default(self, response: UploadResponse) -> Self {
        *lock(&self.default_response) = Some(response);
        self
    }

    pub fn add_response(&self, file_name: &str, response: AppResult<UploadResponse>) {
        self.push(file_name, MockResponse::Immediate(response));
    }

    pub fn add_failure(&self, file_name: &str, reason: &str) {
        self.add_response(file_name, Err(AppError::upload_failed(reason)));
    }

    pub fn add_delayed_response(
        &self,
        file_name: &str,
        delay: Duration,
        response: AppResult<UploadResponse>,
    ) {
        self.push(file_name, MockResponse::Delayed { response, delay });
    }

    /// Holds the upload of `file_name` in flight until the returned sender fires.
    pub fn add_response_with_trigger(
        &self,
        file_name: &str,
        response: AppResult<UploadResponse>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            file_name,
            MockResponse::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    fn push(&self, file_name: &str, response: MockResponse) {
        lock(&self.responses)
            .entry(file_name.to_string())
            .or_default()
            .push(response);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous uploads observed so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadBackend for MockBackend {
    async fn upload(&self, file: &FileHandle, folder: &str) -> AppResult<UploadResponse> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        lock(&self.calls).push(MockCall {
            file_name: file.name().to_string(),
            folder: folder.to_string(),
            mime_type: file.mime_type().to_string(),
            size: file.size(),
        });

        let scripted = {
            let mut responses = lock(&self.responses);
            responses
                .get_mut(file.name())
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0))
        };

        match scripted {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                let _ = trigger.await;
                response
            }
            Some(MockResponse::Delayed { response, delay }) => {
                tokio::time::sleep(delay).await;
                response
            }
            None => {
                let default = lock(&self.default_response).clone();
                Ok(default.unwrap_or_else(|| {
                    UploadResponse::ok(json!({
                        "key": format!("{}/{}", folder, file.name()),
                        "fileName": file.name(),
                    }))
                }))
            }
        }
    }
}

/// Decrements the in-flight counter even if the upload future is dropped
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
