use async_trait::async_trait;
use reqwest::{header, multipart, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::AuthToken;
use crate::config::UploaderConfig;
use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;

use super::file_handle::FileHandle;

/// `{success, data?, message?}` envelope returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl UploadResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Best available failure text, server message first.
    pub fn failure_reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "Upload failed".to_string())
    }

    pub fn public_url(&self) -> Option<String> {
        self.url.clone().or_else(|| {
            self.data
                .as_ref()
                .and_then(|d| d.get("url"))
                .and_then(|u| u.as_str())
                .map(|u| u.to_string())
        })
    }
}

/// The remote side of an upload: stores one file into a destination folder.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// Uploads `file` into `folder`.
    ///
    /// A response with `success: false` is returned as `Ok`; the caller
    /// decides how to record it.
    async fn upload(&self, file: &FileHandle, folder: &str) -> AppResult<UploadResponse>;
}

/// Multipart body for one upload request
#[derive(Debug, Clone)]
pub struct UploadPayload {
    file: Option<(String, FileHandle)>,
    text_fields: HashMap<String, String>,
}

impl UploadPayload {
    pub fn new() -> Self {
        Self {
            file: None,
            text_fields: HashMap::new(),
        }
    }

    pub fn add_text_field(&mut self, key: &str, value: &str) {
        self.text_fields.insert(key.to_string(), value.to_string());
    }

    pub fn set_file(&mut self, field_name: &str, file: FileHandle) {
        self.file = Some((field_name.to_string(), file));
    }

    pub fn build_form(&self) -> AppResult<multipart::Form> {
        let mut form = multipart::Form::new();

        for (key, value) in &self.text_fields {
            form = form.text(key.clone(), value.clone());
        }

        if let Some((field_name, file)) = &self.file {
            let part = multipart::Part::bytes(file.bytes().to_vec())
                .file_name(InputValidator::sanitize_filename(file.name()))
                .mime_str(file.mime_type())?;
            form = form.part(field_name.clone(), part);
        }

        Ok(form)
    }
}

impl Default for UploadPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP client for the backend's multipart upload endpoint
pub struct BackendClient {
    client: Client,
    config: UploaderConfig,
    token: AuthToken,
}

impl BackendClient {
    pub fn new(config: UploaderConfig, token: AuthToken) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_millis(config.request_timeout_ms.min(10_000)))
            .build()?;

        Ok(Self {
            client,
            config,
            token,
        })
    }

    async fn send_payload(&self, payload: &UploadPayload) -> AppResult<UploadResponse> {
        let authorization = self.token.bearer_header()?;
        let url = self.config.upload_url();
        let form = payload.build_form()?;

        log::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, authorization)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        parse_upload_response(status, &body)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout {
                timeout_ms: self.config.request_timeout_ms,
            }
        } else {
            AppError::Network(e)
        }
    }

    /// Single-file upload with a generated object name, returning the public URL.
    ///
    /// Used for covers and audio, which are stored under `{folder}s/`.
    pub async fn simple_upload(&self, file: &FileHandle, folder: &str) -> AppResult<String> {
        InputValidator::validate_folder_name(folder)?;
        let object_name = generate_object_name(file, folder);

        let mut payload = UploadPayload::new();
        payload.set_file("file", file.clone());
        payload.add_text_field("fileName", &object_name);
        payload.add_text_field("folder", folder);

        let response = self.send_payload(&payload).await?;
        if !response.success {
            return Err(AppError::upload_failed(response.failure_reason()));
        }

        response
            .public_url()
            .ok_or_else(|| AppError::upload_failed("Upload response did not include a URL"))
    }

    /// Runs [`BackendClient::simple_upload`] for each file in order.
    ///
    /// A failed file is recorded and the rest still run. A permanent error,
    /// such as an expired token, stops the batch and is returned.
    pub async fn simple_upload_all(
        &self,
        files: &[FileHandle],
        folder: &str,
    ) -> AppResult<Vec<(String, AppResult<String>)>> {
        InputValidator::validate_folder_name(folder)?;

        let mut results = Vec::with_capacity(files.len());
        for file in files {
            match self.simple_upload(file, folder).await {
                Err(e) if e.is_permanent() => {
                    log::error!("Stopping simple uploads at {}: {}", file.name(), e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Simple upload of {} failed: {}", file.name(), e);
                    results.push((file.name().to_string(), Err(e)));
                }
                Ok(url) => results.push((file.name().to_string(), Ok(url))),
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl UploadBackend for BackendClient {
    async fn upload(&self, file: &FileHandle, folder: &str) -> AppResult<UploadResponse> {
        let mut payload = UploadPayload::new();
        payload.set_file(&self.config.file_field, file.clone());
        payload.add_text_field(&self.config.folder_field, folder);

        log::info!(
            "Uploading {} ({} bytes) to folder {}",
            file.name(),
            file.size(),
            folder
        );
        self.send_payload(&payload).await
    }
}

/// Turns an HTTP status and body into the backend envelope.
///
/// Non-2xx statuses become `UploadFailed`, carrying the server's message
/// when the body is a JSON envelope.
pub fn parse_upload_response(status: StatusCode, body: &str) -> AppResult<UploadResponse> {
    let parsed = serde_json::from_str::<UploadResponse>(body);

    if !status.is_success() {
        let reason = parsed
            .ok()
            .and_then(|r| r.message.or(r.error))
            .filter(|m| !m.trim().is_empty())
            .map(|m| format!("Upload failed: {} - {}", status.as_u16(), m))
            .unwrap_or_else(|| format!("Upload failed: {}", status.as_u16()));
        return Err(AppError::upload_failed(reason));
    }

    parsed.map_err(|e| {
        log::debug!(
            "Unparseable upload response (first 200 chars): {}",
            &body.chars().take(200).collect::<String>()
        );
        AppError::upload_failed(format!("Invalid response from server: {}", e))
    })
}

/// Object name of the form `{folder}s/{unix_millis}-{random}.{ext}`.
pub fn generate_object_name(file: &FileHandle, folder: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(11)
        .collect();
    let extension = file
        .extension()
        .map(InputValidator::sanitize_filename)
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string());

    format!("{}s/{}-{}.{}", folder, timestamp, random, extension)
}
