//! Sequential upload queue for the EchoReads magazine backend.
//!
//! Magazine pages, covers and audio are validated locally, queued, and
//! uploaded one at a time to the backend's multipart upload endpoint.

pub mod auth;
pub mod config;
pub mod errors;
pub mod notifications;
pub mod security;
pub mod uploader;

pub use errors::{AppError, AppResult};
