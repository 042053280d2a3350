use chrono::{DateTime, Utc};

use crate::errors::{AppError, AppResult};

pub const TOKEN_ENV_VAR: &str = "ECHOREADS_TOKEN";

/// Bearer token handed to every backend call
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(token: &str) -> AppResult<Self> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(AppError::MissingToken);
        }
        Ok(Self {
            token: trimmed.to_string(),
            expires_at: None,
        })
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn from_env() -> AppResult<Self> {
        match std::env::var(TOKEN_ENV_VAR) {
            Ok(value) => Self::new(&value),
            Err(_) => Err(AppError::MissingToken),
        }
    }

    /// Tokens without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Utc::now() >= expires_at)
            .unwrap_or(false)
    }

    pub fn bearer_header(&self) -> AppResult<String> {
        if self.is_expired() {
            return Err(AppError::TokenExpired);
        }
        Ok(format!("Bearer {}", self.token))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}
