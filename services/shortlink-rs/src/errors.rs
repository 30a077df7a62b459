//! Service-level error taxonomy.
//!
//! Lower layers carry their own error types (`RepositoryError`,
//! `SanitizeError`, `GeneratorError`); everything converges here so the HTTP
//! boundary maps each identity to exactly one status + stable machine code.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::idgen::GeneratorError;
use crate::repository::RepositoryError;
use crate::sanitizer::SanitizeError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("url exceeds the maximum length of {max} bytes")]
    UrlTooLong { max: usize },
    #[error("url uses a dangerous scheme: {0}")]
    DangerousUrl(String),
    #[error("url resolves to a private or local address: {0}")]
    PrivateIpBlocked(String),
    #[error("url host is blocked: {0}")]
    BlockedHost(String),
    #[error("invalid short code")]
    InvalidShortCode,
    #[error("invalid expires_in duration: {0}")]
    InvalidExpiresIn(String),
    #[error("short url not found")]
    NotFound,
    #[error("short url has expired")]
    Expired,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("could not allocate a unique short code")]
    RetryExceeded,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyUrl => "EMPTY_URL",
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::UrlTooLong { .. } => "URL_TOO_LONG",
            Self::DangerousUrl(_) => "DANGEROUS_URL",
            Self::PrivateIpBlocked(_) => "PRIVATE_IP_BLOCKED",
            Self::BlockedHost(_) => "BLOCKED_HOST",
            Self::InvalidShortCode => "INVALID_SHORT_CODE",
            Self::InvalidExpiresIn(_) => "INVALID_EXPIRES_IN",
            Self::NotFound => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::RetryExceeded => "RETRY_EXCEEDED",
            Self::Cancelled | Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmptyUrl
            | Self::InvalidUrl(_)
            | Self::UrlTooLong { .. }
            | Self::DangerousUrl(_)
            | Self::PrivateIpBlocked(_)
            | Self::BlockedHost(_)
            | Self::InvalidShortCode
            | Self::InvalidExpiresIn(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Expired => StatusCode::GONE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RetryExceeded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cancelled | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SanitizeError> for ServiceError {
    fn from(err: SanitizeError) -> Self {
        match err {
            SanitizeError::EmptyUrl => Self::EmptyUrl,
            SanitizeError::UrlTooLong { max, .. } => Self::UrlTooLong { max },
            SanitizeError::InvalidUrl(msg) => Self::InvalidUrl(msg),
            SanitizeError::InvalidScheme(scheme) => {
                Self::InvalidUrl(format!("unsupported scheme: {scheme}"))
            }
            SanitizeError::DangerousScheme(scheme) => Self::DangerousUrl(scheme),
            SanitizeError::PrivateIp(host) => Self::PrivateIpBlocked(host),
            SanitizeError::BlockedHost(host) => Self::BlockedHost(host),
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => Self::NotFound,
            RepositoryError::Cancelled => Self::Cancelled,
            RepositoryError::Internal(e) => Self::Internal(e),
        }
    }
}

impl From<GeneratorError> for ServiceError {
    fn from(err: GeneratorError) -> Self {
        match err {
            GeneratorError::MaxRetriesExceeded(_) => Self::RetryExceeded,
            GeneratorError::Cancelled => Self::Cancelled,
            GeneratorError::Storage(repo) => repo.into(),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Wire shape of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx bodies never leak internal wording.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        let retry_after = match &self {
            Self::RateLimited { retry_after_secs } => Some((*retry_after_secs).max(1)),
            _ => None,
        };
        let body = Json(ErrorBody {
            error: message,
            code: self.code(),
            retry_after,
        });
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
