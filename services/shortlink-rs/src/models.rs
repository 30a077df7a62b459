use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::base62;
use crate::errors::ServiceError;

/// Maximum length of a short code, caller-supplied or generated.
pub const MAX_SHORT_CODE_LEN: usize = 10;

/// A shortened URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Url {
    pub id: u64,
    pub short_code: String,
    pub original_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_count: u64,
}

impl Url {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Command to persist a new URL. Validated before it reaches a repository.
#[derive(Debug, Clone)]
pub struct UrlCreate {
    pub short_code: String,
    pub original_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UrlCreate {
    /// Restates the entity invariants: short code is 1–10 Base62 characters,
    /// the URL is absolute http(s) with a host, expiry (if any) is in the
    /// future.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.short_code.is_empty()
            || self.short_code.len() > MAX_SHORT_CODE_LEN
            || !base62::is_valid(&self.short_code)
        {
            return Err(ServiceError::InvalidShortCode);
        }
        let parsed = url::Url::parse(&self.original_url)
            .map_err(|e| ServiceError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ServiceError::InvalidUrl("missing host".to_string()));
        }
        if let Some(at) = self.expires_at {
            if at <= Utc::now() {
                return Err(ServiceError::InvalidExpiresIn(
                    "expiry must be in the future".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ── HTTP DTOs ─────────────────────────────────────────────────────────────────

/// Request body for POST /api/v1/shorten.
#[derive(Debug, Deserialize)]
pub struct ShortenRequest {
    pub url: String,
    /// Duration string such as `"24h"`, `"30m"`, `"1h30m"`.
    pub expires_in: Option<String>,
}

/// Response for POST /api/v1/shorten.
#[derive(Debug, Serialize)]
pub struct ShortenResponse {
    pub short_url: String,
    pub short_code: String,
    pub original_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response for GET /api/v1/urls/{code}.
#[derive(Debug, Serialize)]
pub struct UrlInfoResponse {
    pub id: u64,
    pub short_code: String,
    pub short_url: String,
    pub original_url: String,
    pub click_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UrlInfoResponse {
    pub fn from_url(url: &Url, base_url: &str) -> Self {
        Self {
            id: url.id,
            short_code: url.short_code.clone(),
            short_url: format!("{}/{}", base_url.trim_end_matches('/'), url.short_code),
            original_url: url.original_url.clone(),
            click_count: url.click_count,
            created_at: url.created_at,
            expires_at: url.expires_at,
        }
    }
}

/// Response for GET /api/v1/analytics/{code}.
#[derive(Debug, Serialize)]
pub struct UrlStats {
    pub short_code: String,
    pub click_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_count: Option<u64>,
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: crate::enums::HealthStatus,
    pub timestamp: String,
}

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: crate::enums::ReadyStatus,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<std::collections::BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create(short_code: &str, original_url: &str) -> UrlCreate {
        UrlCreate {
            short_code: short_code.to_string(),
            original_url: original_url.to_string(),
            expires_at: None,
        }
    }

    #[test]
    fn accepts_a_well_formed_create() {
        assert!(create("abc1234", "https://example.com/x").validate().is_ok());
    }

    #[test]
    fn rejects_bad_short_codes() {
        assert!(create("", "https://example.com").validate().is_err());
        assert!(create("abcdefghijk", "https://example.com").validate().is_err());
        assert!(create("ab/cd", "https://example.com").validate().is_err());
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(create("abc", "ftp://example.com").validate().is_err());
        assert!(create("abc", "not a url").validate().is_err());
    }

    #[test]
    fn rejects_past_expiry() {
        let mut cmd = create("abc", "https://example.com");
        cmd.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn expiry_detection_uses_the_given_clock() {
        let now = Utc::now();
        let url = Url {
            id: 1,
            short_code: "abc".into(),
            original_url: "https://example.com".into(),
            created_at: now - Duration::hours(2),
            expires_at: Some(now - Duration::hours(1)),
            click_count: 0,
        };
        assert!(url.is_expired(now));
        assert!(!url.is_expired(now - Duration::hours(2)));
    }
}
