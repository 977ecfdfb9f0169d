//! Failure classes for network-facing sync paths.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::util::compact_text;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The network or the API host is unreachable.
    #[error("Network unavailable: {0}")]
    Offline(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Missing or owned by another engineer; the server does not distinguish.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected by server: {0}")]
    Validation(String),
    #[error("Rate limited by server")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("Service is in read-only maintenance mode")]
    Maintenance,
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("Sync attempt cancelled")]
    Cancelled,
    #[error("Invalid sync configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] crate::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Offline(_))
    }

    /// Failures worth another attempt later.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Offline(_) | Self::RateLimited { .. } | Self::Maintenance => true,
            Self::Server { status, .. } => *status >= 500 || *status == 0,
            _ => false,
        }
    }

    /// Failures that no amount of retrying can fix.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_)
                | Self::NotFound(_)
                | Self::Validation(_)
                | Self::Configuration(_)
                | Self::Server { status: 400..=499, .. }
        )
    }

    /// Map a non-success API response to its failure class.
    pub fn from_response(status: StatusCode, body: &str, retry_after: Option<u64>) -> Self {
        let message = parse_api_error(body).unwrap_or_else(|| {
            let trimmed = compact_text(body);
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                trimmed
            }
        });

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Unauthorized(message),
            StatusCode::NOT_FOUND => Self::NotFound(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::Validation(message)
            }
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited {
                retry_after_secs: retry_after,
            },
            StatusCode::SERVICE_UNAVAILABLE => Self::Maintenance,
            _ => Self::Server {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() || error.is_request() {
            Self::Offline(error.to_string())
        } else if error.is_builder() {
            Self::Configuration(error.to_string())
        } else {
            Self::Server {
                status: error.status().map_or(0, |status| status.as_u16()),
                message: error.to_string(),
            }
        }
    }
}

/// Read `Retry-After` as whole seconds.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Turn a failed response into a [`SyncError`], consuming its body.
pub(crate) async fn error_from_response(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let retry_after = retry_after_secs(response.headers());
    let body = response.text().await.unwrap_or_default();
    SyncError::from_response(status, &body, retry_after)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(body: &str) -> Option<String> {
    let payload = serde_json::from_str::<ApiErrorBody>(body).ok()?;
    payload
        .message
        .or(payload.error)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert!(matches!(
            SyncError::from_response(StatusCode::UNAUTHORIZED, "", None),
            SyncError::Unauthorized(_)
        ));
        assert!(matches!(
            SyncError::from_response(StatusCode::NOT_FOUND, r#"{"error":"Not found"}"#, None),
            SyncError::NotFound(message) if message == "Not found"
        ));
        assert!(matches!(
            SyncError::from_response(StatusCode::TOO_MANY_REQUESTS, "", Some(30)),
            SyncError::RateLimited { retry_after_secs: Some(30) }
        ));
        assert!(matches!(
            SyncError::from_response(StatusCode::SERVICE_UNAVAILABLE, "", None),
            SyncError::Maintenance
        ));
        assert!(matches!(
            SyncError::from_response(StatusCode::BAD_GATEWAY, "upstream", None),
            SyncError::Server { status: 502, .. }
        ));
    }

    #[test]
    fn retryable_and_permanent_classes_are_disjoint() {
        let errors = [
            SyncError::Offline("down".to_string()),
            SyncError::Unauthorized("expired".to_string()),
            SyncError::NotFound("gone".to_string()),
            SyncError::Validation("bad".to_string()),
            SyncError::RateLimited {
                retry_after_secs: None,
            },
            SyncError::Maintenance,
            SyncError::Server {
                status: 500,
                message: "boom".to_string(),
            },
            SyncError::Server {
                status: 409,
                message: "conflict".to_string(),
            },
        ];
        for error in &errors {
            assert!(
                !(error.is_retryable() && error.is_permanent()),
                "{error} is both retryable and permanent"
            );
        }
        assert!(errors[0].is_connectivity());
        assert!(errors[6].is_retryable());
        assert!(errors[7].is_permanent());
        assert!(!SyncError::Cancelled.is_retryable());
    }
}
