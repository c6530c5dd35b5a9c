//! Mapping of playback errors onto HTTP responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use eddy_core::media::CatalogError;
use eddy_core::{PlaybackError, StorageError};
use serde::Serialize;
use tracing::error;

/// Error returned by every handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Failure from the playback service
    #[error(transparent)]
    Playback(#[from] PlaybackError),

    /// Content lookup failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Path segment could not be parsed
    #[error("Invalid {what}: {value}")]
    BadPath {
        /// Which segment
        what: &'static str,
        /// Raw value
        value: String,
    },

    /// Requested byte range lies outside the file
    #[error("Range not satisfiable for {total} bytes")]
    RangeNotSatisfiable {
        /// File size
        total: u64,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ApiError {
    /// Status code and stable error code for this error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Playback(e) => match e {
                PlaybackError::LimitExceeded { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "limit_exceeded")
                }
                PlaybackError::SessionNotFound { .. } => (StatusCode::NOT_FOUND, "session_not_found"),
                PlaybackError::Catalog(CatalogError::NotFound { .. }) => {
                    (StatusCode::NOT_FOUND, "media_not_found")
                }
                PlaybackError::Catalog(CatalogError::InvalidId { .. })
                | PlaybackError::InvalidRequest { .. } => {
                    (StatusCode::BAD_REQUEST, "invalid_request")
                }
                PlaybackError::Decision(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unplayable_media"),
                PlaybackError::NoCapableProvider(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "no_capable_provider")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Storage(StorageError::NotFound { .. } | StorageError::InvalidPath { .. }) => {
                (StatusCode::NOT_FOUND, "content_not_found")
            }
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ApiError::BadPath { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::RangeNotSatisfiable { .. } => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "range_not_satisfiable")
            }
        }
    }

    /// Text safe to show clients. Server-side failures stay generic.
    fn message(&self) -> String {
        match self {
            ApiError::Playback(e) => e.user_message(),
            ApiError::Storage(StorageError::NotFound { .. } | StorageError::InvalidPath { .. }) => {
                "Content not found".to_string()
            }
            ApiError::Storage(_) => "Storage error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "Request failed");
        }

        let retry_after = match &self {
            ApiError::Playback(e) => e.retry_after().map(|d| d.as_secs().max(1)),
            _ => None,
        };
        let body = ErrorBody {
            error: code,
            message: self.message(),
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let ApiError::RangeNotSatisfiable { total } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
