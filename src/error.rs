//! Store errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::executor::UpdateError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`crate::store::StateStore`].
///
/// `NotFound` and `Conflict` are distinct signals and are propagated without
/// reinterpretation up to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A uniqueness constraint would be violated.
    #[error("conflict: {what}")]
    Conflict { what: String },

    #[error("invalid request: {message}")]
    Invalid { message: String },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        StoreError::Conflict { what: what.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::Invalid {
            message: message.into(),
        }
    }

    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StoreError::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

/// JSON error response shared by the controller and operator routers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "BAD_GATEWAY", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            StoreError::Conflict { .. } => Self::new(StatusCode::CONFLICT, "CONFLICT", message),
            StoreError::Invalid { .. } => Self::bad_request(message),
            StoreError::Storage { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE", message)
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<StoreError>() {
            Ok(store_err) => return store_err.into(),
            Err(other) => other,
        };
        if let Some(update_err) = err.downcast_ref::<UpdateError>() {
            if matches!(update_err, UpdateError::ServerRunning { .. }) {
                return Self::new(StatusCode::CONFLICT, "SERVER_RUNNING", format!("{:#}", err));
            }
        }
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            format!("{:#}", err),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_distinct_statuses() {
        assert_eq!(
            ApiError::from(StoreError::not_found("server x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::conflict("duplicate TARGET")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::invalid("bad")).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn wrapped_store_error_keeps_its_status() {
        let err = anyhow::Error::new(StoreError::conflict("dup")).context("inserting state");
        assert_eq!(ApiError::from(err).status(), StatusCode::CONFLICT);
    }
}
