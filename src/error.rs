//! Error taxonomy shared by the session layer and the version-control engine.
//!
//! Validation and persistence errors abort the operation they occur in.
//! Transport errors never leave the dispatcher; they are logged there and
//! the triggering caller sees success.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::storage::StorageError;

/// Result type used across the crate
pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Malformed identifier or missing field
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown user, project, path or conflict
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Stale base version; carries what the caller needs to rebase
    #[error("Conflict on {file_path}: base version {base_version} is behind latest version {latest_version}")]
    Conflict {
        conflict_id: Uuid,
        file_path: String,
        base_version: u64,
        latest_version: u64,
    },

    /// Caller lacks the project role the operation needs
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation not allowed from the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Delivery to a session failed
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        AppError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict { .. } | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Transport(_) | AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            AppError::Conflict {
                conflict_id,
                file_path,
                base_version,
                latest_version,
            } => json!({
                "success": false,
                "conflict": true,
                "conflict_id": conflict_id,
                "file_path": file_path,
                "base_version": base_version,
                "latest_version": latest_version,
                "message": "Conflict detected. Please resolve before committing.",
            }),
            AppError::Persistence(e) => {
                tracing::error!("Storage failure surfaced to client: {}", e);
                json!({ "success": false, "error": "Internal storage error" })
            }
            other => json!({ "success": false, "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Parse a UUID-shaped identifier, naming the field on failure
pub fn parse_id(field: &str, raw: &str) -> AppResult<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(format!("{} is required", field)));
    }
    Uuid::parse_str(trimmed)
        .map_err(|_| AppError::validation(format!("Invalid {} format: {}", field, trimmed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id("user_id", &id.to_string()).unwrap(), id);
        assert!(matches!(parse_id("user_id", ""), Err(AppError::Validation(_))));
        assert!(matches!(
            parse_id("user_id", "not-a-uuid"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::not_found("Conflict", "abc").status_code(),
            StatusCode::NOT_FOUND
        );
        let conflict = AppError::Conflict {
            conflict_id: Uuid::new_v4(),
            file_path: "a.txt".to_string(),
            base_version: 1,
            latest_version: 2,
        };
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Forbidden("not owner".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = AppError::not_found("Project", "p-1");
        assert_eq!(err.to_string(), "Project not found: p-1");
    }
}
