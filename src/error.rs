// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why an inbound action was refused. The `Display` text is what the caller
/// receives in its `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("{0}")]
    Authorization(&'static str),

    #[error("{0}")]
    StateConflict(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    StoreUnavailable(String),
}

impl PollError {
    pub const TEACHER_ONLY_CREATE: Self = Self::Authorization("Only teachers can create polls");
    pub const TEACHER_ONLY_END: Self = Self::Authorization("Only teachers can end polls");
    pub const TEACHER_ONLY_REMOVE: Self = Self::Authorization("Only teachers can remove students");
    pub const STUDENT_ONLY_ANSWER: Self = Self::Authorization("Only students can submit answers");
    pub const NOT_JOINED: Self = Self::Authorization("User not found");
    pub const POLL_IN_PROGRESS: Self = Self::StateConflict(
        "Cannot create new poll. Not all students have answered the current question.",
    );
    pub const NO_ACTIVE_POLL: Self = Self::StateConflict("No active poll to answer");
    pub const ALREADY_ANSWERED: Self = Self::StateConflict("You have already answered this poll");
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("poll {0} not found in store")]
    PollNotFound(String),
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        PollError::StoreUnavailable(err.to_string())
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("coordinator is not running")]
    CoordinatorGone,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::CoordinatorGone => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
