use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application error taxonomy. Every fallible path funnels into one of these
/// variants, and the [`IntoResponse`] impl below is the only place the
/// variant → HTTP status mapping lives.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Caller-fixable input problem. The message is surfaced verbatim.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid bearer token, or owner mismatch. Deliberately
    /// carries no detail about which of those it was.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller's plan does not permit the operation.
    #[error("{0}")]
    PlanCap(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Slug collision on insert, or an edit attempted on an expired link.
    #[error("{0}")]
    Conflict(String),

    /// A fixed-window limit was exhausted. `retry_after` is whole seconds
    /// until the window resets.
    #[error("rate limit exceeded")]
    RateLimited { retry_after: i64 },

    /// Storage failure. Logged with the underlying cause; callers only ever
    /// see a generic body.
    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_owned()),
            AppError::PlanCap(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded".to_owned(),
            ),
            AppError::Database(e) => {
                tracing::error!("database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_owned(),
                )
            }
        };

        let body = Json(json!({ "error": message }));

        match self {
            AppError::RateLimited { retry_after } => {
                (status, [(header::RETRY_AFTER, retry_after.to_string())], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

/// True when a sqlx error is a UNIQUE-constraint violation. Used to turn a
/// slug collision into a 409 instead of a 500.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.kind() == sqlx::error::ErrorKind::UniqueViolation,
        _ => false,
    }
}
