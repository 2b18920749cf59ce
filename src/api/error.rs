use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for the console HTTP surface.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return it directly.
#[derive(Debug)]
pub enum ApiError {
    /// 503 - Every console slot is taken; refused before upgrade.
    CapacityExceeded { max_sessions: usize },
    /// 404 - Unknown route.
    NotFound,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::CapacityExceeded { .. } => "capacity_exceeded",
            ApiError::NotFound => "not_found",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::CapacityExceeded { max_sessions } => format!(
                "Maximum console sessions reached ({}). Close a session and retry.",
                max_sessions
            ),
            ApiError::NotFound => "Not found.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
