/// HTTP API Layer
///
/// This module provides the REST API for process management. It handles:
/// - Deployment of BPMN/JSON resources (multipart upload)
/// - Starting instances, listing and completing tasks
/// - Instance inspection, suspension and history
/// - Diagram rendering
///
/// Every JSON response uses the `{ code, message, data }` envelope.

use crate::error::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

// Process engine endpoints
pub mod process;

// Re-export router builders
pub use process::{create_process_routes, AppState};

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 200,
            message: "success".to_string(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    /// Success without payload
    pub fn empty() -> Self {
        Self {
            code: 200,
            message: "success".to_string(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Engine error rendered as an envelope with a matching HTTP status
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Parse(_) | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::DefinitionNotFound(_)
            | EngineError::InstanceNotFound(_)
            | EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InstanceSuspended(_) => StatusCode::CONFLICT,
            EngineError::NoMatchingFlow { .. }
            | EngineError::InfiniteLoopDetected { .. }
            | EngineError::ExpressionError { .. }
            | EngineError::DelegateNotFound(_)
            | EngineError::DelegateFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("💥 Request failed: {:#}", self.0);
        } else {
            tracing::warn!("⚠️ Request rejected: {}", self.0);
        }
        (status, Json(ApiResponse::error(self.0.to_string()))).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (EngineError::Parse("bad".into()), StatusCode::BAD_REQUEST),
            (EngineError::TaskNotFound("t".into()), StatusCode::NOT_FOUND),
            (EngineError::InstanceSuspended("i".into()), StatusCode::CONFLICT),
            (
                EngineError::NoMatchingFlow { node_id: "gw".into() },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EngineError::Storage(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).status(), status);
        }
    }

    #[test]
    fn envelope_shape() {
        let ok = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(ok["code"], 200);
        assert_eq!(ok["message"], "success");
        assert_eq!(ok["data"], serde_json::json!([1, 2]));

        let err = serde_json::to_value(ApiResponse::error("boom")).unwrap();
        assert_eq!(err["code"], 500);
        assert!(err["data"].is_null());
    }
}
