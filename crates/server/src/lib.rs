//! voxgate server
//!
//! Axum HTTP surface plus the bidirectional streaming voice channel.

pub mod http;
pub mod metrics;
pub mod middleware;
pub mod state;
pub mod ws;

pub use http::create_router;
pub use metrics::init_metrics;
pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Response adapter carrying the core taxonomy onto the wire: the status
/// code comes from the error kind, the body carries the machine code and
/// whatever structured context the kind defines.
pub struct ApiError(pub voxgate_core::Error);

impl From<voxgate_core::Error> for ApiError {
    fn from(err: voxgate_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut body = serde_json::json!({
            "error": err.code(),
            "message": err.to_string(),
        });
        match &err {
            voxgate_core::Error::Unauthorized { required, held } => {
                body["required"] = serde_json::json!(required);
                body["user_permissions"] = serde_json::json!(held);
            }
            voxgate_core::Error::QuotaExceeded {
                limit_class,
                limit,
                current,
                remaining,
                ..
            } => {
                body["limit_class"] = serde_json::json!(limit_class);
                body["limit"] = serde_json::json!(limit);
                body["current"] = serde_json::json!(current);
                body["remaining"] = serde_json::json!(remaining);
            }
            voxgate_core::Error::RateLimit { retry_after_secs } => {
                body["retry_after"] = serde_json::json!(retry_after_secs);
            }
            voxgate_core::Error::ProviderError { correlation_id, .. } => {
                body["correlation_id"] = serde_json::json!(correlation_id);
            }
            voxgate_core::Error::BusinessRule { rule, .. } => {
                body["rule"] = serde_json::json!(rule);
            }
            _ => {}
        }

        crate::metrics::record_error(err.code());
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
