use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Crate-level error type mapped to an HTTP response at a single boundary (`IntoResponse`).
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("store not found")]
    NotFound,

    #[error("global store quota exceeded")]
    GlobalQuotaExceeded,

    #[error("tenant store quota exceeded")]
    TenantQuotaExceeded,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: i64 },

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
            }
            ApiError::GlobalQuotaExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "global store quota exceeded"})),
            )
                .into_response(),
            ApiError::TenantQuotaExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "tenant store quota exceeded"})),
            )
                .into_response(),
            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let mut resp = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": "rate limit exceeded"})),
                )
                    .into_response();
                resp.headers_mut().insert(
                    "Retry-After",
                    retry_after_seconds.to_string().parse().unwrap(),
                );
                resp
            }
            ApiError::Persistence(e) => {
                tracing::error!("{:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
