//! Operator API handlers.
//!
//! Read-only views of the dedup store for operators and audits.
//!
//! # Endpoints
//!
//! - `GET /records`               – list records (paginated, filterable by status)
//! - `GET /records/{deposit_id}`  – one record by deposit id (hex)
//! - `GET /watermark`             – watermark, scan cursor and lowest unresolved round

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use voibridge_core::store::StoreError;

use crate::state::AppState;

mod records;

/// Build the operator API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/records", get(records::list_records))
        .route("/records/{deposit_id}", get(records::get_record))
        .route("/watermark", get(records::watermark))
}

/// Errors that can occur in operator API handlers.
#[derive(Debug)]
pub(crate) enum ApiError {
    Store(StoreError),
    NotFound,
    BadRequest(&'static str),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Operator API store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "record not found").into_response(),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        }
    }
}
