use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::model::ClassifierError;

/// Anything that can go wrong between receiving a `/solve` body and answering it.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("image must be a base64 string")]
    ImageField,
    #[error("invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Classifier(#[from] ClassifierError),
    #[error("solver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for SolveError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.to_string() }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}
