//! §7 error kinds and their HTTP surface mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("principal not watched")]
    PrincipalNotWatched,

    #[error("operator signing would decrease its own claim")]
    ProducerBalanceDecrease,

    #[error("signature validation failed: {0}")]
    SignatureValidation(String),

    #[error("signer disabled")]
    SignerDisabled,

    #[error("nonce too low, existing nonce {existing_nonce}")]
    NonceTooLow { existing_nonce: String },

    #[error("unknown pipe state")]
    UnknownPipeState,

    #[error("not found")]
    NotFound,

    #[error("upstream call timed out")]
    UpstreamTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad-request",
            AppError::PrincipalNotWatched => "principal-not-watched",
            AppError::ProducerBalanceDecrease => "producer-balance-decrease",
            AppError::SignatureValidation(_) => "signature-validation",
            AppError::SignerDisabled => "signer-disabled",
            AppError::NonceTooLow { .. } => "nonce-too-low",
            AppError::UnknownPipeState => "unknown-pipe-state",
            AppError::NotFound => "not-found",
            AppError::UpstreamTimeout => "upstream-timeout",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PrincipalNotWatched => StatusCode::FORBIDDEN,
            AppError::ProducerBalanceDecrease => StatusCode::FORBIDDEN,
            AppError::SignatureValidation(_) => StatusCode::UNAUTHORIZED,
            AppError::SignerDisabled => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NonceTooLow { .. } => StatusCode::CONFLICT,
            AppError::UnknownPipeState => StatusCode::CONFLICT,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_nonce: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let existing_nonce = match &self {
            AppError::NonceTooLow { existing_nonce } => Some(existing_nonce.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            existing_nonce,
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(format!("store error: {e}"))
    }
}
