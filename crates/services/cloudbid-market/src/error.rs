use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cloudbid_auction::AuctionError;
use cloudbid_ledger::{LedgerError, StoreError};
use cloudbid_types::ValidationError;
use serde_json::json;

/// Every failure the HTTP surface reports. Library errors are converted here
/// and nowhere else.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing token")]
    AuthMissing,

    #[error("invalid token")]
    AuthInvalid,

    #[error("not permitted for this user")]
    AuthMismatch,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    InsufficientCredits(String),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthMissing | ApiError::AuthInvalid | ApiError::AuthMismatch => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InsufficientCredits(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({ "error": message }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidCredentials => ApiError::AuthInvalid,
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::InsufficientCredits { .. } => ApiError::InsufficientCredits(err.to_string()),
            StoreError::ResourceNotBiddable
            | StoreError::ResourceComputing
            | StoreError::OwnResource
            | StoreError::BidBelowFloor { .. }
            | StoreError::BidNotCompetitive
            | StoreError::ResourceStillAvailable
            | StoreError::BidComputing(_)
            | StoreError::NotComputing(_) => ApiError::PreconditionFailed(err.to_string()),
            StoreError::SchemaMismatch { .. }
            | StoreError::InvariantViolation(_)
            | StoreError::Database(_)
            | StoreError::Migration(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { .. } => ApiError::InsufficientCredits(err.to_string()),
            LedgerError::ResourceNotBiddable(_)
            | LedgerError::BidBelowFloor { .. }
            | LedgerError::BidNotCompetitive => ApiError::PreconditionFailed(err.to_string()),
            LedgerError::InvalidBid(_) | LedgerError::InvalidAmount(_) => {
                ApiError::BadRequest(err.to_string())
            }
            LedgerError::NotFound(what) => ApiError::NotFound(what),
            LedgerError::InternalStoreFailure(inner) => inner.into(),
        }
    }
}

impl From<AuctionError> for ApiError {
    fn from(err: AuctionError) -> Self {
        match err {
            AuctionError::Ledger(err) => err.into(),
            AuctionError::Store(err) => err.into(),
            AuctionError::NotResourceOwner { .. } | AuctionError::NotBidOwner { .. } => {
                ApiError::AuthMismatch
            }
            AuctionError::ShuttingDown => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        tracing::debug!(error = %err.body_text(), "rejected request body");
        ApiError::BadRequest("invalid request body".to_string())
    }
}

impl From<PathRejection> for ApiError {
    fn from(err: PathRejection) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}
