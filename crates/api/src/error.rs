use axum::{Json, http::StatusCode, response::IntoResponse};
use funil_infra::acme_client::AcmeClientError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Upstream { .. } => "upstream_error",
            ApiError::BadGateway(_) => "bad_gateway",
            ApiError::Internal => "internal_error",
        }
    }
}

/// CRM errors carrying an HTTP status pass that status through the gateway
/// unchanged; anything without one (transport, auth exchange, malformed
/// upstream body) surfaces as a 502.
impl From<AcmeClientError> for ApiError {
    fn from(err: AcmeClientError) -> Self {
        match err {
            AcmeClientError::Client {
                status, message, ..
            }
            | AcmeClientError::Upstream {
                status, message, ..
            } => ApiError::Upstream { status, message },
            AcmeClientError::Unauthorized { message, .. } => ApiError::Upstream {
                status: 401,
                message,
            },
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
