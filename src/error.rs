//! Service-wide error type and its HTTP rendering.
//!
//! Every error renders as `{"detail": "..."}` with a user-facing Spanish
//! message; internals stay in the logs.

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::rate_limit::RETRY_AFTER_SECS;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("API key inválida o ausente")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("Sincronización ya en curso")]
    SyncInProgress,

    #[error("Demasiadas peticiones. Máximo {limit}/min.")]
    RateLimited { limit: u32 },

    /// Transient upstream failure after retries were exhausted.
    #[error("TUSSAM API no disponible. Inténtalo en unos segundos.")]
    UpstreamUnavailable(String),

    /// Permanent upstream failure: the provider rejected the request or
    /// answered with a body we could not decode.
    #[error("Respuesta inválida del proveedor de datos")]
    UpstreamRejected(String),

    #[error("Sincronización abortada: {0}")]
    SyncAborted(String),

    #[error("Error interno")]
    Database(#[from] sqlx::Error),

    #[error("Error interno")]
    Serialization(#[from] serde_json::Error),

    #[error("Error interno")]
    Internal(String),
}

impl ServiceError {
    /// True for failures that originate in the transit or geocoding
    /// providers rather than in this service.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ServiceError::UpstreamUnavailable(_) | ServiceError::UpstreamRejected(_)
        )
    }

    /// Failure detail kept out of client responses.
    fn internal_detail(&self) -> Option<&str> {
        match self {
            ServiceError::UpstreamUnavailable(detail)
            | ServiceError::UpstreamRejected(detail)
            | ServiceError::Internal(detail) => Some(detail),
            _ => None,
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::SyncInProgress => StatusCode::CONFLICT,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::UpstreamRejected(_) | ServiceError::SyncAborted(_) => {
                StatusCode::BAD_GATEWAY
            }
            ServiceError::Database(_)
            | ServiceError::Serialization(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Some(detail) = self.internal_detail() {
            warn!(status = %self.status_code(), detail, "{self}");
        }
        let mut builder = HttpResponse::build(self.status_code());
        if let ServiceError::RateLimited { .. } = self {
            builder.insert_header((header::RETRY_AFTER, RETRY_AFTER_SECS.to_string()));
        }
        builder.json(json!({ "detail": self.to_string() }))
    }
}
