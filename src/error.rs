//! Typed errors for tenant routing and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures of the routing core. Identity fallback is not represented: a blank or
/// missing caller always resolves to the default tenant.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),
    #[error("tenant {tenant}: cannot build connection pool: {reason}")]
    Provisioning { tenant: String, reason: String },
    #[error("tenant {tenant}: schema migration failed: {reason}")]
    Migration { tenant: String, reason: String },
    #[error("tenant {tenant}: no connection available before acquire timeout")]
    PoolExhausted { tenant: String },
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

impl RoutingError {
    pub(crate) fn provisioning(tenant: &str, reason: impl Into<String>) -> Self {
        RoutingError::Provisioning {
            tenant: tenant.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn migration(tenant: &str, reason: impl Into<String>) -> Self {
        RoutingError::Migration {
            tenant: tenant.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Routing(e) => match e {
                RoutingError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "tenant_not_found"),
                RoutingError::Provisioning { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "provisioning_error"),
                RoutingError::Migration { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "migration_error"),
                RoutingError::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
                RoutingError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
                RoutingError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            },
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else if e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false)
                {
                    (StatusCode::CONFLICT, "conflict")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
