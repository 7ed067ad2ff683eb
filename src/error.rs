//! Wire-facing error model for the transport layer.
//! Component errors (`TokenError`, `RegistryError`) convert into `AppError` here,
//! and `AppError` is the only type that knows about HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::identity::{RegistryError, TokenError};

/// JSON-RPC error code used for every transport-level rejection.
pub const JSONRPC_SERVER_ERROR: i64 = -32000;
/// JSON-RPC error code reserved for authentication failures.
pub const JSONRPC_UNAUTHORIZED: i64 = -32001;
/// JSON-RPC internal error.
pub const JSONRPC_INTERNAL: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    Unauthenticated { code: String, message: String },
    Forbidden { code: String, message: String },
    BadRequest { code: String, message: String },
    CapacityExceeded { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Unauthenticated { code, .. }
            | AppError::Forbidden { code, .. }
            | AppError::BadRequest { code, .. }
            | AppError::CapacityExceeded { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Unauthenticated { message, .. }
            | AppError::Forbidden { message, .. }
            | AppError::BadRequest { message, .. }
            | AppError::CapacityExceeded { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn unauthenticated() -> Self {
        AppError::Unauthenticated { code: "unauthenticated".into(), message: "Unauthorized".into() }
    }
    pub fn forbidden<S: Into<String>>(msg: S) -> Self { AppError::Forbidden { code: "forbidden".into(), message: msg.into() } }
    pub fn bad_request<S: Into<String>>(msg: S) -> Self { AppError::BadRequest { code: "bad_request".into(), message: msg.into() } }
    pub fn capacity<S: Into<String>>(msg: S) -> Self { AppError::CapacityExceeded { code: "capacity_exceeded".into(), message: msg.into() } }
    /// Internal errors never carry detail to the caller; log before constructing.
    pub fn internal() -> Self {
        AppError::Internal { code: "internal".into(), message: "Internal server error".into() }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Unauthenticated { .. } => 401,
            AppError::Forbidden { .. } => 403,
            AppError::BadRequest { .. } => 400,
            AppError::CapacityExceeded { .. } => 429,
            AppError::Internal { .. } => 500,
        }
    }

    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            AppError::Unauthenticated { .. } => JSONRPC_UNAUTHORIZED,
            AppError::Internal { .. } => JSONRPC_INTERNAL,
            _ => JSONRPC_SERVER_ERROR,
        }
    }

    /// JSON-RPC shaped error body. The id is always null because transport
    /// rejections happen before the envelope is trusted.
    pub fn jsonrpc_body(&self) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "error": { "code": self.jsonrpc_code(), "message": self.message() },
            "id": null
        })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.jsonrpc_body())).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        // Reason stays in the operator log; the caller only ever sees the generic body.
        tracing::warn!(target: "auth", reason = %err, "bearer token rejected");
        AppError::unauthenticated()
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { .. } => AppError::capacity(err.to_string()),
            RegistryError::DuplicateSession(_) => {
                tracing::error!(target: "session", error = %err, "session id collision");
                AppError::internal()
            }
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
