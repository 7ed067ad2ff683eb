//! Boundary to the operation layer.
//!
//! The coordinator hands every authenticated call to an `OperationHandler`
//! together with the resolved identity. Administrative operations plug in by
//! implementing the trait; `BuiltinOperations` covers the protocol handshake.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use super::jsonrpc;
use crate::identity::IdentityContext;

pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation failed ({code}): {message}")]
pub struct OperationError {
    pub code: i64,
    pub message: String,
}

impl OperationError {
    pub fn new(code: i64, message: impl Into<String>) -> Self { Self { code, message: message.into() } }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(jsonrpc::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }
}

/// Pushes log notifications to the caller's server stream. The stream buffer is
/// bounded; when it is full the notification is dropped.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Option<Sender<Value>>,
}

impl LogSink {
    pub fn to_stream(tx: Sender<Value>) -> Self { Self { tx: Some(tx) } }

    /// Sink that only writes to the operator log.
    pub fn detached() -> Self { Self { tx: None } }

    pub fn log(&self, level: &str, message: &str) {
        tracing::debug!(target: "operations", level, message, "operation log");
        let Some(tx) = &self.tx else { return; };
        let note = jsonrpc::notification("notifications/message", serde_json::json!({"level": level, "data": message}));
        if let Err(TrySendError::Full(_)) = tx.try_send(note) {
            tracing::debug!(target: "transport", "server stream buffer full; notification dropped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationCall {
    pub identity: IdentityContext,
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
    pub workspace_path: PathBuf,
    pub log: LogSink,
}

pub trait OperationHandler: Send + Sync {
    fn call(&self, call: OperationCall) -> BoxFuture<'static, Result<Value, OperationError>>;
}

/// Run one call, turning a panic in the operation layer into `Err(description)`.
pub async fn call_catching_panics(
    handler: &dyn OperationHandler,
    call: OperationCall,
) -> Result<Result<Value, OperationError>, String> {
    AssertUnwindSafe(async { handler.call(call).await }).catch_unwind().await.map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic".to_string()
        }
    })
}

#[derive(Debug, Clone)]
pub struct BuiltinOperations {
    pub server_name: String,
    pub server_version: String,
}

impl Default for BuiltinOperations {
    fn default() -> Self {
        Self { server_name: env!("CARGO_PKG_NAME").to_string(), server_version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

impl OperationHandler for BuiltinOperations {
    fn call(&self, call: OperationCall) -> BoxFuture<'static, Result<Value, OperationError>> {
        let name = self.server_name.clone();
        let version = self.server_version.clone();
        async move {
            match call.method.as_str() {
                "initialize" => {
                    call.log.log("info", &format!("session initialized for {}", call.identity.role().as_str()));
                    Ok(serde_json::json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": { "tools": {}, "logging": {} },
                        "serverInfo": { "name": name, "version": version }
                    }))
                }
                "ping" => Ok(serde_json::json!({})),
                "tools/list" => Ok(serde_json::json!({ "tools": [] })),
                m if m.starts_with("notifications/") => Ok(Value::Null),
                other => Err(OperationError::method_not_found(other)),
            }
        }
        .boxed()
    }
}
