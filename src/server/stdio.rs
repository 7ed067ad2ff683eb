//! Local mode: newline-delimited JSON-RPC over stdin/stdout, executed as the
//! server's own identity. No caller sessions are involved.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use super::jsonrpc::{self, Envelope};
use super::operations::{call_catching_panics, LogSink, OperationCall, OperationHandler};
use crate::error::{JSONRPC_INTERNAL, JSONRPC_UNAUTHORIZED};
use crate::identity::{IdentityContext, ServerIdentityManager};

pub async fn serve(
    server_identity: Arc<ServerIdentityManager>,
    operations: Arc<dyn OperationHandler>,
    workspace_path: PathBuf,
) -> anyhow::Result<()> {
    info!(target: "startup", "serving JSON-RPC on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() { continue; }
        // Re-read per line so a refreshed token is picked up.
        let identity = server_identity.identity_context();
        for out in handle_line(identity, operations.as_ref(), &workspace_path, &line).await {
            write_message(&mut stdout, &out).await?;
        }
    }
    info!(target: "startup", "stdin closed; stopping");
    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Value) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(msg).map_err(std::io::Error::other)?;
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await
}

/// Answers for one input line, in order. Notifications produce nothing.
/// `identity` is `None` while the server identity is unavailable.
pub async fn handle_line(
    identity: Option<IdentityContext>,
    operations: &dyn OperationHandler,
    workspace_path: &std::path::Path,
    line: &str,
) -> Vec<Value> {
    let envelope = match Envelope::parse(line.as_bytes()) {
        Ok(e) => e,
        Err(e) => {
            warn!(target: "transport", error = %e, "unparseable stdio message");
            return vec![jsonrpc::error(Value::Null, jsonrpc::PARSE_ERROR, "Parse error")];
        }
    };
    let mut out = Vec::new();
    for msg in envelope.messages {
        let Some(method) = msg.method else { continue; };
        let Some(identity) = identity.clone() else {
            if let Some(id) = msg.id {
                out.push(jsonrpc::error(id, JSONRPC_UNAUTHORIZED, "Server identity unavailable"));
            }
            continue;
        };
        let call = OperationCall {
            identity,
            session_id: None,
            method: method.clone(),
            params: msg.params,
            workspace_path: workspace_path.to_path_buf(),
            log: LogSink::detached(),
        };
        let outcome = call_catching_panics(operations, call).await;
        let Some(id) = msg.id else { continue; };
        out.push(match outcome {
            Ok(Ok(v)) => jsonrpc::result(id, v),
            Ok(Err(e)) => jsonrpc::error(id, e.code, &e.message),
            Err(what) => {
                error!(target: "panic", method = %method, "operation panic: {}", what);
                jsonrpc::error(id, JSONRPC_INTERNAL, "Internal server error")
            }
        });
    }
    out
}
