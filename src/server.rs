//!
//! tollgate transport coordinator
//! ------------------------------
//! Axum routes for the streaming JSON-RPC transport.
//!
//! Responsibilities:
//! - Authenticate every call from its `Authorization: Bearer` header.
//! - Create a session on `initialize`, look it up by `mcp-session-id` afterwards.
//! - Refuse to let one caller use, stream from, or terminate another caller's session.
//! - Release the session and its stream when the stream closes or the caller terminates.
//! - Map component errors to HTTP status codes (only here, via `AppError`).

use std::convert::Infallible;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::identity::{
    new_session_id, ClientSession, CredentialStore, HttpAuthBackend, IdentityContext, SessionRegistry, ServerIdentityManager,
    TokenValidator,
};

pub mod jsonrpc;
pub mod operations;
pub mod stdio;
pub mod transport;

use jsonrpc::Envelope;
use operations::{call_catching_panics, BuiltinOperations, LogSink, OperationCall, OperationHandler};
use transport::{SessionTransport, TransportTable};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const MCP_PATH: &str = "/mcp";
pub const HEALTH_PATH: &str = "/health";

/// Shared coordinator injected into all handlers.
pub struct Coordinator {
    validator: Arc<TokenValidator>,
    registry: Arc<SessionRegistry>,
    transports: Arc<TransportTable>,
    operations: Arc<dyn OperationHandler>,
    workspace_path: PathBuf,
}

impl Coordinator {
    pub fn new(
        validator: Arc<TokenValidator>,
        registry: Arc<SessionRegistry>,
        operations: Arc<dyn OperationHandler>,
        workspace_path: PathBuf,
    ) -> Arc<Self> {
        let transports = Arc::new(TransportTable::new());
        // Sessions reclaimed by the sweep or shutdown also release their stream.
        let table = transports.clone();
        registry.set_eviction_listener(Arc::new(move |s: &ClientSession| {
            if table.remove(&s.session_id).is_some() {
                info!(target: "transport", sid = %s.session_id, "transport released after eviction");
            }
        }));
        Arc::new(Self { validator, registry, transports, operations, workspace_path })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> { &self.registry }

    pub fn active_session_count(&self) -> usize { self.registry.active_session_count() }

    fn authenticate(&self, headers: &HeaderMap) -> AppResult<IdentityContext> {
        let raw = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        Ok(self.validator.validate(raw)?)
    }

    /// New transport plus registry entry. The registry insert is the stream-ready step;
    /// if it is refused the transport is never published.
    fn open_session(&self, identity: &IdentityContext) -> AppResult<Arc<SessionTransport>> {
        let sid = new_session_id().map_err(|e| {
            error!(target: "transport", error = %e, "cannot generate session id");
            AppError::internal()
        })?;
        let transport = SessionTransport::new(sid.clone());
        self.registry.create(&sid, identity.clone())?;
        self.transports.insert(transport.clone());
        Ok(transport)
    }

    /// Ownership gate shared by send, stream and terminate.
    fn resolve_session(&self, headers: &HeaderMap, identity: &IdentityContext) -> AppResult<(ClientSession, Arc<SessionTransport>)> {
        let sid = session_header(headers).ok_or_else(|| AppError::bad_request("Bad Request: No valid session ID provided"))?;
        let session = self
            .registry
            .peek(sid)
            .ok_or_else(|| AppError::bad_request("Bad Request: No valid session ID provided"))?;
        if !session.identity.same_owner(identity) {
            warn!(target: "transport", sid = %sid, owner = %session.owner(), caller = %identity.subject_id(), "session ownership mismatch");
            return Err(AppError::forbidden("Forbidden: session belongs to another caller"));
        }
        if !self.registry.update_identity(sid, identity.clone()) {
            return Err(AppError::bad_request("Bad Request: No valid session ID provided"));
        }
        let transport = self
            .transports
            .get(sid)
            .ok_or_else(|| AppError::bad_request("Bad Request: No valid session ID provided"))?;
        Ok((session, transport))
    }

    /// Drop the session and its transport. Safe to call from any close path, any number of times.
    pub fn close_session(&self, session_id: &str, reason: &str) {
        let released = self.transports.remove(session_id).is_some();
        let removed = self.registry.remove(session_id);
        if released || removed {
            info!(target: "transport", sid = %session_id, reason, "session closed");
        }
    }

    /// Drop every session and transport. Open server streams end, which lets a
    /// graceful HTTP shutdown finish. Safe to call more than once.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        let released = self.transports.clear();
        if released > 0 {
            info!(target: "transport", released, "remaining transports released");
        }
    }

    async fn dispatch(&self, envelope: Envelope, identity: IdentityContext, session_id: &str, log: LogSink) -> AppResult<Option<Value>> {
        let mut replies = Vec::new();
        for msg in envelope.messages {
            let Some(method) = msg.method.clone() else { continue; };
            let call = OperationCall {
                identity: identity.clone(),
                session_id: Some(session_id.to_string()),
                method: method.clone(),
                params: msg.params.clone(),
                workspace_path: self.workspace_path.clone(),
                log: log.clone(),
            };
            let outcome = match call_catching_panics(self.operations.as_ref(), call).await {
                Ok(r) => r,
                Err(what) => {
                    error!(target: "panic", sid = %session_id, method = %method, "operation panic: {}", what);
                    return Err(AppError::internal());
                }
            };
            let Some(id) = msg.id else { continue; };
            replies.push(match outcome {
                Ok(v) => jsonrpc::result(id, v),
                Err(e) => jsonrpc::error(id, e.code, &e.message),
            });
        }
        Ok(match (replies.len(), envelope.batch) {
            (0, _) => None,
            (_, true) => Some(Value::Array(replies)),
            (_, false) => replies.pop(),
        })
    }
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

fn reply(body: Option<Value>, session_id: Option<&str>) -> AppResult<Response> {
    let mut resp = match body {
        Some(v) => (StatusCode::OK, Json(v)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(sid) = session_id {
        let hv = HeaderValue::from_str(sid).map_err(|_| AppError::internal())?;
        resp.headers_mut().insert(SESSION_HEADER, hv);
    }
    Ok(resp)
}

/// Send-call: initialization without a session id, or any call on an owned session.
async fn post_handler(State(coord): State<Arc<Coordinator>>, headers: HeaderMap, body: Bytes) -> AppResult<Response> {
    let identity = coord.authenticate(&headers)?;
    let envelope = Envelope::parse(&body).map_err(|_| AppError::bad_request("Parse error: invalid JSON-RPC body"))?;
    if envelope.is_empty() {
        return Err(AppError::bad_request("Bad Request: empty batch"));
    }

    if session_header(&headers).is_none() {
        if !envelope.is_initialize() {
            return Err(AppError::bad_request("Bad Request: No valid session ID provided"));
        }
        let transport = coord.open_session(&identity)?;
        let sid = transport.session_id.clone();
        let body = match coord.dispatch(envelope, identity, &sid, transport.log_sink()).await {
            Ok(b) => b,
            Err(e) => {
                // The caller never learns this id, so nothing else would close it.
                coord.close_session(&sid, "initialization failed");
                return Err(e);
            }
        };
        return reply(body, Some(&sid));
    }

    let (session, transport) = coord.resolve_session(&headers, &identity)?;
    if envelope.is_initialize() {
        return Err(AppError::bad_request("Bad Request: session already initialized"));
    }
    let body = coord.dispatch(envelope, identity, &session.session_id, transport.log_sink()).await?;
    reply(body, Some(&session.session_id))
}

/// Closes the session when the server stream is dropped (caller disconnect or shutdown).
struct StreamCloseGuard {
    coord: Weak<Coordinator>,
    session_id: String,
}

impl Drop for StreamCloseGuard {
    fn drop(&mut self) {
        if let Some(coord) = self.coord.upgrade() {
            coord.close_session(&self.session_id, "stream closed");
        }
    }
}

fn event_stream(
    rx: tokio::sync::mpsc::Receiver<Value>,
    guard: StreamCloseGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let msg = rx.recv().await?;
        let event = Event::default().event("message").data(msg.to_string());
        Some((Ok(event), (rx, guard)))
    })
}

/// Open-server-stream: long-lived SSE carrying notifications for the session.
async fn get_handler(State(coord): State<Arc<Coordinator>>, headers: HeaderMap) -> AppResult<Response> {
    let identity = coord.authenticate(&headers)?;
    let (session, transport) = coord.resolve_session(&headers, &identity)?;
    let rx = transport
        .open_stream()
        .ok_or_else(|| AppError::bad_request("Bad Request: stream already open for this session"))?;
    info!(target: "transport", sid = %session.session_id, "server stream opened");
    let guard = StreamCloseGuard { coord: Arc::downgrade(&coord), session_id: session.session_id.clone() };
    let mut resp = Sse::new(event_stream(rx, guard)).keep_alive(KeepAlive::default()).into_response();
    let hv = HeaderValue::from_str(&session.session_id).map_err(|_| AppError::internal())?;
    resp.headers_mut().insert(SESSION_HEADER, hv);
    Ok(resp)
}

/// Terminate: explicit close of an owned session.
async fn delete_handler(State(coord): State<Arc<Coordinator>>, headers: HeaderMap) -> AppResult<Response> {
    let identity = coord.authenticate(&headers)?;
    let (session, _transport) = coord.resolve_session(&headers, &identity)?;
    coord.close_session(&session.session_id, "terminated by caller");
    Ok(StatusCode::OK.into_response())
}

/// Liveness; aggregate counts only.
async fn health_handler(State(coord): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "activeSessionCount": coord.active_session_count()}))
}

pub fn router(coord: Arc<Coordinator>) -> Router {
    Router::new()
        .route(MCP_PATH, get(get_handler).post(post_handler).delete(delete_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(coord)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "startup", "failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!(target: "startup", "shutdown signal received");
}

/// Serve the router on `listener` until `signal` resolves. On the signal every
/// session is torn down first, so open server streams end and the graceful
/// drain can complete.
pub async fn serve_until<F>(listener: tokio::net::TcpListener, coord: Arc<Coordinator>, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(coord.clone());
    let drain = async move {
        signal.await;
        coord.shutdown();
    };
    axum::serve(listener, app).with_graceful_shutdown(drain).await
}

/// Start the HTTP transport (or stdio mode) with everything wired from `config`.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let validator = Arc::new(TokenValidator::new(&config.jwt_secret)?);

    let backend = Arc::new(HttpAuthBackend::new(&config.backend_url, config.anon_key.clone())?);
    let server_identity = Arc::new(ServerIdentityManager::new(
        backend,
        CredentialStore::new(config.credentials_path.clone()),
        config.explicit_identity.clone(),
        config.service_role_key.clone(),
    ));
    let auth = server_identity.initialize().await;
    if auth.authenticated {
        info!(target: "startup", explicit = auth.using_explicit_identity, "server identity ready");
    } else {
        warn!(target: "startup", error = ?auth.error, "server identity unavailable; continuing in degraded mode");
    }

    let operations: Arc<dyn OperationHandler> = Arc::new(BuiltinOperations::default());

    if config.stdio {
        let result = stdio::serve(server_identity.clone(), operations, config.workspace_path.clone()).await;
        server_identity.cleanup();
        return result;
    }

    let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
    registry.start_sweeper();
    let coord = Coordinator::new(validator, registry.clone(), operations, config.workspace_path.clone());

    let addr = config.bind_addr()?;
    info!(target: "startup", "Starting server on {} (path {})", addr, MCP_PATH);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let identity = server_identity.clone();
    let served = serve_until(listener, coord, async move {
        shutdown_signal().await;
        identity.cleanup();
    })
    .await;

    registry.shutdown();
    server_identity.cleanup();
    served?;
    Ok(())
}
