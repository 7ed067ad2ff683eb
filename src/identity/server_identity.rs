//! The server's own backend identity.
//!
//! Resolution order: explicit credentials from configuration, then the stored
//! credential file, then a freshly minted account. After a successful login a
//! single refresh task runs: it sleeps, refreshes, and sleeps again for as long
//! as the identity stays authenticated. The task stays in its slot while a
//! cycle is in flight, so `cleanup` can always cancel it.
//!
//! Nothing here returns an error to the caller. Every failure lands in
//! `ServerAuthState::error` with `authenticated == false`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::backend::{AuthBackend, AuthSession};
use super::context::IdentityContext;
use super::credentials::{CredentialStore, StoredCredentials};

/// Refresh this long before the access token expires.
pub const REFRESH_MARGIN_SECS: i64 = 300;
/// Never arm the timer for less than this.
pub const MIN_REFRESH_DELAY_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitIdentity {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerAuthState {
    pub authenticated: bool,
    pub session: Option<AuthSession>,
    pub using_explicit_identity: bool,
    pub error: Option<String>,
}

impl ServerAuthState {
    fn failed(using_explicit_identity: bool, msg: impl Into<String>) -> Self {
        Self { authenticated: false, session: None, using_explicit_identity, error: Some(msg.into()) }
    }
}

/// Delay before the next refresh: `max(secs_until_expiry - 300, 60)` seconds.
pub fn refresh_delay(expires_at: i64, now: i64) -> Duration {
    let secs = (expires_at - now - REFRESH_MARGIN_SECS).max(MIN_REFRESH_DELAY_SECS);
    Duration::from_secs(secs as u64)
}

struct ResolvedCredentials {
    email: String,
    password: String,
    explicit: bool,
}

pub struct ServerIdentityManager {
    backend: Arc<dyn AuthBackend>,
    store: CredentialStore,
    explicit: Option<ExplicitIdentity>,
    elevated_key: Option<String>,
    state: Mutex<ServerAuthState>,
    // Credentials in use, kept for the refresh fallback login.
    active: Mutex<Option<ResolvedCredentials>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ServerIdentityManager {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: CredentialStore,
        explicit: Option<ExplicitIdentity>,
        elevated_key: Option<String>,
    ) -> Self {
        Self {
            backend,
            store,
            explicit,
            elevated_key,
            state: Mutex::new(ServerAuthState::default()),
            active: Mutex::new(None),
            refresh_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ServerAuthState { self.state.lock().clone() }

    pub fn is_authenticated(&self) -> bool { self.state.lock().authenticated }

    /// Identity the server acts as when no caller identity is present.
    pub fn identity_context(&self) -> Option<IdentityContext> {
        let st = self.state.lock();
        if !st.authenticated { return None; }
        let s = st.session.as_ref()?;
        Some(IdentityContext::user(s.user_id.clone(), s.email.clone(), None, s.access_token.clone(), s.expires_at))
    }

    /// Resolve credentials, log in and arm the refresh timer.
    pub async fn initialize(self: &Arc<Self>) -> ServerAuthState {
        let creds = match self.resolve_credentials().await {
            Ok(c) => c,
            Err(msg) => {
                error!(target: "server_identity", error = %msg, "could not resolve server credentials; continuing unauthenticated");
                let st = ServerAuthState::failed(self.explicit.is_some(), msg);
                *self.state.lock() = st.clone();
                return st;
            }
        };
        let st = self.login(creds).await;
        if let Some(session) = &st.session {
            self.schedule_refresh(session.expires_at);
        }
        st
    }

    async fn resolve_credentials(&self) -> Result<ResolvedCredentials, String> {
        if let Some(ex) = &self.explicit {
            info!(target: "server_identity", email = %ex.email, "using explicit server identity");
            return Ok(ResolvedCredentials { email: ex.email.clone(), password: ex.password.clone(), explicit: true });
        }
        if let Some(stored) = self.store.load() {
            info!(target: "server_identity", email = %stored.email, path = %self.store.path().display(), "using stored server identity");
            return Ok(ResolvedCredentials { email: stored.email, password: stored.password, explicit: false });
        }
        let minted = self.mint_account().await?;
        Ok(ResolvedCredentials { email: minted.email, password: minted.password, explicit: false })
    }

    async fn mint_account(&self) -> Result<StoredCredentials, String> {
        let mut creds = StoredCredentials::generate().map_err(|e| format!("failed to generate credentials: {}", e))?;
        info!(target: "server_identity", email = %creds.email, "creating server account");
        let outcome = self
            .backend
            .sign_up(&creds.email, &creds.password)
            .await
            .map_err(|e| format!("account creation failed: {}", e))?;
        creds.user_id = outcome.user_id.clone();

        if outcome.session.is_none() {
            match (&self.elevated_key, &outcome.user_id) {
                (Some(key), Some(uid)) => {
                    if let Err(e) = self.backend.admin_confirm_user(uid, key).await {
                        warn!(target: "server_identity", error = %e, "auto-confirm of server account failed");
                    } else {
                        info!(target: "server_identity", user_id = %uid, "server account confirmed");
                    }
                }
                _ => warn!(target: "server_identity", "server account may need confirmation; no elevated key configured"),
            }
        }

        self.store.save(&creds).map_err(|e| format!("failed to persist server credentials: {}", e))?;
        Ok(creds)
    }

    async fn login(&self, creds: ResolvedCredentials) -> ServerAuthState {
        let explicit = creds.explicit;
        let result = self.backend.sign_in_with_password(&creds.email, &creds.password).await;
        let st = match result {
            Ok(session) => {
                info!(target: "server_identity", user_id = %session.user_id, expires_at = session.expires_at, "server identity authenticated");
                *self.active.lock() = Some(creds);
                ServerAuthState { authenticated: true, session: Some(session), using_explicit_identity: explicit, error: None }
            }
            Err(e) => {
                if explicit {
                    error!(target: "server_identity", error = %e, "login with explicit server identity failed; fix the configured credentials");
                } else {
                    error!(target: "server_identity", error = %e, "login with stored server identity failed; discarding stored credentials");
                    // After cleanup the process is going away; leave the file alone.
                    if !self.stopped.load(Ordering::SeqCst) {
                        self.store.delete();
                    }
                }
                *self.active.lock() = None;
                ServerAuthState::failed(explicit, format!("login failed: {}", e))
            }
        };
        *self.state.lock() = st.clone();
        st
    }

    /// Arm the refresh task, replacing (and cancelling) any pending one.
    pub fn schedule_refresh(self: &Arc<Self>, expires_at: i64) {
        let first = refresh_delay(expires_at, chrono::Utc::now().timestamp());
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut slot = self.refresh_task.lock();
        // Checked under the slot lock; `cleanup` sets the flag under the same lock.
        if self.stopped.load(Ordering::SeqCst) { return; }
        let handle = tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::time::sleep(delay).await;
                let Some(mgr) = weak.upgrade() else { return; };
                let st = mgr.refresh_cycle().await;
                let Some(session) = st.session else { return; };
                delay = refresh_delay(session.expires_at, chrono::Utc::now().timestamp());
                info!(target: "server_identity", delay_secs = delay.as_secs(), "server token refresh scheduled");
            }
        });
        info!(target: "server_identity", delay_secs = first.as_secs(), "server token refresh scheduled");
        if let Some(prev) = slot.replace(handle) {
            prev.abort();
        }
    }

    /// Run one refresh cycle now and re-arm the timer on success.
    pub async fn refresh_now(self: &Arc<Self>) -> ServerAuthState {
        let st = self.refresh_cycle().await;
        if let Some(session) = &st.session {
            self.schedule_refresh(session.expires_at);
        }
        st
    }

    /// Refresh-token exchange, falling back to a full login. Never re-arms.
    async fn refresh_cycle(&self) -> ServerAuthState {
        let refresh_token = self.state.lock().session.as_ref().map(|s| s.refresh_token.clone());
        if let Some(rt) = refresh_token {
            match self.backend.refresh_session(&rt).await {
                Ok(session) => {
                    info!(target: "server_identity", expires_at = session.expires_at, "server token refreshed");
                    let mut guard = self.state.lock();
                    guard.authenticated = true;
                    guard.session = Some(session);
                    guard.error = None;
                    return guard.clone();
                }
                Err(e) => warn!(target: "server_identity", error = %e, "token refresh failed; falling back to login"),
            }
        }

        let creds = self.active.lock().take();
        let Some(creds) = creds else {
            let st = ServerAuthState::failed(self.explicit.is_some(), "refresh failed and no credentials available for login");
            *self.state.lock() = st.clone();
            return st;
        };
        self.login(creds).await
    }

    pub fn has_pending_refresh(&self) -> bool {
        self.refresh_task.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Cancel the pending refresh. Call on shutdown.
    pub fn cleanup(&self) {
        let pending = {
            let mut slot = self.refresh_task.lock();
            self.stopped.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(handle) = pending {
            handle.abort();
            info!(target: "server_identity", "server token refresh cancelled");
        }
    }
}

impl Drop for ServerIdentityManager {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_task.get_mut().take() {
            handle.abort();
        }
    }
}
