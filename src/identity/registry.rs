//! In-memory table of live caller sessions.
//!
//! One `parking_lot::Mutex` guards the whole map; every critical section is a
//! plain map operation, so callers never hold the lock across an await point.
//! Capacity limits are a soft operational guard checked under the same lock as
//! the insert.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::context::IdentityContext;

pub const DEFAULT_MAX_SESSIONS: usize = 1000;
pub const DEFAULT_MAX_SESSIONS_PER_OWNER: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub max_sessions_per_owner: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_sessions_per_owner: DEFAULT_MAX_SESSIONS_PER_OWNER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityScope {
    Global,
    Owner,
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityScope::Global => write!(f, "server"),
            CapacityScope::Owner => write!(f, "caller"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session limit reached ({limit} per {scope})")]
    CapacityExceeded { scope: CapacityScope, limit: usize },
    #[error("session id already registered: {0}")]
    DuplicateSession(String),
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub session_id: String,
    pub identity: IdentityContext,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn owner(&self) -> &str { self.identity.subject_id() }
}

/// Called with every session the sweep or `shutdown` drops, after the lock is released.
pub type EvictionListener = Arc<dyn Fn(&ClientSession) + Send + Sync>;

/// 256-bit random session id, base64url without padding.
pub fn new_session_id() -> Result<String, getrandom::Error> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: Mutex<HashMap<String, ClientSession>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    on_evict: Mutex<Option<EvictionListener>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            on_evict: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig { &self.config }

    pub fn set_eviction_listener(&self, listener: EvictionListener) {
        *self.on_evict.lock() = Some(listener);
    }

    pub fn create(&self, session_id: &str, identity: IdentityContext) -> Result<ClientSession, RegistryError> {
        let now = Utc::now();
        let mut map = self.sessions.lock();
        if map.len() >= self.config.max_sessions {
            return Err(RegistryError::CapacityExceeded { scope: CapacityScope::Global, limit: self.config.max_sessions });
        }
        let owned = map.values().filter(|s| s.identity.same_owner(&identity)).count();
        if owned >= self.config.max_sessions_per_owner {
            return Err(RegistryError::CapacityExceeded { scope: CapacityScope::Owner, limit: self.config.max_sessions_per_owner });
        }
        if map.contains_key(session_id) {
            return Err(RegistryError::DuplicateSession(session_id.to_string()));
        }
        let session = ClientSession {
            session_id: session_id.to_string(),
            identity,
            created_at: now,
            last_activity_at: now,
        };
        map.insert(session_id.to_string(), session.clone());
        let total = map.len();
        drop(map);
        info!(target: "session", sid = %session_id, owner = %session.owner(), total, "session.create");
        Ok(session)
    }

    /// Lookup that counts as activity.
    pub fn get(&self, session_id: &str) -> Option<ClientSession> {
        let mut map = self.sessions.lock();
        let entry = map.get_mut(session_id)?;
        entry.last_activity_at = Utc::now();
        Some(entry.clone())
    }

    /// Lookup without touching activity; used for ownership checks and introspection.
    pub fn peek(&self, session_id: &str) -> Option<ClientSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn update_identity(&self, session_id: &str, identity: IdentityContext) -> bool {
        let mut map = self.sessions.lock();
        match map.get_mut(session_id) {
            Some(entry) => {
                entry.identity = identity;
                entry.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id).is_some();
        if removed {
            info!(target: "session", sid = %session_id, "session.remove");
        }
        removed
    }

    pub fn list_by_owner(&self, subject_id: &str) -> Vec<ClientSession> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.owner() == subject_id)
            .cloned()
            .collect()
    }

    pub fn active_session_count(&self) -> usize { self.sessions.lock().len() }

    pub fn sweep(&self) -> usize { self.sweep_at(Utc::now()) }

    /// Drop every session whose token has expired or that has been idle past the threshold.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let idle = chrono::Duration::from_std(self.config.idle_timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let now_unix = now.timestamp();
        let evicted: Vec<ClientSession> = {
            let mut map = self.sessions.lock();
            let stale: Vec<String> = map
                .values()
                .filter(|s| s.identity.is_expired_at(now_unix) || now.signed_duration_since(s.last_activity_at) > idle)
                .map(|s| s.session_id.clone())
                .collect();
            stale.iter().filter_map(|id| map.remove(id)).collect()
        };
        if !evicted.is_empty() {
            info!(target: "session", removed = evicted.len(), "session.sweep");
            self.notify_evicted(&evicted);
        }
        evicted.len()
    }

    /// Spawn the periodic sweep. The task holds only a weak reference, so it ends
    /// on its own once the registry is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() { return; }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break; };
                let removed = registry.sweep();
                debug!(target: "session", removed, "sweep tick");
            }
        }));
    }

    /// Cancel the sweep and drop every session. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let evicted: Vec<ClientSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if !evicted.is_empty() {
            info!(target: "session", cleared = evicted.len(), "session registry shut down");
            self.notify_evicted(&evicted);
        }
    }

    fn notify_evicted(&self, evicted: &[ClientSession]) {
        let listener = self.on_evict.lock().clone();
        if let Some(listener) = listener {
            for s in evicted { listener(s); }
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
