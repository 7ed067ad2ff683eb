//! Server identity lifecycle against an in-memory auth backend: bootstrap,
//! credential persistence, login failure handling and refresh fallback.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use regex::Regex;
use tempfile::tempdir;
use tokio::sync::Notify;

use tollgate::identity::{
    refresh_delay, AuthBackend, AuthSession, BackendError, CredentialStore, ExplicitIdentity, ServerIdentityManager,
    SignUpOutcome, StoredCredentials,
};

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, String>,
    unconfirmed: HashSet<String>,
    refresh_owner: HashMap<String, String>,
    issued: u32,
    sign_ups: u32,
    confirms: u32,
    fail_sign_up: bool,
    fail_refresh: bool,
    require_confirmation: bool,
}

#[derive(Default)]
struct MockBackend {
    state: Mutex<MockState>,
    // When set, password logins wait here before answering.
    login_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockBackend {
    fn with_account(email: &str, password: &str) -> Arc<Self> {
        let b = Self::default();
        b.state.lock().accounts.insert(email.to_string(), password.to_string());
        Arc::new(b)
    }

    fn issue(st: &mut MockState, email: &str) -> AuthSession {
        st.issued += 1;
        let refresh_token = format!("refresh-{}", st.issued);
        st.refresh_owner.insert(refresh_token.clone(), email.to_string());
        AuthSession {
            access_token: format!("access-{}", st.issued),
            refresh_token,
            user_id: format!("user-{}", email),
            email: Some(email.to_string()),
            expires_at: chrono::Utc::now().timestamp() + 3600,
        }
    }
}

fn rejected(message: &str) -> BackendError { BackendError::Rejected { status: 400, message: message.to_string() } }

impl AuthBackend for MockBackend {
    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<SignUpOutcome, BackendError>> {
        async move {
            let mut st = self.state.lock();
            st.sign_ups += 1;
            if st.fail_sign_up {
                return Err(BackendError::Transport("connection refused".into()));
            }
            st.accounts.insert(email.to_string(), password.to_string());
            let user_id = Some(format!("user-{}", email));
            if st.require_confirmation {
                st.unconfirmed.insert(email.to_string());
                return Ok(SignUpOutcome { user_id, session: None });
            }
            let session = Self::issue(&mut st, email);
            Ok(SignUpOutcome { user_id, session: Some(session) })
        }
        .boxed()
    }

    fn sign_in_with_password<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>> {
        async move {
            let gate = self.login_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let mut st = self.state.lock();
            if st.accounts.get(email).map(String::as_str) != Some(password) {
                return Err(rejected("Invalid login credentials"));
            }
            if st.unconfirmed.contains(email) {
                return Err(rejected("Email not confirmed"));
            }
            Ok(Self::issue(&mut st, email))
        }
        .boxed()
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>> {
        async move {
            let mut st = self.state.lock();
            if st.fail_refresh {
                return Err(rejected("Invalid Refresh Token"));
            }
            let email = st.refresh_owner.remove(refresh_token).ok_or_else(|| rejected("Invalid Refresh Token"))?;
            Ok(Self::issue(&mut st, &email))
        }
        .boxed()
    }

    fn admin_confirm_user<'a>(&'a self, user_id: &'a str, _service_key: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            let mut st = self.state.lock();
            st.confirms += 1;
            let email = user_id.trim_start_matches("user-").to_string();
            st.unconfirmed.remove(&email);
            Ok(())
        }
        .boxed()
    }
}

fn manager(backend: Arc<MockBackend>, path: PathBuf, explicit: Option<ExplicitIdentity>, key: Option<&str>) -> Arc<ServerIdentityManager> {
    Arc::new(ServerIdentityManager::new(backend, CredentialStore::new(path), explicit, key.map(str::to_string)))
}

#[tokio::test]
async fn bootstrap_mints_and_persists_a_private_account() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("tollgate");
    let path = dir.join("credentials.json");
    let backend = Arc::new(MockBackend::default());

    let mgr = manager(backend.clone(), path.clone(), None, None);
    let st = mgr.initialize().await;
    assert!(st.authenticated, "{:?}", st.error);
    assert!(!st.using_explicit_identity);
    assert!(mgr.has_pending_refresh());

    let stored = CredentialStore::new(&path).load().unwrap();
    let email_re = Regex::new(r"^tollgate-server-[0-9a-f]{16}@tollgate\.local$").unwrap();
    assert!(email_re.is_match(&stored.email), "{}", stored.email);
    assert!(stored.password.len() >= 40);
    assert_eq!(stored.user_id.as_deref(), Some(format!("user-{}", stored.email).as_str()));
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let ctx = mgr.identity_context().unwrap();
    assert_eq!(ctx.subject_id(), format!("user-{}", stored.email));

    mgr.cleanup();
    assert!(!mgr.has_pending_refresh());

    // A second start reuses the stored account instead of minting another.
    let again = manager(backend.clone(), path.clone(), None, None);
    assert!(again.initialize().await.authenticated);
    assert_eq!(backend.state.lock().sign_ups, 1);
    again.cleanup();
}

#[tokio::test]
async fn explicit_identity_is_never_written_or_deleted() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let backend = MockBackend::with_account("ops@example.com", "right");

    let good = ExplicitIdentity { email: "ops@example.com".into(), password: "right".into() };
    let mgr = manager(backend.clone(), path.clone(), Some(good), None);
    let st = mgr.initialize().await;
    assert!(st.authenticated);
    assert!(st.using_explicit_identity);
    assert!(!path.exists());
    mgr.cleanup();

    // A stored file from an earlier run survives a failed explicit login.
    let stored = StoredCredentials::generate().unwrap();
    CredentialStore::new(&path).save(&stored).unwrap();
    let bad = ExplicitIdentity { email: "ops@example.com".into(), password: "wrong".into() };
    let mgr = manager(backend.clone(), path.clone(), Some(bad), None);
    let st = mgr.initialize().await;
    assert!(!st.authenticated);
    assert!(st.using_explicit_identity);
    assert!(st.error.is_some());
    assert!(path.exists());
    assert!(mgr.identity_context().is_none());
    assert!(!mgr.has_pending_refresh());
}

#[tokio::test]
async fn failed_login_with_stored_credentials_discards_them() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let stale = StoredCredentials::generate().unwrap();
    CredentialStore::new(&path).save(&stale).unwrap();

    let backend = Arc::new(MockBackend::default());
    let mgr = manager(backend.clone(), path.clone(), None, None);
    let st = mgr.initialize().await;
    assert!(!st.authenticated);
    assert!(st.error.unwrap().contains("login failed"));
    assert!(!path.exists());
    assert_eq!(backend.state.lock().sign_ups, 0);
}

#[tokio::test]
async fn refresh_failure_falls_back_to_login() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let backend = Arc::new(MockBackend::default());
    let mgr = manager(backend.clone(), path.clone(), None, None);
    let first = mgr.initialize().await.session.unwrap();

    let refreshed = mgr.refresh_now().await;
    assert!(refreshed.authenticated);
    let second = refreshed.session.unwrap();
    assert_ne!(first.access_token, second.access_token);
    assert_eq!(second.user_id, first.user_id);

    backend.state.lock().fail_refresh = true;
    let st = mgr.refresh_now().await;
    assert!(st.authenticated, "{:?}", st.error);
    let third = st.session.unwrap();
    assert_ne!(second.access_token, third.access_token);
    assert_eq!(third.user_id, first.user_id);
    assert!(path.exists());
    assert!(mgr.has_pending_refresh());
    mgr.cleanup();
    assert!(!mgr.has_pending_refresh());
}

#[tokio::test]
async fn refresh_without_any_credentials_stays_unauthenticated() {
    let tmp = tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    backend.state.lock().fail_sign_up = true;
    let mgr = manager(backend, tmp.path().join("credentials.json"), None, None);
    assert!(!mgr.initialize().await.authenticated);
    let st = mgr.refresh_now().await;
    assert!(!st.authenticated);
    assert!(st.error.is_some());
}

#[tokio::test]
async fn sign_up_failure_leaves_server_unauthenticated() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let backend = Arc::new(MockBackend::default());
    backend.state.lock().fail_sign_up = true;

    let mgr = manager(backend, path.clone(), None, None);
    let st = mgr.initialize().await;
    assert!(!st.authenticated);
    assert!(st.error.unwrap().contains("account creation failed"));
    assert!(!path.exists());
    assert!(!mgr.is_authenticated());
}

#[tokio::test]
async fn unconfirmed_account_is_confirmed_with_elevated_key() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let backend = Arc::new(MockBackend::default());
    backend.state.lock().require_confirmation = true;

    let mgr = manager(backend.clone(), path.clone(), None, Some("service-key"));
    let st = mgr.initialize().await;
    assert!(st.authenticated, "{:?}", st.error);
    assert_eq!(backend.state.lock().confirms, 1);
    mgr.cleanup();

    // Without the key the account stays unconfirmed and login fails.
    let tmp2 = tempdir().unwrap();
    let path2 = tmp2.path().join("credentials.json");
    let mgr = manager(backend.clone(), path2.clone(), None, None);
    let st = mgr.initialize().await;
    assert!(!st.authenticated);
    assert_eq!(backend.state.lock().confirms, 1);
    assert!(!path2.exists());
}

#[tokio::test]
async fn cleanup_prevents_any_later_rearm() {
    let tmp = tempdir().unwrap();
    let backend = Arc::new(MockBackend::default());
    let mgr = manager(backend, tmp.path().join("credentials.json"), None, None);
    assert!(mgr.initialize().await.authenticated);
    assert!(mgr.has_pending_refresh());

    mgr.cleanup();
    assert!(!mgr.has_pending_refresh());
    mgr.schedule_refresh(chrono::Utc::now().timestamp() + 3600);
    assert!(!mgr.has_pending_refresh());
    let st = mgr.refresh_now().await;
    assert!(st.authenticated);
    assert!(!mgr.has_pending_refresh());
}

#[tokio::test]
async fn cleanup_during_inflight_login_leaves_stored_credentials() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("credentials.json");
    let backend = Arc::new(MockBackend::default());
    let mgr = manager(backend.clone(), path.clone(), None, None);
    assert!(mgr.initialize().await.authenticated);
    assert!(path.exists());

    // Refresh fails and the fallback login will be rejected once it proceeds.
    let gate = Arc::new(Notify::new());
    {
        let mut st = backend.state.lock();
        st.fail_refresh = true;
        st.accounts.clear();
    }
    *backend.login_gate.lock() = Some(gate.clone());

    let inflight = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.refresh_now().await })
    };
    tokio::task::yield_now().await;
    mgr.cleanup();
    gate.notify_one();

    let st = inflight.await.unwrap();
    assert!(!st.authenticated);
    assert!(path.exists());
    assert!(!mgr.has_pending_refresh());
}

#[test]
fn refresh_delay_keeps_margin_and_floor() {
    let now = 1_700_000_000;
    assert_eq!(refresh_delay(now + 3600, now).as_secs(), 3300);
    assert_eq!(refresh_delay(now + 360, now).as_secs(), 60);
    assert_eq!(refresh_delay(now + 100, now).as_secs(), 60);
    assert_eq!(refresh_delay(now - 10, now).as_secs(), 60);
}
