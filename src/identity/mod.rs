//! Caller identity, caller sessions and the server's own backend identity.
//! Keep the public surface thin and split implementation across sub-modules.

mod context;
mod token;
mod registry;
mod credentials;
mod backend;
mod server_identity;

pub use context::{Caller, IdentityContext, Role};
pub use token::{Audience, Claims, TokenError, TokenValidator};
pub use registry::{
    new_session_id, CapacityScope, ClientSession, EvictionListener, RegistryConfig, RegistryError, SessionRegistry,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_MAX_SESSIONS_PER_OWNER, DEFAULT_SWEEP_INTERVAL,
};
pub use credentials::{
    default_credentials_path, generate_local_id, generate_password, generated_email, CredentialError, CredentialStore,
    StoredCredentials, GENERATED_EMAIL_DOMAIN, GENERATED_EMAIL_PREFIX,
};
pub use backend::{AuthBackend, AuthSession, BackendError, HttpAuthBackend, SignUpOutcome};
pub use server_identity::{
    refresh_delay, ExplicitIdentity, ServerAuthState, ServerIdentityManager, MIN_REFRESH_DELAY_SECS, REFRESH_MARGIN_SECS,
};
