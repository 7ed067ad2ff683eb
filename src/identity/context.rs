use serde::{Deserialize, Serialize};

/// Role carried by a verified bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anon,
    Authenticated,
    ServiceRole,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::Authenticated => "authenticated",
            Role::ServiceRole => "service_role",
        }
    }

    /// Roles that stand for a non-human caller and therefore have no subject.
    pub fn from_non_user(s: &str) -> Option<Role> {
        match s {
            "anon" => Some(Role::Anon),
            "service_role" => Some(Role::ServiceRole),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User {
        subject: String,
        email: Option<String>,
        session_claim: Option<String>,
    },
    /// Service or anonymous token; the role name doubles as the subject.
    Role(Role),
}

/// Resolved identity for one inbound call. Rebuilt from the bearer token on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityContext {
    caller: Caller,
    raw_token: String,
    expires_at: i64,
}

impl IdentityContext {
    pub fn user(subject: impl Into<String>, email: Option<String>, session_claim: Option<String>, raw_token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            caller: Caller::User { subject: subject.into(), email, session_claim },
            raw_token: raw_token.into(),
            expires_at,
        }
    }

    pub fn for_role(role: Role, raw_token: impl Into<String>, expires_at: i64) -> Self {
        Self { caller: Caller::Role(role), raw_token: raw_token.into(), expires_at }
    }

    pub fn caller(&self) -> &Caller { &self.caller }

    /// User id for user tokens, the role name for role tokens.
    pub fn subject_id(&self) -> &str {
        match &self.caller {
            Caller::User { subject, .. } => subject,
            Caller::Role(role) => role.as_str(),
        }
    }

    /// Same session owner: same user subject, or same non-user role. A user whose
    /// subject happens to spell a role name never matches that role.
    pub fn same_owner(&self, other: &IdentityContext) -> bool {
        match (&self.caller, &other.caller) {
            (Caller::User { subject: a, .. }, Caller::User { subject: b, .. }) => a == b,
            (Caller::Role(a), Caller::Role(b)) => a == b,
            _ => false,
        }
    }

    pub fn role(&self) -> Role {
        match &self.caller {
            Caller::User { .. } => Role::Authenticated,
            Caller::Role(role) => *role,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match &self.caller {
            Caller::User { email, .. } => email.as_deref(),
            Caller::Role(_) => None,
        }
    }

    pub fn session_claim(&self) -> Option<&str> {
        match &self.caller {
            Caller::User { session_claim, .. } => session_claim.as_deref(),
            Caller::Role(_) => None,
        }
    }

    pub fn raw_token(&self) -> &str { &self.raw_token }

    pub fn expires_at(&self) -> i64 { self.expires_at }

    pub fn is_expired_at(&self, now_unix: i64) -> bool { self.expires_at <= now_unix }
}
