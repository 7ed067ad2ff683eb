//! Stateless bearer-token verification.
//!
//! A `TokenValidator` turns an `Authorization` header into an `IdentityContext`.
//! Only HS256 with a single shared secret is accepted. Tokens whose `role` claim
//! is `anon` or `service_role` short-circuit to a role identity; everything else
//! must be an `authenticated` audience token with a subject.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::context::{IdentityContext, Role};

const BEARER_PREFIX: &str = "bearer ";
const USER_AUDIENCE: &str = "authenticated";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("no verification secret configured")]
    MissingSecret,
    #[error("missing authorization header")]
    MissingHeader,
    #[error("authorization header is not 'Bearer <token>'")]
    MalformedHeader,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token verification failed: {0}")]
    Invalid(String),
    #[error("missing subject claim")]
    MissingSubject,
    #[error("wrong audience: {0:?}")]
    WrongAudience(Option<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::One(a) => a == aud,
            Audience::Many(list) => list.iter().any(|a| a == aud),
        }
    }

    fn describe(&self) -> String {
        match self {
            Audience::One(a) => a.clone(),
            Audience::Many(list) => list.join(","),
        }
    }
}

/// Claims the validator looks at; unknown claims are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").field("algorithm", &Algorithm::HS256).finish_non_exhaustive()
    }
}

impl TokenValidator {
    pub fn new(secret: &str) -> Result<Self, TokenError> {
        if secret.trim().is_empty() {
            return Err(TokenError::MissingSecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // Audience depends on the role claim, so it is checked after decoding.
        validation.validate_aud = false;
        Ok(Self { key: DecodingKey::from_secret(secret.as_bytes()), validation })
    }

    /// Validate a raw `Authorization` header value.
    pub fn validate(&self, header: Option<&str>) -> Result<IdentityContext, TokenError> {
        let header = header.ok_or(TokenError::MissingHeader)?;
        let token = parse_bearer(header)?;
        self.validate_token(token)
    }

    /// Validate a bare token (no `Bearer` prefix).
    pub fn validate_token(&self, token: &str) -> Result<IdentityContext, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::ImmatureSignature => TokenError::NotYetValid,
            other => TokenError::Invalid(format!("{:?}", other)),
        })?;
        let claims = data.claims;

        if let Some(role) = claims.role.as_deref().and_then(Role::from_non_user) {
            return Ok(IdentityContext::for_role(role, token, claims.exp));
        }

        match &claims.aud {
            Some(aud) if aud.contains(USER_AUDIENCE) => {}
            Some(aud) => return Err(TokenError::WrongAudience(Some(aud.describe()))),
            None => return Err(TokenError::WrongAudience(None)),
        }
        let subject = match claims.sub {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Err(TokenError::MissingSubject),
        };
        Ok(IdentityContext::user(subject, claims.email, claims.session_id, token, claims.exp))
    }
}

fn parse_bearer(header: &str) -> Result<&str, TokenError> {
    let header = header.trim();
    let scheme_ok = header
        .get(..BEARER_PREFIX.len())
        .map(|s| s.eq_ignore_ascii_case(BEARER_PREFIX))
        .unwrap_or(false);
    if !scheme_ok {
        return Err(TokenError::MalformedHeader);
    }
    let token = header[BEARER_PREFIX.len()..].trim();
    if token.is_empty() || token.contains(' ') {
        return Err(TokenError::MalformedHeader);
    }
    Ok(token)
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod token_tests;
