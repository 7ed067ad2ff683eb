//! Client for the backend identity provider (GoTrue-style auth API).
//!
//! `AuthBackend` is object safe so the identity manager can hold an
//! `Arc<dyn AuthBackend>` and tests can swap in an in-memory double.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub email: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user_id: Option<String>,
    /// Absent when the provider requires email confirmation first.
    pub session: Option<AuthSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("auth backend unreachable: {0}")]
    Transport(String),
    #[error("auth backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected auth backend response: {0}")]
    Malformed(String),
}

pub trait AuthBackend: Send + Sync {
    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<SignUpOutcome, BackendError>>;

    fn sign_in_with_password<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>>;

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>>;

    /// Mark the account confirmed using an elevated (service role) key.
    fn admin_confirm_user<'a>(&'a self, user_id: &'a str, service_key: &'a str) -> BoxFuture<'a, Result<(), BackendError>>;
}

#[derive(Debug, Deserialize)]
struct UserRecord {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<UserRecord>,
}

impl TokenResponse {
    fn into_session(self) -> Result<AuthSession, BackendError> {
        let user = self.user.ok_or_else(|| BackendError::Malformed("token response without user".into()))?;
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp() + self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
        Ok(AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user_id: user.id,
            email: user.email,
            expires_at,
        })
    }
}

pub struct HttpAuthBackend {
    base: Url,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpAuthBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        // Url::join replaces the last segment unless the base ends in '/'.
        let base = if base_url.ends_with('/') { Url::parse(base_url)? } else { Url::parse(&format!("{}/", base_url))? };
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base, client, api_key })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base.join(path).map_err(|e| BackendError::Malformed(format!("bad url {}: {}", path, e)))
    }

    fn with_api_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.header("apikey", k),
            None => req,
        }
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, BackendError> {
        let resp = self.with_api_key(req).send().await.map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            return Err(BackendError::Rejected { status: status.as_u16(), message: error_message(status, &body) });
        }
        Ok(body)
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<AuthSession, BackendError> {
        let mut url = self.url("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let val = self.send_json(self.client.post(url).json(&body)).await?;
        let tok: TokenResponse = serde_json::from_value(val).map_err(|e| BackendError::Malformed(e.to_string()))?;
        tok.into_session()
    }
}

fn error_message(status: StatusCode, body: &serde_json::Value) -> String {
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string())
}

impl AuthBackend for HttpAuthBackend {
    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<SignUpOutcome, BackendError>> {
        async move {
            let url = self.url("auth/v1/signup")?;
            let val = self
                .send_json(self.client.post(url).json(&serde_json::json!({"email": email, "password": password})))
                .await?;
            // With autoconfirm the provider returns a session; otherwise just the user.
            if val.get("access_token").is_some() {
                let tok: TokenResponse = serde_json::from_value(val).map_err(|e| BackendError::Malformed(e.to_string()))?;
                let session = tok.into_session()?;
                return Ok(SignUpOutcome { user_id: Some(session.user_id.clone()), session: Some(session) });
            }
            let user_id = val
                .get("id")
                .or_else(|| val.get("user").and_then(|u| u.get("id")))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Ok(SignUpOutcome { user_id, session: None })
        }
        .boxed()
    }

    fn sign_in_with_password<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>> {
        self.token_grant("password", serde_json::json!({"email": email, "password": password})).boxed()
    }

    fn refresh_session<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<AuthSession, BackendError>> {
        self.token_grant("refresh_token", serde_json::json!({"refresh_token": refresh_token})).boxed()
    }

    fn admin_confirm_user<'a>(&'a self, user_id: &'a str, service_key: &'a str) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            let url = self.url(&format!("auth/v1/admin/users/{}", user_id))?;
            let req = self
                .client
                .put(url)
                .bearer_auth(service_key)
                .header("apikey", service_key)
                .json(&serde_json::json!({"email_confirm": true}));
            // Service key doubles as apikey here, so skip the anon key.
            let resp = req.send().await.map_err(|e| BackendError::Transport(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
                return Err(BackendError::Rejected { status: status.as_u16(), message: error_message(status, &body) });
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_prefers_absolute_expiry() {
        let tok: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "a", "refresh_token": "r", "expires_in": 3600, "expires_at": 1_900_000_000,
            "user": {"id": "u1", "email": "e@x.y"}
        }))
        .unwrap();
        let s = tok.into_session().unwrap();
        assert_eq!(s.expires_at, 1_900_000_000);
        assert_eq!(s.user_id, "u1");
        assert_eq!(s.email.as_deref(), Some("e@x.y"));
    }

    #[test]
    fn token_response_falls_back_to_relative_expiry() {
        let tok: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "a", "refresh_token": "r", "expires_in": 120, "user": {"id": "u1"}
        }))
        .unwrap();
        let before = chrono::Utc::now().timestamp();
        let s = tok.into_session().unwrap();
        assert!(s.expires_at >= before + 120 && s.expires_at <= before + 121);
    }

    #[test]
    fn token_response_without_user_is_malformed() {
        let tok: TokenResponse = serde_json::from_value(serde_json::json!({"access_token": "a", "refresh_token": "r"})).unwrap();
        assert!(matches!(tok.into_session(), Err(BackendError::Malformed(_))));
    }

    #[test]
    fn error_message_picks_known_fields() {
        let body = serde_json::json!({"error": "invalid_grant", "error_description": "Invalid login credentials"});
        assert_eq!(error_message(StatusCode::BAD_REQUEST, &body), "Invalid login credentials");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, &serde_json::Value::Null), "Bad Gateway");
    }

    #[test]
    fn urls_join_under_base() {
        let b = HttpAuthBackend::new("http://127.0.0.1:54321/", None).unwrap();
        assert_eq!(b.url("auth/v1/signup").unwrap().as_str(), "http://127.0.0.1:54321/auth/v1/signup");
    }
}
