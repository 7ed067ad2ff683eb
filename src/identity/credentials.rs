//! On-disk store for the server's own backend identity.
//!
//! A single JSON document `{email, password, userId?, createdAt}` at a fixed
//! per-user path. The file is created owner-read/write only; the password is
//! stored in clear and protected by those permissions alone.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const GENERATED_EMAIL_PREFIX: &str = "tollgate-server-";
pub const GENERATED_EMAIL_DOMAIN: &str = "tollgate.local";
const LOCAL_ID_BYTES: usize = 8;
const PASSWORD_BYTES: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredCredentials {
    /// Fresh random identity material; nothing is persisted.
    pub fn generate() -> Result<Self, CredentialError> {
        Ok(Self {
            email: generated_email(&generate_local_id()?),
            password: generate_password()?,
            user_id: None,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file io at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("credential serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("random source unavailable: {0}")]
    Random(String),
}

/// Default location: `$XDG_CONFIG_HOME/tollgate/credentials.json`, falling back to `$HOME/.config`.
pub fn default_credentials_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")).map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("tollgate").join("credentials.json")
}

fn random_bytes<const N: usize>() -> Result<[u8; N], CredentialError> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| CredentialError::Random(e.to_string()))?;
    Ok(buf)
}

/// 16 lowercase hex chars.
pub fn generate_local_id() -> Result<String, CredentialError> {
    use std::fmt::Write as _;
    let bytes = random_bytes::<LOCAL_ID_BYTES>()?;
    let mut out = String::with_capacity(LOCAL_ID_BYTES * 2);
    for b in &bytes { let _ = write!(&mut out, "{:02x}", b); }
    Ok(out)
}

/// 384-bit secret, base64url (64 chars).
pub fn generate_password() -> Result<String, CredentialError> {
    let bytes = random_bytes::<PASSWORD_BYTES>()?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

pub fn generated_email(local_id: &str) -> String {
    format!("{}{}@{}", GENERATED_EMAIL_PREFIX, local_id, GENERATED_EMAIL_DOMAIN)
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn has(&self) -> bool { self.path.is_file() }

    /// Returns `None` when the file is absent, unreadable or incomplete. Never fails.
    pub fn load(&self) -> Option<StoredCredentials> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "credentials", path = %self.path.display(), error = %e, "failed to read stored credentials");
                return None;
            }
        };
        match serde_json::from_slice::<StoredCredentials>(&bytes) {
            Ok(c) if !c.email.trim().is_empty() && !c.password.is_empty() => Some(c),
            Ok(_) => {
                warn!(target: "credentials", path = %self.path.display(), "stored credentials missing email or password; ignoring");
                None
            }
            Err(e) => {
                warn!(target: "credentials", path = %self.path.display(), error = %e, "stored credentials malformed; ignoring");
                None
            }
        }
    }

    /// Write the credentials owner-only. Errors are returned, never swallowed.
    pub fn save(&self, creds: &StoredCredentials) -> Result<(), CredentialError> {
        let io_err = |source: std::io::Error| CredentialError::Io { path: self.path.clone(), source };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(creds)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = open_private(&tmp).map_err(io_err)?;
            f.write_all(&body).map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        restrict_permissions(&self.path).map_err(io_err)?;
        info!(target: "credentials", path = %self.path.display(), email = %creds.email, "stored server credentials");
        Ok(())
    }

    /// Best effort; failures are logged.
    pub fn delete(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(target: "credentials", path = %self.path.display(), "deleted stored credentials"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "credentials", path = %self.path.display(), error = %e, "failed to delete stored credentials"),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() { return Ok(()); }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> { fs::create_dir_all(dir) }

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> { Ok(()) }

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod credentials_tests;
