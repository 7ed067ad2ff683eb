//! Startup configuration: CLI flags override environment variables, which
//! override defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::identity::{default_credentials_path, ExplicitIdentity, RegistryConfig};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";

pub const USAGE: &str = "tollgate\n\nUSAGE:\n  tollgate [--host H] [--port N] [--jwt-secret S] [--backend-url URL] [--credentials PATH] [--workspace PATH] [--stdio]\n\nOPTIONS:\n  --host H             Bind address (env: TOLLGATE_HOST, default 127.0.0.1)\n  --port N             HTTP port (env: TOLLGATE_PORT, default 8080)\n  --jwt-secret S       Bearer token verification secret (env: TOLLGATE_JWT_SECRET, required)\n  --backend-url URL    Backend auth API base (env: TOLLGATE_BACKEND_URL, default http://127.0.0.1:54321)\n  --credentials PATH   Stored server credentials file (env: TOLLGATE_CREDENTIALS_PATH)\n  --workspace PATH     Workspace handed to operations (env: TOLLGATE_WORKSPACE, default cwd)\n  --stdio              Serve JSON-RPC on stdin/stdout as the server identity (env: TOLLGATE_STDIO)\n\nENVIRONMENT:\n  TOLLGATE_ANON_KEY, TOLLGATE_SERVICE_ROLE_KEY, TOLLGATE_SERVER_EMAIL, TOLLGATE_SERVER_PASSWORD,\n  TOLLGATE_MAX_SESSIONS, TOLLGATE_MAX_SESSIONS_PER_OWNER, TOLLGATE_SESSION_IDLE_SECS, TOLLGATE_SWEEP_INTERVAL_SECS\n";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub backend_url: String,
    pub anon_key: Option<String>,
    pub service_role_key: Option<String>,
    pub explicit_identity: Option<ExplicitIdentity>,
    pub credentials_path: PathBuf,
    pub workspace_path: PathBuf,
    pub registry: RegistryConfig,
    pub stdio: bool,
}

impl ServerConfig {
    pub fn from_env_and_args(args: &[String]) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().filter(|(k, _)| k.starts_with("TOLLGATE_")).collect();
        Self::resolve(args, &env)
    }

    /// Pure resolution over an explicit environment map.
    pub fn resolve(args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let env_str = |name: &str| env.get(name).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let jwt_secret = arg_value(args, "--jwt-secret")
            .or_else(|| env_str("TOLLGATE_JWT_SECRET"))
            .ok_or_else(|| anyhow!("a token verification secret is required (--jwt-secret or TOLLGATE_JWT_SECRET)"))?;

        let host = arg_value(args, "--host").or_else(|| env_str("TOLLGATE_HOST")).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match arg_value(args, "--port").or_else(|| env_str("TOLLGATE_PORT")) {
            Some(p) => p.parse::<u16>().with_context(|| format!("invalid port: {}", p))?,
            None => DEFAULT_PORT,
        };
        let backend_url = arg_value(args, "--backend-url")
            .or_else(|| env_str("TOLLGATE_BACKEND_URL"))
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let explicit_identity = match (env_str("TOLLGATE_SERVER_EMAIL"), env.get("TOLLGATE_SERVER_PASSWORD").filter(|s| !s.is_empty())) {
            (Some(email), Some(password)) => Some(ExplicitIdentity { email, password: password.clone() }),
            (None, None) => None,
            _ => return Err(anyhow!("TOLLGATE_SERVER_EMAIL and TOLLGATE_SERVER_PASSWORD must be set together")),
        };

        let credentials_path = arg_value(args, "--credentials")
            .or_else(|| env_str("TOLLGATE_CREDENTIALS_PATH"))
            .map(PathBuf::from)
            .unwrap_or_else(default_credentials_path);
        let workspace_path = match arg_value(args, "--workspace").or_else(|| env_str("TOLLGATE_WORKSPACE")) {
            Some(p) => PathBuf::from(p),
            None => std::env::current_dir().context("cannot determine current directory")?,
        };

        let defaults = RegistryConfig::default();
        let registry = RegistryConfig {
            max_sessions: parse_env(env, "TOLLGATE_MAX_SESSIONS")?.unwrap_or(defaults.max_sessions),
            max_sessions_per_owner: parse_env(env, "TOLLGATE_MAX_SESSIONS_PER_OWNER")?.unwrap_or(defaults.max_sessions_per_owner),
            idle_timeout: parse_env::<u64>(env, "TOLLGATE_SESSION_IDLE_SECS")?.map(Duration::from_secs).unwrap_or(defaults.idle_timeout),
            sweep_interval: parse_env::<u64>(env, "TOLLGATE_SWEEP_INTERVAL_SECS")?
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        };

        let stdio = has_flag(args, "--stdio") || env_str("TOLLGATE_STDIO").and_then(|v| parse_bool(&v)).unwrap_or(false);

        Ok(Self {
            host,
            port,
            jwt_secret,
            backend_url,
            anon_key: env_str("TOLLGATE_ANON_KEY"),
            service_role_key: env_str("TOLLGATE_SERVICE_ROLE_KEY"),
            explicit_identity,
            credentials_path,
            workspace_path,
            registry,
            stdio,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

pub fn has_flag(args: &[String], flag: &str) -> bool { args.iter().any(|a| a == flag) }

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).filter(|v| !v.starts_with("--")).cloned();
        }
        if let Some(v) = args[i].strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(v.to_string());
        }
        i += 1;
    }
    None
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(env: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    match env.get(name).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(v) => v.parse::<T>().map(Some).map_err(|_| anyhow!("invalid value for {}: {}", name, v)),
        None => Ok(None),
    }
}
