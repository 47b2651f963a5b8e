//! Target hosts and credential references
//!
//! Handles:
//! - Host identity (name, address, port) and the probe set to run on it
//! - Credential references resolved once per host per cycle
//! - Secure password lookup (environment or OS keyring)
//! - SSH key files and ssh-agent authentication

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default SSH port when the host entry does not set one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Named probe scripts known to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeId {
    ServerMetrics,
    UserActivity,
}

impl ProbeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeId::ServerMetrics => "server_metrics",
            ProbeId::UserActivity => "user_activity",
        }
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote machine configured for periodic collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHost {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub credential: CredentialRef,
    #[serde(default = "default_probes")]
    pub probes: Vec<ProbeId>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_probes() -> Vec<ProbeId> {
    vec![ProbeId::ServerMetrics, ProbeId::UserActivity]
}

impl TargetHost {
    pub fn runs(&self, probe: ProbeId) -> bool {
        self.probes.contains(&probe)
    }
}

/// Where the credentials of a host come from (never the secret itself)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Password stored in an environment variable
    Env { username: String, password_env: String },
    /// Password stored in the OS keyring, account defaults to the host name
    Keyring {
        username: String,
        service: String,
        account: Option<String>,
    },
    /// Private key file, `~/` is expanded against the home directory
    KeyFile { username: String, path: PathBuf },
    /// Keys offered by a running ssh-agent
    Agent { username: String },
}

impl CredentialRef {
    pub fn username(&self) -> &str {
        match self {
            CredentialRef::Env { username, .. }
            | CredentialRef::Keyring { username, .. }
            | CredentialRef::KeyFile { username, .. }
            | CredentialRef::Agent { username } => username,
        }
    }
}

/// Credential lookup failures; always fatal for the host concerned
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CredentialError {
    #[error("empty username")]
    EmptyUsername,
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("environment variable {0} is empty")]
    EmptyEnv(String),
    #[error("keyring lookup failed for {service}/{account}: {reason}")]
    Keyring {
        service: String,
        account: String,
        reason: String,
    },
    #[error("key file {0} does not exist")]
    MissingKeyFile(PathBuf),
}

/// Password that never shows up in logs
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Authentication method ready to hand to the SSH client
#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Password(Secret),
    KeyFile(PathBuf),
    Agent,
}

/// Host identity plus resolved credentials, built once per host per cycle
#[derive(Debug, Clone)]
pub struct Session {
    pub host: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
}

impl Session {
    /// `user@address` destination for the SSH client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

/// Resolve the host's credential reference into a session
pub fn resolve_session(host: &TargetHost) -> Result<Session, CredentialError> {
    let username = host.credential.username().trim();
    if username.is_empty() {
        return Err(CredentialError::EmptyUsername);
    }

    let auth = match &host.credential {
        CredentialRef::Env { password_env, .. } => {
            let value = std::env::var(password_env)
                .map_err(|_| CredentialError::MissingEnv(password_env.clone()))?;
            if value.is_empty() {
                return Err(CredentialError::EmptyEnv(password_env.clone()));
            }
            Auth::Password(Secret::new(value))
        }
        CredentialRef::Keyring {
            service, account, ..
        } => {
            let account = account.clone().unwrap_or_else(|| host.name.clone());
            Auth::Password(load_keyring_password(service, &account)?)
        }
        CredentialRef::KeyFile { path, .. } => {
            let path = expand_home(path);
            if !path.exists() {
                return Err(CredentialError::MissingKeyFile(path));
            }
            Auth::KeyFile(path)
        }
        CredentialRef::Agent { .. } => Auth::Agent,
    };

    Ok(Session {
        host: host.name.clone(),
        address: host.address.clone(),
        port: host.port,
        username: username.to_string(),
        auth,
    })
}

/// Load password from secure OS keyring
fn load_keyring_password(service: &str, account: &str) -> Result<Secret, CredentialError> {
    let keyring_error = |reason: String| CredentialError::Keyring {
        service: service.to_string(),
        account: account.to_string(),
        reason,
    };
    let entry = Entry::new(service, account).map_err(|e| keyring_error(e.to_string()))?;
    let password = entry
        .get_password()
        .map_err(|e| keyring_error(e.to_string()))?;
    if password.is_empty() {
        return Err(keyring_error("stored password is empty".to_string()));
    }
    Ok(Secret::new(password))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
