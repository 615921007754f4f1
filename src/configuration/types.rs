use serde::Deserialize;
use std::path::PathBuf;

fn default_listen_address() -> String {
    String::from("0.0.0.0")
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("keys/ssh_host_ed25519_key")
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_provider() -> String {
    String::from("openai")
}

fn default_model() -> String {
    String::from("gpt-4o-mini")
}

fn default_endpoint() -> String {
    String::from("https://api.openai.com/v1/chat/completions")
}

fn default_summary_timeout_secs() -> u64 {
    60
}

/// Listening side of the proxy.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    pub port: u16,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    /// Longest wait for the upstream's answer to a client request. Counted from the moment
    /// the request arrives, so it includes the upstream dial of a fresh channel.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Authentication methods understood by both the inbound credential check and the upstream
/// connector.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthKind {
    Password,
    PublicKey,
}

/// A credential as written in the configuration file. `kind` is kept as text so an unknown
/// method is reported by validation instead of failing the whole parse.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct AuthConfig {
    pub kind: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl AuthConfig {
    pub fn password(password: &str) -> Self {
        Self {
            kind: String::from("password"),
            password: Some(password.to_string()),
            key_path: None,
        }
    }

    pub fn public_key(key_path: PathBuf) -> Self {
        Self {
            kind: String::from("publickey"),
            password: None,
            key_path: Some(key_path),
        }
    }

    pub fn method(&self) -> Option<AuthKind> {
        match self.kind.as_str() {
            "password" => Some(AuthKind::Password),
            "publickey" => Some(AuthKind::PublicKey),
            _ => None,
        }
    }
}

/// How the upstream host's identity is checked before authenticating to it.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// OpenSSH known_hosts file; `None` means `~/.ssh/known_hosts`.
    KnownHosts {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// Pinned `SHA256:<base64>` fingerprint.
    Fingerprint { sha256: String },
    /// No verification at all. Logged on every connection.
    AcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts { path: None }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub host_key: HostKeyPolicy,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// One entry of the inbound credential set.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub auth: AuthConfig,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
        }
    }
}

/// Post-session transcript analysis through a chat-completion endpoint.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct SummaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_summary_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            api_key: String::new(),
            model: default_model(),
            endpoint: default_endpoint(),
            timeout_secs: default_summary_timeout_secs(),
        }
    }
}
