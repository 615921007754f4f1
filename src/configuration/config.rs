use super::types::*;
use crate::error_handling::types::ConfigError;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Application configuration structure that defines all runtime parameters.
///
/// The configuration is read from a TOML file and validated once at startup; every component
/// receives the part it needs as an owned or shared read-only copy.
///
/// # Fields Overview
///
/// - `server`: listening address, port and host key location of the proxy itself
/// - `upstream`: the single host every session is re-originated against, with the credential
/// the proxy presents to it and the host key policy applied to it
/// - `users`: ordered credential set checked when clients authenticate
/// - `logging`: directory receiving one transcript file per session
/// - `summary`: optional post-session transcript analysis
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use tamis::configuration::config::Config;
///
/// let config = Config::from_file(Path::new("configs/config.toml")).unwrap();
/// println!("Upstream: {}:{}", config.upstream.host, config.upstream.port);
/// ```
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::IoError`] if the file cannot be read
    /// - [`ConfigError::TomlError`] if it is not valid TOML or misses required tables
    /// - any validation error returned by [`Config::validate`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the semantic constraints serde cannot express.
    ///
    /// Upstream host, username and credential must be present, at least one user must be
    /// configured, usernames must be unique and every credential must carry the field its
    /// method requires.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::NotInRange(format!(
                "invalid listen address: {}",
                self.server.listen_address
            )));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "server.request_timeout_secs must be at least 1",
            )));
        }

        if self.upstream.host.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from("upstream.host")));
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::NotInRange(String::from(
                "upstream.port must be between 1 and 65535",
            )));
        }
        if self.upstream.username.is_empty() {
            return Err(ConfigError::MissingField(String::from("upstream.username")));
        }
        validate_auth("upstream", &self.upstream.auth)?;

        if let HostKeyPolicy::Fingerprint { sha256 } = &self.upstream.host_key {
            validate_fingerprint(sha256)?;
        }

        if self.users.is_empty() {
            return Err(ConfigError::MissingField(String::from("users")));
        }
        let mut seen = HashSet::new();
        for user in &self.users {
            if user.username.is_empty() {
                return Err(ConfigError::MissingField(String::from("users.username")));
            }
            if !seen.insert(user.username.as_str()) {
                return Err(ConfigError::DuplicateUser(user.username.clone()));
            }
            validate_auth(&format!("user {}", user.username), &user.auth)?;
        }

        if self.logging.directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingField(String::from("logging.directory")));
        }

        if self.summary.enabled && self.summary.provider != "openai" {
            return Err(ConfigError::UnsupportedAuth(format!(
                "summary provider {}",
                self.summary.provider
            )));
        }

        Ok(())
    }
}

fn validate_auth(owner: &str, auth: &AuthConfig) -> Result<(), ConfigError> {
    match auth.method() {
        Some(AuthKind::Password) => match &auth.password {
            Some(p) if !p.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingField(format!("{}: password", owner))),
        },
        Some(AuthKind::PublicKey) => match &auth.key_path {
            Some(p) if !p.as_os_str().is_empty() => Ok(()),
            _ => Err(ConfigError::MissingField(format!("{}: key_path", owner))),
        },
        None => Err(ConfigError::UnsupportedAuth(format!(
            "{}: {}",
            owner, auth.kind
        ))),
    }
}

fn validate_fingerprint(value: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(r"^SHA256:[A-Za-z0-9+/]{43}=?$")
        .map_err(|e| ConfigError::BadFingerprint(e.to_string()))?;
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::BadFingerprint(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[server]
port = 2222
host_key_path = "keys/host"

[upstream]
host = "10.0.0.12"
username = "ops"
[upstream.auth]
kind = "password"
password = "secret"

[[users]]
username = "alice"
[users.auth]
kind = "password"
password = "p@ss"

[[users]]
username = "bob"
[users.auth]
kind = "publickey"
key_path = "keys/bob.pub"

[logging]
directory = "/var/log/tamis"
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap_or_else(|e| panic!("{}", e));

        assert_eq!(config.server.listen_address, "0.0.0.0");
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.upstream.port, 22);
        assert_eq!(config.upstream.connect_timeout_secs, 10);
        assert_eq!(config.upstream.host_key, HostKeyPolicy::KnownHosts { path: None });
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users[0].auth.method(), Some(AuthKind::Password));
        assert_eq!(
            config.users[1].auth.key_path,
            Some(PathBuf::from("keys/bob.pub"))
        );
        assert_eq!(config.logging.directory, PathBuf::from("/var/log/tamis"));
        assert!(!config.summary.enabled);
        assert_eq!(config.summary.provider, "openai");
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.upstream.host, "10.0.0.12");
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/tamis.toml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_host_key_policies() {
        let fingerprint = SAMPLE.replace(
            "[upstream.auth]",
            "[upstream.host_key]\nmode = \"fingerprint\"\nsha256 = \"SHA256:uNiVztksCsDhcc0u9e8BujQXVUpKZIDTMczCvj3tD2s\"\n[upstream.auth]",
        );
        let config = Config::from_toml_str(&fingerprint).unwrap();
        assert!(matches!(
            config.upstream.host_key,
            HostKeyPolicy::Fingerprint { .. }
        ));

        let accept_any = SAMPLE.replace(
            "[upstream.auth]",
            "[upstream.host_key]\nmode = \"accept-any\"\n[upstream.auth]",
        );
        let config = Config::from_toml_str(&accept_any).unwrap();
        assert_eq!(config.upstream.host_key, HostKeyPolicy::AcceptAny);
    }

    #[test]
    fn test_bad_fingerprint_rejected() {
        let bad = SAMPLE.replace(
            "[upstream.auth]",
            "[upstream.host_key]\nmode = \"fingerprint\"\nsha256 = \"MD5:aa:bb\"\n[upstream.auth]",
        );
        assert!(matches!(
            Config::from_toml_str(&bad),
            Err(ConfigError::BadFingerprint(_))
        ));
    }

    #[test]
    fn test_no_users_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.users.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        let alice = config.users[0].clone();
        config.users.push(alice);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateUser(name)) if name == "alice"
        ));
    }

    #[test]
    fn test_unsupported_auth_kind_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.upstream.auth.kind = String::from("keyboard-interactive");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedAuth(_))
        ));
    }

    #[test]
    fn test_missing_credential_fields_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.upstream.auth.password = None;
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.users[1].auth.key_path = None;
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_upstream_required_fields() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.upstream.host = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.upstream.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.server.listen_address = String::from("not-an-ip");
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.server.request_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_toml_error() {
        assert!(matches!(
            Config::from_toml_str("[server\nport = 1"),
            Err(ConfigError::TomlError(_))
        ));
    }
}
