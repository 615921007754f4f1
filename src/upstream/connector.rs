//! Dials the configured upstream host.
//!
//! Every session gets its own transport: connect, verify the host key against the configured
//! policy, authenticate with the proxy's own upstream credential, open one session channel.
//! The client's identity never reaches the upstream host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use russh::client::{self, AuthResult};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, Disconnect};
use uuid::Uuid;

use super::{upstream_channel, DialFuture, UpstreamDialer, UpstreamLink};
use crate::configuration::types::UpstreamConfig;
use crate::configuration::{AuthKind, HostKeyPolicy};
use crate::error_handling::types::UpstreamError;

enum UpstreamAuth {
    Password(String),
    PublicKey(PathBuf),
}

pub struct UpstreamConnector {
    config: UpstreamConfig,
    auth: UpstreamAuth,
    ssh_config: Arc<client::Config>,
}

/// Host key checks for one upstream connection.
pub struct UpstreamHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.policy.accepts(&self.host, self.port, server_public_key))
    }
}

impl UpstreamConnector {
    /// Checks that the configured credential is usable in principle. The private key itself
    /// is read on every connect, so a key file that goes missing only fails the sessions that
    /// need it.
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let auth = match config.auth.method() {
            Some(AuthKind::Password) => {
                let password = config.auth.password.clone().ok_or_else(|| {
                    UpstreamError::ConfigError(String::from("upstream password is not set"))
                })?;
                UpstreamAuth::Password(password)
            }
            Some(AuthKind::PublicKey) => {
                let path = config.auth.key_path.clone().ok_or_else(|| {
                    UpstreamError::ConfigError(String::from("upstream key_path is not set"))
                })?;
                UpstreamAuth::PublicKey(path)
            }
            None => {
                return Err(UpstreamError::ConfigError(format!(
                    "unsupported authentication kind '{}'",
                    config.auth.kind
                )))
            }
        };

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        Ok(Self {
            config,
            auth,
            ssh_config,
        })
    }

    /// Connects and authenticates within the configured timeout.
    pub async fn connect(&self, session_id: Uuid) -> Result<UpstreamConnection, UpstreamError> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        debug!(
            "[{}] Connecting to upstream {}:{}",
            session_id, self.config.host, self.config.port
        );

        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(Ok(handle)) => {
                info!(
                    "[{}] Connected to upstream {}:{} as {}",
                    session_id, self.config.host, self.config.port, self.config.username
                );
                Ok(UpstreamConnection {
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UpstreamError::DialError(format!(
                "{}:{}: timed out after {}s",
                self.config.host, self.config.port, self.config.connect_timeout_secs
            ))),
        }
    }

    async fn handshake(&self) -> Result<client::Handle<UpstreamHandler>, UpstreamError> {
        // The key is read before dialing so a broken key file costs no connection.
        let credential = match &self.auth {
            UpstreamAuth::Password(password) => Credential::Password(password),
            UpstreamAuth::PublicKey(path) => Credential::Key(load_key(path).await?),
        };

        let target = format!("{}:{}", self.config.host, self.config.port);
        let handler = UpstreamHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            policy: self.config.host_key.clone(),
        };

        let mut handle = client::connect(
            Arc::clone(&self.ssh_config),
            (self.config.host.as_str(), self.config.port),
            handler,
        )
        .await
        .map_err(|e| UpstreamError::DialError(format!("{}: {}", target, e)))?;

        let result = match credential {
            Credential::Password(password) => {
                handle
                    .authenticate_password(self.config.username.as_str(), password)
                    .await
            }
            Credential::Key(key) => {
                let hash_alg = if key.algorithm().is_rsa() {
                    Some(HashAlg::Sha256)
                } else {
                    None
                };
                handle
                    .authenticate_publickey(
                        self.config.username.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
            }
        }
        .map_err(|e| UpstreamError::DialError(format!("{}: {}", target, e)))?;

        match result {
            AuthResult::Success => Ok(handle),
            AuthResult::Failure { .. } => Err(UpstreamError::DialError(format!(
                "{}: authentication as {} rejected",
                target, self.config.username
            ))),
        }
    }
}

enum Credential<'a> {
    Password(&'a str),
    Key(PrivateKey),
}

/// Reads the upstream private key off the blocking pool.
async fn load_key(path: &Path) -> Result<PrivateKey, UpstreamError> {
    let owned = path.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || russh::keys::load_secret_key(&owned, None))
        .await
        .map_err(|e| UpstreamError::KeyLoadError(format!("{}: {}", path.display(), e)))?;
    loaded.map_err(|e| UpstreamError::KeyLoadError(format!("{}: {}", path.display(), e)))
}

impl UpstreamDialer for UpstreamConnector {
    fn dial(&self, session_id: Uuid) -> DialFuture<'_> {
        Box::pin(async move {
            let mut transport = self.connect(session_id).await?;
            let channel = match transport.open_session().await {
                Ok(channel) => channel,
                Err(e) => {
                    transport.close().await;
                    return Err(e);
                }
            };
            Ok(UpstreamLink {
                channel: upstream_channel::bridge(session_id, channel),
                transport,
            })
        })
    }
}

/// An authenticated transport to the upstream host, owned by one session.
pub struct UpstreamConnection {
    handle: Option<client::Handle<UpstreamHandler>>,
}

impl UpstreamConnection {
    /// A transport with nothing behind it, for sessions whose upstream side is not SSH.
    pub fn disconnected() -> Self {
        Self { handle: None }
    }

    pub async fn open_session(&self) -> Result<Channel<client::Msg>, UpstreamError> {
        let handle = self.handle.as_ref().ok_or(UpstreamError::NotConnected)?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| UpstreamError::ChannelOpen(e.to_string()))
    }

    /// Disconnects. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!("Upstream disconnect failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::AuthConfig;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};
    use std::path::PathBuf;

    fn upstream_config(port: u16, auth: AuthConfig) -> UpstreamConfig {
        UpstreamConfig {
            host: String::from("127.0.0.1"),
            port,
            username: String::from("proxy"),
            auth,
            host_key: HostKeyPolicy::AcceptAny,
            connect_timeout_secs: 2,
        }
    }

    #[test]
    fn test_unknown_auth_kind() {
        let mut auth = AuthConfig::password("secret");
        auth.kind = String::from("keyboard-interactive");
        let result = UpstreamConnector::new(upstream_config(22, auth));
        assert!(matches!(result, Err(UpstreamError::ConfigError(_))));
    }

    #[test]
    fn test_missing_password() {
        let mut auth = AuthConfig::password("secret");
        auth.password = None;
        let result = UpstreamConnector::new(upstream_config(22, auth));
        assert!(matches!(result, Err(UpstreamError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_unreadable_key_file_fails_each_connect() {
        let auth = AuthConfig::public_key(PathBuf::from("/nonexistent/id_ed25519"));
        let connector = UpstreamConnector::new(upstream_config(22, auth)).unwrap();

        for _ in 0..2 {
            match connector.connect(Uuid::new_v4()).await {
                Err(UpstreamError::KeyLoadError(reason)) => {
                    assert!(reason.starts_with("/nonexistent/id_ed25519: "))
                }
                Err(other) => panic!("unexpected error {}", other),
                Ok(_) => panic!("connect should not succeed"),
            }
        }
    }

    #[tokio::test]
    async fn test_key_file_is_read_at_connect_time() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("id_ed25519");
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        // The key does not exist yet when the connector is built.
        let connector =
            UpstreamConnector::new(upstream_config(port, AuthConfig::public_key(path.clone())))
                .unwrap();
        assert!(matches!(
            connector.connect(Uuid::new_v4()).await,
            Err(UpstreamError::KeyLoadError(_))
        ));

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap()).unwrap();
        assert_eq!(load_key(&path).await.unwrap().public_key(), key.public_key());

        // With the key in place the connector gets as far as dialing.
        assert!(matches!(
            connector.connect(Uuid::new_v4()).await,
            Err(UpstreamError::DialError(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_dial_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector =
            UpstreamConnector::new(upstream_config(port, AuthConfig::password("secret")))
                .unwrap();

        let result = connector.dial(Uuid::new_v4()).await;
        assert!(matches!(result, Err(UpstreamError::DialError(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts the TCP connection but never speaks SSH.
        let holder = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let mut config = upstream_config(port, AuthConfig::password("secret"));
        config.connect_timeout_secs = 1;
        let connector = UpstreamConnector::new(config).unwrap();

        let result = connector.connect(Uuid::new_v4()).await;
        match result {
            Err(UpstreamError::DialError(reason)) => assert!(reason.contains("timed out")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("handshake should not succeed"),
        }
        holder.abort();
    }

    #[tokio::test]
    async fn test_disconnected_transport() {
        let mut transport = UpstreamConnection::disconnected();
        assert!(matches!(
            transport.open_session().await,
            Err(UpstreamError::NotConnected)
        ));
        transport.close().await;
        transport.close().await;
    }
}
