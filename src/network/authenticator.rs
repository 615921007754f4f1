//! Inbound credential check against the static user set.
//!
//! Both entry points return the detailed reason on failure so it can be logged, while the
//! protocol layer only ever turns it into the same generic rejection.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use russh::keys::ssh_key::AuthorizedKeys;
use russh::keys::PublicKey;

use crate::configuration::{AuthKind, UserEntry};
use crate::error_handling::types::AuthError;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    users: Arc<Vec<UserEntry>>,
}

impl Authenticator {
    pub fn new(users: Vec<UserEntry>) -> Self {
        Self {
            users: Arc::new(users),
        }
    }

    pub fn verify_password(
        &self,
        username: &str,
        password: &str,
        peer: SocketAddr,
    ) -> Result<AuthenticatedUser, AuthError> {
        let result = self.check_password(username, password);
        log_outcome("password", username, peer, &result);
        result
    }

    pub fn verify_public_key(
        &self,
        username: &str,
        key: &PublicKey,
        peer: SocketAddr,
    ) -> Result<AuthenticatedUser, AuthError> {
        let result = self.check_public_key(username, key);
        log_outcome("publickey", username, peer, &result);
        result
    }

    fn lookup(&self, username: &str, method: AuthKind) -> Result<&UserEntry, AuthError> {
        let entry = self
            .users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| AuthError::UnknownUser(username.to_string()))?;

        if entry.auth.method() != Some(method) {
            return Err(AuthError::MethodMismatch(username.to_string()));
        }
        Ok(entry)
    }

    fn check_password(&self, username: &str, password: &str) -> Result<AuthenticatedUser, AuthError> {
        let entry = self.lookup(username, AuthKind::Password)?;
        match &entry.auth.password {
            Some(expected) if expected == password => Ok(AuthenticatedUser {
                username: entry.username.clone(),
            }),
            _ => Err(AuthError::BadCredential(username.to_string())),
        }
    }

    fn check_public_key(
        &self,
        username: &str,
        key: &PublicKey,
    ) -> Result<AuthenticatedUser, AuthError> {
        let entry = self.lookup(username, AuthKind::PublicKey)?;
        let path = entry
            .auth
            .key_path
            .as_deref()
            .ok_or_else(|| AuthError::KeyFile(format!("no key_path for {}", username)))?;

        if authorized_keys_contain(path, key)? {
            Ok(AuthenticatedUser {
                username: entry.username.clone(),
            })
        } else {
            Err(AuthError::BadCredential(username.to_string()))
        }
    }
}

/// Reads an authorized-keys style file and looks for `key`, comparing the key material only.
/// One unreadable line invalidates the whole file.
fn authorized_keys_contain(path: &Path, key: &PublicKey) -> Result<bool, AuthError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AuthError::KeyFile(format!("{}: {}", path.display(), e)))?;

    let mut found = false;
    for entry in AuthorizedKeys::new(&content) {
        let entry = entry.map_err(|e| AuthError::KeyFile(format!("{}: {}", path.display(), e)))?;
        if entry.public_key().key_data() == key.key_data() {
            found = true;
        }
    }
    Ok(found)
}

fn log_outcome(
    method: &str,
    username: &str,
    peer: SocketAddr,
    result: &Result<AuthenticatedUser, AuthError>,
) {
    match result {
        Ok(_) => debug!("{} authenticated {} via {}", peer, username, method),
        Err(e) => warn!(
            "{} failed {} authentication as {}: {}",
            peer, method, username, e
        ),
    }
}
