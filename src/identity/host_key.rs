//! Server identity.
//!
//! The proxy presents one Ed25519 host key, kept in OpenSSH format at the configured path.
//! A missing file is generated once and written owner-only; an existing file that cannot be
//! parsed is an error and is left untouched.

use std::path::Path;

use log::{info, warn};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{HashAlg, PrivateKey};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error_handling::types::IdentityError;

pub async fn load_or_generate(path: &Path) -> Result<PrivateKey, IdentityError> {
    if fs::try_exists(path).await? {
        let key = russh::keys::load_secret_key(path, None).map_err(|e| {
            IdentityError::KeyError(format!("unable to load {}: {}", path.display(), e))
        })?;
        info!(
            "Loaded host key {} ({})",
            path.display(),
            key.public_key().fingerprint(HashAlg::Sha256)
        );
        return Ok(key);
    }

    warn!(
        "No host key at {}, generating a new Ed25519 key",
        path.display()
    );
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| IdentityError::KeyError(e.to_string()))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| IdentityError::KeyError(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(encoded.as_bytes()).await?;
    file.sync_all().await?;

    info!(
        "Saved host key to {} ({})",
        path.display(),
        key.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(key)
}
