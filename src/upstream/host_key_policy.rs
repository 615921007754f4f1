use log::{debug, error, warn};
use russh::keys::{HashAlg, PublicKey};

use crate::configuration::HostKeyPolicy;

impl HostKeyPolicy {
    /// Decides whether the key presented by `host:port` is trusted.
    pub fn accepts(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        match self {
            HostKeyPolicy::KnownHosts { path } => {
                let checked = match path {
                    Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
                    None => russh::keys::check_known_hosts(host, port, key),
                };
                match checked {
                    Ok(true) => {
                        debug!("Upstream host key {} found in known_hosts", fingerprint);
                        true
                    }
                    Ok(false) => {
                        warn!(
                            "Upstream {}:{} is not in known_hosts (key {}), refusing",
                            host, port, fingerprint
                        );
                        false
                    }
                    Err(e) => {
                        error!(
                            "Upstream {}:{} host key {} rejected: {}",
                            host, port, fingerprint, e
                        );
                        false
                    }
                }
            }
            HostKeyPolicy::Fingerprint { sha256 } => {
                if *sha256 == fingerprint {
                    true
                } else {
                    error!(
                        "Upstream {}:{} presented {}, expected {}",
                        host, port, fingerprint, sha256
                    );
                    false
                }
            }
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting upstream {}:{} host key {} without verification",
                    host, port, fingerprint
                );
                true
            }
        }
    }
}
