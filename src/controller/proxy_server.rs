//! Proxy server lifecycle.
//!
//! ```text
//!          start()            shutdown()                 all sessions done
//!  Idle ─────────────▶ Running ───────────▶ Stopping ─────────────────────▶ Stopped
//!    │                                                                        ▲
//!    └── shutdown(): no-op                          start(): ServerStopped ───┘
//! ```
//!
//! A `shutdown()` that arrives while `start()` is still binding waits for the start to settle:
//! a server that came up is then stopped, one that failed to start stays `Idle`.
//!
//! `shutdown()` closes the listening socket, stops admitting new session channels and waits
//! for every running session to tear down. Sessions are never cancelled. Callers arriving while
//! another shutdown is in progress wait for the same completion.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use russh::server;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::analysis::SessionSummarizer;
use crate::configuration::config::Config;
use crate::error_handling::types::NetworkError;
use crate::identity;
use crate::network::authenticator::Authenticator;
use crate::network::network_listener::NetworkListener;
use crate::session_management::session::SessionContext;
use crate::session_management::session_tracker::SessionTracker;
use crate::upstream::UpstreamDialer;

const AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    state: ServerState,
    starting: bool,
    local_addr: Option<SocketAddr>,
    stop: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

pub struct ProxyServer {
    config: Config,
    dialer: Arc<dyn UpstreamDialer>,
    summarizer: Arc<dyn SessionSummarizer>,
    tracker: SessionTracker,
    inner: Mutex<Inner>,
    phase: watch::Sender<ServerState>,
}

impl ProxyServer {
    pub fn new(
        config: Config,
        dialer: Arc<dyn UpstreamDialer>,
        summarizer: Arc<dyn SessionSummarizer>,
    ) -> Self {
        let (phase, _) = watch::channel(ServerState::Idle);
        Self {
            config,
            dialer,
            summarizer,
            tracker: SessionTracker::new(),
            inner: Mutex::new(Inner {
                state: ServerState::Idle,
                starting: false,
                local_addr: None,
                stop: None,
                accept_task: None,
            }),
            phase,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Number of sessions currently relaying or tearing down.
    pub fn active_sessions(&self) -> usize {
        self.tracker.active()
    }

    /// Loads the host identity, binds the listening socket and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when port 0 was
    /// requested.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::AlreadyRunning`] if the server is running, stopping or starting
    /// - [`NetworkError::ServerStopped`] once the server has been shut down
    /// - [`NetworkError::Identity`] if the host key cannot be loaded or generated
    /// - [`NetworkError::BindError`] if the listening address is invalid or unavailable
    pub async fn start(&self) -> Result<SocketAddr, NetworkError> {
        {
            let mut inner = self.lock();
            match inner.state {
                ServerState::Idle if !inner.starting => inner.starting = true,
                ServerState::Idle | ServerState::Running | ServerState::Stopping => {
                    return Err(NetworkError::AlreadyRunning)
                }
                ServerState::Stopped => return Err(NetworkError::ServerStopped),
            }
        }

        match self.bind_and_spawn().await {
            Ok(local) => {
                info!("Proxy listening on {}", local);
                Ok(local)
            }
            Err(e) => {
                self.lock().starting = false;
                self.phase.send_replace(ServerState::Idle);
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(&self) -> Result<SocketAddr, NetworkError> {
        let key = identity::load_or_generate(&self.config.server.host_key_path).await?;

        let ip: IpAddr = self.config.server.listen_address.parse().map_err(|_| {
            NetworkError::BindError(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address {}", self.config.server.listen_address),
            ))
        })?;
        let listener = TcpListener::bind(SocketAddr::new(ip, self.config.server.port))
            .await
            .map_err(NetworkError::BindError)?;
        let local = listener.local_addr().map_err(NetworkError::BindError)?;

        let ssh_config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: None,
            ..Default::default()
        });
        let context = Arc::new(SessionContext {
            dialer: Arc::clone(&self.dialer),
            log_directory: self.config.logging.directory.clone(),
            summarizer: Arc::clone(&self.summarizer),
        });
        let network_listener = NetworkListener::new(
            listener,
            ssh_config,
            Authenticator::new(self.config.users.clone()),
            context,
            self.tracker.clone(),
            Duration::from_secs(self.config.server.request_timeout_secs),
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(network_listener.run(stop_rx));

        let mut inner = self.lock();
        inner.starting = false;
        inner.state = ServerState::Running;
        inner.local_addr = Some(local);
        inner.stop = Some(stop_tx);
        inner.accept_task = Some(accept_task);
        drop(inner);
        self.phase.send_replace(ServerState::Running);

        Ok(local)
    }

    async fn wait_for_start(&self) {
        let mut phase = self.phase.subscribe();
        loop {
            let starting = self.lock().starting;
            if !starting || phase.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops the server and waits for every session to finish. Never fails.
    pub async fn shutdown(&self) {
        self.wait_for_start().await;

        let (stop, accept_task) = {
            let mut inner = self.lock();
            match inner.state {
                ServerState::Idle | ServerState::Stopped => return,
                ServerState::Stopping => (None, None),
                ServerState::Running => {
                    inner.state = ServerState::Stopping;
                    (Some(inner.stop.take()), inner.accept_task.take())
                }
            }
        };

        let Some(stop) = stop else {
            let mut phase = self.phase.subscribe();
            let _ = phase.wait_for(|s| *s == ServerState::Stopped).await;
            return;
        };

        self.phase.send_replace(ServerState::Stopping);
        info!("Shutting down proxy");

        self.tracker.close();
        if let Some(tx) = stop {
            let _ = tx.send(());
        }
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        let active = self.tracker.active();
        if active > 0 {
            info!("Waiting for {} session(s) to finish", active);
        }
        self.tracker.wait_idle().await;

        {
            let mut inner = self.lock();
            inner.state = ServerState::Stopped;
            inner.local_addr = None;
        }
        self.phase.send_replace(ServerState::Stopped);
        info!("Proxy stopped");
    }
}
