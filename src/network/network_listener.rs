//! # Network Listener Module
//!
//! This module accepts TCP connections on the proxy's listening socket and runs the SSH server
//! side of each one.
//!
//! The main components are [`NetworkListener`], which owns the bound socket and the accept
//! loop, and [`ConnectionHandler`], the per-connection `russh` handler that arbitrates
//! authentication, accepts session channels and relays their control requests to the
//! session engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌───────────────────┐    ┌──────────────┐
//! │ Incoming        │───▶│ NetworkListener  │───▶│ ConnectionHandler │───▶│ Session      │
//! │ Connections     │    │ (accept loop)    │    │ - Authenticator   │    │ (per channel)│
//! └─────────────────┘    └──────────────────┘    │ - channel bridges │    └──────────────┘
//!                                                └───────────────────┘
//! ```
//!
//! Only `session` channels are accepted. Forwarding channels and `tcpip-forward` global
//! requests are refused.
//!
//! ## Requests
//!
//! russh decodes channel requests itself and calls one handler method per known type; unknown
//! types are refused before the handler sees them. The want-reply flag of a request is not
//! passed to the handler either. It is kept per channel and consulted by
//! `channel_success`/`channel_failure`, which only write a reply when the client asked for
//! one. The flag is overwritten by the next request on the same channel, so the answer has to
//! be written before the callback returns. Requests are therefore relayed upstream with
//! want-reply set and the handler waits for the answer, at most `request_timeout`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use super::authenticator::{AuthenticatedUser, Authenticator};
use super::channel_bridge::{self, encode_modes, signal_name, ClientBridge};
use crate::error_handling::types::RequestError;
use crate::session_management::request::{
    self, ChannelRequest, EnvRequest, ExecRequest, NamedRequest, PtyRequest, WindowChange,
    X11Request,
};
use crate::session_management::session::{Session as ProxySession, SessionContext};
use crate::session_management::session_tracker::SessionTracker;

/// Accepts connections on a bound socket and hands each to its own SSH server task.
pub struct NetworkListener {
    /// Bound listening socket
    listener: TcpListener,

    /// Server configuration shared by every connection, host key included
    ssh_config: Arc<server::Config>,

    /// Credential check used during each handshake
    authenticator: Authenticator,

    /// Collaborators handed to every session
    context: Arc<SessionContext>,

    /// Counts running sessions and refuses new ones once the server stops
    tracker: SessionTracker,

    /// Longest wait for a session's answer to a client request
    request_timeout: Duration,
}

impl NetworkListener {
    /// Creates a new `NetworkListener` around an already bound socket.
    ///
    /// # Arguments
    ///
    /// * `listener` - The bound TCP listener
    /// * `ssh_config` - russh server configuration carrying the host key
    /// * `authenticator` - Inbound credential check
    /// * `context` - Shared session collaborators (upstream dialer, transcript directory,
    ///   summarizer)
    /// * `tracker` - Session tracker shared with the owning server
    /// * `request_timeout` - Longest wait for the answer to a client request
    pub fn new(
        listener: TcpListener,
        ssh_config: Arc<server::Config>,
        authenticator: Authenticator,
        context: Arc<SessionContext>,
        tracker: SessionTracker,
        request_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            ssh_config,
            authenticator,
            context,
            tracker,
            request_timeout,
        }
    }

    /// Runs the accept loop until `stop` fires or its sender is dropped.
    ///
    /// Accept errors and failed handshakes are logged and never end the loop. Connections that
    /// are already established keep running after the loop exits.
    ///
    /// # Arguments
    ///
    /// * `stop` - Stop signal; the listening socket is closed when this returns
    pub async fn run(self, mut stop: oneshot::Receiver<()>) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("<unknown>"));
        info!("Accepting SSH connections on {}", local);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Incoming connection from {}", peer);
                        let handler = ConnectionHandler::new(
                            peer,
                            self.authenticator.clone(),
                            Arc::clone(&self.context),
                            self.tracker.clone(),
                            self.request_timeout,
                        );
                        tokio::spawn(serve_connection(
                            Arc::clone(&self.ssh_config),
                            stream,
                            peer,
                            handler,
                        ));
                    }
                    Err(e) => warn!("Accept error on {}: {}", local, e),
                },
            }
        }

        info!("Stopped accepting connections on {}", local);
    }
}

async fn serve_connection(
    config: Arc<server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: ConnectionHandler,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Unable to set TCP_NODELAY for {}: {}", peer, e);
    }

    match server::run_stream(config, stream, handler).await {
        Ok(running) => match running.await {
            Ok(()) => debug!("Connection from {} closed", peer),
            Err(e) => info!("Connection from {} ended: {}", peer, e),
        },
        Err(e) => warn!("SSH handshake with {} failed: {}", peer, e),
    }
}

/// Per-connection SSH server handler.
pub struct ConnectionHandler {
    peer: SocketAddr,
    authenticator: Authenticator,
    context: Arc<SessionContext>,
    tracker: SessionTracker,
    request_timeout: Duration,
    user: Option<AuthenticatedUser>,
    channels: HashMap<ChannelId, ClientBridge>,
}

impl ConnectionHandler {
    pub fn new(
        peer: SocketAddr,
        authenticator: Authenticator,
        context: Arc<SessionContext>,
        tracker: SessionTracker,
        request_timeout: Duration,
    ) -> Self {
        Self {
            peer,
            authenticator,
            context,
            tracker,
            request_timeout,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn accept(&mut self, user: AuthenticatedUser) -> Auth {
        info!("{} authenticated as {}", self.peer, user.username);
        self.user = Some(user);
        Auth::Accept
    }

    fn refuse_channel(&self, kind: &str) -> Result<bool, russh::Error> {
        info!("Refusing {} channel from {}", kind, self.peer);
        Ok(false)
    }

    /// Hands a request to the channel's session and answers the client with its decision.
    async fn relay_request(
        &mut self,
        channel: ChannelId,
        request: Result<ChannelRequest, RequestError>,
        session: &mut Session,
    ) {
        let (want_reply, ok) = match request {
            Ok(request) => {
                let want_reply = request.want_reply;
                let ok = match self.channels.get(&channel) {
                    Some(bridge) => bridge.submit(request, self.request_timeout).await,
                    None => {
                        debug!("Request on unknown channel {:?} from {}", channel, self.peer);
                        false
                    }
                };
                (want_reply, ok)
            }
            Err(e) => {
                warn!("Unable to relay request from {}: {}", self.peer, e);
                (true, false)
            }
        };

        if !want_reply {
            return;
        }
        let replied = if ok {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        };
        if replied.is_err() {
            debug!("Unable to answer request on {:?}", channel);
        }
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authenticator.verify_password(user, password, self.peer) {
            Ok(user) => Ok(self.accept(user)),
            Err(_) => Ok(reject()),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self
            .authenticator
            .verify_public_key(user, public_key, self.peer)
        {
            Ok(user) => Ok(self.accept(user)),
            Err(_) => Ok(reject()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(user) = self.user.clone() else {
            return self.refuse_channel("unauthenticated session");
        };
        let Some(guard) = self.tracker.try_enter() else {
            info!(
                "Refusing session channel from {}: server is stopping",
                self.peer
            );
            return Ok(false);
        };

        let id = channel.id();
        let (bridge, client) = channel_bridge::bridge(channel, session.handle());
        self.channels.insert(id, bridge);

        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            ProxySession::serve(context, user.username, client).await;
            drop(guard);
        });
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "direct-tcpip to {}:{} requested",
            host_to_connect, port_to_connect
        );
        self.refuse_channel("direct-tcpip")
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_channel("forwarded-tcpip")
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.refuse_channel("x11")
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            "Refusing tcpip-forward {}:{} from {}",
            address, port, self.peer
        );
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = Ok(ChannelRequest::new(request::AUTH_AGENT_REQ, true, Vec::new()));
        self.relay_request(channel, request, session).await;
        // Already answered on the channel. russh turns `false` into an extra global failure.
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = PtyRequest {
            term: term.to_string(),
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
            modes: encode_modes(modes),
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::PTY_REQ, true, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = WindowChange {
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::WINDOW_CHANGE, false, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = Ok(ChannelRequest::new(request::SHELL, true, Vec::new()));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ExecRequest {
            command: data.to_vec(),
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::EXEC, true, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = EnvRequest {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::ENV, true, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = NamedRequest {
            name: name.to_string(),
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::SUBSYSTEM, true, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = NamedRequest {
            name: signal_name(&signal),
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::SIGNAL, false, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = X11Request {
            single_connection,
            auth_protocol: x11_auth_protocol.to_string(),
            auth_cookie: x11_auth_cookie.to_string(),
            screen: x11_screen_number,
        }
        .encode()
        .map(|payload| ChannelRequest::new(request::X11_REQ, true, payload));
        self.relay_request(channel, request, session).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}
