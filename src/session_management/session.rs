//! Proxy session engine.
//!
//! One [`Session`] per accepted client session channel. It owns both channel ends, the
//! upstream transport and the transcript, and goes through these phases:
//!
//! ```text
//! establish:  dial upstream ──▶ open transcript          (any failure: "Error: ..." to client)
//! run:        ┌ request forwarder  client ─▶ upstream (pty-req / window-change / exec inspected)
//!             ├ copy client ─▶ transcript ─▶ upstream
//!             └ copy upstream ─▶ client
//! teardown:   first copy done ─▶ close both channels ─▶ await other copy
//!             ─▶ relay error? "Error: ..." to client ─▶ client EOF ─▶ stop forwarder
//!             ─▶ close upstream transport ─▶ close transcript ─▶ submit for summary
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinError;
use uuid::Uuid;

use super::endpoint::{ClientChannel, IncomingRequest, RequestForwarder, UpstreamChannel};
use super::request::{ChannelRequest, ExecRequest, PtyRequest, RequestKind, WindowChange};
use super::SharedGeometry;
use crate::analysis::SessionSummarizer;
use crate::data_capture::{copy_open, copy_stream, Direction, Transcript};
use crate::error_handling::types::SessionError;
use crate::upstream::{UpstreamConnection, UpstreamDialer, UpstreamLink};

/// Shared, read-only collaborators every session of the server uses.
pub struct SessionContext {
    pub dialer: Arc<dyn UpstreamDialer>,
    pub log_directory: PathBuf,
    pub summarizer: Arc<dyn SessionSummarizer>,
}

pub struct Session {
    id: Uuid,
    username: String,
    client: ClientChannel,
    upstream: UpstreamChannel,
    transport: UpstreamConnection,
    transcript: Arc<Transcript>,
    geometry: SharedGeometry,
    summarizer: Arc<dyn SessionSummarizer>,
}

#[derive(Clone, Copy)]
enum FirstDone {
    ClientToUpstream,
    UpstreamToClient,
}

impl Session {
    /// Connects the upstream side and opens the transcript.
    ///
    /// On failure the client gets a single `Error: <reason>` line on its channel, the channel
    /// is closed and anything already opened upstream is released. No relay task is started.
    pub async fn establish(
        context: &SessionContext,
        username: &str,
        client: ClientChannel,
    ) -> Result<Session, SessionError> {
        let id = Uuid::new_v4();
        info!("[{}] New session for user {}", id, username);

        let UpstreamLink {
            channel: upstream,
            mut transport,
        } = match context.dialer.dial(id).await {
            Ok(link) => link,
            Err(e) => {
                error!("[{}] Failed to connect to upstream: {}", id, e);
                let err = SessionError::Upstream(e);
                reject_client(id, client, &err).await;
                return Err(err);
            }
        };

        let transcript = match Transcript::create(&context.log_directory, username, id).await {
            Ok(t) => t,
            Err(e) => {
                error!("[{}] Failed to create transcript: {}", id, e);
                let err = SessionError::Capture(e);
                let (_, mut closer) = upstream.end.into_parts();
                closer.close();
                transport.close().await;
                reject_client(id, client, &err).await;
                return Err(err);
            }
        };

        Ok(Session {
            id,
            username: username.to_string(),
            client,
            upstream,
            transport,
            transcript: Arc::new(transcript),
            geometry: SharedGeometry::default(),
            summarizer: Arc::clone(&context.summarizer),
        })
    }

    /// Establishes and runs a session, logging the outcome. Used by the listener for every
    /// accepted session channel.
    pub async fn serve(context: Arc<SessionContext>, username: String, client: ClientChannel) {
        let session = match Session::establish(&context, &username, client).await {
            Ok(session) => session,
            Err(_) => return,
        };
        let id = session.id();
        match session.run().await {
            Ok(()) => info!("[{}] Session for {} ended", id, username),
            Err(e) => warn!("[{}] Session for {} ended with error: {}", id, username, e),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn geometry(&self) -> SharedGeometry {
        self.geometry.clone()
    }

    /// Relays until either direction finishes, then tears everything down.
    ///
    /// Returns the first error that is not an end-of-stream condition, if any.
    pub async fn run(self) -> Result<(), SessionError> {
        let Session {
            id,
            username,
            client,
            upstream,
            mut transport,
            transcript,
            geometry,
            summarizer,
        } = self;

        debug!("[{}] Relaying for {}", id, username);

        let (client_stream, mut client_closer) = client.end.into_parts();
        let (upstream_stream, mut upstream_closer) = upstream.end.into_parts();
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (upstream_read, upstream_write) = tokio::io::split(upstream_stream);

        let forwarder = tokio::spawn(forward_requests(
            id,
            client.requests,
            upstream.requests,
            Arc::clone(&transcript),
            geometry,
        ));

        let mut client_to_upstream = tokio::spawn({
            let transcript = Arc::clone(&transcript);
            async move {
                copy_stream(
                    id,
                    Direction::ClientToUpstream,
                    client_read,
                    upstream_write,
                    Some(&transcript),
                )
                .await
            }
        });
        let mut upstream_to_client = tokio::spawn(async move {
            let mut client_write = client_write;
            let copied = copy_open(
                id,
                Direction::UpstreamToClient,
                upstream_read,
                &mut client_write,
                None,
            )
            .await;
            (copied, client_write)
        });

        // The client writer comes back from its copy so a relay failure can still be
        // reported before the client sees EOF.
        let mut client_writer = None;
        let (first, done) = tokio::select! {
            res = &mut client_to_upstream => (flatten(res), FirstDone::ClientToUpstream),
            res = &mut upstream_to_client => (
                flatten(keep_writer(res, &mut client_writer)),
                FirstDone::UpstreamToClient,
            ),
        };
        match done {
            FirstDone::ClientToUpstream => debug!("[{}] Client side finished first", id),
            FirstDone::UpstreamToClient => debug!("[{}] Upstream side finished first", id),
        }

        client_closer.close();
        upstream_closer.close();

        let second = match done {
            FirstDone::ClientToUpstream => {
                flatten(keep_writer(upstream_to_client.await, &mut client_writer))
            }
            FirstDone::UpstreamToClient => flatten(client_to_upstream.await),
        };

        if let Some(mut writer) = client_writer {
            if let Err(e) = first.as_ref().and(second.as_ref()) {
                write_error_line(id, &mut writer, e).await;
            }
            let _ = writer.shutdown().await;
        }

        forwarder.abort();
        let _ = forwarder.await;
        transport.close().await;

        match transcript.close().await {
            Ok(()) => summarizer.submit(transcript.path().to_path_buf()),
            Err(e) => warn!("[{}] Failed to close transcript: {}", id, e),
        }

        info!(
            "[{}] Session closed: {} bytes from client, {} bytes from upstream",
            id,
            bytes_of(&first, &second, done, Direction::ClientToUpstream),
            bytes_of(&first, &second, done, Direction::UpstreamToClient),
        );
        first.and(second).map(|_| ())
    }
}

fn keep_writer<W>(
    res: Result<(Result<u64, SessionError>, W), JoinError>,
    slot: &mut Option<W>,
) -> Result<Result<u64, SessionError>, JoinError> {
    res.map(|(copied, writer)| {
        *slot = Some(writer);
        copied
    })
}

fn flatten(res: Result<Result<u64, SessionError>, JoinError>) -> Result<u64, SessionError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(SessionError::Io(io::Error::other(e))),
    }
}

fn bytes_of(
    first: &Result<u64, SessionError>,
    second: &Result<u64, SessionError>,
    done: FirstDone,
    direction: Direction,
) -> u64 {
    let res = match (done, direction) {
        (FirstDone::ClientToUpstream, Direction::ClientToUpstream)
        | (FirstDone::UpstreamToClient, Direction::UpstreamToClient) => first,
        _ => second,
    };
    *res.as_ref().unwrap_or(&0)
}

/// Writes the failure reason to the client and closes its channel.
async fn reject_client(id: Uuid, client: ClientChannel, err: &SessionError) {
    let (mut stream, mut closer) = client.end.into_parts();
    write_error_line(id, &mut stream, err).await;
    let _ = stream.shutdown().await;
    closer.close();
}

async fn write_error_line<W>(id: Uuid, writer: &mut W, err: &SessionError)
where
    W: AsyncWrite + Unpin,
{
    let line = format!("Error: {}\r\n", err);
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!("[{}] Unable to report failure to client: {}", id, e);
    }
}

/// Forwards client requests in arrival order, one at a time, answering each with the
/// upstream's reply.
async fn forward_requests(
    id: Uuid,
    mut requests: UnboundedReceiver<IncomingRequest>,
    upstream: RequestForwarder,
    transcript: Arc<Transcript>,
    geometry: SharedGeometry,
) {
    while let Some(incoming) = requests.recv().await {
        if incoming.abandoned() {
            debug!(
                "[{}] Dropping {}: client already answered",
                id, incoming.request.request_type
            );
            continue;
        }
        inspect_request(id, &incoming.request, &transcript, &geometry).await;

        let ok = match upstream.forward(incoming.request.clone()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(
                    "[{}] Forwarding {} failed: {}",
                    id, incoming.request.request_type, e
                );
                false
            }
        };
        debug!(
            "[{}] {} (want_reply={}) -> {}",
            id, incoming.request.request_type, incoming.request.want_reply, ok
        );
        incoming.respond(ok);
    }
}

/// Side effects of the inspected request types. A payload that does not decode is logged and
/// otherwise ignored; the request is still forwarded.
async fn inspect_request(
    id: Uuid,
    request: &ChannelRequest,
    transcript: &Transcript,
    geometry: &SharedGeometry,
) {
    match request.kind() {
        RequestKind::PtyReq => match PtyRequest::decode(&request.payload) {
            Ok(pty) => {
                debug!(
                    "[{}] pty-req term={} {}x{}",
                    id, pty.term, pty.width, pty.height
                );
                geometry.set(pty.width, pty.height);
            }
            Err(e) => warn!("[{}] {}", id, e),
        },
        RequestKind::WindowChange => match WindowChange::decode(&request.payload) {
            Ok(wc) => {
                debug!("[{}] window-change {}x{}", id, wc.width, wc.height);
                geometry.set(wc.width, wc.height);
            }
            Err(e) => warn!("[{}] {}", id, e),
        },
        RequestKind::Exec => match ExecRequest::decode(&request.payload) {
            Ok(exec) => {
                if let Err(e) = transcript.record_exec(&exec.command_lossy()).await {
                    warn!("[{}] Unable to record exec: {}", id, e);
                }
            }
            Err(e) => warn!("[{}] {}", id, e),
        },
        RequestKind::Passthrough => {}
    }
}
