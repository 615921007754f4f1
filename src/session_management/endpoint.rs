//! Engine-facing ends of the two channels a session relays between.
//!
//! The session engine never touches protocol objects. Each side is an in-memory byte pipe
//! plus a request queue; a bridge task on the other end of the pipe moves bytes and requests
//! to and from the real SSH channel.
//!
//! ```text
//!  client ssh channel ◀──▶ bridge ◀══ pipe ══▶ Session ◀══ pipe ══▶ bridge ◀──▶ upstream channel
//!                                 ── IncomingRequest ─▶      ── OutgoingRequest ─▶
//! ```

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

use super::request::ChannelRequest;
use crate::error_handling::types::RequestError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Asks the bridge to close the underlying channel once everything already written has been
/// delivered. Dropping it has the same effect.
#[derive(Debug)]
pub struct ChannelCloser(Option<oneshot::Sender<()>>);

impl ChannelCloser {
    pub fn close(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// The engine's side of a channel.
#[derive(Debug)]
pub struct ChannelEnd {
    stream: DuplexStream,
    closer: ChannelCloser,
}

impl ChannelEnd {
    pub fn into_parts(self) -> (DuplexStream, ChannelCloser) {
        (self.stream, self.closer)
    }
}

/// The bridge's side of a channel. `close_requested` resolves when the engine closes or drops
/// its end.
#[derive(Debug)]
pub struct ChannelPeer {
    pub stream: DuplexStream,
    pub close_requested: oneshot::Receiver<()>,
}

pub fn channel_pair() -> (ChannelEnd, ChannelPeer) {
    let (engine, bridge) = tokio::io::duplex(PIPE_CAPACITY);
    let (tx, rx) = oneshot::channel();
    (
        ChannelEnd {
            stream: engine,
            closer: ChannelCloser(Some(tx)),
        },
        ChannelPeer {
            stream: bridge,
            close_requested: rx,
        },
    )
}

/// A request received from the client, waiting for the answer the proxy will give.
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: ChannelRequest,
    reply: Option<oneshot::Sender<bool>>,
}

impl IncomingRequest {
    /// Returns the request and, if the client wants a reply, the receiver the answer lands on.
    pub fn new(request: ChannelRequest) -> (Self, Option<oneshot::Receiver<bool>>) {
        if request.want_reply {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    request,
                    reply: Some(tx),
                },
                Some(rx),
            )
        } else {
            (
                Self {
                    request,
                    reply: None,
                },
                None,
            )
        }
    }

    /// True once the client side stopped waiting for the answer.
    pub fn abandoned(&self) -> bool {
        self.reply.as_ref().is_some_and(|tx| tx.is_closed())
    }

    pub fn respond(self, ok: bool) {
        if let Some(tx) = self.reply {
            let _ = tx.send(ok);
        }
    }
}

/// Client side of a session: the byte pipe plus the requests the client sends, in order.
pub struct ClientChannel {
    pub end: ChannelEnd,
    pub requests: mpsc::UnboundedReceiver<IncomingRequest>,
}

/// A request on its way to the upstream channel.
#[derive(Debug)]
pub struct OutgoingRequest {
    pub request: ChannelRequest,
    pub reply: Option<oneshot::Sender<bool>>,
}

/// Sends requests to the upstream bridge, preserving order.
#[derive(Debug, Clone)]
pub struct RequestForwarder {
    tx: mpsc::UnboundedSender<OutgoingRequest>,
}

impl RequestForwarder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutgoingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Forwards `request` and returns the upstream's answer. Requests that do not want a
    /// reply count as accepted once queued.
    pub async fn forward(&self, request: ChannelRequest) -> Result<bool, RequestError> {
        if request.want_reply {
            let (tx, rx) = oneshot::channel();
            self.tx
                .send(OutgoingRequest {
                    request,
                    reply: Some(tx),
                })
                .map_err(|_| RequestError::ChannelClosed)?;
            rx.await.map_err(|_| RequestError::ChannelClosed)
        } else {
            self.tx
                .send(OutgoingRequest {
                    request,
                    reply: None,
                })
                .map_err(|_| RequestError::ChannelClosed)?;
            Ok(true)
        }
    }
}

/// Upstream side of a session: the byte pipe plus the request path toward the upstream host.
pub struct UpstreamChannel {
    pub end: ChannelEnd,
    pub requests: RequestForwarder,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_and_close_signal() {
        let (end, mut peer) = channel_pair();
        let (mut stream, mut closer) = end.into_parts();

        stream.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        peer.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        closer.close();
        closer.close();
        assert!(peer.close_requested.await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_end_counts_as_close() {
        let (end, peer) = channel_pair();
        drop(end);
        assert!(peer.close_requested.await.is_err());
    }

    #[tokio::test]
    async fn test_forward_waits_for_reply() {
        let (forwarder, mut rx) = RequestForwarder::channel();

        let answer = tokio::spawn(async move {
            forwarder
                .forward(ChannelRequest::new("shell", true, Vec::new()))
                .await
        });

        let outgoing = rx.recv().await.unwrap();
        assert_eq!(outgoing.request.request_type, "shell");
        outgoing.reply.unwrap().send(false).unwrap();

        assert_eq!(answer.await.unwrap(), Ok(false));
    }

    #[tokio::test]
    async fn test_forward_without_reply_and_closed_bridge() {
        let (forwarder, mut rx) = RequestForwarder::channel();

        let ok = forwarder
            .forward(ChannelRequest::new("window-change", false, vec![0; 16]))
            .await;
        assert_eq!(ok, Ok(true));
        assert!(rx.recv().await.unwrap().reply.is_none());

        let pending = tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder
                    .forward(ChannelRequest::new("exec", true, Vec::new()))
                    .await
            }
        });
        let outgoing = rx.recv().await.unwrap();
        drop(outgoing);
        assert_eq!(pending.await.unwrap(), Err(RequestError::ChannelClosed));

        drop(rx);
        assert_eq!(
            forwarder
                .forward(ChannelRequest::new("env", false, Vec::new()))
                .await,
            Err(RequestError::ChannelClosed)
        );
    }

    #[test]
    fn test_incoming_reply_only_when_wanted() {
        let (req, rx) = IncomingRequest::new(ChannelRequest::new("signal", false, Vec::new()));
        assert!(rx.is_none());
        req.respond(true);

        let (req, rx) = IncomingRequest::new(ChannelRequest::new("pty-req", true, Vec::new()));
        req.respond(true);
        assert_eq!(rx.unwrap().try_recv(), Ok(true));
    }
}
