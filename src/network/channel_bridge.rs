//! Bridge between an accepted client session channel and the engine's [`ClientChannel`].
//!
//! Bytes flow through a pump task that owns the russh channel. Control requests do not: russh
//! hands them to the connection handler, which queues them for the engine through
//! [`ClientBridge::submit`] and answers the client with whatever the engine decided.

use std::time::Duration;

use log::{debug, trace, warn};
use russh::server::{self, Msg};
use russh::{Channel, ChannelId, ChannelMsg, Pty, Sig};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::session_management::endpoint::{
    channel_pair, ChannelPeer, ClientChannel, IncomingRequest,
};
use crate::session_management::request::ChannelRequest;

/// Connection handler's grip on one bridged channel.
#[derive(Debug)]
pub struct ClientBridge {
    requests: mpsc::UnboundedSender<IncomingRequest>,
}

impl ClientBridge {
    /// Queues `request` for the session and returns the answer owed to the client. Requests
    /// that want no reply count as accepted once queued; a session that is gone answers `false`.
    ///
    /// An answer that takes longer than `wait` counts as `false`. The request is then
    /// withdrawn: a session that has not forwarded it yet drops it.
    pub async fn submit(&self, request: ChannelRequest, wait: Duration) -> bool {
        let request_type = request.request_type.clone();
        let (incoming, reply) = IncomingRequest::new(request);
        if self.requests.send(incoming).is_err() {
            return false;
        }
        let Some(rx) = reply else {
            return true;
        };
        match tokio::time::timeout(wait, rx).await {
            Ok(answer) => answer.unwrap_or(false),
            Err(_) => {
                warn!(
                    "No answer to {} within {}s, refusing it",
                    request_type,
                    wait.as_secs_f32()
                );
                false
            }
        }
    }
}

/// Starts the pump for an accepted `channel`.
pub fn bridge(channel: Channel<Msg>, handle: server::Handle) -> (ClientBridge, ClientChannel) {
    let (end, peer) = channel_pair();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(channel, handle, peer));
    (
        ClientBridge { requests: tx },
        ClientChannel { end, requests: rx },
    )
}

async fn pump(mut channel: Channel<Msg>, handle: server::Handle, peer: ChannelPeer) {
    let id = channel.id();
    let ChannelPeer {
        stream,
        mut close_requested,
    } = peer;
    let (mut peer_read, mut peer_write) = tokio::io::split(stream);

    // Engine output goes straight to the client; shutting the writer down sends EOF.
    let mut writer = channel.make_writer();
    let mut outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut peer_read, &mut writer).await;
        let _ = writer.shutdown().await;
        copied
    });

    let mut client_closed = false;
    loop {
        tokio::select! {
            biased;

            _ = &mut close_requested => {
                debug!("Closing client channel {:?}", id);
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Err(e) = peer_write.write_all(&data).await {
                        trace!("Dropping client data on {:?}: {}", id, e);
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Err(e) = peer_write.write_all(&data).await {
                        trace!("Dropping client data on {:?}: {}", id, e);
                    }
                }
                Some(ChannelMsg::Eof) => {
                    debug!("Client sent EOF on {:?}", id);
                    let _ = peer_write.shutdown().await;
                }
                Some(ChannelMsg::Close) | None => {
                    debug!("Client closed channel {:?}", id);
                    client_closed = true;
                    break;
                }
                // Requests reach the connection handler callbacks instead.
                Some(_) => {}
            },
        }
    }

    let _ = peer_write.shutdown().await;

    if !client_closed {
        drain(id, &mut channel, &mut outbound).await;
    } else {
        outbound.abort();
    }

    close(&handle, id).await;
}

/// Waits for the engine to finish writing while still consuming channel messages, so the
/// session loop never stalls on a full channel queue.
async fn drain(
    id: ChannelId,
    channel: &mut Channel<Msg>,
    outbound: &mut tokio::task::JoinHandle<std::io::Result<u64>>,
) {
    loop {
        tokio::select! {
            copied = &mut *outbound => {
                match copied {
                    Ok(Ok(bytes)) => trace!("{} bytes sent to client on {:?}", bytes, id),
                    Ok(Err(e)) => debug!("Client write on {:?} ended: {}", id, e),
                    Err(e) => debug!("Client writer task for {:?} failed: {}", id, e),
                }
                return;
            }
            msg = channel.wait() => {
                if matches!(msg, None | Some(ChannelMsg::Close)) {
                    outbound.abort();
                    return;
                }
            }
        }
    }
}

async fn close(handle: &server::Handle, id: ChannelId) {
    if handle.close(id).await.is_err() {
        trace!("Channel {:?} already gone", id);
    }
}

/// Encodes terminal modes back into their RFC 4254 wire form, terminator included.
pub fn encode_modes(modes: &[(Pty, u32)]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(modes.len() * 5 + 1);
    for (mode, value) in modes {
        encoded.push(*mode as u8);
        encoded.extend_from_slice(&value.to_be_bytes());
    }
    encoded.push(0);
    encoded
}

/// Signal name as carried in a `signal` request, without the `SIG` prefix.
pub fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::ABRT => String::from("ABRT"),
        Sig::ALRM => String::from("ALRM"),
        Sig::FPE => String::from("FPE"),
        Sig::HUP => String::from("HUP"),
        Sig::ILL => String::from("ILL"),
        Sig::INT => String::from("INT"),
        Sig::KILL => String::from("KILL"),
        Sig::PIPE => String::from("PIPE"),
        Sig::QUIT => String::from("QUIT"),
        Sig::SEGV => String::from("SEGV"),
        Sig::TERM => String::from("TERM"),
        Sig::USR1 => String::from("USR1"),
        Sig::Custom(name) => name.clone(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::upstream_channel::{decode_modes, signal_from_name};

    #[test]
    fn test_modes_wire_form() {
        let encoded = encode_modes(&[(Pty::VINTR, 3), (Pty::ECHO, 1)]);
        assert_eq!(
            encoded,
            vec![Pty::VINTR as u8, 0, 0, 0, 3, Pty::ECHO as u8, 0, 0, 0, 1, 0]
        );
        assert_eq!(decode_modes(&encoded), vec![(Pty::VINTR, 3), (Pty::ECHO, 1)]);
        assert_eq!(encode_modes(&[]), vec![0]);
    }

    #[test]
    fn test_signal_names_match_upstream_mapping() {
        for sig in [Sig::INT, Sig::HUP, Sig::USR1, Sig::Custom(String::from("WINCH"))] {
            let name = signal_name(&sig);
            assert_eq!(signal_name(&signal_from_name(&name)), name);
        }
        assert_eq!(signal_name(&Sig::TERM), "TERM");
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_submit_to_gone_session_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = ClientBridge { requests: tx };
        drop(rx);
        assert!(
            !bridge
                .submit(ChannelRequest::new("shell", true, Vec::new()), WAIT)
                .await
        );
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out_and_is_withdrawn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = ClientBridge { requests: tx };

        let started = std::time::Instant::now();
        let answer = bridge
            .submit(
                ChannelRequest::new("pty-req", true, Vec::new()),
                Duration::from_millis(100),
            )
            .await;
        assert!(!answer);
        assert!(started.elapsed() < WAIT);

        let incoming: IncomingRequest = rx.recv().await.unwrap();
        assert!(incoming.abandoned());

        // Requests without a reply never wait.
        assert!(
            bridge
                .submit(
                    ChannelRequest::new("window-change", false, vec![0; 16]),
                    Duration::ZERO
                )
                .await
        );
        assert!(!rx.recv().await.unwrap().abandoned());
    }

    #[tokio::test]
    async fn test_submit_waits_for_session_answer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = ClientBridge { requests: tx };

        let answering = tokio::spawn(async move {
            let incoming: IncomingRequest = rx.recv().await.unwrap();
            assert_eq!(incoming.request.request_type, "exec");
            assert!(!incoming.abandoned());
            incoming.respond(true);
            let incoming = rx.recv().await.unwrap();
            assert!(!incoming.request.want_reply);
            incoming.respond(false);
        });

        assert!(
            bridge
                .submit(ChannelRequest::new("exec", true, Vec::new()), WAIT)
                .await
        );
        assert!(
            bridge
                .submit(ChannelRequest::new("window-change", false, vec![0; 16]), WAIT)
                .await
        );
        answering.await.unwrap();
    }
}
