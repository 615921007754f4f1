//! Bridge between the upstream session channel and the engine's [`UpstreamChannel`].
//!
//! ```text
//!  engine pipe ──copy──▶ ChannelTx (make_writer) ──▶ upstream
//!  engine pipe ◀─────── pump ◀── channel.wait()  ◀── upstream
//!  OutgoingRequest ───▶ pump ──typed request──▶ upstream
//!                       pump ◀── Success/Failure (FIFO)
//! ```
//!
//! A single pump task owns the channel. Replies to want-reply requests come back as
//! `Success`/`Failure` messages in the order the requests were sent, so the pump keeps the
//! pending reply senders in a queue.

use std::collections::VecDeque;

use log::{debug, trace, warn};
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty, Sig};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error_handling::types::RequestError;
use crate::session_management::endpoint::{
    channel_pair, ChannelPeer, OutgoingRequest, RequestForwarder, UpstreamChannel,
};
use crate::session_management::request::{
    self, ChannelRequest, EnvRequest, ExecRequest, NamedRequest, PtyRequest, WindowChange,
    X11Request,
};

/// Opcodes at or above this value carry no argument we can parse, so mode parsing stops there.
const PTY_OPCODE_LIMIT: u8 = 160;

/// Starts the pump for `channel` and returns the engine's side of it.
pub fn bridge(session_id: Uuid, channel: Channel<Msg>) -> UpstreamChannel {
    let (end, peer) = channel_pair();
    let (forwarder, requests) = RequestForwarder::channel();
    tokio::spawn(pump(session_id, channel, peer, requests));
    UpstreamChannel {
        end,
        requests: forwarder,
    }
}

async fn pump(
    id: Uuid,
    mut channel: Channel<Msg>,
    peer: ChannelPeer,
    mut requests: mpsc::UnboundedReceiver<OutgoingRequest>,
) {
    let ChannelPeer {
        stream,
        mut close_requested,
    } = peer;
    let (mut peer_read, mut peer_write) = tokio::io::split(stream);

    let mut writer = channel.make_writer();
    let mut outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut peer_read, &mut writer).await;
        let _ = writer.shutdown().await;
        copied
    });

    let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    let mut requests_open = true;
    let mut remote_closed = false;

    loop {
        tokio::select! {
            biased;

            _ = &mut close_requested => {
                debug!("[{}] Closing upstream channel", id);
                break;
            }
            outgoing = requests.recv(), if requests_open => match outgoing {
                Some(outgoing) => issue(id, &channel, outgoing, &mut pending).await,
                None => requests_open = false,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Err(e) = peer_write.write_all(&data).await {
                        trace!("[{}] Dropping upstream data: {}", id, e);
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    trace!("[{}] {} bytes of extended data ({})", id, data.len(), ext);
                    if let Err(e) = peer_write.write_all(&data).await {
                        trace!("[{}] Dropping upstream data: {}", id, e);
                    }
                }
                Some(ChannelMsg::Success) => answer(id, &mut pending, true),
                Some(ChannelMsg::Failure) => answer(id, &mut pending, false),
                Some(ChannelMsg::Eof) => {
                    debug!("[{}] Upstream sent EOF", id);
                    let _ = peer_write.shutdown().await;
                }
                Some(ChannelMsg::Close) | None => {
                    debug!("[{}] Upstream channel closed by remote", id);
                    remote_closed = true;
                    break;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("[{}] Upstream exit status {}", id, exit_status);
                }
                Some(other) => trace!("[{}] Ignoring upstream message {:?}", id, other),
            },
        }
    }

    let _ = peer_write.shutdown().await;
    // Requests still waiting for a reply resolve as failures.
    drop(pending);
    drop(requests);

    if remote_closed {
        outbound.abort();
        return;
    }

    // Let the engine finish writing before the channel goes away.
    loop {
        tokio::select! {
            copied = &mut outbound => {
                match copied {
                    Ok(Ok(bytes)) => trace!("[{}] {} bytes sent upstream", id, bytes),
                    Ok(Err(e)) => debug!("[{}] Upstream write ended: {}", id, e),
                    Err(e) => debug!("[{}] Upstream writer task failed: {}", id, e),
                }
                break;
            }
            msg = channel.wait() => {
                if matches!(msg, None | Some(ChannelMsg::Close)) {
                    outbound.abort();
                    return;
                }
            }
        }
    }

    if let Err(e) = channel.close().await {
        debug!("[{}] Upstream channel close failed: {}", id, e);
    }
}

fn answer(id: Uuid, pending: &mut VecDeque<oneshot::Sender<bool>>, ok: bool) {
    match pending.pop_front() {
        Some(tx) => {
            let _ = tx.send(ok);
        }
        None => warn!("[{}] Unexpected request reply from upstream", id),
    }
}

async fn issue(
    id: Uuid,
    channel: &Channel<Msg>,
    outgoing: OutgoingRequest,
    pending: &mut VecDeque<oneshot::Sender<bool>>,
) {
    let OutgoingRequest { request, reply } = outgoing;

    match send_request(channel, &request).await {
        Ok(()) => {
            trace!("[{}] Sent {} upstream", id, request.request_type);
            if let Some(tx) = reply {
                pending.push_back(tx);
            }
        }
        Err(e) => {
            warn!(
                "[{}] Unable to forward {} upstream: {}",
                id, request.request_type, e
            );
            if let Some(tx) = reply {
                let _ = tx.send(false);
            }
        }
    }
}

/// Replays `request` on the upstream channel with the same want-reply flag.
async fn send_request(channel: &Channel<Msg>, request: &ChannelRequest) -> Result<(), RequestError> {
    let want_reply = request.want_reply;
    let payload = request.payload.as_slice();

    let sent = match request.request_type.as_str() {
        request::PTY_REQ => {
            let pty = PtyRequest::decode(payload)?;
            let modes = decode_modes(&pty.modes);
            channel
                .request_pty(
                    want_reply,
                    &pty.term,
                    pty.width,
                    pty.height,
                    pty.pixel_width,
                    pty.pixel_height,
                    &modes,
                )
                .await
        }
        request::SHELL => channel.request_shell(want_reply).await,
        request::EXEC => {
            let exec = ExecRequest::decode(payload)?;
            channel.exec(want_reply, exec.command).await
        }
        request::ENV => {
            let env = EnvRequest::decode(payload)?;
            channel.set_env(want_reply, env.name, env.value).await
        }
        request::SUBSYSTEM => {
            let subsystem = NamedRequest::decode(request::SUBSYSTEM, payload)?;
            channel.request_subsystem(want_reply, subsystem.name).await
        }
        request::WINDOW_CHANGE => {
            let wc = WindowChange::decode(payload)?;
            channel
                .window_change(wc.width, wc.height, wc.pixel_width, wc.pixel_height)
                .await
        }
        request::SIGNAL => {
            let signal = NamedRequest::decode(request::SIGNAL, payload)?;
            channel.signal(signal_from_name(&signal.name)).await
        }
        request::X11_REQ => {
            let x11 = X11Request::decode(payload)?;
            channel
                .request_x11(
                    want_reply,
                    x11.single_connection,
                    x11.auth_protocol,
                    x11.auth_cookie,
                    x11.screen,
                )
                .await
        }
        request::AUTH_AGENT_REQ => channel.agent_forward(want_reply).await,
        other => return Err(RequestError::Unsupported(other.to_string())),
    };

    sent.map_err(|e| {
        debug!("Upstream channel rejected {}: {}", request.request_type, e);
        RequestError::ChannelClosed
    })
}

/// Parses RFC 4254 encoded terminal modes. Unknown opcodes are skipped.
pub fn decode_modes(encoded: &[u8]) -> Vec<(Pty, u32)> {
    let mut modes = Vec::new();
    let mut rest = encoded;

    while let Some((&opcode, tail)) = rest.split_first() {
        if opcode == 0 || opcode >= PTY_OPCODE_LIMIT || tail.len() < 4 {
            break;
        }
        let value = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if let Some(mode) = Pty::from_u8(opcode) {
            modes.push((mode, value));
        }
        rest = &tail[4..];
    }
    modes
}

pub fn signal_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}
