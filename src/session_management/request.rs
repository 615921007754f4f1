//! Session channel requests.
//!
//! A request travels through the proxy in its wire shape (type name, want-reply flag, raw
//! payload) so it reaches the upstream exactly as the client sent it. The few types the proxy
//! needs to look inside are decoded on the side with the helpers below; everything else is
//! opaque.

use ssh_encoding::{Decode, Encode};

use crate::error_handling::types::RequestError;

pub const PTY_REQ: &str = "pty-req";
pub const WINDOW_CHANGE: &str = "window-change";
pub const EXEC: &str = "exec";
pub const SHELL: &str = "shell";
pub const ENV: &str = "env";
pub const SUBSYSTEM: &str = "subsystem";
pub const SIGNAL: &str = "signal";
pub const X11_REQ: &str = "x11-req";
pub const AUTH_AGENT_REQ: &str = "auth-agent-req@openssh.com";

/// A channel request as received from one side and replayed to the other.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
}

impl ChannelRequest {
    pub fn new(request_type: &str, want_reply: bool, payload: Vec<u8>) -> Self {
        Self {
            request_type: request_type.to_string(),
            want_reply,
            payload,
        }
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::classify(&self.request_type)
    }
}

/// Request types with a side effect inside the proxy. Anything else passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    PtyReq,
    WindowChange,
    Exec,
    Passthrough,
}

impl RequestKind {
    pub fn classify(request_type: &str) -> Self {
        match request_type {
            PTY_REQ => RequestKind::PtyReq,
            WINDOW_CHANGE => RequestKind::WindowChange,
            EXEC => RequestKind::Exec,
            _ => RequestKind::Passthrough,
        }
    }
}

fn finish<T>(request_type: &str, reader: &[u8], value: T) -> Result<T, RequestError> {
    if reader.is_empty() {
        Ok(value)
    } else {
        Err(RequestError::Malformed(format!(
            "{}: {} trailing bytes",
            request_type,
            reader.len()
        )))
    }
}

fn malformed(request_type: &str, err: ssh_encoding::Error) -> RequestError {
    RequestError::Malformed(format!("{}: {}", request_type, err))
}

/// `pty-req` payload. Terminal modes stay in their encoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct PtyRequest {
    pub term: String,
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub modes: Vec<u8>,
}

impl PtyRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let read = |reader: &mut &[u8]| -> Result<Self, ssh_encoding::Error> {
            Ok(Self {
                term: String::decode(reader)?,
                width: u32::decode(reader)?,
                height: u32::decode(reader)?,
                pixel_width: u32::decode(reader)?,
                pixel_height: u32::decode(reader)?,
                modes: Vec::<u8>::decode(reader)?,
            })
        };
        let value = read(&mut reader).map_err(|e| malformed(PTY_REQ, e))?;
        finish(PTY_REQ, reader, value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        self.term.as_str().encode(&mut out)?;
        self.width.encode(&mut out)?;
        self.height.encode(&mut out)?;
        self.pixel_width.encode(&mut out)?;
        self.pixel_height.encode(&mut out)?;
        self.modes.as_slice().encode(&mut out)?;
        Ok(out)
    }
}

/// `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowChange {
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl WindowChange {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let read = |reader: &mut &[u8]| -> Result<Self, ssh_encoding::Error> {
            Ok(Self {
                width: u32::decode(reader)?,
                height: u32::decode(reader)?,
                pixel_width: u32::decode(reader)?,
                pixel_height: u32::decode(reader)?,
            })
        };
        let value = read(&mut reader).map_err(|e| malformed(WINDOW_CHANGE, e))?;
        finish(WINDOW_CHANGE, reader, value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        self.width.encode(&mut out)?;
        self.height.encode(&mut out)?;
        self.pixel_width.encode(&mut out)?;
        self.pixel_height.encode(&mut out)?;
        Ok(out)
    }
}

/// `exec` payload. The command is raw bytes on the wire; most shells send UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<u8>,
}

impl ExecRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let command = Vec::<u8>::decode(&mut reader).map_err(|e| malformed(EXEC, e))?;
        finish(EXEC, reader, Self { command })
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        self.command.as_slice().encode(&mut out)?;
        Ok(out)
    }

    pub fn command_lossy(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvRequest {
    pub name: String,
    pub value: String,
}

impl EnvRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let read = |reader: &mut &[u8]| -> Result<Self, ssh_encoding::Error> {
            Ok(Self {
                name: String::decode(reader)?,
                value: String::decode(reader)?,
            })
        };
        let value = read(&mut reader).map_err(|e| malformed(ENV, e))?;
        finish(ENV, reader, value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        self.name.as_str().encode(&mut out)?;
        self.value.as_str().encode(&mut out)?;
        Ok(out)
    }
}

/// Payload carrying a single string: `subsystem` names and `signal` names.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedRequest {
    pub name: String,
}

impl NamedRequest {
    pub fn decode(request_type: &str, payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let name = String::decode(&mut reader).map_err(|e| malformed(request_type, e))?;
        finish(request_type, reader, Self { name })
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        self.name.as_str().encode(&mut out)?;
        Ok(out)
    }
}

/// `x11-req` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen: u32,
}

impl X11Request {
    pub fn decode(payload: &[u8]) -> Result<Self, RequestError> {
        let mut reader = payload;
        let read = |reader: &mut &[u8]| -> Result<Self, ssh_encoding::Error> {
            Ok(Self {
                single_connection: u8::decode(reader)? != 0,
                auth_protocol: String::decode(reader)?,
                auth_cookie: String::decode(reader)?,
                screen: u32::decode(reader)?,
            })
        };
        let value = read(&mut reader).map_err(|e| malformed(X11_REQ, e))?;
        finish(X11_REQ, reader, value)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        let mut out = Vec::new();
        u8::from(self.single_connection).encode(&mut out)?;
        self.auth_protocol.as_str().encode(&mut out)?;
        self.auth_cookie.as_str().encode(&mut out)?;
        self.screen.encode(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(RequestKind::classify("pty-req"), RequestKind::PtyReq);
        assert_eq!(RequestKind::classify("window-change"), RequestKind::WindowChange);
        assert_eq!(RequestKind::classify("exec"), RequestKind::Exec);
        assert_eq!(RequestKind::classify("shell"), RequestKind::Passthrough);
        assert_eq!(RequestKind::classify("env"), RequestKind::Passthrough);
        assert_eq!(
            RequestKind::classify("keepalive@openssh.com"),
            RequestKind::Passthrough
        );
    }

    #[test]
    fn test_pty_request_wire_layout() {
        let req = PtyRequest {
            term: String::from("xterm"),
            width: 80,
            height: 24,
            pixel_width: 0,
            pixel_height: 0,
            modes: vec![0],
        };
        let payload = req.encode().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"xterm");
        expected.extend_from_slice(&80u32.to_be_bytes());
        expected.extend_from_slice(&24u32.to_be_bytes());
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&0u32.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.push(0);
        assert_eq!(payload, expected);

        assert_eq!(PtyRequest::decode(&payload).unwrap(), req);
    }

    #[test]
    fn test_window_change_decode() {
        let mut payload = Vec::new();
        for v in [132u32, 43, 640, 480] {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let wc = WindowChange::decode(&payload).unwrap();
        assert_eq!(
            wc,
            WindowChange {
                width: 132,
                height: 43,
                pixel_width: 640,
                pixel_height: 480
            }
        );
    }

    #[test]
    fn test_exec_decode() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(b"uptime");
        let exec = ExecRequest::decode(&payload).unwrap();
        assert_eq!(exec.command_lossy(), "uptime");
    }

    #[test]
    fn test_truncated_payloads_are_malformed() {
        assert!(matches!(
            WindowChange::decode(&[0, 0, 0, 80, 0, 0]),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            ExecRequest::decode(&[0, 0, 0, 9, b'l', b's']),
            Err(RequestError::Malformed(_))
        ));
        assert!(matches!(
            PtyRequest::decode(&[]),
            Err(RequestError::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut payload = WindowChange {
            width: 1,
            height: 2,
            pixel_width: 3,
            pixel_height: 4,
        }
        .encode()
        .unwrap();
        payload.push(0xff);
        assert!(matches!(
            WindowChange::decode(&payload),
            Err(RequestError::Malformed(_))
        ));
    }

    #[test]
    fn test_env_and_x11_decode() {
        let env = EnvRequest {
            name: String::from("LANG"),
            value: String::from("C.UTF-8"),
        };
        assert_eq!(EnvRequest::decode(&env.encode().unwrap()).unwrap(), env);

        let x11 = X11Request {
            single_connection: true,
            auth_protocol: String::from("MIT-MAGIC-COOKIE-1"),
            auth_cookie: String::from("00ff"),
            screen: 0,
        };
        let payload = x11.encode().unwrap();
        assert_eq!(payload[0], 1);
        assert_eq!(X11Request::decode(&payload).unwrap(), x11);
    }

    #[test]
    fn test_named_request() {
        let sub = NamedRequest {
            name: String::from("sftp"),
        };
        let payload = sub.encode().unwrap();
        assert_eq!(NamedRequest::decode(SUBSYSTEM, &payload).unwrap(), sub);
    }
}
