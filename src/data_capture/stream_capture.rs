use std::io;

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::transcript::Transcript;
use crate::error_handling::types::SessionError;

const COPY_BUFFER_SIZE: usize = 16 * 1024;
const PREVIEW_LEN: usize = 64;

/// Which way bytes flow through the proxy. Only used for logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "C->U",
            Direction::UpstreamToClient => "U->C",
        }
    }
}

/// Conditions the teardown of the opposite side produces on a stream that is still being
/// copied. They end the copy like a clean EOF.
pub fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Copies `reader` into `writer` until EOF, then shuts the writer down so the far side sees
/// EOF too. When a transcript is given every chunk is recorded before it is forwarded.
///
/// Returns the number of bytes forwarded. Read and write failures that only mean the other
/// side went away are reported as a normal end.
pub async fn copy_stream<R, W>(
    session_id: Uuid,
    direction: Direction,
    reader: R,
    mut writer: W,
    transcript: Option<&Transcript>,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let total = copy_open(session_id, direction, reader, &mut writer, transcript).await?;
    trace!(
        "[{}] {} EOF; shutting down writer",
        session_id,
        direction.label()
    );
    let _ = writer.shutdown().await;
    Ok(total)
}

/// Same as [`copy_stream`] but leaves `writer` open, so the caller can still append to it
/// before signalling EOF.
pub async fn copy_open<R, W>(
    session_id: Uuid,
    direction: Direction,
    mut reader: R,
    writer: &mut W,
    transcript: Option<&Transcript>,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    trace!("[{}] {} copy started", session_id, direction.label());

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => return Err(SessionError::Io(e)),
        };

        if let Some(transcript) = transcript {
            transcript.record_input(&buf[..n]).await?;
        }

        match writer.write_all(&buf[..n]).await {
            Ok(()) => {}
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => return Err(SessionError::Io(e)),
        }
        total += n as u64;

        let preview = &buf[..std::cmp::min(n, PREVIEW_LEN)];
        trace!(
            "[{}] {} {} bytes: {}{}",
            session_id,
            direction.label(),
            n,
            String::from_utf8_lossy(preview),
            if n > PREVIEW_LEN { " ..." } else { "" }
        );
    }

    trace!(
        "[{}] {} copy finished after {} bytes",
        session_id,
        direction.label(),
        total
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_copy_forwards_and_records() {
        let dir = TempDir::new().unwrap();
        let transcript = Transcript::create(dir.path(), "alice", Uuid::new_v4())
            .await
            .unwrap();

        let reader = Builder::new().read(b"hello ").read(b"world").build();
        let writer = Builder::new().write(b"hello ").write(b"world").build();

        let copied = copy_stream(
            Uuid::new_v4(),
            Direction::ClientToUpstream,
            reader,
            writer,
            Some(&transcript),
        )
        .await
        .unwrap();
        assert_eq!(copied, 11);

        transcript.close().await.unwrap();
        let content = std::fs::read_to_string(transcript.path()).unwrap();
        assert!(content.ends_with("hello world"));
    }

    #[tokio::test]
    async fn test_copy_without_transcript() {
        let reader = Builder::new().read(b"pong").build();
        let writer = Builder::new().write(b"pong").build();

        let copied = copy_stream(
            Uuid::new_v4(),
            Direction::UpstreamToClient,
            reader,
            writer,
            None,
        )
        .await
        .unwrap();
        assert_eq!(copied, 4);
    }

    #[tokio::test]
    async fn test_open_copy_leaves_writer_usable() {
        let reader = Builder::new().read(b"output").build();
        let (mut writer, mut far) = tokio::io::duplex(64);

        let copied = copy_open(
            Uuid::new_v4(),
            Direction::UpstreamToClient,
            reader,
            &mut writer,
            None,
        )
        .await
        .unwrap();
        assert_eq!(copied, 6);

        writer.write_all(b" + tail").await.unwrap();
        writer.shutdown().await.unwrap();
        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"output + tail");
    }

    #[tokio::test]
    async fn test_broken_pipe_is_end_of_stream() {
        let reader = Builder::new().read(b"data").build();
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let copied = copy_stream(
            Uuid::new_v4(),
            Direction::UpstreamToClient,
            reader,
            writer,
            None,
        )
        .await
        .unwrap();
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn test_other_errors_are_reported() {
        let reader = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
            .build();
        let writer = Builder::new().build();

        let result = copy_stream(
            Uuid::new_v4(),
            Direction::ClientToUpstream,
            reader,
            writer,
            None,
        )
        .await;
        assert!(matches!(result, Err(SessionError::Io(e)) if e.kind() == io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_end_of_stream_kinds() {
        assert!(is_end_of_stream(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_end_of_stream(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_end_of_stream(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
