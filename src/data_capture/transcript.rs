//! Per-session transcript file.
//!
//! One file per session under the configured directory, named
//! `{username}_{YYYYMMDD-HHMMSS}.log` from the local start time. The file starts with a small
//! header block; after it comes every byte the client sent, in order, plus a `$ <command>` line
//! for each `exec` request. Nothing from the upstream side is recorded.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, info, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error_handling::types::CaptureError;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Append-only session log. Writers share it behind `&self`; the inner mutex keeps concurrent
/// appends (data copy and exec markers) whole.
#[derive(Debug)]
pub struct Transcript {
    session_id: Uuid,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Transcript {
    /// Creates the transcript file and writes its header.
    ///
    /// The directory is created when missing. An existing file is never truncated: if the
    /// timestamped name is taken, `-1`, `-2`, ... is appended before the extension.
    pub async fn create(
        directory: &Path,
        username: &str,
        session_id: Uuid,
    ) -> Result<Self, CaptureError> {
        fs::create_dir_all(directory).await?;

        let started = Local::now();
        let stem = format!(
            "{}_{}",
            sanitize_username(username),
            started.format("%Y%m%d-%H%M%S")
        );

        let (path, mut file) = open_unique(directory, &stem).await?;

        let header = format!(
            "--- Session Log for {} ---\nStarted: {}\n------------------------------\n\n",
            username,
            started.to_rfc3339()
        );
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;

        info!("[{}] Recording transcript to {}", session_id, path.display());

        Ok(Self {
            session_id,
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends raw client input.
    pub async fn record_input(&self, data: &[u8]) -> Result<(), CaptureError> {
        self.append(data).await
    }

    /// Appends the `$ <command>` marker for an exec request.
    pub async fn record_exec(&self, command: &str) -> Result<(), CaptureError> {
        debug!("[{}] exec: {}", self.session_id, command);
        self.append(format!("$ {}\n", command).as_bytes()).await
    }

    /// Flushes and closes the file. Later appends fail with [`CaptureError::Closed`]; a second
    /// close is a no-op.
    pub async fn close(&self) -> Result<(), CaptureError> {
        let file = self.file.lock().await.take();
        match file {
            Some(mut file) => {
                file.flush().await?;
                file.sync_all().await?;
                debug!("[{}] Transcript closed", self.session_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn append(&self, data: &[u8]) -> Result<(), CaptureError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(CaptureError::Closed)?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn open_unique(directory: &Path, stem: &str) -> Result<(PathBuf, File), CaptureError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{}.log", stem)
        } else {
            format!("{}-{}.log", stem, attempt)
        };
        let path = directory.join(name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("Transcript {} already exists, trying next name", path.display());
            }
            Err(e) => return Err(CaptureError::IoError(e)),
        }
    }

    Err(CaptureError::IoError(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free transcript name for {}", stem),
    )))
}

/// Keeps file names inside the log directory whatever the client chose as username.
fn sanitize_username(username: &str) -> String {
    let cleaned: String = username
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        String::from("_")
    } else {
        cleaned
    }
}
