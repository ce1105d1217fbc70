//! Host-side upload orchestration: whole-session retries around [`Sender`].

use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::error::{LinkError, Result};
use crate::progress::TransferProgress;
use crate::streaming::sender::{Sender, SenderConfig};

/// Summary of a successful upload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub blocks: usize,
    pub sent_checksum: u32,
    pub received_checksum: u32,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl TransferReport {
    /// Bytes per second over the whole upload, retries included.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct Uploader {
    sender: Sender,
    retries: u32,
}

impl Uploader {
    pub fn new(config: SenderConfig, retries: u32) -> Self {
        Self {
            sender: Sender::new(config),
            retries,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Read an image file in full.
    pub async fn read_image(path: &Path) -> Result<Bytes> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| LinkError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        if u32::try_from(data.len()).is_err() {
            return Err(LinkError::ImageTooLarge { len: data.len() });
        }
        Ok(Bytes::from(data))
    }

    /// Upload `image`, rerunning the whole session on recoverable failures
    /// up to `retries` more times.
    pub async fn upload<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        image: &[u8],
        progress: &TransferProgress,
    ) -> Result<TransferReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let max_attempts = self.retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.sender.send(reader, writer, image, progress).await {
                Ok(session) => {
                    tracing::info!(
                        bytes = session.bytes,
                        attempt,
                        checksum = %format!("{:#010x}", session.sent_checksum),
                        "upload verified"
                    );
                    return Ok(TransferReport {
                        bytes: session.bytes,
                        blocks: session.blocks,
                        sent_checksum: session.sent_checksum,
                        received_checksum: session.received_checksum,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) if e.is_recoverable() && attempt < max_attempts => {
                    tracing::warn!(attempt, max_attempts, "session failed, retrying: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
