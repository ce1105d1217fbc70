//! Host side of the upload protocol.
//!
//! Waits for READY, announces size and checksum, streams the image in
//! blocks without per-block acknowledgement and compares the receiver's
//! checksum with its own.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::checksum;
use crate::error::{LinkError, Result};
use crate::progress::TransferProgress;
use crate::streaming::protocol::{
    encode_word, read_u8, read_word, write_bytes, Marker, PhaseKind, DEFAULT_BLOCK_SIZE,
};

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// How long to wait for the receiver's READY marker
    pub ready_timeout: Duration,
    /// Timeout for every later wait on the receiver
    pub phase_timeout: Duration,
    /// Streaming block size, for progress reporting only
    pub block_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            phase_timeout: Duration::from_secs(2),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Result of a successful session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub bytes: usize,
    pub blocks: usize,
    pub sent_checksum: u32,
    pub received_checksum: u32,
    pub elapsed: Duration,
}

pub struct Sender {
    config: SenderConfig,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Run one complete session for `image`.
    ///
    /// Any error means the image on the device must be considered invalid;
    /// retrying means calling `send` again from the start.
    #[tracing::instrument(name = "send", skip_all, fields(len = image.len()))]
    pub async fn send<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        image: &[u8],
        progress: &TransferProgress,
    ) -> Result<SessionReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let size = u32::try_from(image.len()).map_err(|_| LinkError::ImageTooLarge {
            len: image.len(),
        })?;
        let sent_checksum = checksum::compute(image);

        // 1. Ready
        self.wait_for_ready(reader).await?;
        let started = Instant::now();

        // 2. Size
        let timeout = self.config.phase_timeout;
        write_bytes(writer, &encode_word(size), timeout, PhaseKind::Size).await?;
        tracing::debug!(size, "size sent");
        self.wait_for_size_ack(reader, size).await?;

        // 3. Checksum
        write_bytes(writer, &encode_word(sent_checksum), timeout, PhaseKind::Checksum).await?;
        tracing::debug!(checksum = %format!("{sent_checksum:#010x}"), "checksum sent");

        // 4. Streaming
        let block_size = self.config.block_size.max(1);
        let mut blocks = 0;
        progress.start(image.len() as u64);
        for block in image.chunks(block_size) {
            write_bytes(writer, block, timeout, PhaseKind::Streaming)
                .await
                .inspect_err(|_| progress.abandon("stalled"))?;
            blocks += 1;
            progress.advance(block.len() as u64);
        }
        tracing::debug!(blocks, "image streamed");

        // 5. Verify
        let received_checksum = self.wait_for_verify(reader).await?;
        let elapsed = started.elapsed();

        if received_checksum != sent_checksum {
            progress.abandon("checksum mismatch");
            return Err(LinkError::ChecksumMismatch {
                expected: sent_checksum,
                actual: received_checksum,
            });
        }
        progress.finish();

        Ok(SessionReport {
            bytes: image.len(),
            blocks,
            sent_checksum,
            received_checksum,
            elapsed,
        })
    }

    async fn wait_for_ready<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let byte = match read_u8(reader, remaining, PhaseKind::Ready).await {
                Ok(b) => b,
                Err(LinkError::Timeout { .. }) => {
                    return Err(LinkError::NoPeer {
                        waited_ms: self.config.ready_timeout.as_millis() as u64,
                    })
                }
                Err(e) => return Err(e),
            };
            match Marker::from_u8(byte) {
                Some(Marker::Ready) => {
                    tracing::debug!("receiver ready");
                    return Ok(());
                }
                _ => tracing::trace!(byte, "ignoring byte while waiting for READY"),
            }
        }
    }

    async fn wait_for_size_ack<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        size: u32,
    ) -> Result<()> {
        let timeout = self.config.phase_timeout;
        loop {
            let byte = read_u8(reader, timeout, PhaseKind::Size).await?;
            match Marker::from_u8(byte) {
                Some(Marker::SizeAck) => return Ok(()),
                Some(Marker::SizeReject) => {
                    let capacity = read_word(reader, timeout, PhaseKind::Size).await?;
                    return Err(LinkError::SizeRejected {
                        declared: size,
                        capacity,
                    });
                }
                // READY is repeated until our size word lands
                Some(Marker::Ready) => continue,
                _ => tracing::trace!(byte, "ignoring byte while waiting for SIZE_ACK"),
            }
        }
    }

    async fn wait_for_verify<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<u32> {
        let timeout = self.config.phase_timeout;
        loop {
            let byte = read_u8(reader, timeout, PhaseKind::Verify).await?;
            if Marker::from_u8(byte) == Some(Marker::VerifyAck) {
                return read_word(reader, timeout, PhaseKind::Verify).await;
            }
            tracing::trace!(byte, "ignoring byte while waiting for VERIFY_ACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::{READY, SIZE_ACK, SIZE_REJECT, VERIFY_ACK};
    use crate::streaming::receiver::{Receiver, ReceiverConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sender() -> Sender {
        Sender::new(SenderConfig {
            ready_timeout: Duration::from_secs(1),
            phase_timeout: Duration::from_millis(200),
            block_size: 1024,
        })
    }

    fn receiver(max: u32) -> Receiver {
        Receiver::new(ReceiverConfig {
            max_image_size: max,
            ready_interval: Duration::from_millis(50),
            ready_timeout: Some(Duration::from_secs(5)),
            phase_timeout: Duration::from_millis(200),
        })
    }

    /// Run sender and receiver against each other over an in-memory link.
    async fn transfer(image: &[u8], capacity: usize) -> (Result<SessionReport>, Result<Vec<u8>>) {
        let (host, device) = tokio::io::duplex(2048);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let recv = tokio::spawn(async move {
            let mut dest = vec![0u8; capacity];
            receiver(capacity as u32)
                .receive(&mut dev_rx, &mut dev_tx, &mut dest)
                .await
                .map(|r| {
                    dest.truncate(r.len);
                    dest
                })
        });

        let sent = sender()
            .send(&mut host_rx, &mut host_tx, image, &TransferProgress::hidden())
            .await;
        (sent, recv.await.unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip() {
        let image = pattern(5000);
        let (sent, received) = transfer(&image, 8192).await;

        let report = sent.unwrap();
        assert_eq!(report.sent_checksum, report.received_checksum);
        assert_eq!(report.sent_checksum, checksum::compute(&image));
        // 4 full blocks and a short one
        assert_eq!(report.blocks, 5);
        assert_eq!(received.unwrap(), image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_runs_identical() {
        let image = pattern(3000);
        let (_, first) = transfer(&image, 4096).await;
        let (_, second) = transfer(&image, 4096).await;
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_capacity_boundary() {
        let fits = pattern(4096);
        let (sent, received) = transfer(&fits, 4096).await;
        assert!(sent.is_ok());
        assert_eq!(received.unwrap(), fits);

        let too_big = pattern(4097);
        let (sent, received) = transfer(&too_big, 4096).await;
        assert!(matches!(
            sent,
            Err(LinkError::SizeRejected {
                declared: 4097,
                capacity: 4096
            })
        ));
        assert!(matches!(received, Err(LinkError::SizeRejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_size_streams_nothing() {
        let (host, mut device) = tokio::io::duplex(64 * 1024);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);

        let fake = tokio::spawn(async move {
            device.write_all(&[READY]).await.unwrap();
            let size = device.read_u32_le().await.unwrap();
            assert_eq!(size, 10_000);
            device.write_all(&[SIZE_REJECT]).await.unwrap();
            device.write_all(&100u32.to_le_bytes()).await.unwrap();
            // anything else would be a streamed byte
            let mut rest = Vec::new();
            tokio::time::timeout(Duration::from_millis(500), device.read_to_end(&mut rest))
                .await
                .ok();
            rest
        });

        let err = sender()
            .send(&mut host_rx, &mut host_tx, &pattern(10_000), &TransferProgress::hidden())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::SizeRejected { capacity: 100, .. }));
        drop((host_rx, host_tx));
        assert!(fake.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_device_times_out_while_streaming() {
        let (host, mut device) = tokio::io::duplex(64);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);

        // acknowledges the size, then stops draining the link
        let wedged = tokio::spawn(async move {
            device.write_all(&[READY]).await.unwrap();
            device.read_u32_le().await.unwrap();
            device.write_all(&[SIZE_ACK]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            device
        });

        let err = sender()
            .send(&mut host_rx, &mut host_tx, &pattern(8192), &TransferProgress::hidden())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Timeout {
                phase: PhaseKind::Streaming
            }
        ));
        assert!(err.is_recoverable());
        wedged.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peer() {
        let (host, _device) = tokio::io::duplex(64);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let err = sender()
            .send(&mut host_rx, &mut host_tx, b"abc", &TransferProgress::hidden())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NoPeer { waited_ms: 1000 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_noise_and_repeated_ready_tolerated() {
        let (host, mut device) = tokio::io::duplex(64 * 1024);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let image = b"tiny overlay".to_vec();
        let crc = checksum::compute(&image);

        let fake = tokio::spawn(async move {
            device.write_all(b"> shell prompt\r\n").await.unwrap();
            device.write_all(&[READY]).await.unwrap();
            let size = device.read_u32_le().await.unwrap();
            device.write_all(&[READY, READY, SIZE_ACK]).await.unwrap();
            let expected = device.read_u32_le().await.unwrap();
            let mut data = vec![0u8; size as usize];
            device.read_exact(&mut data).await.unwrap();
            device.write_all(&[VERIFY_ACK]).await.unwrap();
            device
                .write_all(&checksum::compute(&data).to_le_bytes())
                .await
                .unwrap();
            (expected, data)
        });

        let report = sender()
            .send(&mut host_rx, &mut host_tx, &image, &TransferProgress::hidden())
            .await
            .unwrap();
        assert_eq!(report.received_checksum, crc);
        let (expected, data) = fake.await.unwrap();
        assert_eq!(expected, crc);
        assert_eq!(data, image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_reported_with_both_checksums() {
        let (host, mut device) = tokio::io::duplex(64 * 1024);
        let (mut host_rx, mut host_tx) = tokio::io::split(host);

        let fake = tokio::spawn(async move {
            device.write_all(&[READY]).await.unwrap();
            let size = device.read_u32_le().await.unwrap();
            device.write_all(&[SIZE_ACK]).await.unwrap();
            let _ = device.read_u32_le().await.unwrap();
            let mut data = vec![0u8; size as usize];
            device.read_exact(&mut data).await.unwrap();
            device.write_all(&[VERIFY_ACK]).await.unwrap();
            device.write_all(&0xBAD0_BAD0u32.to_le_bytes()).await.unwrap();
            device
        });

        let image = pattern(100);
        let err = sender()
            .send(&mut host_rx, &mut host_tx, &image, &TransferProgress::hidden())
            .await
            .unwrap_err();
        match err {
            LinkError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, checksum::compute(&image));
                assert_eq!(actual, 0xBAD0_BAD0);
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(fake.await.unwrap());
    }
}
