//! Device side of the upload protocol.
//!
//! Signals READY until the sender starts talking, then drives a
//! [`TransferSession`] with whatever bytes arrive, writing its replies back.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::error::{LinkError, Result};
use crate::streaming::protocol::{read_some, write_bytes, PhaseKind, Reply};
use crate::streaming::session::{Outcome, TransferSession};

/// Read buffer size; unrelated to the sender's block size.
const READ_CHUNK: usize = 512;

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Largest image accepted, further capped by the destination length
    pub max_image_size: u32,
    /// How often READY is repeated while idle
    pub ready_interval: Duration,
    /// Give up waiting for a sender after this long; `None` waits forever
    pub ready_timeout: Option<Duration>,
    /// Byte-arrival timeout once a session has started
    pub phase_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_image_size: 192 * 1024,
            ready_interval: Duration::from_millis(500),
            ready_timeout: None,
            phase_timeout: Duration::from_secs(2),
        }
    }
}

/// A verified image now sitting in the destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    pub checksum: u32,
}

pub struct Receiver {
    config: ReceiverConfig,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Run one session, writing image bytes into `dest`.
    ///
    /// On any error the contents of `dest` are unspecified and must not be
    /// executed.
    #[tracing::instrument(name = "receive", skip_all)]
    pub async fn receive<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        dest: &mut [u8],
    ) -> Result<Received>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let capacity = self
            .config
            .max_image_size
            .min(u32::try_from(dest.len()).unwrap_or(u32::MAX));
        let mut session = TransferSession::new(capacity);
        let mut buf = [0u8; READ_CHUNK];
        let started = Instant::now();
        tracing::debug!(capacity, "waiting for sender");

        let outcome = loop {
            if let Some(outcome) = session.outcome() {
                break outcome;
            }
            let phase = session.phase().kind();

            let n = if phase == PhaseKind::Ready {
                let ready = Reply::Ready;
                write_bytes(writer, &ready.encode(), self.config.phase_timeout, ready.phase())
                    .await?;
                match read_some(reader, &mut buf, self.config.ready_interval, phase).await {
                    Ok(n) => n,
                    Err(LinkError::Timeout { .. }) => {
                        if let Some(limit) = self.config.ready_timeout {
                            if started.elapsed() >= limit {
                                return Err(LinkError::Timeout { phase });
                            }
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                read_some(reader, &mut buf, self.config.phase_timeout, phase)
                    .await
                    .inspect_err(|e| {
                        tracing::warn!(
                            %phase,
                            received = session.bytes_received(),
                            "session aborted: {e}"
                        )
                    })?
            };

            let mut input = &buf[..n];
            while !input.is_empty() && !session.is_finished() {
                let step = session.consume(input, dest);
                input = &input[step.consumed..];
                if let Some(reply) = step.reply {
                    tracing::trace!(?reply, "reply");
                    write_bytes(writer, &reply.encode(), self.config.phase_timeout, reply.phase())
                        .await?;
                }
            }
            if !input.is_empty() {
                tracing::debug!(extra = input.len(), "ignoring bytes past end of image");
            }
        };

        match outcome {
            Outcome::Verified { size, checksum } => {
                tracing::info!(
                    size,
                    checksum = %format!("{checksum:#010x}"),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "image received"
                );
                Ok(Received {
                    len: size as usize,
                    checksum,
                })
            }
            Outcome::Mismatch {
                expected, actual, ..
            } => {
                tracing::warn!(
                    expected = %format!("{expected:#010x}"),
                    actual = %format!("{actual:#010x}"),
                    "image failed verification, discarding"
                );
                Err(LinkError::ChecksumMismatch { expected, actual })
            }
            Outcome::Rejected { declared, capacity } => {
                Err(LinkError::SizeRejected { declared, capacity })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::streaming::protocol::{encode_word, READY, SIZE_ACK, SIZE_REJECT, VERIFY_ACK};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(max: u32) -> ReceiverConfig {
        ReceiverConfig {
            max_image_size: max,
            ready_interval: Duration::from_millis(50),
            ready_timeout: Some(Duration::from_secs(5)),
            phase_timeout: Duration::from_millis(200),
        }
    }

    /// Read bytes from the receiver until a non-READY byte shows up.
    async fn next_non_ready<R: AsyncRead + Unpin>(r: &mut R) -> u8 {
        loop {
            let b = r.read_u8().await.unwrap();
            if b != READY {
                return b;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_not_draining_ready_times_out() {
        // room for a single READY; the host never reads it
        let (_host, device) = tokio::io::duplex(1);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let started = tokio::time::Instant::now();
        let mut dest = vec![0u8; 16];
        let err = Receiver::new(config(16))
            .receive(&mut dev_rx, &mut dev_tx, &mut dest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Timeout {
                phase: PhaseKind::Ready
            }
        ));
        // well before the 5 s ready timeout
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_with_hand_written_sender() {
        let (mut host, device) = tokio::io::duplex(4096);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let image: Vec<u8> = (0..=255u8).cycle().take(2500).collect();
        let crc = checksum::compute(&image);

        let recv = tokio::spawn(async move {
            let mut dest = vec![0u8; 4096];
            let res = Receiver::new(config(4096))
                .receive(&mut dev_rx, &mut dev_tx, &mut dest)
                .await;
            (res, dest)
        });

        assert_eq!(host.read_u8().await.unwrap(), READY);
        host.write_all(&encode_word(image.len() as u32)).await.unwrap();
        assert_eq!(next_non_ready(&mut host).await, SIZE_ACK);
        host.write_all(&encode_word(crc)).await.unwrap();
        // odd chunking, nothing to do with any block size
        for chunk in image.chunks(333) {
            host.write_all(chunk).await.unwrap();
        }
        assert_eq!(host.read_u8().await.unwrap(), VERIFY_ACK);
        assert_eq!(host.read_u32_le().await.unwrap(), crc);

        let (res, dest) = recv.await.unwrap();
        assert_eq!(
            res.unwrap(),
            Received {
                len: 2500,
                checksum: crc
            }
        );
        assert_eq!(&dest[..2500], &image[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_repeats_while_idle() {
        let (mut host, device) = tokio::io::duplex(4096);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let recv = tokio::spawn(async move {
            let mut dest = vec![0u8; 16];
            Receiver::new(config(16))
                .receive(&mut dev_rx, &mut dev_tx, &mut dest)
                .await
        });

        // several intervals pass before the sender shows up
        tokio::time::sleep(Duration::from_millis(175)).await;
        let mut markers = [0u8; 3];
        host.read_exact(&mut markers).await.unwrap();
        assert_eq!(markers, [READY; 3]);

        host.write_all(&encode_word(0)).await.unwrap();
        assert_eq!(next_non_ready(&mut host).await, SIZE_ACK);
        host.write_all(&encode_word(0)).await.unwrap();
        assert_eq!(next_non_ready(&mut host).await, VERIFY_ACK);
        assert_eq!(recv.await.unwrap().unwrap().len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_declaration_rejected() {
        let (mut host, device) = tokio::io::duplex(4096);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let recv = tokio::spawn(async move {
            let mut dest = vec![0xEEu8; 64];
            let res = Receiver::new(config(64))
                .receive(&mut dev_rx, &mut dev_tx, &mut dest)
                .await;
            (res, dest)
        });

        assert_eq!(host.read_u8().await.unwrap(), READY);
        host.write_all(&encode_word(65)).await.unwrap();
        assert_eq!(next_non_ready(&mut host).await, SIZE_REJECT);
        assert_eq!(host.read_u32_le().await.unwrap(), 64);

        let (res, dest) = recv.await.unwrap();
        assert!(matches!(
            res,
            Err(LinkError::SizeRejected {
                declared: 65,
                capacity: 64
            })
        ));
        assert!(dest.iter().all(|&b| b == 0xEE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_stream_times_out_in_streaming() {
        let (mut host, device) = tokio::io::duplex(4096);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let recv = tokio::spawn(async move {
            let mut dest = vec![0u8; 1024];
            Receiver::new(config(1024))
                .receive(&mut dev_rx, &mut dev_tx, &mut dest)
                .await
        });

        assert_eq!(host.read_u8().await.unwrap(), READY);
        host.write_all(&encode_word(100)).await.unwrap();
        assert_eq!(next_non_ready(&mut host).await, SIZE_ACK);
        host.write_all(&encode_word(0x1234_5678)).await.unwrap();
        // 60 of 100 bytes, then silence with the link still open
        host.write_all(&[0x42; 60]).await.unwrap();

        let err = recv.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            LinkError::Timeout {
                phase: PhaseKind::Streaming
            }
        ));
        drop(host);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sender_times_out_in_ready() {
        let (_host, device) = tokio::io::duplex(4096);
        let (mut dev_rx, mut dev_tx) = tokio::io::split(device);

        let mut dest = vec![0u8; 16];
        let mut cfg = config(16);
        cfg.ready_timeout = Some(Duration::from_millis(300));
        let err = Receiver::new(cfg)
            .receive(&mut dev_rx, &mut dev_tx, &mut dest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Timeout {
                phase: PhaseKind::Ready
            }
        ));
    }
}
