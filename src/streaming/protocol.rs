//! Wire format of the overlay upload protocol.
//!
//! Byte stream, no framing of its own. Single-byte markers go from receiver
//! to sender; everything else is a little-endian u32 or raw image bytes.
//!
//! ```text
//! receiver -> sender   READY
//! sender   -> receiver size:u32
//! receiver -> sender   SIZE_ACK                 | SIZE_REJECT capacity:u32
//! sender   -> receiver checksum:u32
//! sender   -> receiver data[size]
//! receiver -> sender   VERIFY_ACK checksum:u32
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LinkError, Result};

// =============================================================================
// Markers
// =============================================================================

// 0xC0, 0xC1 and 0xF5..=0xFF never occur in UTF-8, so console text from a
// running overlay cannot be mistaken for a marker.

/// Receiver idle and waiting for a size word
pub const READY: u8 = 0xC0;

/// Size accepted, send the checksum and data
pub const SIZE_ACK: u8 = 0xC1;

/// All bytes received, receiver checksum follows
pub const VERIFY_ACK: u8 = 0xF5;

/// Size refused, receiver capacity follows
pub const SIZE_REJECT: u8 = 0xF6;

/// Default streaming block size. Only drives the progress display.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Marker {
    Ready = READY,
    SizeAck = SIZE_ACK,
    VerifyAck = VERIFY_ACK,
    SizeReject = SIZE_REJECT,
}

impl Marker {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            READY => Some(Self::Ready),
            SIZE_ACK => Some(Self::SizeAck),
            VERIFY_ACK => Some(Self::VerifyAck),
            SIZE_REJECT => Some(Self::SizeReject),
            _ => None,
        }
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Protocol phase, as reported in errors and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Ready,
    Size,
    Checksum,
    Streaming,
    Verify,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseKind::Ready => "ready",
            PhaseKind::Size => "size exchange",
            PhaseKind::Checksum => "checksum exchange",
            PhaseKind::Streaming => "streaming",
            PhaseKind::Verify => "verification",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Receiver replies
// =============================================================================

/// Bytes the receiver sends back at a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ready,
    SizeAck,
    SizeReject { capacity: u32 },
    Verify { checksum: u32 },
}

impl Reply {
    /// Phase the reply closes.
    pub fn phase(&self) -> PhaseKind {
        match self {
            Reply::Ready => PhaseKind::Ready,
            Reply::SizeAck | Reply::SizeReject { .. } => PhaseKind::Size,
            Reply::Verify { .. } => PhaseKind::Verify,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        match *self {
            Reply::Ready => buf.put_u8(READY),
            Reply::SizeAck => buf.put_u8(SIZE_ACK),
            Reply::SizeReject { capacity } => {
                buf.put_u8(SIZE_REJECT);
                buf.put_u32_le(capacity);
            }
            Reply::Verify { checksum } => {
                buf.put_u8(VERIFY_ACK);
                buf.put_u32_le(checksum);
            }
        }
        buf.freeze()
    }
}

/// Encode a size or checksum word.
pub fn encode_word(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

// =============================================================================
// Word accumulator
// =============================================================================

/// Collects the four bytes of a little-endian word across arbitrary reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WordBuf {
    bytes: [u8; 4],
    filled: usize,
}

impl WordBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take bytes from `input`; returns how many were used.
    pub fn fill(&mut self, input: &[u8]) -> usize {
        let n = (4 - self.filled).min(input.len());
        self.bytes[self.filled..self.filled + n].copy_from_slice(&input[..n]);
        self.filled += n;
        n
    }

    pub fn value(&self) -> Option<u32> {
        (self.filled == 4).then(|| u32::from_le_bytes(self.bytes))
    }
}

// =============================================================================
// Timed reads and writes
// =============================================================================

/// Read into `buf` within `timeout`. End-of-stream is `Disconnected`.
pub async fn read_some<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    phase: PhaseKind,
) -> Result<usize> {
    match tokio::time::timeout(timeout, r.read(buf)).await {
        Ok(Ok(0)) => Err(LinkError::Disconnected { phase }),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(LinkError::Timeout { phase }),
    }
}

pub async fn read_u8<R: AsyncRead + Unpin>(
    r: &mut R,
    timeout: Duration,
    phase: PhaseKind,
) -> Result<u8> {
    let mut b = [0u8; 1];
    read_some(r, &mut b, timeout, phase).await?;
    Ok(b[0])
}

/// Read a little-endian word; each byte must arrive within `timeout`.
pub async fn read_word<R: AsyncRead + Unpin>(
    r: &mut R,
    timeout: Duration,
    phase: PhaseKind,
) -> Result<u32> {
    let mut word = WordBuf::new();
    let mut buf = [0u8; 4];
    loop {
        if let Some(v) = word.value() {
            return Ok(v);
        }
        let want = 4 - word.filled;
        let n = read_some(r, &mut buf[..want], timeout, phase).await?;
        word.fill(&buf[..n]);
    }
}

/// Write and flush `bytes` within `timeout`. A peer that stops draining the
/// link is a `Timeout` in `phase`, same as one that stops sending.
pub async fn write_bytes<W: AsyncWrite + Unpin>(
    w: &mut W,
    bytes: &[u8],
    timeout: Duration,
    phase: PhaseKind,
) -> Result<()> {
    let write = async {
        w.write_all(bytes).await?;
        w.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(LinkError::Timeout { phase }),
    }
}

// =============================================================================
// Tests
// =============================================================================
