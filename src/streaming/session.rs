//! Receiver side of one transfer, as a byte-driven state machine.
//!
//! No I/O happens here. The driver feeds whatever bytes arrived into
//! [`TransferSession::consume`] and writes back the [`Reply`] it returns.
//! Data consumption is driven by the declared size only; block boundaries on
//! the wire mean nothing.

use crate::checksum::Crc32;
use crate::streaming::protocol::{PhaseKind, Reply, WordBuf};

#[derive(Debug)]
pub enum Phase {
    /// Nothing received yet
    Ready,
    Size(WordBuf),
    Checksum {
        size: u32,
        word: WordBuf,
    },
    Streaming {
        size: u32,
        expected: u32,
        received: u32,
        crc: Crc32,
    },
    /// All bytes in and the verify reply sent
    Complete {
        size: u32,
        expected: u32,
        actual: u32,
    },
    /// Declared size above capacity; the reject reply was sent
    Rejected {
        declared: u32,
        capacity: u32,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Ready => PhaseKind::Ready,
            Phase::Size(_) | Phase::Rejected { .. } => PhaseKind::Size,
            Phase::Checksum { .. } => PhaseKind::Checksum,
            Phase::Streaming { .. } => PhaseKind::Streaming,
            Phase::Complete { .. } => PhaseKind::Verify,
        }
    }
}

/// Result of feeding bytes to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Input bytes used
    pub consumed: usize,
    /// Reply to send before feeding more input
    pub reply: Option<Reply>,
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Verified { size: u32, checksum: u32 },
    Mismatch { size: u32, expected: u32, actual: u32 },
    Rejected { declared: u32, capacity: u32 },
}

pub struct TransferSession {
    capacity: u32,
    phase: Phase,
}

impl TransferSession {
    /// `capacity` is the largest image this session will accept; the
    /// destination passed to `consume` must be at least that long.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            phase: Phase::Ready,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Image bytes written into the destination so far.
    pub fn bytes_received(&self) -> u32 {
        match self.phase {
            Phase::Streaming { received, .. } => received,
            Phase::Complete { size, .. } => size,
            _ => 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Complete { .. } | Phase::Rejected { .. })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            Phase::Complete {
                size,
                expected,
                actual,
            } if expected == actual => Some(Outcome::Verified {
                size,
                checksum: actual,
            }),
            Phase::Complete {
                size,
                expected,
                actual,
            } => Some(Outcome::Mismatch {
                size,
                expected,
                actual,
            }),
            Phase::Rejected { declared, capacity } => {
                Some(Outcome::Rejected { declared, capacity })
            }
            _ => None,
        }
    }

    /// Feed received bytes. Stops early after producing a reply, or once the
    /// session is finished; trailing input is left unconsumed.
    pub fn consume(&mut self, input: &[u8], dest: &mut [u8]) -> Step {
        let mut used = 0;

        loop {
            let rest = &input[used..];
            match &mut self.phase {
                Phase::Ready => {
                    if rest.is_empty() {
                        break;
                    }
                    self.phase = Phase::Size(WordBuf::new());
                }
                Phase::Size(word) => {
                    used += word.fill(rest);
                    let Some(size) = word.value() else { break };

                    let capacity = self
                        .capacity
                        .min(u32::try_from(dest.len()).unwrap_or(u32::MAX));
                    if size > capacity {
                        tracing::warn!(declared = size, capacity, "rejecting oversized image");
                        self.phase = Phase::Rejected {
                            declared: size,
                            capacity,
                        };
                        return Step {
                            consumed: used,
                            reply: Some(Reply::SizeReject { capacity }),
                        };
                    }

                    tracing::debug!(size, "size accepted");
                    self.phase = Phase::Checksum {
                        size,
                        word: WordBuf::new(),
                    };
                    return Step {
                        consumed: used,
                        reply: Some(Reply::SizeAck),
                    };
                }
                Phase::Checksum { size, word } => {
                    used += word.fill(rest);
                    let Some(expected) = word.value() else { break };
                    let size = *size;

                    tracing::debug!(expected = %format!("{expected:#010x}"), "checksum received");
                    self.phase = Phase::Streaming {
                        size,
                        expected,
                        received: 0,
                        crc: Crc32::new(),
                    };
                }
                Phase::Streaming {
                    size,
                    expected,
                    received,
                    crc,
                } => {
                    let want = (*size - *received) as usize;
                    let take = want.min(rest.len());
                    if take > 0 {
                        let start = *received as usize;
                        let chunk = &rest[..take];
                        dest[start..start + take].copy_from_slice(chunk);
                        crc.update(chunk);
                        *received += take as u32;
                        used += take;
                    }
                    if *received < *size {
                        break;
                    }

                    let (size, expected) = (*size, *expected);
                    let crc = std::mem::take(crc);
                    let actual = crc.finalize();
                    self.phase = Phase::Complete {
                        size,
                        expected,
                        actual,
                    };
                    return Step {
                        consumed: used,
                        reply: Some(Reply::Verify { checksum: actual }),
                    };
                }
                Phase::Complete { .. } | Phase::Rejected { .. } => break,
            }
        }

        Step {
            consumed: used,
            reply: None,
        }
    }
}
