use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::memory::layout::LayoutError;
use crate::streaming::protocol::PhaseKind;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Timed out waiting for the peer during {phase}")]
    Timeout { phase: PhaseKind },

    #[error("No receiver signalled READY within {waited_ms} ms")]
    NoPeer { waited_ms: u64 },

    #[error("Transport closed during {phase}")]
    Disconnected { phase: PhaseKind },

    #[error("Receiver rejected image of {declared} bytes (capacity {capacity} bytes)")]
    SizeRejected { declared: u32, capacity: u32 },

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Invalid memory layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("Image of {len} bytes cannot be described by a 32-bit length")]
    ImageTooLarge { len: usize },

    #[error("Invalid image name '{name}': {reason}")]
    InvalidImageName { name: String, reason: &'static str },

    #[error("Memory access {addr:#010x}+{len} outside device memory")]
    OutOfBounds { addr: u32, len: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Executor failed: {0}")]
    Executor(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Whether re-running the whole protocol may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout { .. }
                | LinkError::Disconnected { .. }
                | LinkError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
