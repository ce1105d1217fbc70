//! Streaming upload protocol.
//!
//! One session moves one image from host to device with an end-to-end
//! CRC-32 check:
//!
//! ```text
//! Host (Sender)                         Device (Receiver)
//!       |  <------------- READY (repeated) ----|
//!       |  --- size:u32 ---------------------> |  capacity check
//!       |  <------------- SIZE_ACK / REJECT ---|
//!       |  --- checksum:u32 -----------------> |
//!       |  --- data blocks, no acks ---------> |  incremental CRC
//!       |  <------------- VERIFY_ACK crc:u32 --|
//! ```
//!
//! [`session`] holds the receiver state machine without any I/O;
//! [`receiver`] and [`sender`] drive it over any `AsyncRead`/`AsyncWrite`
//! pair with per-phase timeouts.

pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

pub use protocol::{Marker, PhaseKind, Reply, DEFAULT_BLOCK_SIZE};
pub use receiver::{Received, Receiver, ReceiverConfig};
pub use sender::{Sender, SenderConfig, SessionReport};
pub use session::{Outcome, Phase, TransferSession};
