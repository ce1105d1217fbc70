//! ovlink: upload overlays to a RISC-V FPGA board over a serial link and run
//! them in a fixed memory window.
//!
//! The host side is [`upload::Uploader`] on top of
//! [`streaming::Sender`]. The device side is [`server::Supervisor`], which
//! receives with [`streaming::Receiver`] into [`memory::DeviceMemory`] and
//! launches images with [`loader::Loader`].

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod loader;
pub mod memory;
pub mod progress;
pub mod server;
pub mod storage;
pub mod streaming;
pub mod transport;
pub mod upload;

pub use error::{LinkError, Result};
