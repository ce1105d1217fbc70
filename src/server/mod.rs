//! Supervisor: the device main loop.
//!
//! Runs when invoked as `ovlink serve`. Signals ready, receives an image,
//! launches it through the loader and goes back to waiting. Protocol
//! diagnostics go to stderr; stdin/stdout carry the link.

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite};

use crate::error::{LinkError, Result};
use crate::loader::{Executor, ExitReason, Loader, NoDevices, SharedDevices};
use crate::memory::{DeviceMemory, MemoryLayout, OverlayWindow};
use crate::storage::ImageSource;
use crate::streaming::{Receiver, ReceiverConfig};

/// Where received bytes land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Straight into the code window; a failed session leaves it invalid
    Direct,
    /// Into a holding buffer; the code window only sees verified images
    Staged,
}

/// Counters for one `serve` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub sessions: u32,
    pub launched: u32,
    pub failed: u32,
}

pub struct Supervisor<E, D = NoDevices> {
    memory: DeviceMemory,
    layout: MemoryLayout,
    window: OverlayWindow,
    loader: Loader<E, D>,
    receiver: Receiver,
    mode: ReceiveMode,
    staging: Vec<u8>,
    code_valid: bool,
}

impl<E: Executor, D: SharedDevices> Supervisor<E, D> {
    pub fn new(
        layout: MemoryLayout,
        receiver: ReceiverConfig,
        loader: Loader<E, D>,
        mode: ReceiveMode,
    ) -> Result<Self> {
        let window = layout.overlay_window()?;
        let capacity = receiver.max_image_size.min(window.capacity());
        let staging = match mode {
            ReceiveMode::Staged => vec![0; capacity as usize],
            ReceiveMode::Direct => Vec::new(),
        };
        tracing::debug!(
            ?mode,
            code = %format!("{:#010x}", window.code.base),
            capacity,
            "supervisor ready"
        );
        Ok(Self {
            memory: DeviceMemory::new(layout.memory()),
            layout,
            window,
            loader,
            receiver: Receiver::new(ReceiverConfig {
                max_image_size: capacity,
                ..receiver
            }),
            mode,
            staging,
            code_valid: false,
        })
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn window(&self) -> &OverlayWindow {
        &self.window
    }

    pub fn mode(&self) -> ReceiveMode {
        self.mode
    }

    /// Whether the code window holds a verified image.
    pub fn has_valid_image(&self) -> bool {
        self.code_valid
    }

    /// One receive-and-run cycle.
    pub async fn serve_one<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<ExitReason>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.mode {
            ReceiveMode::Direct => {
                self.code_valid = false;
                let dest = self.memory.region_mut(&self.window.code)?;
                let received = self.receiver.receive(reader, writer, dest).await?;
                let exit = self
                    .loader
                    .run_in_place(&mut self.memory, &self.window, received.len)?;
                self.code_valid = matches!(exit, ExitReason::Returned { .. });
                Ok(exit)
            }
            ReceiveMode::Staged => {
                let received = self
                    .receiver
                    .receive(reader, writer, &mut self.staging)
                    .await?;
                let bytes = Bytes::copy_from_slice(&self.staging[..received.len]);
                let exit = self
                    .loader
                    .load_bytes(&mut self.memory, &self.window, bytes)?;
                self.code_valid = matches!(exit, ExitReason::Returned { .. });
                Ok(exit)
            }
        }
    }

    /// Serve sessions until the host goes away, or after the first session
    /// when `once` is set.
    pub async fn serve<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        once: bool,
    ) -> Result<ServeStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = ServeStats::default();
        loop {
            stats.sessions += 1;
            match self.serve_one(reader, writer).await {
                Ok(exit) => {
                    if matches!(exit, ExitReason::Returned { .. }) {
                        stats.launched += 1;
                    }
                    tracing::info!(session = stats.sessions, "overlay {exit}");
                }
                Err(e) if is_disconnect(&e) => {
                    tracing::info!("host disconnected: {e}");
                    stats.sessions -= 1;
                    return Ok(stats);
                }
                Err(e) if once => return Err(e),
                Err(e @ LinkError::Io(_)) => return Err(e),
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(session = stats.sessions, "session failed: {e}");
                }
            }
            if once {
                return Ok(stats);
            }
        }
    }

    /// Serve over this process's stdin/stdout.
    pub async fn serve_stdio(&mut self, once: bool) -> Result<ServeStats> {
        let mut stdin = io::stdin();
        let mut stdout = io::stdout();
        self.serve(&mut stdin, &mut stdout, once).await
    }

    /// Load a named image from `source` and run it.
    pub async fn run_stored(&mut self, source: &dyn ImageSource, name: &str) -> Result<ExitReason> {
        let bytes = source.resolve(name).await?;
        tracing::info!(name, len = bytes.len(), "running stored image");
        let exit = self.loader.load_bytes(&mut self.memory, &self.window, bytes)?;
        self.code_valid = matches!(exit, ExitReason::Returned { .. });
        Ok(exit)
    }
}

/// The host closed its end of the link.
fn is_disconnect(e: &LinkError) -> bool {
    match e {
        LinkError::Disconnected { .. } => true,
        LinkError::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
