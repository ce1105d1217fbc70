//! Configuration file (`config.toml`).
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration for the reference board.
//!
//! ```toml
//! [link]
//! port = "/dev/ttyUSB0"
//! retries = 3
//!
//! [device]
//! staged = true
//!
//! [layout]
//! size = 0x80000
//! [[layout.regions]]
//! name = "code"
//! kind = "code"
//! size = 0x30000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LinkError, Result};
use crate::loader::LoaderConfig;
use crate::memory::{MemoryLayout, MemorySpec, OverlayWindow, RegionKind, RegionSpec};
use crate::streaming::protocol::DEFAULT_BLOCK_SIZE;
use crate::streaming::{ReceiverConfig, SenderConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub device: DeviceConfig,
    pub layout: LayoutConfig,
}

/// Host side of the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device node or `tcp://host:port`
    pub port: Option<String>,
    pub ready_timeout_ms: u64,
    pub phase_timeout_ms: u64,
    pub block_size: usize,
    pub retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            ready_timeout_ms: 10_000,
            phase_timeout_ms: 2_000,
            block_size: DEFAULT_BLOCK_SIZE,
            retries: 3,
        }
    }
}

/// Device (receiver and loader) side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Defaults to the code region size
    pub max_image_size: Option<u32>,
    pub ready_interval_ms: u64,
    /// Unset waits for a sender forever
    pub ready_timeout_ms: Option<u64>,
    pub phase_timeout_ms: u64,
    pub require_header: bool,
    /// Receive into a holding buffer instead of the code window
    pub staged: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_image_size: None,
            ready_interval_ms: 500,
            ready_timeout_ms: None,
            phase_timeout_ms: 2_000,
            require_header: false,
            staged: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub base: u32,
    pub size: u32,
    pub safety_gap: u32,
    pub regions: Vec<RegionSpec>,
}

impl Default for LayoutConfig {
    /// 512 KiB board: supervisor, overlay code, heap, guard gap, stack.
    fn default() -> Self {
        Self {
            base: 0,
            size: 0x8_0000,
            safety_gap: 0x1000,
            regions: vec![
                RegionSpec::new("supervisor", RegionKind::Reserved, 0x1_8000),
                RegionSpec::new("code", RegionKind::Code, 0x3_0000),
                RegionSpec::new("heap", RegionKind::Heap, 0x2_0000),
                RegionSpec::new("guard", RegionKind::Gap, 0x1000),
                RegionSpec::new("stack", RegionKind::Stack, 0x8000),
            ],
        }
    }
}

impl LayoutConfig {
    pub fn memory(&self) -> MemorySpec {
        MemorySpec {
            base: self.base,
            size: self.size,
        }
    }

    pub fn plan(&self) -> Result<MemoryLayout> {
        Ok(MemoryLayout::plan(
            self.memory(),
            self.safety_gap,
            &self.regions,
        )?)
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/ovlink/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ovlink").join("config.toml"))
    }

    /// Load `path`, or the default path if `None`. A missing default file
    /// means defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::parse(&text)
                    .map_err(|e| LinkError::Config(format!("{}: {e}", path.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                Ok(Self::default())
            }
            Err(source) => Err(LinkError::ReadFile { path, source }),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LinkError::Config(e.to_string()))
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            ready_timeout: Duration::from_millis(self.link.ready_timeout_ms),
            phase_timeout: Duration::from_millis(self.link.phase_timeout_ms),
            block_size: self.link.block_size.max(1),
        }
    }

    /// Receiver settings for `window`; never accepts more than the code
    /// region holds.
    pub fn receiver_config(&self, window: &OverlayWindow) -> ReceiverConfig {
        let capacity = window.capacity();
        ReceiverConfig {
            max_image_size: self.device.max_image_size.unwrap_or(capacity).min(capacity),
            ready_interval: Duration::from_millis(self.device.ready_interval_ms),
            ready_timeout: self.device.ready_timeout_ms.map(Duration::from_millis),
            phase_timeout: Duration::from_millis(self.device.phase_timeout_ms),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            require_header: self.device.require_header,
        }
    }
}
