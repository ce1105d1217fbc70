//! Concrete links to a device: a serial device node, a TCP bridge, or a
//! local emulator process spawned as `ovlink serve --once`.
//!
//! Provides raw read/write halves. Protocol handling is done by the sender.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// Where the device is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Serial device node; line settings are configured outside this tool
    Serial(PathBuf),
    /// `tcp://host:port`, e.g. a serial-over-TCP bridge
    Tcp(String),
    /// Emulator child process running this binary
    Local,
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "local" {
            return Ok(Endpoint::Local);
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                anyhow::bail!("TCP endpoint needs host:port, got '{s}'");
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.is_empty() {
            anyhow::bail!("Empty port name");
        }
        Ok(Endpoint::Serial(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Local => f.write_str("local emulator"),
        }
    }
}

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// An open, exclusively owned link.
pub struct Link {
    reader: BoxReader,
    writer: BoxWriter,
    child: Option<Child>,
}

impl Link {
    /// Open `endpoint`. `config` is handed to a spawned emulator.
    pub async fn open(endpoint: &Endpoint, config: Option<&Path>) -> Result<Self> {
        let link = match endpoint {
            Endpoint::Serial(path) => Self::open_serial(path).await?,
            Endpoint::Tcp(addr) => Self::connect_tcp(addr).await?,
            Endpoint::Local => Self::connect_local(config)?,
        };
        tracing::debug!(%endpoint, "link open");
        Ok(link)
    }

    /// Open a serial device node for reading and writing.
    pub async fn open_serial(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open serial port {}", path.display()))?;
        let reader = file
            .try_clone()
            .await
            .context("Failed to clone serial port handle")?;

        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(file),
            child: None,
        })
    }

    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }

    /// Spawn the built-in emulator and talk to it over its stdin/stdout.
    pub fn connect_local(config: Option<&Path>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        if let Some(config) = config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("serve").arg("--once");

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn ovlink emulator")?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;

        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// Read and write halves for one protocol session.
    pub fn split(&mut self) -> (&mut BoxReader, &mut BoxWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// Close the link, waiting for a spawned emulator to exit.
    pub async fn close(self) -> Result<()> {
        let Self {
            reader,
            writer,
            child,
        } = self;
        drop(writer);
        drop(reader);
        if let Some(mut child) = child {
            let status = child.wait().await.context("Failed to wait for emulator")?;
            if !status.success() {
                tracing::warn!(%status, "emulator exited with failure");
            }
        }
        Ok(())
    }
}
