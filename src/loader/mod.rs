//! Overlay loader: place an image in the code window, clear its BSS, jump,
//! and take control back.
//!
//! All preconditions are checked before the first byte is written, so a
//! refused image leaves device memory untouched.

pub mod executor;
pub mod image;

pub use executor::{ExecutionContext, Executor, NoDevices, SharedDevices, TracingExecutor};
pub use image::{Image, ImageHeader, RejectReason, HEADER_LEN, MAGIC};

use bytes::Bytes;
use serde::Deserialize;
use std::ops::Range;

use crate::error::Result;
use crate::memory::{DeviceMemory, OverlayWindow};
use executor::NeutraliseGuard;

/// How a load attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The overlay ran and returned
    Returned { status: i32 },
    /// Larger than the code region; nothing was written
    OversizedImage { len: usize, capacity: u32 },
    /// Failed a sanity check; nothing was run
    Rejected(RejectReason),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Returned { status } => write!(f, "returned with status {status}"),
            ExitReason::OversizedImage { len, capacity } => {
                write!(f, "image of {len} bytes exceeds code region of {capacity} bytes")
            }
            ExitReason::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Refuse images without a valid header
    pub require_header: bool,
}

pub struct Loader<E, D = NoDevices> {
    executor: E,
    devices: D,
    config: LoaderConfig,
}

impl<E: Executor> Loader<E, NoDevices> {
    pub fn new(executor: E, config: LoaderConfig) -> Self {
        Self::with_devices(executor, NoDevices, config)
    }
}

impl<E: Executor, D: SharedDevices> Loader<E, D> {
    pub fn with_devices(executor: E, devices: D, config: LoaderConfig) -> Self {
        Self {
            executor,
            devices,
            config,
        }
    }

    /// Parse `bytes` as an image and run it. A malformed header is a
    /// rejection, not an error.
    pub fn load_bytes(
        &mut self,
        memory: &mut DeviceMemory,
        window: &OverlayWindow,
        bytes: Bytes,
    ) -> Result<ExitReason> {
        match Image::parse(bytes) {
            Ok(image) => self.load_and_run(memory, window, &image),
            Err(reason) => Ok(ExitReason::Rejected(reason)),
        }
    }

    /// Copy `image` to the code base, zero its BSS and run it.
    #[tracing::instrument(name = "load", skip_all, fields(len = image.len()))]
    pub fn load_and_run(
        &mut self,
        memory: &mut DeviceMemory,
        window: &OverlayWindow,
        image: &Image,
    ) -> Result<ExitReason> {
        let bss = match self.check(window, image) {
            Ok(bss) => bss,
            Err(exit) => return Ok(exit),
        };
        memory.write(window.code.base, image.bytes())?;
        self.launch(memory, window, image, bss)
    }

    /// Run an image the receiver already wrote to the code base.
    #[tracing::instrument(name = "load", skip_all, fields(len = len))]
    pub fn run_in_place(
        &mut self,
        memory: &mut DeviceMemory,
        window: &OverlayWindow,
        len: usize,
    ) -> Result<ExitReason> {
        if len > window.capacity() as usize {
            return Ok(ExitReason::OversizedImage {
                len,
                capacity: window.capacity(),
            });
        }
        let bytes = Bytes::copy_from_slice(memory.read(window.code.base, len)?);
        let image = match Image::parse(bytes) {
            Ok(image) => image,
            Err(reason) => return Ok(ExitReason::Rejected(reason)),
        };
        let bss = match self.check(window, &image) {
            Ok(bss) => bss,
            Err(exit) => return Ok(exit),
        };
        self.launch(memory, window, &image, bss)
    }

    /// Preconditions; on success the absolute BSS range.
    fn check(
        &self,
        window: &OverlayWindow,
        image: &Image,
    ) -> std::result::Result<Range<u32>, ExitReason> {
        let code = &window.code;
        if image.len() > code.size as usize {
            tracing::warn!(len = image.len(), capacity = code.size, "image too large");
            return Err(ExitReason::OversizedImage {
                len: image.len(),
                capacity: code.size,
            });
        }
        if self.config.require_header && image.header().is_none() {
            return Err(ExitReason::Rejected(RejectReason::BadMagic));
        }

        let entry = code.base.checked_add(image.entry());
        if !entry.is_some_and(|e| code.contains(e)) {
            return Err(ExitReason::Rejected(RejectReason::EntryOutsideCode {
                entry: code.base.wrapping_add(image.entry()),
            }));
        }

        // the entry must land on loaded bytes, past the header if there is one
        let first = if image.header().is_some() { HEADER_LEN } else { 0 };
        let offset = image.entry() as usize;
        if offset < first || offset >= image.len() {
            tracing::warn!(entry = offset, len = image.len(), "entry not inside the image");
            return Err(ExitReason::Rejected(RejectReason::EntryOutsideImage {
                entry: image.entry(),
                len: image.len(),
            }));
        }

        let bss = image.bss();
        let start = code.base.checked_add(bss.start);
        let end = code.base.checked_add(bss.end);
        match (start, end) {
            (Some(start), Some(end))
                if start <= end && code.contains_range(start, (end - start) as u64) =>
            {
                Ok(start..end)
            }
            _ => Err(ExitReason::Rejected(RejectReason::BssOutsideCode {
                start: code.base.wrapping_add(bss.start),
                end: code.base.wrapping_add(bss.end),
            })),
        }
    }

    fn launch(
        &mut self,
        memory: &mut DeviceMemory,
        window: &OverlayWindow,
        image: &Image,
        bss: Range<u32>,
    ) -> Result<ExitReason> {
        memory.fill(bss.start, bss.len(), 0)?;

        if image.header().is_some() && memory.read(window.code.base, MAGIC.len())? != MAGIC {
            return Ok(ExitReason::Rejected(RejectReason::MagicLost));
        }

        let ctx = ExecutionContext {
            entry: window.code.base + image.entry(),
            stack_pointer: window.stack_top,
            bss,
            heap: window
                .heap
                .as_ref()
                .map(|h| h.base..h.end().min(u32::MAX as u64) as u32),
        };
        tracing::debug!(?ctx, "execution context ready");

        let status = {
            let _guard = NeutraliseGuard(&mut self.devices);
            self.executor.execute(memory, &ctx)?
        };
        tracing::info!(status, "overlay returned");
        Ok(ExitReason::Returned { status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::memory::{MemoryLayout, MemorySpec, RegionKind, RegionSpec};

    /// Records each context and the memory it saw at the entry point.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(ExecutionContext, Vec<u8>)>,
        fail: bool,
    }

    impl Executor for &mut Recorder {
        fn execute(&mut self, memory: &mut DeviceMemory, ctx: &ExecutionContext) -> Result<i32> {
            if self.fail {
                return Err(LinkError::Executor("trap".into()));
            }
            let snapshot = memory.read(ctx.entry, 4)?.to_vec();
            self.calls.push((ctx.clone(), snapshot));
            Ok(7)
        }
    }

    #[derive(Default)]
    struct Leds {
        resets: u32,
    }

    impl SharedDevices for &mut Leds {
        fn neutralise(&mut self) {
            self.resets += 1;
        }
    }

    fn setup() -> (DeviceMemory, OverlayWindow) {
        let memory = MemorySpec {
            base: 0x8000_0000,
            size: 0x400,
        };
        let layout = MemoryLayout::plan(
            memory,
            0x40,
            &[
                RegionSpec::new("supervisor", RegionKind::Reserved, 0x100),
                RegionSpec::new("code", RegionKind::Code, 0x100),
                RegionSpec::new("gap", RegionKind::Gap, 0x40),
                RegionSpec::new("stack", RegionKind::Stack, 0x100),
            ],
        )
        .unwrap();
        (DeviceMemory::new(memory), layout.overlay_window().unwrap())
    }

    #[test]
    fn test_exact_fit_runs_with_bss_zeroed() {
        let (mut memory, window) = setup();
        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());

        let mut bytes = vec![0xAAu8; 0x100];
        bytes[0x10..0x14].copy_from_slice(&[0x13, 0x05, 0x10, 0x00]);
        let image = Image::with_layout(bytes, 0x10, 0xC0..0x100);

        let exit = loader.load_and_run(&mut memory, &window, &image).unwrap();
        assert_eq!(exit, ExitReason::Returned { status: 7 });

        let code = window.code.base;
        assert_eq!(memory.read(code, 0x10).unwrap(), &[0xAA; 0x10]);
        // image bytes from the entry up to the BSS survive
        assert_eq!(memory.read(code + 0x10, 4).unwrap(), &[0x13, 0x05, 0x10, 0x00]);
        assert_eq!(memory.read(code + 0x14, 0xC0 - 0x14).unwrap(), &[0xAA; 0xC0 - 0x14][..]);
        assert!(memory.read(code + 0xC0, 0x40).unwrap().iter().all(|&b| b == 0));

        let (ctx, insn) = &recorder.calls[0];
        assert_eq!(ctx.entry, code + 0x10);
        assert_eq!(ctx.stack_pointer, window.stack_top);
        assert_eq!(ctx.stack_pointer % 16, 0);
        assert_eq!(ctx.bss, code + 0xC0..code + 0x100);
        assert_eq!(insn, &[0x13, 0x05, 0x10, 0x00]);
    }

    #[test]
    fn test_oversized_leaves_memory_untouched() {
        let (mut memory, window) = setup();
        memory.fill(window.code.base, 0x100, 0x5A).unwrap();
        let before = memory.read(memory.base(), memory.size()).unwrap().to_vec();

        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());
        let exit = loader
            .load_and_run(&mut memory, &window, &Image::raw(vec![0u8; 0x101]))
            .unwrap();

        assert_eq!(
            exit,
            ExitReason::OversizedImage {
                len: 0x101,
                capacity: 0x100
            }
        );
        assert_eq!(memory.read(memory.base(), memory.size()).unwrap(), &before[..]);
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn test_require_header_rejects_raw() {
        let (mut memory, window) = setup();
        let mut recorder = Recorder::default();
        let mut loader = Loader::new(
            &mut recorder,
            LoaderConfig {
                require_header: true,
            },
        );
        let exit = loader
            .load_bytes(&mut memory, &window, Bytes::from_static(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(exit, ExitReason::Rejected(RejectReason::BadMagic));

        let packed = Image::pack(&[0x13, 0, 0, 0], 0, 4..16).unwrap();
        let exit = loader.load_bytes(&mut memory, &window, packed).unwrap();
        assert_eq!(exit, ExitReason::Returned { status: 7 });
        assert_eq!(recorder.calls[0].0.entry, window.code.base + HEADER_LEN as u32);
    }

    #[test]
    fn test_entry_and_bss_must_stay_in_code() {
        let (mut memory, window) = setup();
        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());

        let exit = loader
            .load_and_run(&mut memory, &window, &Image::with_layout(vec![0u8; 8], 0x100, 0..0))
            .unwrap();
        assert!(matches!(
            exit,
            ExitReason::Rejected(RejectReason::EntryOutsideCode { .. })
        ));

        let exit = loader
            .load_and_run(&mut memory, &window, &Image::with_layout(vec![0u8; 8], 0, 0x80..0x140))
            .unwrap();
        assert!(matches!(
            exit,
            ExitReason::Rejected(RejectReason::BssOutsideCode { .. })
        ));
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn test_entry_must_point_into_loaded_bytes() {
        let (mut memory, window) = setup();
        memory.fill(window.code.base, 0x100, 0x13).unwrap();
        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());

        // nothing loaded; the code window only holds leftovers
        let exit = loader
            .load_and_run(&mut memory, &window, &Image::raw(Vec::new()))
            .unwrap();
        assert_eq!(
            exit,
            ExitReason::Rejected(RejectReason::EntryOutsideImage { entry: 0, len: 0 })
        );

        // inside the code region but past the four loaded bytes
        let exit = loader
            .load_and_run(&mut memory, &window, &Image::with_layout(vec![0x13; 4], 0x80, 0..0))
            .unwrap();
        assert_eq!(
            exit,
            ExitReason::Rejected(RejectReason::EntryOutsideImage { entry: 0x80, len: 4 })
        );
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn test_header_entry_must_skip_header() {
        let (mut memory, window) = setup();
        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());

        // a header whose entry points back into itself
        let mut bytes = Image::pack(&[0x13; 8], 0, 0..0).unwrap().to_vec();
        let header = ImageHeader {
            entry: 4,
            bss_start: 28,
            bss_end: 28,
        };
        bytes[..HEADER_LEN].copy_from_slice(&header.encode());
        let exit = loader
            .load_bytes(&mut memory, &window, Bytes::from(bytes))
            .unwrap();
        assert!(matches!(
            exit,
            ExitReason::Rejected(RejectReason::EntryOutsideImage { entry: 4, .. })
        ));

        // header-only image: nothing to jump to
        let packed = Image::pack(&[], 0, 0..0).unwrap();
        let exit = loader.load_bytes(&mut memory, &window, packed).unwrap();
        assert!(matches!(
            exit,
            ExitReason::Rejected(RejectReason::EntryOutsideImage { entry: 20, len: 20 })
        ));
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn test_devices_neutralised_even_on_executor_error() {
        let (mut memory, window) = setup();
        let mut recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut leds = Leds::default();
        {
            let mut loader =
                Loader::with_devices(&mut recorder, &mut leds, LoaderConfig::default());
            let err = loader
                .load_and_run(&mut memory, &window, &Image::raw(vec![0u8; 4]))
                .unwrap_err();
            assert!(matches!(err, LinkError::Executor(_)));
        }
        assert_eq!(leds.resets, 1);
    }

    #[test]
    fn test_run_in_place() {
        let (mut memory, window) = setup();
        let packed = Image::pack(&[0x67, 0x80, 0, 0], 0, 4..8).unwrap();
        memory.write(window.code.base, &packed).unwrap();
        memory.write(window.code.base + 24, &[0xFF; 4]).unwrap();

        let mut recorder = Recorder::default();
        let mut loader = Loader::new(&mut recorder, LoaderConfig::default());
        let exit = loader
            .run_in_place(&mut memory, &window, packed.len())
            .unwrap();
        assert_eq!(exit, ExitReason::Returned { status: 7 });
        assert_eq!(memory.read(window.code.base + 24, 4).unwrap(), &[0; 4]);
    }
}
