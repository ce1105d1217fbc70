//! The control-transfer seam: what runs once an image is in place.

use std::ops::Range;

use crate::error::Result;
use crate::memory::DeviceMemory;

/// Everything an overlay is started with. Built right before the jump and
/// dropped when control comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Absolute entry address
    pub entry: u32,
    /// Initial stack pointer, 16-byte aligned
    pub stack_pointer: u32,
    /// Absolute BSS range, already zeroed
    pub bss: Range<u32>,
    /// Heap the overlay may use, if the layout has one
    pub heap: Option<Range<u32>>,
}

/// Transfers control to a loaded overlay and returns its status.
///
/// On hardware this is the register setup and jump; an overlay that never
/// returns is invisible from here.
pub trait Executor {
    fn execute(&mut self, memory: &mut DeviceMemory, ctx: &ExecutionContext) -> Result<i32>;
}

/// Output devices an overlay may leave in any state.
pub trait SharedDevices {
    /// Put every device back into its idle state.
    fn neutralise(&mut self);
}

/// Board without shared outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

impl SharedDevices for NoDevices {
    fn neutralise(&mut self) {}
}

/// Neutralises devices when dropped, so it also happens on early return.
pub(crate) struct NeutraliseGuard<'a, D: SharedDevices + ?Sized>(pub(crate) &'a mut D);

impl<D: SharedDevices + ?Sized> Drop for NeutraliseGuard<'_, D> {
    fn drop(&mut self) {
        self.0.neutralise();
    }
}

/// Host stand-in for the CPU: logs the context and the first instruction
/// word, then returns status 0 without running anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExecutor;

impl Executor for TracingExecutor {
    fn execute(&mut self, memory: &mut DeviceMemory, ctx: &ExecutionContext) -> Result<i32> {
        let first = memory.read_u32(ctx.entry)?;
        tracing::info!(
            entry = %format!("{:#010x}", ctx.entry),
            sp = %format!("{:#010x}", ctx.stack_pointer),
            bss = %format!("{:#x}..{:#x}", ctx.bss.start, ctx.bss.end),
            insn = %format!("{first:#010x}"),
            "jumping to overlay"
        );
        Ok(0)
    }
}
