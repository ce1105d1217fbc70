//! Static memory layout of the device.
//!
//! Regions are described as data (name, kind, size, optional fixed base) and
//! planned once into an immutable [`MemoryLayout`]. Every invariant is
//! checked here so that a bad layout stops the program at configuration time
//! instead of corrupting memory at run time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Overlay code and data window
    Code,
    /// Overlay stack (grows down)
    Stack,
    /// Overlay heap (grows up)
    Heap,
    /// Deliberately unused safety gap
    Gap,
    /// Owned by the supervisor or hardware, never touched by the loader
    Reserved,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegionKind::Code => "code",
            RegionKind::Stack => "stack",
            RegionKind::Heap => "heap",
            RegionKind::Gap => "gap",
            RegionKind::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        const EXEC = 1 << 0;
        const WRITE = 1 << 1;
        const GROWS_UP = 1 << 2;
        const GROWS_DOWN = 1 << 3;
        const GUARD = 1 << 4;
    }
}

impl RegionKind {
    pub fn flags(self) -> RegionFlags {
        match self {
            RegionKind::Code => RegionFlags::EXEC | RegionFlags::WRITE,
            RegionKind::Stack => RegionFlags::WRITE | RegionFlags::GROWS_DOWN,
            RegionKind::Heap => RegionFlags::WRITE | RegionFlags::GROWS_UP,
            RegionKind::Gap => RegionFlags::GUARD,
            RegionKind::Reserved => RegionFlags::empty(),
        }
    }
}

/// Total addressable device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpec {
    pub base: u32,
    pub size: u32,
}

impl MemorySpec {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }
}

/// A requested region, before placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    pub kind: RegionKind,
    pub size: u32,
    /// Fixed base address; placed after the previous region when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<u32>,
}

impl RegionSpec {
    pub fn new(name: impl Into<String>, kind: RegionKind, size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            base: None,
        }
    }

    pub fn at(mut self, base: u32) -> Self {
        self.base = Some(base);
        self
    }
}

/// A placed region: `[base, base + size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub name: String,
    pub kind: RegionKind,
    pub base: u32,
    pub size: u32,
}

impl Region {
    /// One past the last byte. May be 2^32 for a region ending at the top
    /// of the address space.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }

    /// Whether `[addr, addr + len)` lies entirely inside the region.
    pub fn contains_range(&self, addr: u32, len: u64) -> bool {
        addr >= self.base && addr as u64 + len <= self.end()
    }

    fn overlaps(&self, base: u64, end: u64) -> bool {
        (self.base as u64) < end && base < self.end()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("region '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("region '{0}' has zero size")]
    ZeroSize(String),

    #[error("regions need {total} bytes but memory has only {limit}")]
    Overcommitted { total: u64, limit: u64 },

    #[error("memory [{base:#x}, {end:#x}) does not fit a 32-bit address space")]
    AddressOverflow { base: u32, end: u64 },

    #[error("region '{region}' spans [{base:#x}, {end:#x}), outside memory [{floor:#x}, {limit:#x})")]
    OutOfMemory {
        region: String,
        base: u64,
        end: u64,
        floor: u64,
        limit: u64,
    },

    #[error("region '{region}' overlaps region '{other}'")]
    Overlap { region: String, other: String },

    #[error("growing region '{region}' is {gap} bytes from '{neighbour}', needs a {required} byte safety gap")]
    InsufficientGap {
        region: String,
        neighbour: String,
        gap: u64,
        required: u32,
    },

    #[error("layout has no {0} region")]
    MissingRegion(RegionKind),

    #[error("layout has more than one {0} region")]
    AmbiguousRegion(RegionKind),
}

/// The code/stack window an overlay runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayWindow {
    pub code: Region,
    pub stack: Region,
    pub heap: Option<Region>,
    /// Initial stack pointer: end of the stack region, 16-byte aligned
    pub stack_top: u32,
}

impl OverlayWindow {
    /// Largest image the window accepts.
    pub fn capacity(&self) -> u32 {
        self.code.size
    }
}

/// Validated, immutable placement of all regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    memory: MemorySpec,
    safety_gap: u32,
    regions: Vec<Region>,
}

impl MemoryLayout {
    /// Place `specs` in order inside `memory`.
    ///
    /// Regions without a fixed base start where the previous region ended
    /// (the first one at the memory base). Fails with the first violated
    /// invariant: duplicate or empty regions, overcommitted memory, a region
    /// outside memory, overlapping regions, and finally a growing region
    /// (stack down, heap up) closer than `safety_gap` bytes to the nearest
    /// non-gap neighbour in its growth direction.
    pub fn plan(
        memory: MemorySpec,
        safety_gap: u32,
        specs: &[RegionSpec],
    ) -> Result<Self, LayoutError> {
        if memory.end() > 1 << 32 {
            return Err(LayoutError::AddressOverflow {
                base: memory.base,
                end: memory.end(),
            });
        }

        for (i, spec) in specs.iter().enumerate() {
            if spec.size == 0 {
                return Err(LayoutError::ZeroSize(spec.name.clone()));
            }
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(LayoutError::DuplicateName(spec.name.clone()));
            }
        }

        let total: u64 = specs.iter().map(|s| s.size as u64).sum();
        if total > memory.size as u64 {
            return Err(LayoutError::Overcommitted {
                total,
                limit: memory.size as u64,
            });
        }

        let mut regions: Vec<Region> = Vec::with_capacity(specs.len());
        let mut cursor = memory.base as u64;

        for spec in specs {
            let base = spec.base.map(u64::from).unwrap_or(cursor);
            let end = base + spec.size as u64;

            if base < memory.base as u64 || end > memory.end() {
                return Err(LayoutError::OutOfMemory {
                    region: spec.name.clone(),
                    base,
                    end,
                    floor: memory.base as u64,
                    limit: memory.end(),
                });
            }

            if let Some(other) = regions.iter().find(|r| r.overlaps(base, end)) {
                return Err(LayoutError::Overlap {
                    region: spec.name.clone(),
                    other: other.name.clone(),
                });
            }

            // base < memory.end() <= 2^32 here
            regions.push(Region {
                name: spec.name.clone(),
                kind: spec.kind,
                base: base as u32,
                size: spec.size,
            });
            cursor = end;
        }

        check_safety_gaps(&regions, safety_gap)?;

        tracing::debug!(
            regions = regions.len(),
            base = %format!("{:#x}", memory.base),
            size = memory.size,
            "memory layout planned"
        );

        Ok(Self {
            memory,
            safety_gap,
            regions,
        })
    }

    pub fn memory(&self) -> MemorySpec {
        self.memory
    }

    pub fn safety_gap(&self) -> u32 {
        self.safety_gap
    }

    /// Regions in declaration order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn get(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Whether `addr` lies inside the region called `name`. Unknown names
    /// contain nothing.
    pub fn contains(&self, name: &str, addr: u32) -> bool {
        self.get(name).is_some_and(|r| r.contains(addr))
    }

    fn single(&self, kind: RegionKind) -> Result<Option<&Region>, LayoutError> {
        let mut found = self.regions.iter().filter(|r| r.kind == kind);
        let first = found.next();
        if found.next().is_some() {
            return Err(LayoutError::AmbiguousRegion(kind));
        }
        Ok(first)
    }

    /// Derive the overlay window. Needs exactly one code and one stack
    /// region, and at most one heap.
    pub fn overlay_window(&self) -> Result<OverlayWindow, LayoutError> {
        let code = self
            .single(RegionKind::Code)?
            .ok_or(LayoutError::MissingRegion(RegionKind::Code))?
            .clone();
        let stack = self
            .single(RegionKind::Stack)?
            .ok_or(LayoutError::MissingRegion(RegionKind::Stack))?
            .clone();
        let heap = self.single(RegionKind::Heap)?.cloned();

        let stack_top = (stack.end().min(u32::MAX as u64) as u32) & !0xF;

        Ok(OverlayWindow {
            code,
            stack,
            heap,
            stack_top,
        })
    }
}

fn check_safety_gaps(regions: &[Region], required: u32) -> Result<(), LayoutError> {
    let solid = || regions.iter().filter(|r| r.kind != RegionKind::Gap);

    for region in regions {
        let flags = region.kind.flags();

        if flags.contains(RegionFlags::GROWS_DOWN) {
            let below = solid()
                .filter(|r| r.name != region.name && r.end() <= region.base as u64)
                .max_by_key(|r| r.end());
            if let Some(neighbour) = below {
                let gap = region.base as u64 - neighbour.end();
                if gap < required as u64 {
                    return Err(LayoutError::InsufficientGap {
                        region: region.name.clone(),
                        neighbour: neighbour.name.clone(),
                        gap,
                        required,
                    });
                }
            }
        }

        if flags.contains(RegionFlags::GROWS_UP) {
            let above = solid()
                .filter(|r| r.name != region.name && r.base as u64 >= region.end())
                .min_by_key(|r| r.base);
            if let Some(neighbour) = above {
                let gap = neighbour.base as u64 - region.end();
                if gap < required as u64 {
                    return Err(LayoutError::InsufficientGap {
                        region: region.name.clone(),
                        neighbour: neighbour.name.clone(),
                        gap,
                        required,
                    });
                }
            }
        }
    }
    Ok(())
}
