//! Device memory: the planned region layout and the RAM it describes.

pub mod device;
pub mod layout;

pub use device::DeviceMemory;
pub use layout::{
    LayoutError, MemoryLayout, MemorySpec, OverlayWindow, Region, RegionFlags, RegionKind,
    RegionSpec,
};
