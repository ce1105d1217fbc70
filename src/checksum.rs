//! CRC-32 integrity codec shared by both ends of the upload protocol.
//!
//! CRC-32/ISO-HDLC (the zlib/Ethernet CRC): reflected polynomial 0xEDB88320,
//! initial value 0xFFFFFFFF, final XOR 0xFFFFFFFF. The empty input checksums
//! to 0x00000000.

/// Checksum of a complete buffer.
pub fn compute(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Incremental checksum; `finalize` equals `compute` over everything fed to
/// `update`, however the input was split.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

impl std::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc32")
            .field("current", &self.hasher.clone().finalize())
            .finish()
    }
}
