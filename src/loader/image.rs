//! Overlay images and the optional header that describes them.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "OVL1"
//!      4     4  entry      offset from code base
//!      8     4  bss_start  offset from code base
//!     12     4  bss_end    offset from code base
//!     16     4  header_crc CRC-32 of bytes 0..16
//! ```
//!
//! The header is loaded along with the rest of the image, so all offsets
//! count from the first header byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

use crate::checksum;

pub const MAGIC: [u8; 4] = *b"OVL1";
pub const HEADER_LEN: usize = 20;

/// Why the loader refused to run an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("image does not start with the overlay magic")]
    BadMagic,

    #[error("header checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadHeaderChecksum { stored: u32, computed: u32 },

    #[error("BSS range {start:#x}..{end:#x} is inverted")]
    InvalidBss { start: u32, end: u32 },

    #[error("entry point {entry:#010x} outside the code region")]
    EntryOutsideCode { entry: u32 },

    #[error("entry offset {entry:#x} outside the {len} loaded bytes")]
    EntryOutsideImage { entry: u32, len: usize },

    #[error("BSS {start:#010x}..{end:#010x} outside the code region")]
    BssOutsideCode { start: u32, end: u32 },

    #[error("overlay magic missing from memory after copy")]
    MagicLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: u32,
    pub bss_start: u32,
    pub bss_end: u32,
}

impl ImageHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.entry);
        buf.put_u32_le(self.bss_start);
        buf.put_u32_le(self.bss_end);
        let crc = checksum::compute(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decode a header from the start of `bytes`.
    ///
    /// Returns `Ok(None)` when the magic is absent; the image is raw then.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, RejectReason> {
        if bytes.len() < HEADER_LEN || bytes[..4] != MAGIC {
            return Ok(None);
        }
        let computed = checksum::compute(&bytes[..16]);
        let mut buf = &bytes[4..HEADER_LEN];
        let entry = buf.get_u32_le();
        let bss_start = buf.get_u32_le();
        let bss_end = buf.get_u32_le();
        let stored = buf.get_u32_le();

        if stored != computed {
            return Err(RejectReason::BadHeaderChecksum { stored, computed });
        }
        if bss_start > bss_end {
            return Err(RejectReason::InvalidBss {
                start: bss_start,
                end: bss_end,
            });
        }
        Ok(Some(Self {
            entry,
            bss_start,
            bss_end,
        }))
    }
}

/// Image bytes plus what the loader needs to launch them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    bytes: Bytes,
    entry: u32,
    bss: Range<u32>,
    header: Option<ImageHeader>,
}

impl Image {
    /// A raw image: entry at offset 0 and no BSS.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            entry: 0,
            bss: 0..0,
            header: None,
        }
    }

    /// A raw image with caller-supplied metadata.
    pub fn with_layout(bytes: impl Into<Bytes>, entry: u32, bss: Range<u32>) -> Self {
        Self {
            bytes: bytes.into(),
            entry,
            bss,
            header: None,
        }
    }

    /// Use the header if the magic is present, otherwise treat as raw.
    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self, RejectReason> {
        let bytes = bytes.into();
        match ImageHeader::decode(&bytes)? {
            Some(header) => Ok(Self {
                entry: header.entry,
                bss: header.bss_start..header.bss_end,
                header: Some(header),
                bytes,
            }),
            None => Ok(Self::raw(bytes)),
        }
    }

    /// Prepend a header to `raw`. `entry` and `bss` are offsets into `raw`
    /// and get shifted past the header.
    pub fn pack(raw: &[u8], entry: u32, bss: Range<u32>) -> Result<Bytes, RejectReason> {
        if bss.start > bss.end {
            return Err(RejectReason::InvalidBss {
                start: bss.start,
                end: bss.end,
            });
        }
        let shift = HEADER_LEN as u32;
        let shifted = |v: u32| {
            v.checked_add(shift)
                .ok_or(RejectReason::EntryOutsideCode { entry: v })
        };
        let header = ImageHeader {
            entry: shifted(entry)?,
            bss_start: shifted(bss.start)?,
            bss_end: shifted(bss.end)?,
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + raw.len());
        out.put(header.encode());
        out.put_slice(raw);
        Ok(out.freeze())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn bss(&self) -> Range<u32> {
        self.bss.clone()
    }

    pub fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }
}
