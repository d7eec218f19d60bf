//! The sparse disk header
//!
//! Dynamic and differencing disks carry a 1024-byte header at offset 512. It
//! locates the block allocation table, fixes the block size, and — for
//! differencing disks — names the parent image both as a UTF-16BE path and
//! through up to eight platform-specific locator records.

use std::fmt;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::{U32, U64};

/// Magic cookie identifying a sparse header
pub const COOKIE: [u8; 8] = *b"cxsparse";

/// Byte range of the checksum field within the header
pub const CHECKSUM_FIELD: core::ops::Range<usize> = 36..40;

/// The sparse disk header. 1024 bytes, big-endian, at offset 512.
#[derive(Copy, Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct Header {
    /// Must equal [`COOKIE`](constant.COOKIE.html) (`"cxsparse"`)
    pub cookie: [u8; 8],
    /// Unused; all ones
    pub data_offset: U64,
    /// Byte offset of the block allocation table
    pub table_offset: U64,
    /// Header version; the major half must be at least 1
    pub header_version: U32,
    /// Number of slots in the BAT. At most one per block of the virtual disk.
    pub max_table_entries: U32,
    /// Bytes of data per block. Must be a power of two; 2 MiB in practice.
    pub block_size: U32,
    /// One's-complement checksum of the record with this field zeroed
    pub checksum: U32,
    /// UUID of the parent image (differencing disks only, else zero)
    pub parent_unique_id: [u8; 16],
    /// Modification time of the parent, seconds since 2000-01-01 UTC
    pub parent_timestamp: U32,
    pub reserved1: U32,
    /// Path of the parent image, UTF-16BE, NUL padded
    pub parent_unicode_name: [u8; 512],
    /// Platform-specific ways of finding the parent
    pub parent_locators: [ParentLocatorEntry; 8],
    pub reserved2: [u8; 256],
}

impl Header {
    pub fn cookie_ok(&self) -> bool {
        self.cookie == COOKIE
    }

    /// Recompute and store the checksum. Must be called after any field
    /// mutation, before the record is written out.
    pub fn update_checksum(&mut self) {
        let fresh = self.computed_checksum();
        self.checksum.set(fresh);
    }

    /// Checksum of the current field values (stored field excluded)
    pub fn computed_checksum(&self) -> u32 {
        crate::checksum(self.as_bytes(), CHECKSUM_FIELD)
    }

    pub fn checksum_valid(&self) -> bool {
        self.computed_checksum() == self.checksum.get()
    }

    /// The declared parent path, or `None` when the field is empty (dynamic
    /// disks). Unpaired surrogates are replaced rather than rejected: a
    /// mangled name should surface as a missing parent, not a parse failure.
    pub fn parent_unicode_name(&self) -> Option<String> {
        let units: Vec<u16> = self
            .parent_unicode_name
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        if units.is_empty() {
            None
        } else {
            Some(String::from_utf16_lossy(&units))
        }
    }

    /// Store `name` as the parent path. Returns `false` (leaving the field
    /// untouched) when the encoded name does not fit the 512-byte field.
    pub fn set_parent_unicode_name(&mut self, name: &str) -> bool {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() * 2 > self.parent_unicode_name.len() {
            return false;
        }
        let mut field = [0u8; 512];
        for (i, unit) in units.iter().enumerate() {
            field[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        self.parent_unicode_name = field;
        true
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Header")
            .field("table_offset", &self.table_offset.get())
            .field("max_table_entries", &self.max_table_entries.get())
            .field("block_size", &self.block_size.get())
            .field("parent_unique_id", &self.parent_unique_id)
            .field("parent_unicode_name", &self.parent_unicode_name())
            .finish()
    }
}

/// One of the eight parent locator records in the header
#[derive(Copy, Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct ParentLocatorEntry {
    /// See [`PlatformCode`](struct.PlatformCode.html); `NONE` marks an unused
    /// entry
    pub platform_code: U32,
    /// Space reserved for the locator data
    pub platform_data_space: U32,
    /// Actual length of the locator data, in bytes
    pub platform_data_length: U32,
    pub reserved: U32,
    /// Absolute byte offset of the locator data within the file
    pub platform_data_offset: U64,
}

impl ParentLocatorEntry {
    pub fn platform_code(&self) -> PlatformCode {
        PlatformCode(self.platform_code.get())
    }

    pub fn is_used(&self) -> bool {
        self.platform_code() != PlatformCode::NONE
    }
}

impl Default for ParentLocatorEntry {
    /// An unused entry (all zero)
    fn default() -> Self {
        ParentLocatorEntry {
            platform_code: U32::new(0),
            platform_data_space: U32::new(0),
            platform_data_length: U32::new(0),
            reserved: U32::new(0),
            platform_data_offset: U64::new(0),
        }
    }
}

impl fmt::Debug for ParentLocatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParentLocatorEntry")
            .field("platform_code", &self.platform_code())
            .field("platform_data_space", &self.platform_data_space.get())
            .field("platform_data_length", &self.platform_data_length.get())
            .field("platform_data_offset", &self.platform_data_offset.get())
            .finish()
    }
}

/// Parent locator platform tag. Only `W2KU` is ever written; the rest are
/// recognized on read.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PlatformCode(pub u32);

impl PlatformCode {
    pub const NONE: PlatformCode = PlatformCode(0);
    /// Relative UTF-16LE path (`"W2ru"`)
    pub const W2RU: PlatformCode = PlatformCode(0x5732_7275);
    /// Absolute UTF-16LE path (`"W2ku"`)
    pub const W2KU: PlatformCode = PlatformCode(0x5732_6b75);
    /// Mac OS alias blob (`"Mac "`)
    pub const MAC: PlatformCode = PlatformCode(0x4d61_6320);
    /// Mac OS X RFC 2396 URL (`"MacX"`)
    pub const MACX: PlatformCode = PlatformCode(0x4d61_6358);
}

impl fmt::Debug for PlatformCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == PlatformCode::NONE {
            return f.write_str("None");
        }
        let raw = self.0.to_be_bytes();
        match std::str::from_utf8(&raw) {
            Ok(tag) => write!(f, "{:?}", tag),
            Err(_) => write!(f, "PlatformCode({:#x})", self.0),
        }
    }
}

/// Encode a path for a `W2ku`/`W2ru` locator payload (UTF-16LE, no NUL)
pub fn encode_utf16_le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// Decode a `W2ku`/`W2ru` locator payload
pub fn decode_utf16_le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
