//! On-disk representation of Connectix sparse VHD images.
//!
//! A sparse (dynamic or differencing) VHD is laid out as:
//!
//! * [Footer](footer/index.html) — 512 bytes at offset 0, repeated at the end
//!   of the file
//! * [Header](header/index.html) — 1024 bytes at offset 512
//! * Parent locator data (differencing images only)
//! * Block allocation table — one big-endian `u32` sector address per block,
//!   padded to a sector boundary
//! * Blocks — each a sector bitmap followed by `block_size` bytes of data
//!
//! Every multi-byte field in the format is big-endian. The structs in this
//! crate are bytewise images of their on-disk form: reading and writing a
//! record is a plain memory copy, and checksums are computed over the same
//! bytes that hit the disk.

use zerocopy::byteorder::BigEndian;

pub mod footer;
pub mod geometry;
pub mod header;

pub use footer::{DiskType, Features, Footer, Timestamp};
pub use geometry::Chs;
pub use header::{Header, ParentLocatorEntry, PlatformCode};

/// Big-endian wire integers. Aliased so record definitions read like the
/// format document.
pub type U16 = zerocopy::byteorder::U16<BigEndian>;
pub type U32 = zerocopy::byteorder::U32<BigEndian>;
pub type U64 = zerocopy::byteorder::U64<BigEndian>;

/// Size of a disk sector. All offsets in the format are either byte offsets
/// or counted in these.
pub const SECTOR_SIZE: u64 = 512;

/// Size of the [footer](footer/struct.Footer.html) record
pub const FOOTER_SIZE: u64 = 512;

/// Size of the [header](header/struct.Header.html) record
pub const HEADER_SIZE: u64 = 1024;

/// Number of parent locator entries in the header (fixed by the format)
pub const PARENT_LOCATOR_ENTRIES: usize = 8;

/// Sentinel BAT value for a block with no backing storage
pub const BLOCK_UNUSED: u32 = 0xFFFF_FFFF;

/// The only supported file format version (1.0)
pub const FILE_FORMAT_VERSION: u32 = 0x0001_0000;

/// The only supported header version (1.0)
pub const HEADER_VERSION: u32 = 0x0001_0000;

/// Default block size (2 MiB). Must be a power of two.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

/// Bytes occupied on disk by a BAT with `entries` slots.
///
/// The table is padded up to the next sector boundary and occupies at least
/// one sector even when empty.
pub fn bat_size_bytes(entries: u32) -> u64 {
    let sectors = (u64::from(entries) * 4 + SECTOR_SIZE - 1) / SECTOR_SIZE;
    sectors.max(1) * SECTOR_SIZE
}

/// One's-complement checksum used by both the footer and the header.
///
/// The stored checksum field (`checksum_field`, a byte range within `bytes`)
/// is treated as zero, all remaining bytes are summed as unsigned values, and
/// the complement of the truncated sum is returned.
pub fn checksum(bytes: &[u8], checksum_field: core::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if !checksum_field.contains(&i) {
            sum = sum.wrapping_add(u32::from(b));
        }
    }
    !sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bat_sizes() {
        assert_eq!(bat_size_bytes(0), 512);
        assert_eq!(bat_size_bytes(1), 512);
        assert_eq!(bat_size_bytes(128), 512);
        assert_eq!(bat_size_bytes(129), 1024);
    }

    #[test]
    fn checksum_ignores_the_stored_field() {
        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        bytes[15] = 2;
        let fresh = checksum(&bytes, 4..8);
        bytes[4..8].copy_from_slice(&fresh.to_be_bytes());
        assert_eq!(checksum(&bytes, 4..8), fresh);
        assert_eq!(fresh, !3u32);
    }
}
