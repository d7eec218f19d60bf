//! VHD images.
//!
//! [`Vhd`] is the capability contract every image representation provides;
//! [`VhdFile`](file/struct.VhdFile.html) implements it against a single file
//! reached through a [`Handler`](../handler/trait.Handler.html). Alternative
//! representations (one file per block, streaming) share the same contract
//! and the same coalesce logic.

use repr::{Footer, Header, BLOCK_UNUSED, FOOTER_SIZE, SECTOR_SIZE};
use zerocopy::FromBytes;

use crate::errors::{
    BadChecksumSnafu, InvalidCookieSnafu, NotSparseSnafu, OutOfRangeBlockSizeSnafu, Result,
    UnsupportedVersionSnafu, VhdError,
};
use snafu::ensure;

mod file;

pub use file::VhdFile;

pub(crate) fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors * SECTOR_SIZE
}

pub(crate) fn bytes_to_sectors_ceil(bytes: u64) -> u64 {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Capabilities of a VHD image representation.
///
/// All geometry-derived values are computed when the header is assigned and
/// served from cache; implementations must keep them in step with the header.
pub trait Vhd {
    fn footer(&self) -> &Footer;
    fn header(&self) -> &Header;
    fn geometry(&self) -> Geometry;

    /// On-disk size of the BAT in bytes (sector padded)
    fn bat_size(&self) -> u64;

    /// (Re)read and validate both records. With `check_second_footer` the end
    /// copy must be byte-identical to the primary; without it a stale end
    /// copy is tolerated, which is required when resuming an interrupted
    /// merge.
    fn read_header_and_footer(&mut self, check_second_footer: bool) -> Result<()>;

    /// (Re)read the block allocation table into memory
    fn read_block_allocation_table(&mut self) -> Result<()>;

    fn contains_block(&self, id: u32) -> bool;

    /// Read one allocated block; fails with a block-absent error on an
    /// unused BAT slot. With `only_bitmap` the data is not read.
    fn read_block(&mut self, id: u32, only_bitmap: bool) -> Result<Block>;

    /// Grow the BAT to hold at least `entries` slots, relocating leading
    /// blocks out of the way when the table must expand in place
    fn ensure_bat_size(&mut self, entries: u32) -> Result<()>;

    /// Write a full block (bitmap and data), allocating it if absent
    fn write_entire_block(&mut self, block: &Block) -> Result<()>;

    /// Merge one child block into this image, guided by the child's bitmap.
    /// Returns the number of data bytes written.
    fn coalesce_block(&mut self, child: &mut dyn Vhd, id: u32) -> Result<u64>;

    /// Rewrite the footer copies. The end copy is always written; with
    /// `only_end_footer` the primary at offset 0 is left alone, which is the
    /// durability checkpoint used during block relocation.
    fn write_footer(&mut self, only_end_footer: bool) -> Result<()>;

    fn write_header(&mut self) -> Result<()>;

    fn write_block_allocation_table(&mut self) -> Result<()>;

    /// Point this image at a parent: store `path` as a `W2ku` locator in
    /// entry 0 and clear the remaining entries. The header is not persisted
    /// here; callers follow up with [`write_header`](#tymethod.write_header).
    fn set_unique_parent_locator(&mut self, path: &str) -> Result<()>;

    /// Payload of locator `index`, or `None` when the entry reserves no space
    fn read_parent_locator_data(&mut self, index: usize) -> Result<Option<Vec<u8>>>;

    /// Overwrite the payload of locator `index` at its recorded offset
    fn write_parent_locator(&mut self, index: usize, data: &[u8]) -> Result<()>;
}

/// Geometry derived from the header, cached so sector arithmetic never
/// re-reads header fields
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub sectors_per_block: u32,
    pub sectors_of_bitmap: u32,
}

impl Geometry {
    pub fn from_header(header: &Header) -> Geometry {
        let block_size = header.block_size.get();
        let sectors_per_block = block_size / SECTOR_SIZE as u32;
        // One bit per sector, padded up to whole sectors, at least one
        let sectors_of_bitmap = (sectors_per_block + 8 * SECTOR_SIZE as u32 - 1)
            / (8 * SECTOR_SIZE as u32);
        Geometry {
            block_size,
            sectors_per_block,
            sectors_of_bitmap: sectors_of_bitmap.max(1),
        }
    }

    pub fn bitmap_size(&self) -> u32 {
        self.sectors_of_bitmap * SECTOR_SIZE as u32
    }

    pub fn full_block_size(&self) -> u32 {
        self.bitmap_size() + self.block_size
    }

    pub fn sectors_of_full_block(&self) -> u32 {
        self.sectors_of_bitmap + self.sectors_per_block
    }
}

/// One block read from an image: the sector bitmap, optionally followed by
/// the data, in a single buffer laid out exactly as on disk
#[derive(Debug)]
pub struct Block {
    id: u32,
    bitmap_size: usize,
    buf: Vec<u8>,
}

impl Block {
    pub(crate) fn new(id: u32, bitmap_size: usize, buf: Vec<u8>) -> Block {
        debug_assert!(buf.len() >= bitmap_size);
        Block {
            id,
            bitmap_size,
            buf,
        }
    }

    /// Assemble a block from a bitmap and its data
    pub(crate) fn assemble(id: u32, bitmap: Vec<u8>, data: &[u8]) -> Block {
        let bitmap_size = bitmap.len();
        let mut buf = bitmap;
        buf.extend_from_slice(data);
        Block {
            id,
            bitmap_size,
            buf,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.buf[..self.bitmap_size]
    }

    /// Block data; empty when the block was read bitmap-only
    pub fn data(&self) -> &[u8] {
        &self.buf[self.bitmap_size..]
    }

    pub fn has_data(&self) -> bool {
        self.buf.len() > self.bitmap_size
    }

    /// The on-disk image of the block: bitmap immediately followed by data
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }
}

/// The in-memory BAT, kept as the raw big-endian byte buffer so it stays
/// bytewise equal to its on-disk form and single slots can be persisted with
/// 4-byte writes
pub struct Bat {
    buf: Vec<u8>,
}

impl Bat {
    pub(crate) fn empty() -> Bat {
        Bat { buf: Vec::new() }
    }

    pub(crate) fn from_bytes(buf: Vec<u8>) -> Bat {
        Bat { buf }
    }

    /// Sector address of block `id`, or
    /// [`BLOCK_UNUSED`](../../repr/constant.BLOCK_UNUSED.html) for slots
    /// beyond the table
    pub fn entry(&self, id: u32) -> u32 {
        let offset = id as usize * 4;
        match self.buf.get(offset..offset + 4) {
            Some(raw) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            None => BLOCK_UNUSED,
        }
    }

    pub(crate) fn set_entry(&mut self, id: u32, sector: u32) {
        let offset = id as usize * 4;
        self.buf[offset..offset + 4].copy_from_slice(&sector.to_be_bytes());
    }

    /// Extend to `new_len` bytes, marking the new slots unused
    pub(crate) fn grow(&mut self, new_len: usize) {
        debug_assert!(new_len >= self.buf.len());
        self.buf.resize(new_len, 0xFF);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Allocated `(id, sector)` pairs among the first `entries` slots, in
    /// increasing block id order
    pub fn allocated(&self, entries: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        (0..entries).filter_map(move |id| {
            let sector = self.entry(id);
            (sector != BLOCK_UNUSED).then_some((id, sector))
        })
    }
}

/// Unpack and validate a footer record
pub(crate) fn unpack_footer(bytes: &[u8]) -> Result<Footer, VhdError> {
    let footer = match Footer::read_from(bytes) {
        Some(footer) => footer,
        None => {
            return Err(VhdError::Assertion {
                message: format!("footer buffer is {} bytes", bytes.len()),
            })
        }
    };
    ensure!(
        footer.cookie_ok(),
        InvalidCookieSnafu {
            expected: "conectix",
            actual: footer.cookie.to_vec(),
        }
    );
    let computed = footer.computed_checksum();
    let stored = footer.checksum.get();
    ensure!(computed == stored, BadChecksumSnafu { computed, stored });
    Ok(footer)
}

/// Unpack and validate a header record. The footer provides context: only a
/// sparse image (footer pointing at the header) has one.
pub(crate) fn unpack_header(bytes: &[u8], footer: &Footer) -> Result<Header, VhdError> {
    ensure!(
        footer.data_offset.get() == FOOTER_SIZE,
        NotSparseSnafu {
            disk_type: footer.disk_type(),
        }
    );
    let header = match Header::read_from(bytes) {
        Some(header) => header,
        None => {
            return Err(VhdError::Assertion {
                message: format!("header buffer is {} bytes", bytes.len()),
            })
        }
    };
    ensure!(
        header.cookie_ok(),
        InvalidCookieSnafu {
            expected: "cxsparse",
            actual: header.cookie.to_vec(),
        }
    );
    let computed = header.computed_checksum();
    let stored = header.checksum.get();
    ensure!(computed == stored, BadChecksumSnafu { computed, stored });
    ensure!(
        header.header_version.get() >= repr::HEADER_VERSION,
        UnsupportedVersionSnafu {
            version: header.header_version.get(),
        }
    );
    let block_size = header.block_size.get();
    ensure!(
        block_size.is_power_of_two() && block_size >= SECTOR_SIZE as u32,
        OutOfRangeBlockSizeSnafu { actual: block_size }
    );
    Ok(header)
}

/// Pack a footer for writing, refreshing its checksum
pub(crate) fn pack_footer(footer: &mut Footer) -> [u8; FOOTER_SIZE as usize] {
    use zerocopy::AsBytes;
    footer.update_checksum();
    let mut out = [0u8; FOOTER_SIZE as usize];
    out.copy_from_slice(footer.as_bytes());
    out
}

/// Pack a header for writing, refreshing its checksum
pub(crate) fn pack_header(header: &mut Header) -> [u8; repr::HEADER_SIZE as usize] {
    use zerocopy::AsBytes;
    header.update_checksum();
    let mut out = [0u8; repr::HEADER_SIZE as usize];
    out.copy_from_slice(header.as_bytes());
    out
}
