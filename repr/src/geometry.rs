//! CHS disk geometry
//!
//! The footer stores a cylinders/heads/sectors-per-track triple computed from
//! the virtual size with the algorithm in the format appendix. Nothing in
//! this crate reads it back for addressing — ATA-era tooling does — but the
//! field must still be filled consistently for other implementations to
//! accept the image.

use std::fmt;

/// Cylinders/heads/sectors-per-track triple, packed big-endian as
/// `cylinders:16 heads:8 sectors:8`
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Chs {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Chs {
    /// Geometry for a disk of `size_bytes`, per the format appendix
    pub fn for_size(size_bytes: u64) -> Chs {
        let total_sectors = (size_bytes / crate::SECTOR_SIZE).min(65535 * 16 * 255) as u32;

        if total_sectors >= 65535 * 16 * 63 {
            let sectors_per_track = 255;
            let heads = 16;
            let cylinders = total_sectors / (heads * sectors_per_track);
            return Chs {
                cylinders: cylinders as u16,
                heads: heads as u8,
                sectors_per_track: sectors_per_track as u8,
            };
        }

        let mut sectors_per_track = 17u32;
        let mut cylinder_times_heads = total_sectors / sectors_per_track;
        let mut heads = ((cylinder_times_heads + 1023) / 1024).max(4);

        if cylinder_times_heads >= heads * 1024 || heads > 16 {
            sectors_per_track = 31;
            heads = 16;
            cylinder_times_heads = total_sectors / sectors_per_track;
        }
        if cylinder_times_heads >= heads * 1024 {
            sectors_per_track = 63;
            heads = 16;
            cylinder_times_heads = total_sectors / sectors_per_track;
        }

        Chs {
            cylinders: (cylinder_times_heads / heads) as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }

    pub fn pack(self) -> u32 {
        u32::from(self.cylinders) << 16
            | u32::from(self.heads) << 8
            | u32::from(self.sectors_per_track)
    }

    pub fn unpack(raw: u32) -> Chs {
        Chs {
            cylinders: (raw >> 16) as u16,
            heads: (raw >> 8) as u8,
            sectors_per_track: raw as u8,
        }
    }

    /// Capacity addressable through this geometry, in bytes
    pub fn capacity(self) -> u64 {
        u64::from(self.cylinders)
            * u64::from(self.heads)
            * u64::from(self.sectors_per_track)
            * crate::SECTOR_SIZE
    }
}

impl fmt::Debug for Chs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.cylinders, self.heads, self.sectors_per_track
        )
    }
}
