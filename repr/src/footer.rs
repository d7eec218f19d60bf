//! The hard disk footer
//!
//! Every VHD starts with a 512-byte footer, and a byte-identical copy is kept
//! at the very end of the file. The duplicate is what makes a sparse image
//! recoverable: appending writes may clobber the end copy, but the primary at
//! offset 0 always describes a consistent view (and vice versa during block
//! relocation, where only the end copy is kept current).

use bitflags::bitflags;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::geometry::Chs;
use crate::{U32, U64};

/// Magic cookie identifying a VHD footer
pub const COOKIE: [u8; 8] = *b"conectix";

/// Byte range of the checksum field within the footer
pub const CHECKSUM_FIELD: core::ops::Range<usize> = 64..68;

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00:00 UTC)
pub const EPOCH_UNIX_OFFSET: i64 = 946_684_800;

/// The hard disk footer. 512 bytes, big-endian, stored at offset 0 and again
/// at `file_size - 512`.
#[derive(Copy, Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C, packed)]
pub struct Footer {
    /// Must equal [`COOKIE`](constant.COOKIE.html) (`"conectix"`)
    pub cookie: [u8; 8],
    /// See [`Features`](struct.Features.html). The `RESERVED` bit must always
    /// be set.
    pub features: U32,
    /// Format version; must equal
    /// [`FILE_FORMAT_VERSION`](../constant.FILE_FORMAT_VERSION.html) (1.0)
    pub file_format_version: U32,
    /// Byte offset of the sparse header. All ones for a fixed disk, 512 for
    /// the sparse layouts this crate handles.
    pub data_offset: U64,
    /// Creation time, in seconds since 2000-01-01 00:00:00 UTC
    pub timestamp: U32,
    /// Four-character tag of the application that created the image
    pub creator_application: [u8; 4],
    /// Version of the creator application
    pub creator_version: U32,
    /// Host OS tag of the creator (`"Wi2k"` / `"Mac "`)
    pub creator_host_os: U32,
    /// Size of the virtual disk at creation time, in bytes
    pub original_size: U64,
    /// Current size of the virtual disk, in bytes
    pub current_size: U64,
    /// CHS geometry derived from the disk size
    pub disk_geometry: U32,
    /// See [`DiskType`](struct.DiskType.html)
    pub disk_type: U32,
    /// One's-complement checksum of the record with this field zeroed
    pub checksum: U32,
    /// UUID of this image. Differencing children record their parent's id in
    /// the header and both must match for the chain to be valid.
    pub unique_id: [u8; 16],
    /// Non-zero when the VM was saved-stated onto this image
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

impl Footer {
    pub fn cookie_ok(&self) -> bool {
        self.cookie == COOKIE
    }

    pub fn disk_type(&self) -> DiskType {
        DiskType(self.disk_type.get())
    }

    pub fn set_disk_type(&mut self, disk_type: DiskType) {
        self.disk_type.set(disk_type.0);
    }

    pub fn features(&self) -> Features {
        Features::from_bits_truncate(self.features.get())
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.timestamp.get())
    }

    pub fn geometry(&self) -> Chs {
        Chs::unpack(self.disk_geometry.get())
    }

    pub fn set_geometry(&mut self, chs: Chs) {
        self.disk_geometry.set(chs.pack());
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
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Footer")
            .field("disk_type", &self.disk_type())
            .field("features", &self.features())
            .field("current_size", &self.current_size.get())
            .field("original_size", &self.original_size.get())
            .field("timestamp", &self.timestamp())
            .field("geometry", &self.geometry())
            .field("unique_id", &self.unique_id)
            .field("saved_state", &self.saved_state)
            .finish()
    }
}

/// Disk type tag. This crate writes only `DYNAMIC` and `DIFFERENCING`; the
/// other values are recognized so foreign images fail with a precise error.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DiskType(pub u32);

impl DiskType {
    pub const NONE: DiskType = DiskType(0);
    pub const FIXED: DiskType = DiskType(2);
    pub const DYNAMIC: DiskType = DiskType(3);
    pub const DIFFERENCING: DiskType = DiskType(4);

    /// True for the two sparse layouts (the only ones with a header and BAT)
    pub fn is_sparse(self) -> bool {
        self == DiskType::DYNAMIC || self == DiskType::DIFFERENCING
    }
}

impl fmt::Debug for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DiskType::NONE => f.write_str("None"),
            DiskType::FIXED => f.write_str("Fixed"),
            DiskType::DYNAMIC => f.write_str("Dynamic"),
            DiskType::DIFFERENCING => f.write_str("Differencing"),
            DiskType(other) => write!(f, "DiskType({})", other),
        }
    }
}

bitflags! {
    pub struct Features: u32 {
        /// The image is a candidate for deletion on VM shutdown
        const TEMPORARY = 1;
        /// Must always be set
        const RESERVED = 1 << 1;
    }
}

/// Seconds since the VHD epoch (2000-01-01 00:00:00 UTC)
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub fn to_datetime(self) -> DateTime<Utc> {
        // The whole u32 range past the epoch is representable, so this is
        // always Single
        Utc.timestamp_opt(EPOCH_UNIX_OFFSET + i64::from(self.0), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `None` when the instant is out of range for the format (before 2000,
    /// or after its u32 range expires in 2136)
    pub fn from_datetime(date_time: DateTime<Utc>) -> Option<Timestamp> {
        let secs = date_time.timestamp() - EPOCH_UNIX_OFFSET;
        u32::try_from(secs).ok().map(Timestamp)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_datetime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FOOTER_SIZE;
    use std::mem;
    use zerocopy::FromBytes;

    fn zeroed() -> Footer {
        Footer::read_from(&[0u8; 512][..]).unwrap()
    }

    #[test]
    fn footer_is_bytewise() {
        assert_eq!(mem::size_of::<Footer>(), FOOTER_SIZE as usize);
        assert_eq!(mem::align_of::<Footer>(), 1);
    }

    #[test]
    fn checksum_round_trip() {
        let mut footer = zeroed();
        footer.cookie = COOKIE;
        footer.current_size.set(2 * 1024 * 1024);
        footer.disk_type.set(DiskType::DYNAMIC.0);
        footer.update_checksum();
        assert!(footer.checksum_valid());

        // Any byte flip invalidates the stored checksum
        footer.saved_state = 1;
        assert!(!footer.checksum_valid());
    }

    #[test]
    fn timestamps() {
        let epoch = Timestamp(0).to_datetime();
        assert_eq!(epoch.timestamp(), EPOCH_UNIX_OFFSET);
        assert_eq!(Timestamp::from_datetime(epoch), Some(Timestamp(0)));
        // Pre-epoch instants do not fit
        let before = Utc.timestamp_opt(EPOCH_UNIX_OFFSET - 1, 0).unwrap();
        assert_eq!(Timestamp::from_datetime(before), None);
    }
}
