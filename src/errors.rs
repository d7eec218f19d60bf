use snafu::{IntoError, Snafu};
use std::io;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub struct Error(ErrorInner);

impl Error {
    /// True when the error describes a structurally corrupt image (bad
    /// cookie, bad checksum, diverged footer copies) rather than an I/O
    /// failure or a logic error. The cleaner prunes on these, and only
    /// these, when asked to remove broken images.
    pub fn is_corrupt_image(&self) -> bool {
        match &self.0 {
            ErrorInner::BadImage { source, .. } => matches!(
                source,
                VhdError::InvalidCookie { .. }
                    | VhdError::UnsupportedVersion { .. }
                    | VhdError::BadChecksum { .. }
                    | VhdError::FooterMismatch
                    | VhdError::NotSparse { .. }
                    | VhdError::OutOfRangeBlockSize { .. }
                    | VhdError::Truncated { .. }
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum ErrorInner {
    #[snafu(display("Unable to open {}: {}", path.display(), source))]
    UnableToOpen { path: PathBuf, source: io::Error },

    #[snafu(display("VHD error: {}", source))]
    #[snafu(context(false))]
    BadImage { source: VhdError },

    #[snafu(display("Merge error: {}", source))]
    #[snafu(context(false))]
    BadMerge { source: MergeError },

    #[snafu(display("Cleaner error: {}", source))]
    #[snafu(context(false))]
    BadClean { source: CleanError },

    #[snafu(display("IO error: {}", source))]
    #[snafu(context(false))]
    Io { source: io::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum VhdError {
    #[snafu(display("Cookie mismatch: expected {:?}, got {:?}", expected, actual))]
    InvalidCookie {
        expected: &'static str,
        actual: Vec<u8>,
    },

    #[snafu(display("Unsupported header version {:#010x}", version))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("Checksum mismatch: computed {:#010x}, stored {:#010x}", computed, stored))]
    BadChecksum { computed: u32, stored: u32 },

    #[snafu(display("Primary and end footer copies differ"))]
    FooterMismatch,

    #[snafu(display("Disk type {:?} has no sparse header", disk_type))]
    NotSparse { disk_type: repr::DiskType },

    #[snafu(display("Block size {} is not a power of two of at least one sector", actual))]
    OutOfRangeBlockSize { actual: u32 },

    #[snafu(display("File of {} bytes is too short to hold the records", len))]
    Truncated { len: u64 },

    #[snafu(display("Block {} is not allocated", id))]
    BlockAbsent { id: u32 },

    #[snafu(display("Structural assertion failed: {}", message))]
    Assertion { message: String },

    #[snafu(display("IO error: {}", source))]
    VhdIo { source: io::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum MergeError {
    #[snafu(display("{} is {:?}; only dynamic and differencing disks can absorb a child", path.display(), disk_type))]
    UnmergeableParent {
        path: PathBuf,
        disk_type: repr::DiskType,
    },

    #[snafu(display("{} is {:?}; only a differencing disk can be merged", path.display(), disk_type))]
    UnmergeableChild {
        path: PathBuf,
        disk_type: repr::DiskType,
    },

    #[snafu(display("{} is not the parent of {}", parent.display(), child.display()))]
    NotAChild { parent: PathBuf, child: PathBuf },

    #[snafu(display("Unreadable merge state {}: {}", path.display(), source))]
    BadMergeState {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("IO error: {}", source))]
    MergeIo { source: io::Error },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum CleanError {
    #[snafu(display("{} is claimed as parent by both {} and {}", parent.display(), first.display(), second.display()))]
    MultipleChildren {
        parent: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[snafu(display("Parent {} of {} is missing", parent.display(), child.display()))]
    ParentMissing { parent: PathBuf, child: PathBuf },

    #[snafu(display("IO error: {}", source))]
    CleanIo { source: io::Error },
}

impl From<VhdError> for Error {
    fn from(e: VhdError) -> Self {
        Self(e.into())
    }
}

impl From<MergeError> for Error {
    fn from(e: MergeError) -> Self {
        Self(e.into())
    }
}

impl From<CleanError> for Error {
    fn from(e: CleanError) -> Self {
        Self(e.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(e.into())
    }
}

impl From<io::Error> for VhdError {
    fn from(e: io::Error) -> Self {
        VhdIoSnafu.into_error(e)
    }
}

impl From<io::Error> for MergeError {
    fn from(e: io::Error) -> Self {
        MergeIoSnafu.into_error(e)
    }
}

impl From<io::Error> for CleanError {
    fn from(e: io::Error) -> Self {
        CleanIoSnafu.into_error(e)
    }
}
