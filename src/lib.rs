//! Reading, writing and coalescing Connectix sparse and differencing VHD
//! images, plus the chain cleaner that keeps a backup VM directory healthy.
//!
//! The on-disk records live in the [`repr`] crate; everything here drives
//! them through a [`Handler`](handler/trait.Handler.html), so the same
//! engine runs over any filesystem-like namespace.

use slog::Drain;

pub mod bitmap;
pub mod clean;
pub(crate) mod errors;
pub mod handler;
pub mod merge;
pub mod vhd;

pub use clean::{clean_vm, clean_vm_with_logger, CleanOptions, CleanReport};
pub use errors::{Error, Result};
pub use merge::{merge_vhd, merge_vhd_with_logger, sidecar_path, Progress};
pub use vhd::{Bat, Block, Geometry, Vhd, VhdFile};

pub(crate) fn default_logger() -> slog::Logger {
    slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!())
}
