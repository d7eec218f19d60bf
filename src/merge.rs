//! Merging a differencing child into its parent.
//!
//! The merge mutates the parent in place, block by block, so a crash must be
//! recoverable: a JSON sidecar next to the child records the pair and how
//! many blocks are already in, and is written durably before the first
//! parent mutation and after every merged block. The sidecar's absence marks
//! a completed merge; its presence makes the cleaner re-run the merge, which
//! replays idempotently from the recorded position.

use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use snafu::{ensure, ResultExt};
use std::io;
use std::path::{Path, PathBuf};

use repr::DiskType;

use crate::errors::{
    BadMergeStateSnafu, MergeError, NotAChildSnafu, Result, UnmergeableChildSnafu,
    UnmergeableParentSnafu,
};
use crate::handler::{normalize_join, Handler};
use crate::vhd::{Vhd, VhdFile};

/// Merge progress, reported after every merged block
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Progress {
    pub done: u32,
    pub total: u32,
}

/// On-disk merge state: `.<child basename>.merge.json` next to the child
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MergeState {
    pub parent: PathBuf,
    pub child: PathBuf,
    #[serde(rename = "mergedBlocks")]
    pub merged_blocks: u32,
}

/// Path of the merge-state sidecar for `child`
pub fn sidecar_path(child: &Path) -> PathBuf {
    let name = child
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    child.with_file_name(format!(".{}.merge.json", name))
}

/// Original child path for a sidecar file name, if it matches the
/// `.<base>.merge.json` pattern
pub(crate) fn child_of_sidecar(sidecar: &Path) -> Option<PathBuf> {
    let name = sidecar.file_name()?.to_str()?;
    let base = name.strip_prefix('.')?.strip_suffix(".merge.json")?;
    if base.is_empty() {
        return None;
    }
    Some(sidecar.with_file_name(base))
}

pub(crate) fn read_merge_state(
    handler: &dyn Handler,
    sidecar: &Path,
) -> Result<Option<MergeState>, MergeError> {
    let bytes = match handler.read_file(sidecar) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state =
        serde_json::from_slice(&bytes).context(BadMergeStateSnafu { path: sidecar })?;
    Ok(Some(state))
}

/// Persist the state durably: write to a scratch name, then rename over the
/// sidecar so a crash never leaves a half-written record
fn write_merge_state(
    handler: &dyn Handler,
    sidecar: &Path,
    state: &MergeState,
) -> Result<(), MergeError> {
    let bytes = serde_json::to_vec(state).map_err(|e| MergeError::BadMergeState {
        path: sidecar.to_path_buf(),
        source: e,
    })?;
    let scratch = sidecar.with_extension("json.tmp");
    handler.write_file(&scratch, &bytes)?;
    handler.rename(&scratch, sidecar)?;
    Ok(())
}

/// Merge every allocated block of `child_path` into `parent_path`.
///
/// The parent must be dynamic or differencing; the child must be a
/// differencing image of the parent. On success the parent carries the
/// child's identity (size, geometry, timestamp, unique id) so descendants of
/// the child keep resolving, and the sidecar is gone. Returns the number of
/// data bytes written into the parent.
pub fn merge_vhd(
    handler: &dyn Handler,
    parent_path: &Path,
    child_path: &Path,
    progress: &mut dyn FnMut(Progress),
) -> Result<u64> {
    merge_vhd_with_logger(
        handler,
        parent_path,
        child_path,
        progress,
        crate::default_logger(),
    )
}

pub fn merge_vhd_with_logger(
    handler: &dyn Handler,
    parent_path: &Path,
    child_path: &Path,
    progress: &mut dyn FnMut(Progress),
    logger: Logger,
) -> Result<u64> {
    let logger = logger.new(o!(
        "parent" => parent_path.display().to_string(),
        "child" => child_path.display().to_string(),
    ));

    let sidecar = sidecar_path(child_path);
    let resumed = read_merge_state(handler, &sidecar)?;
    let resuming = resumed.is_some();
    if resuming {
        info!(logger, "resuming interrupted merge";
            "merged_blocks" => resumed.as_ref().map(|state| state.merged_blocks),
        );
    }

    // A crashed merge leaves the parent with a stale primary footer (only the
    // end copy tracks block relocation), so the strict comparison only holds
    // for a fresh merge
    let mut parent =
        VhdFile::open_with_logger(handler, parent_path, !resuming, logger.clone())?;
    let mut child = VhdFile::open_with_logger(handler, child_path, !resuming, logger.clone())?;

    ensure!(
        parent.footer().disk_type().is_sparse(),
        UnmergeableParentSnafu {
            path: parent_path,
            disk_type: parent.footer().disk_type(),
        }
    );
    ensure!(
        child.footer().disk_type() == DiskType::DIFFERENCING,
        UnmergeableChildSnafu {
            path: child_path,
            disk_type: child.footer().disk_type(),
        }
    );

    let child_dir = child_path.parent().unwrap_or_else(|| Path::new(""));
    let named_parent = child
        .header()
        .parent_unicode_name()
        .map(|name| normalize_join(child_dir, &name));
    let linked = named_parent.as_deref() == Some(parent_path)
        || child.header().parent_unique_id == parent.footer().unique_id;
    ensure!(
        linked,
        NotAChildSnafu {
            parent: parent_path,
            child: child_path,
        }
    );

    let block_ids: Vec<u32> =
        (0..child.header().max_table_entries.get())
            .filter(|&id| child.contains_block(id))
            .collect();
    let total = block_ids.len() as u32;

    let mut state = match resumed {
        Some(state) => state,
        None => {
            let state = MergeState {
                parent: parent_path.to_path_buf(),
                child: child_path.to_path_buf(),
                merged_blocks: 0,
            };
            // Durable before the first parent mutation
            write_merge_state(handler, &sidecar, &state)?;
            state
        }
    };

    parent.ensure_bat_size(child.header().max_table_entries.get())?;

    let mut merged_bytes = 0u64;
    let mut done = 0u32;
    for &id in &block_ids {
        if done < state.merged_blocks {
            // Already in the parent from before the interruption
            done += 1;
            continue;
        }
        merged_bytes += parent.coalesce_block(&mut child, id)?;
        done += 1;
        state.merged_blocks = done;
        write_merge_state(handler, &sidecar, &state)?;
        progress(Progress { done, total });
        debug!(logger, "merged block"; "id" => id, "done" => done, "total" => total);
    }

    // The parent takes over the child's identity so anything that referenced
    // the child (by unique id, or by path after the rename) keeps resolving.
    // Its own parent linkage is untouched: the merged image still hangs off
    // whatever the parent hung off.
    parent.footer.current_size = child.footer.current_size;
    parent.footer.original_size = child.footer.original_size;
    parent.footer.disk_geometry = child.footer.disk_geometry;
    parent.footer.timestamp = child.footer.timestamp;
    parent.footer.unique_id = child.footer.unique_id;
    parent.write_header()?;
    parent.write_footer(false)?;

    handler.unlink(&sidecar).map_err(MergeError::from)?;

    info!(logger, "merge complete";
        "blocks" => total,
        "bytes" => merged_bytes,
    );
    Ok(merged_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LocalHandler;

    const BLOCK: u32 = 4 * 512; // four sectors per block

    fn no_progress() -> impl FnMut(Progress) {
        |_| {}
    }

    fn setup_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let handler = LocalHandler;
        let parent_path = dir.join("parent.vhd");
        let child_path = dir.join("child.vhd");
        let mut parent =
            VhdFile::create_dynamic(&handler, &parent_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        parent.write_data(0, &[0x11; 4 * 512]).unwrap(); // full block 0
        drop(parent);

        let mut child = VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();
        child.write_data(0, &[0x22; 2 * 512]).unwrap(); // block 0, sectors 0..2
        drop(child);
        (parent_path, child_path)
    }

    #[test]
    fn child_sectors_supersede_parent_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let (parent_path, child_path) = setup_pair(dir.path());
        let handler = LocalHandler;

        let merged = merge_vhd(&handler, &parent_path, &child_path, &mut no_progress()).unwrap();
        assert_eq!(merged, 2 * 512);
        assert!(!handler.exists(&sidecar_path(&child_path)));

        let mut parent = VhdFile::open(&handler, &parent_path).unwrap();
        let mut read = vec![0u8; 4 * 512];
        parent.read_data(0, &mut read).unwrap();
        assert!(read[..2 * 512].iter().all(|&b| b == 0x22));
        assert!(read[2 * 512..].iter().all(|&b| b == 0x11));

        // The parent took over the child's identity
        let child = VhdFile::open(&handler, &child_path).unwrap();
        assert_eq!(parent.footer().unique_id, child.footer().unique_id);
        assert_eq!(parent.footer().disk_type(), DiskType::DYNAMIC);
    }

    #[test]
    fn merge_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let handler = LocalHandler;
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        VhdFile::create_dynamic(&handler, &parent_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        let mut child =
            VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();
        child.write_data(0, &[1; 512]).unwrap();
        child.write_data(8, &[2; 512]).unwrap(); // block 2
        drop(child);

        let sidecar = sidecar_path(&child_path);
        let mut seen = Vec::new();
        let mut on_progress = |progress: Progress| {
            // the sidecar exists while the merge is in flight
            assert!(LocalHandler.exists(&sidecar));
            seen.push(progress);
        };
        merge_vhd(&handler, &parent_path, &child_path, &mut on_progress).unwrap();
        assert_eq!(
            seen,
            vec![Progress { done: 1, total: 2 }, Progress { done: 2, total: 2 }]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (parent_path, child_path) = setup_pair(dir.path());
        let handler = LocalHandler;

        merge_vhd(&handler, &parent_path, &child_path, &mut no_progress()).unwrap();
        let first = std::fs::read(&parent_path).unwrap();
        merge_vhd(&handler, &parent_path, &child_path, &mut no_progress()).unwrap();
        let second = std::fs::read(&parent_path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn blocks_with_empty_bitmaps_copy_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let handler = LocalHandler;
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        let mut parent =
            VhdFile::create_dynamic(&handler, &parent_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        parent.write_data(0, &[0x11; 4 * 512]).unwrap();
        drop(parent);
        let mut child =
            VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();
        // Allocated block, no bitmap bit set
        child
            .write_block_sectors(0, &vec![0u8; BLOCK as usize], 0..0)
            .unwrap();
        child.write_footer(false).unwrap();
        assert!(child.contains_block(0));
        drop(child);

        let merged = merge_vhd(&handler, &parent_path, &child_path, &mut no_progress()).unwrap();
        assert_eq!(merged, 0);

        let mut parent = VhdFile::open(&handler, &parent_path).unwrap();
        let mut read = vec![0u8; 4 * 512];
        parent.read_data(0, &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn interrupted_merge_resumes_from_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let handler = LocalHandler;
        let parent_path = dir.path().join("parent.vhd");
        let child_path = dir.path().join("child.vhd");
        VhdFile::create_dynamic(&handler, &parent_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        let mut child =
            VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();
        child.write_data(0, &[0x0A; 512]).unwrap(); // block 0
        child.write_data(4, &[0x0B; 512]).unwrap(); // block 1
        drop(child);

        // Replay the first half of the protocol by hand: sidecar in place,
        // block 0 already coalesced, end footer moved but primary stale
        let logger = crate::default_logger();
        let mut parent =
            VhdFile::open_with_logger(&handler, &parent_path, true, logger.clone()).unwrap();
        let mut child =
            VhdFile::open_with_logger(&handler, &child_path, true, logger).unwrap();
        write_merge_state(
            &handler,
            &sidecar_path(&child_path),
            &MergeState {
                parent: parent_path.clone(),
                child: child_path.clone(),
                merged_blocks: 0,
            },
        )
        .unwrap();
        parent
            .ensure_bat_size(child.header().max_table_entries.get())
            .unwrap();
        parent.coalesce_block(&mut child, 0).unwrap();
        parent.write_footer(true).unwrap();
        write_merge_state(
            &handler,
            &sidecar_path(&child_path),
            &MergeState {
                parent: parent_path.clone(),
                child: child_path.clone(),
                merged_blocks: 1,
            },
        )
        .unwrap();
        drop(parent);
        drop(child);

        merge_vhd(&handler, &parent_path, &child_path, &mut no_progress()).unwrap();
        assert!(!handler.exists(&sidecar_path(&child_path)));

        let mut parent = VhdFile::open(&handler, &parent_path).unwrap();
        let mut read = vec![0u8; 8 * 512];
        parent.read_data(0, &mut read).unwrap();
        assert!(read[..512].iter().all(|&b| b == 0x0A));
        assert!(read[512..4 * 512].iter().all(|&b| b == 0));
        assert!(read[4 * 512..5 * 512].iter().all(|&b| b == 0x0B));
    }

    #[test]
    fn merging_an_unrelated_image_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let handler = LocalHandler;
        let parent_path = dir.path().join("parent.vhd");
        let other_path = dir.path().join("other.vhd");
        let child_path = dir.path().join("child.vhd");
        VhdFile::create_dynamic(&handler, &parent_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        VhdFile::create_dynamic(&handler, &other_path, 4 * u64::from(BLOCK), BLOCK).unwrap();
        VhdFile::create_differencing(&handler, &child_path, &parent_path).unwrap();

        let err =
            merge_vhd(&handler, &other_path, &child_path, &mut no_progress()).unwrap_err();
        assert!(err.to_string().contains("not the parent"));
        assert!(!handler.exists(&sidecar_path(&child_path)));
    }

    #[test]
    fn sidecar_names_round_trip() {
        let sidecar = sidecar_path(Path::new("/vm/vdis/a/b/20260101.vhd"));
        assert_eq!(
            sidecar,
            Path::new("/vm/vdis/a/b/.20260101.vhd.merge.json")
        );
        assert_eq!(
            child_of_sidecar(&sidecar).unwrap(),
            Path::new("/vm/vdis/a/b/20260101.vhd")
        );
        assert_eq!(child_of_sidecar(Path::new("/x/plain.json")), None);
    }
}
