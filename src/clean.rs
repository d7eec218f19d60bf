//! Cleaning a VM backup directory.
//!
//! A VM directory holds backup metadata JSONs and XVA archives at the top
//! level and VHD chains under `vdis/<job>/<disk>/`. Over time crashes and
//! aborted backups leave debris: corrupt images, orphaned children,
//! interrupted merges, metadata pointing at files that no longer exist, and
//! chains of differencing images that nothing references anymore. The
//! cleaner walks the directory, reports all of it, and — only behind
//! explicit flags — deletes the debris, collapses unreferenced chains, and
//! repairs metadata sizes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use repr::DiskType;

use crate::errors::{CleanError, Result};
use crate::handler::{normalize_join, Handler};
use crate::merge::{
    child_of_sidecar, merge_vhd_with_logger, read_merge_state, sidecar_path, MergeState, Progress,
};
use crate::vhd::{Vhd, VhdFile};

/// What the cleaner is allowed to touch. Everything defaults to off: with no
/// flags set a run only reports.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    /// Rewrite backup metadata whose recorded size undershoots reality
    pub fix_metadata: bool,
    /// Delete broken images, orphans and metadata with missing payloads
    pub remove: bool,
    /// Collapse unreferenced chains and resume interrupted merges
    pub merge: bool,
    /// How many chains may merge at once. Chains never share a VHD, so this
    /// is purely an I/O throttle.
    pub merge_limit: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        CleanOptions {
            fix_metadata: false,
            remove: false,
            merge: false,
            merge_limit: 1,
        }
    }
}

/// Outcome of a cleaning run
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Healthy VHDs left standing
    pub vhds: usize,
    /// Images that failed to open (deleted when `remove` and corrupt)
    pub broken_vhds: Vec<PathBuf>,
    /// Differencing images whose ancestry is broken
    pub orphan_vhds: Vec<PathBuf>,
    /// Children with a merge-state sidecar, scheduled for resumption
    pub interrupted_merges: Vec<PathBuf>,
    /// Metadata JSONs whose payload is gone
    pub dangling_metadata: Vec<PathBuf>,
    /// Metadata JSONs rewritten with a corrected size
    pub fixed_metadata: Vec<PathBuf>,
    /// Unreferenced images too short to form a chain; left alone
    pub unused_vhds: Vec<PathBuf>,
    pub planned_chains: usize,
    pub merged_chains: usize,
    pub merged_bytes: u64,
    pub failed_merges: usize,
}

/// Backup metadata at the VM directory top level. Unknown fields ride along
/// untouched so a size repair never strips information.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupMetadata {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xva: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vhds: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

pub fn clean_vm(
    handler: &dyn Handler,
    vm_dir: &Path,
    options: &CleanOptions,
) -> Result<CleanReport> {
    clean_vm_with_logger(handler, vm_dir, options, crate::default_logger())
}

pub fn clean_vm_with_logger(
    handler: &dyn Handler,
    vm_dir: &Path,
    options: &CleanOptions,
    logger: Logger,
) -> Result<CleanReport> {
    let logger = logger.new(o!("vm_dir" => vm_dir.display().to_string()));
    let mut report = CleanReport::default();

    // ---- scan vdis/*/*/ for images and merge-state sidecars
    let mut vhds: BTreeSet<PathBuf> = BTreeSet::new();
    let mut sidecars: Vec<PathBuf> = Vec::new();
    for job_dir in handler.list(&vm_dir.join("vdis")).map_err(CleanError::from)? {
        if !handler.is_dir(&job_dir) {
            continue;
        }
        for disk_dir in handler.list(&job_dir).map_err(CleanError::from)? {
            if !handler.is_dir(&disk_dir) {
                continue;
            }
            for file in handler.list(&disk_dir).map_err(CleanError::from)? {
                if child_of_sidecar(&file).is_some() {
                    sidecars.push(file);
                } else if file.extension().map_or(false, |ext| ext == "vhd") {
                    vhds.insert(file);
                }
            }
        }
    }

    // Interrupted merges: child path -> recorded state. Both ends of an
    // interrupted pair may legitimately carry a stale end footer, so both
    // are opened without the second-footer comparison below.
    let mut interrupted: BTreeMap<PathBuf, MergeState> = BTreeMap::new();
    let mut relaxed: BTreeSet<PathBuf> = BTreeSet::new();
    for sidecar in &sidecars {
        let child = match child_of_sidecar(sidecar) {
            Some(child) => child,
            None => continue,
        };
        if !vhds.contains(&child) {
            warn!(logger, "merge state without its image";
                "state" => sidecar.display().to_string());
            if options.remove {
                handler.unlink(sidecar).map_err(CleanError::from)?;
            }
            continue;
        }
        match read_merge_state(handler, sidecar) {
            Ok(Some(state)) => {
                relaxed.insert(state.parent.clone());
                relaxed.insert(child.clone());
                report.interrupted_merges.push(child.clone());
                interrupted.insert(child, state);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(logger, "unreadable merge state";
                    "state" => sidecar.display().to_string(), "error" => %e);
            }
        }
    }

    // ---- phase 1: open every image, prune the broken ones, map ancestry
    let mut parent_of: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let mut children_of: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let mut contested_parents: BTreeSet<PathBuf> = BTreeSet::new();
    for path in vhds.clone() {
        let check_second_footer = !relaxed.contains(&path);
        let opened =
            VhdFile::open_with_logger(handler, &path, check_second_footer, logger.clone());
        let vhd = match opened {
            Ok(vhd) => vhd,
            Err(e) => {
                warn!(logger, "broken VHD";
                    "file" => path.display().to_string(), "error" => %e);
                vhds.remove(&path);
                if e.is_corrupt_image() && options.remove {
                    handler.unlink(&path).map_err(CleanError::from)?;
                    info!(logger, "removed broken VHD"; "file" => path.display().to_string());
                }
                report.broken_vhds.push(path);
                continue;
            }
        };
        if vhd.footer().disk_type() != DiskType::DIFFERENCING {
            continue;
        }
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let parent = match vhd.header().parent_unicode_name() {
            Some(name) => normalize_join(dir, &name),
            None => {
                warn!(logger, "differencing VHD names no parent";
                    "file" => path.display().to_string());
                vhds.remove(&path);
                if options.remove {
                    handler.unlink(&path).map_err(CleanError::from)?;
                }
                report.broken_vhds.push(path);
                continue;
            }
        };
        if contested_parents.contains(&parent) {
            parent_of.insert(path, parent);
            continue;
        }
        if let Some(first) = children_of.get(&parent) {
            let conflict = CleanError::MultipleChildren {
                parent: parent.clone(),
                first: first.clone(),
                second: path.clone(),
            };
            warn!(logger, "unmergeable chain"; "error" => %conflict);
            children_of.remove(&parent);
            contested_parents.insert(parent.clone());
            parent_of.insert(path, parent);
            continue;
        }
        children_of.insert(parent.clone(), path.clone());
        parent_of.insert(path, parent);
    }

    // ---- phase 2: prune orphans, cascading through lost ancestors
    loop {
        let orphans: Vec<PathBuf> = parent_of
            .iter()
            .filter(|(_, parent)| !vhds.contains(*parent))
            .map(|(child, _)| child.clone())
            .collect();
        if orphans.is_empty() {
            break;
        }
        for child in orphans {
            if let Some(parent) = parent_of.remove(&child) {
                let missing = CleanError::ParentMissing {
                    parent,
                    child: child.clone(),
                };
                warn!(logger, "orphan VHD"; "error" => %missing);
            }
            vhds.remove(&child);
            if options.remove {
                handler.unlink(&child).map_err(CleanError::from)?;
            }
            report.orphan_vhds.push(child);
        }
    }

    // ---- phase 3: backup metadata and archives at the top level
    let top_level = handler.list(vm_dir).map_err(CleanError::from)?;
    let xvas: BTreeSet<&PathBuf> = top_level
        .iter()
        .filter(|path| path.extension().map_or(false, |ext| ext == "xva"))
        .collect();
    let mut used_vhds: BTreeSet<PathBuf> = BTreeSet::new();
    let mut used_xvas: BTreeSet<PathBuf> = BTreeSet::new();
    // Delta metadata that survives phase 3, kept for the post-merge size pass
    let mut delta_metadata: Vec<(PathBuf, BackupMetadata, Vec<PathBuf>)> = Vec::new();

    for json_path in top_level.iter().filter(|path| {
        path.extension().map_or(false, |ext| ext == "json")
            && path
                .file_name()
                .map_or(false, |name| !name.to_string_lossy().starts_with('.'))
    }) {
        let bytes = match handler.read_file(json_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(logger, "unreadable metadata";
                    "file" => json_path.display().to_string(), "error" => %e);
                continue;
            }
        };
        let meta: BackupMetadata = match serde_json::from_slice(&bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(logger, "unparseable metadata";
                    "file" => json_path.display().to_string(), "error" => %e);
                continue;
            }
        };

        let mode = meta.mode.clone();
        match mode.as_str() {
            "full" => {
                let xva = meta.xva.as_ref().map(|rel| normalize_join(vm_dir, rel));
                match xva {
                    Some(xva) if xvas.contains(&xva) => {
                        used_xvas.insert(xva.clone());
                        let actual = handler.size(&xva).map_err(CleanError::from)?;
                        let mut meta = meta;
                        repair_size(
                            handler, json_path, &mut meta, actual, options, &logger, &mut report,
                        )?;
                    }
                    _ => {
                        drop_dangling_metadata(handler, json_path, options, &logger, &mut report)?;
                    }
                }
            }
            "delta" => {
                let referenced: Vec<PathBuf> = meta
                    .vhds
                    .as_ref()
                    .map(|map| {
                        map.values()
                            .map(|rel| normalize_join(vm_dir, rel))
                            .collect()
                    })
                    .unwrap_or_default();
                if referenced.is_empty() || !referenced.iter().all(|path| vhds.contains(path)) {
                    drop_dangling_metadata(handler, json_path, options, &logger, &mut report)?;
                    continue;
                }
                used_vhds.extend(referenced.iter().cloned());
                let actual = delta_actual_size(handler, &referenced).map_err(CleanError::from)?;
                let mut meta = meta;
                repair_size(
                    handler, json_path, &mut meta, actual, options, &logger, &mut report,
                )?;
                delta_metadata.push((json_path.clone(), meta, referenced));
            }
            other => {
                warn!(logger, "unknown metadata mode";
                    "file" => json_path.display().to_string(), "mode" => other);
            }
        }
    }

    for xva in xvas {
        if !used_xvas.contains(xva) {
            info!(logger, "unused XVA"; "file" => xva.display().to_string());
        }
    }

    // ---- phase 4: plan merges over the unused chains
    let unused: BTreeSet<&PathBuf> = vhds.iter().filter(|path| !used_vhds.contains(*path)).collect();
    let mut chains: Vec<Vec<PathBuf>> = Vec::new();
    for &root in &unused {
        // A chain starts at an unused VHD whose own parent is used or absent
        let starts_chain = match parent_of.get(root) {
            None => true,
            Some(parent) => !unused.contains(parent),
        };
        if !starts_chain {
            continue;
        }
        let mut lineage = vec![root.clone()];
        let mut current = root.clone();
        while let Some(child) = children_of.get(&current) {
            if !vhds.contains(child) {
                break;
            }
            lineage.push(child.clone());
            if used_vhds.contains(child) {
                // The first used descendant terminates (and joins) the chain
                break;
            }
            current = child.clone();
        }
        if lineage.len() >= 2 {
            lineage.reverse(); // [child, ..., parent]
            chains.push(lineage);
        } else {
            debug!(logger, "unused VHD outside any chain";
                "file" => root.display().to_string());
            report.unused_vhds.push(root.clone());
        }
    }

    // Interrupted pairs resume even when both ends are referenced
    for (child, state) in &interrupted {
        if !vhds.contains(child) || !vhds.contains(&state.parent) {
            warn!(logger, "cannot resume merge, an end of the pair is gone";
                "child" => child.display().to_string(),
                "parent" => state.parent.display().to_string());
            continue;
        }
        let covered = chains
            .iter()
            .any(|chain| chain.contains(child) && chain.contains(&state.parent));
        if !covered {
            chains.push(vec![child.clone(), state.parent.clone()]);
        }
    }

    report.planned_chains = chains.len();
    for chain in &chains {
        info!(logger, "planned merge";
            "chain" => format!("{:?}", chain.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()),
            "resume" => interrupted.contains_key(&chain[0]),
        );
    }

    // ---- phase 5: execute merges behind the limiter
    let mut collapsed: Vec<PathBuf> = Vec::new();
    if options.merge && !chains.is_empty() {
        let queue: Mutex<VecDeque<Vec<PathBuf>>> = Mutex::new(chains.into_iter().collect());
        let outcomes: Mutex<(u64, Vec<PathBuf>, usize)> = Mutex::new((0, Vec::new(), 0));
        let workers = options.merge_limit.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let chain = match queue.lock().pop_front() {
                        Some(chain) => chain,
                        None => break,
                    };
                    match merge_chain(handler, &chain, &logger) {
                        Ok(bytes) => {
                            let mut outcomes = outcomes.lock();
                            outcomes.0 += bytes;
                            outcomes.1.push(chain[0].clone());
                        }
                        Err(e) => {
                            warn!(logger, "merge failed";
                                "child" => chain[0].display().to_string(), "error" => %e);
                            outcomes.lock().2 += 1;
                        }
                    }
                });
            }
        });
        let (bytes, mut done, failed) = outcomes.into_inner();
        report.merged_bytes = bytes;
        report.merged_chains = done.len();
        report.failed_merges = failed;
        collapsed.append(&mut done);
    }

    // ---- phase 6: merged chains changed file sizes under the metadata
    if options.fix_metadata && !collapsed.is_empty() {
        let collapsed: BTreeSet<&PathBuf> = collapsed.iter().collect();
        for (json_path, meta, referenced) in &mut delta_metadata {
            if !referenced.iter().any(|path| collapsed.contains(path)) {
                continue;
            }
            let actual = delta_actual_size(handler, referenced).map_err(CleanError::from)?;
            repair_size(handler, json_path, meta, actual, options, &logger, &mut report)?;
        }
    }

    report.vhds = vhds.len();
    info!(logger, "clean finished";
        "vhds" => report.vhds,
        "broken" => report.broken_vhds.len(),
        "orphans" => report.orphan_vhds.len(),
        "planned_chains" => report.planned_chains,
        "merged_chains" => report.merged_chains,
        "merged_bytes" => report.merged_bytes,
    );
    Ok(report)
}

/// Merge every descendant of a `[child, ..., parent]` chain into the parent,
/// oldest first, then commit by renaming the merged parent over the child's
/// path and unlinking the intermediates. The rename is the atomic commit
/// point: once it lands, the chain has collapsed.
fn merge_chain(handler: &dyn Handler, chain: &[PathBuf], logger: &Logger) -> Result<u64> {
    let parent = match chain.last() {
        Some(parent) if chain.len() >= 2 => parent,
        _ => return Ok(0),
    };
    let mut bytes = 0;
    for child in chain[..chain.len() - 1].iter().rev() {
        let mut on_progress = |progress: Progress| {
            debug!(logger, "merge progress";
                "child" => child.display().to_string(),
                "done" => progress.done,
                "total" => progress.total);
        };
        bytes += merge_vhd_with_logger(handler, parent, child, &mut on_progress, logger.clone())?;
    }
    handler.rename(parent, &chain[0]).map_err(CleanError::from)?;
    for stale in &chain[1..chain.len() - 1] {
        handler.unlink(stale).map_err(CleanError::from)?;
        // A resumed intermediate may still carry its sidecar
        let stale_state = sidecar_path(stale);
        if handler.exists(&stale_state) {
            handler.unlink(&stale_state).map_err(CleanError::from)?;
        }
    }
    info!(logger, "chain collapsed";
        "into" => chain[0].display().to_string(),
        "images" => chain.len(),
        "bytes" => bytes,
    );
    Ok(bytes)
}

fn drop_dangling_metadata(
    handler: &dyn Handler,
    json_path: &Path,
    options: &CleanOptions,
    logger: &Logger,
    report: &mut CleanReport,
) -> Result<()> {
    warn!(logger, "metadata references missing payload";
        "file" => json_path.display().to_string());
    if options.remove {
        handler.unlink(json_path).map_err(CleanError::from)?;
    }
    report.dangling_metadata.push(json_path.to_path_buf());
    Ok(())
}

/// Update the recorded size when it undershoots reality. Sizes never shrink:
/// a larger recorded size is evidence of a stale reference, not of
/// over-counting, and shrinking would hide it.
fn repair_size(
    handler: &dyn Handler,
    json_path: &Path,
    meta: &mut BackupMetadata,
    actual: u64,
    options: &CleanOptions,
    logger: &Logger,
    report: &mut CleanReport,
) -> Result<()> {
    let recorded = meta.size;
    if recorded.map_or(false, |size| size >= actual) {
        return Ok(());
    }
    if !options.fix_metadata {
        info!(logger, "metadata size undershoots";
            "file" => json_path.display().to_string(),
            "recorded" => recorded,
            "actual" => actual);
        return Ok(());
    }
    meta.size = Some(actual);
    let bytes = match serde_json::to_vec_pretty(meta) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(logger, "cannot re-serialize metadata";
                "file" => json_path.display().to_string(), "error" => %e);
            return Ok(());
        }
    };
    handler
        .write_file(json_path, &bytes)
        .map_err(CleanError::from)?;
    info!(logger, "fixed metadata size";
        "file" => json_path.display().to_string(),
        "recorded" => recorded,
        "actual" => actual);
    report.fixed_metadata.push(json_path.to_path_buf());
    Ok(())
}

/// Total on-disk size of a delta backup: the sum over its chain members
fn delta_actual_size(handler: &dyn Handler, paths: &[PathBuf]) -> io::Result<u64> {
    let mut total = 0;
    for path in paths {
        total += handler.size(path)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LocalHandler;
    use crate::merge::sidecar_path;

    const BLOCK: u32 = 4 * 512;

    struct VmDir {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        disk_dir: PathBuf,
    }

    fn vm_dir() -> VmDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let disk_dir = root.join("vdis/job/disk");
        std::fs::create_dir_all(&disk_dir).unwrap();
        VmDir {
            _tmp: tmp,
            root,
            disk_dir,
        }
    }

    /// A <- B <- C chain with a distinct byte pattern per layer
    fn build_chain(dir: &VmDir) -> (PathBuf, PathBuf, PathBuf) {
        let handler = LocalHandler;
        let a = dir.disk_dir.join("a.vhd");
        let b = dir.disk_dir.join("b.vhd");
        let c = dir.disk_dir.join("c.vhd");
        let mut vhd =
            VhdFile::create_dynamic(&handler, &a, 4 * u64::from(BLOCK), BLOCK).unwrap();
        vhd.write_data(0, &[0x0A; 4 * 512]).unwrap(); // full block 0
        drop(vhd);
        let mut vhd = VhdFile::create_differencing(&handler, &b, &a).unwrap();
        vhd.write_data(0, &[0x0B; 512]).unwrap(); // sector 0
        drop(vhd);
        let mut vhd = VhdFile::create_differencing(&handler, &c, &b).unwrap();
        vhd.write_data(1, &[0x0C; 512]).unwrap(); // sector 1
        drop(vhd);
        (a, b, c)
    }

    fn write_delta_metadata(dir: &VmDir, name: &str, target: &str, size: Option<u64>) -> PathBuf {
        let path = dir.root.join(name);
        let mut meta = serde_json::json!({
            "mode": "delta",
            "vhds": { "0": target },
        });
        if let Some(size) = size {
            meta["size"] = size.into();
        }
        std::fs::write(&path, serde_json::to_vec(&meta).unwrap()).unwrap();
        path
    }

    #[test]
    fn report_mode_touches_nothing() {
        let dir = vm_dir();
        let (a, b, c) = build_chain(&dir);
        write_delta_metadata(&dir, "backup.json", "vdis/job/disk/c.vhd", Some(1));

        let report = clean_vm(&LocalHandler, &dir.root, &CleanOptions::default()).unwrap();
        assert_eq!(report.planned_chains, 1);
        assert_eq!(report.merged_chains, 0);
        assert!(report.fixed_metadata.is_empty());
        // everything is still there
        assert!(a.exists() && b.exists() && c.exists());
    }

    #[test]
    fn unreferenced_chain_collapses_into_the_leaf() {
        let dir = vm_dir();
        let (a, b, c) = build_chain(&dir);
        write_delta_metadata(&dir, "backup.json", "vdis/job/disk/c.vhd", Some(1));

        let options = CleanOptions {
            remove: true,
            merge: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.planned_chains, 1);
        assert_eq!(report.merged_chains, 1);
        assert_eq!(report.failed_merges, 0);

        // a was renamed over c, b was unlinked
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(c.exists());

        let handler = LocalHandler;
        let mut merged = VhdFile::open(&handler, &c).unwrap();
        assert_eq!(merged.footer().disk_type(), DiskType::DYNAMIC);
        let mut read = vec![0u8; 4 * 512];
        merged.read_data(0, &mut read).unwrap();
        assert!(read[..512].iter().all(|&byte| byte == 0x0B));
        assert!(read[512..2 * 512].iter().all(|&byte| byte == 0x0C));
        assert!(read[2 * 512..].iter().all(|&byte| byte == 0x0A));
    }

    #[test]
    fn orphans_cascade_and_are_removed() {
        let dir = vm_dir();
        let (a, b, c) = build_chain(&dir);
        std::fs::remove_file(&a).unwrap();

        let options = CleanOptions {
            remove: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.orphan_vhds.len(), 2);
        assert!(!b.exists());
        assert!(!c.exists());
        assert_eq!(report.planned_chains, 0);
        assert_eq!(report.vhds, 0);
    }

    #[test]
    fn broken_images_are_pruned() {
        let dir = vm_dir();
        let (_, _, c) = build_chain(&dir);
        write_delta_metadata(&dir, "backup.json", "vdis/job/disk/c.vhd", None);
        let junk = dir.disk_dir.join("junk.vhd");
        std::fs::write(&junk, b"this is not a disk image, it only ends in .vhd").unwrap();

        let report = clean_vm(&LocalHandler, &dir.root, &CleanOptions::default()).unwrap();
        assert_eq!(report.broken_vhds, vec![junk.clone()]);
        assert!(junk.exists()); // report mode keeps it

        let options = CleanOptions {
            remove: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.broken_vhds, vec![junk.clone()]);
        assert!(!junk.exists());
        assert!(c.exists());
    }

    #[test]
    fn metadata_with_missing_payload_is_dropped() {
        let dir = vm_dir();
        build_chain(&dir);
        let json = write_delta_metadata(&dir, "backup.json", "vdis/job/disk/missing.vhd", None);

        let options = CleanOptions {
            remove: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.dangling_metadata, vec![json.clone()]);
        assert!(!json.exists());
    }

    #[test]
    fn sizes_grow_but_never_shrink() {
        let dir = vm_dir();
        let (_, _, c) = build_chain(&dir);
        // c is referenced; a and b become a chain but merging is off
        let undershoot = write_delta_metadata(&dir, "under.json", "vdis/job/disk/c.vhd", Some(1));
        let c_size = std::fs::metadata(&c).unwrap().len();

        let options = CleanOptions {
            fix_metadata: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.fixed_metadata, vec![undershoot.clone()]);
        let rewritten: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&undershoot).unwrap()).unwrap();
        assert_eq!(rewritten["size"], serde_json::json!(c_size));
        assert_eq!(rewritten["mode"], "delta");

        // An overshooting size stays put
        std::fs::write(
            &undershoot,
            serde_json::to_vec(&serde_json::json!({
                "mode": "delta",
                "size": c_size + 1_000_000,
                "vhds": { "0": "vdis/job/disk/c.vhd" },
            }))
            .unwrap(),
        )
        .unwrap();
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert!(report.fixed_metadata.is_empty());
        let kept: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&undershoot).unwrap()).unwrap();
        assert_eq!(kept["size"], serde_json::json!(c_size + 1_000_000));
    }

    #[test]
    fn interrupted_merges_resume_even_when_referenced() {
        let dir = vm_dir();
        let handler = LocalHandler;
        let a = dir.disk_dir.join("a.vhd");
        let b = dir.disk_dir.join("b.vhd");
        let mut vhd =
            VhdFile::create_dynamic(&handler, &a, 4 * u64::from(BLOCK), BLOCK).unwrap();
        vhd.write_data(0, &[0x0A; 4 * 512]).unwrap();
        drop(vhd);
        let mut vhd = VhdFile::create_differencing(&handler, &b, &a).unwrap();
        vhd.write_data(0, &[0x0B; 512]).unwrap();
        drop(vhd);
        write_delta_metadata(&dir, "backup.json", "vdis/job/disk/b.vhd", None);

        // Fake a crash that happened right after the sidecar became durable
        std::fs::write(
            sidecar_path(&b),
            serde_json::to_vec(&serde_json::json!({
                "parent": &a,
                "child": &b,
                "mergedBlocks": 0,
            }))
            .unwrap(),
        )
        .unwrap();

        let options = CleanOptions {
            merge: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        assert_eq!(report.interrupted_merges, vec![b.clone()]);
        assert_eq!(report.merged_chains, 1);
        assert!(!sidecar_path(&b).exists());
        assert!(!a.exists());

        let mut merged = VhdFile::open(&handler, &b).unwrap();
        let mut read = vec![0u8; 4 * 512];
        merged.read_data(0, &mut read).unwrap();
        assert!(read[..512].iter().all(|&byte| byte == 0x0B));
        assert!(read[512..].iter().all(|&byte| byte == 0x0A));
    }

    #[test]
    fn two_children_for_one_parent_block_the_chain() {
        let dir = vm_dir();
        let handler = LocalHandler;
        let a = dir.disk_dir.join("a.vhd");
        let b = dir.disk_dir.join("b.vhd");
        let c = dir.disk_dir.join("c.vhd");
        VhdFile::create_dynamic(&handler, &a, 4 * u64::from(BLOCK), BLOCK).unwrap();
        VhdFile::create_differencing(&handler, &b, &a).unwrap();
        VhdFile::create_differencing(&handler, &c, &a).unwrap();

        let options = CleanOptions {
            merge: true,
            remove: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&LocalHandler, &dir.root, &options).unwrap();
        // nothing merged, nothing deleted
        assert_eq!(report.merged_chains, 0);
        assert!(a.exists() && b.exists() && c.exists());
    }
}
