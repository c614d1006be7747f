// walk.rs - Parallel directory tree walker
//
// Rank 0 seeds the work queue with the root; every rank then drains
// directories off the queue and appends what it sees to its own record
// list. Failures on children are logged and skipped; a failure on the
// root leaves the inventory empty. The walker never aborts the job.
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::comm::{Comm, ROOT};
use crate::inventory::{FileRecord, FileStat, FileType};
use crate::queue::WorkQueue;

/// Longest path accepted into the inventory, terminating NUL included.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkMode {
    /// lstat every item.
    Stat,
    /// Take types from directory entries; lstat only when the entry
    /// type is unknown.
    Lite,
}

pub fn walk<C: Comm>(
    comm: &C,
    queue: &WorkQueue,
    root: &Path,
    mode: WalkMode,
) -> Vec<FileRecord> {
    let mut records = Vec::new();
    if comm.rank() == ROOT {
        seed(root, mode, queue, &mut records);
    }
    // Nobody may observe an empty queue before the seed lands.
    comm.barrier();
    match mode {
        WalkMode::Stat => queue.drain(|item, q| {
            process_stat(bytes_path(&item), q, &mut records);
        }),
        WalkMode::Lite => queue.drain(|item, q| {
            process_dir_lite(bytes_path(&item), q, &mut records);
        }),
    }
    comm.barrier();
    records
}

fn bytes_path(item: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(item))
}

fn seed(root: &Path, mode: WalkMode, queue: &WorkQueue, records: &mut Vec<FileRecord>) {
    match mode {
        WalkMode::Stat => queue.enqueue(root.as_os_str().as_bytes().to_vec()),
        WalkMode::Lite => {
            let md = match fs::symlink_metadata(root) {
                Ok(md) => md,
                Err(e) => {
                    eprintln!("Failed to lstat `{}': {}", root.display(), e);
                    return;
                }
            };
            let ftype = FileType::from_mode(mode_of(&md));
            records.push(FileRecord {
                path: root.to_path_buf(),
                ftype,
                st: None,
            });
            if ftype == FileType::Dir {
                process_dir_lite(root, queue, records);
            }
        }
    }
}

fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

/// Stat mode: every queued item is lstat'd and recorded; directories
/// get their entries queued.
fn process_stat(path: &Path, queue: &WorkQueue, records: &mut Vec<FileRecord>) {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) => {
            eprintln!("Failed to lstat `{}': {}", path.display(), e);
            return;
        }
    };
    let ftype = FileType::from_mode(mode_of(&md));
    records.push(FileRecord {
        path: path.to_path_buf(),
        ftype,
        st: Some(FileStat::from_metadata(&md)),
    });
    if ftype != FileType::Dir {
        return;
    }
    let rd = match fs::read_dir(path) {
        Ok(rd) => rd,
        Err(e) => {
            eprintln!("Failed to open directory `{}': {}", path.display(), e);
            return;
        }
    };
    for dent in rd {
        let dent = match dent {
            Ok(d) => d,
            Err(e) => {
                eprintln!("Failed to read entry in `{}': {}", path.display(), e);
                continue;
            }
        };
        if let Some(child) = bounded_child(dent.path()) {
            queue.enqueue(child.as_os_str().as_bytes().to_vec());
        }
    }
}

/// Lite mode: queued items are directories whose entries get recorded
/// with whatever type the dirent hint provides, falling back to lstat
/// only when the hint is missing.
fn process_dir_lite(dir: &Path, queue: &WorkQueue, records: &mut Vec<FileRecord>) {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) => {
            eprintln!("Failed to open directory `{}': {}", dir.display(), e);
            return;
        }
    };
    for dent in rd {
        let dent = match dent {
            Ok(d) => d,
            Err(e) => {
                eprintln!("Failed to read entry in `{}': {}", dir.display(), e);
                continue;
            }
        };
        let Some(path) = bounded_child(dent.path()) else {
            continue;
        };
        let ftype = match dent.file_type() {
            Ok(ft) => FileType::from_fs(ft),
            Err(_) => match fs::symlink_metadata(&path) {
                Ok(md) => FileType::from_mode(mode_of(&md)),
                Err(e) => {
                    eprintln!("Failed to lstat `{}': {}", path.display(), e);
                    continue;
                }
            },
        };
        records.push(FileRecord {
            path: path.clone(),
            ftype,
            st: None,
        });
        if ftype == FileType::Dir {
            queue.enqueue(path.into_os_string().into_vec());
        }
    }
}

/// Paths that would overflow the path buffer are dropped with a
/// diagnostic; they never enter the inventory.
fn bounded_child(path: PathBuf) -> Option<PathBuf> {
    let len = path.as_os_str().len() + 1;
    if len > MAX_PATH_LEN {
        eprintln!(
            "Path name is too long: {} chars exceeds limit {}",
            len, MAX_PATH_LEN
        );
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_ranks;
    use std::collections::BTreeSet;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn build_tree(root: &Path) {
        fs::create_dir(root.join("d1")).unwrap();
        fs::create_dir(root.join("d1/d2")).unwrap();
        fs::write(root.join("a"), b"a").unwrap();
        fs::write(root.join("d1/b"), b"bb").unwrap();
        fs::write(root.join("d1/d2/c"), b"ccc").unwrap();
        symlink("a", root.join("l")).unwrap();
    }

    fn walk_tree(ranks: usize, root: PathBuf, mode: WalkMode) -> Vec<FileRecord> {
        let queue = WorkQueue::new();
        let out = run_ranks(ranks, |c| walk(c, &queue, &root, mode));
        out.into_iter().flatten().collect()
    }

    fn paths(records: &[FileRecord]) -> BTreeSet<PathBuf> {
        records.iter().map(|r| r.path.clone()).collect()
    }

    #[test]
    fn stat_walk_records_every_entry_once() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        build_tree(&root);

        let records = walk_tree(1, root.clone(), WalkMode::Stat);
        let expect: BTreeSet<PathBuf> = [
            root.clone(),
            root.join("a"),
            root.join("l"),
            root.join("d1"),
            root.join("d1/b"),
            root.join("d1/d2"),
            root.join("d1/d2/c"),
        ]
        .into_iter()
        .collect();
        assert_eq!(paths(&records), expect);
        assert_eq!(records.len(), 7);
        assert!(records.iter().all(|r| r.st.is_some()));

        let link = records.iter().find(|r| r.path == root.join("l")).unwrap();
        assert_eq!(link.ftype, FileType::Link);
        let sub = records.iter().find(|r| r.path == root.join("d1")).unwrap();
        assert_eq!(sub.ftype, FileType::Dir);
    }

    #[test]
    fn stat_walk_sizes_come_from_lstat() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        build_tree(&root);

        let records = walk_tree(1, root.clone(), WalkMode::Stat);
        let c = records
            .iter()
            .find(|r| r.path == root.join("d1/d2/c"))
            .unwrap();
        assert_eq!(c.st.as_ref().unwrap().size, 3);
    }

    #[test]
    fn lite_walk_matches_stat_walk_coverage() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        build_tree(&root);

        let lite = walk_tree(1, root.clone(), WalkMode::Lite);
        let stat = walk_tree(1, root.clone(), WalkMode::Stat);
        assert_eq!(paths(&lite), paths(&stat));
        assert!(lite.iter().all(|r| r.st.is_none()));

        let link = lite.iter().find(|r| r.path == root.join("l")).unwrap();
        assert_eq!(link.ftype, FileType::Link);
    }

    #[test]
    fn multiple_ranks_cover_the_tree_disjointly() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        build_tree(&root);

        let records = walk_tree(3, root.clone(), WalkMode::Stat);
        assert_eq!(records.len(), 7, "no entry recorded twice");
        assert_eq!(paths(&records).len(), 7);
    }

    #[test]
    fn missing_root_yields_empty_inventory() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("nope");
        for mode in [WalkMode::Stat, WalkMode::Lite] {
            let records = walk_tree(1, root.clone(), mode);
            assert!(records.is_empty());
        }
    }

    #[test]
    fn oversize_children_are_dropped() {
        let long = "x".repeat(MAX_PATH_LEN);
        assert!(bounded_child(PathBuf::from(long)).is_none());
        assert!(bounded_child(PathBuf::from("/t/ok")).is_some());
    }
}
