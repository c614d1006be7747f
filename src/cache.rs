// cache.rs - Versioned inventory cache file
//
// Big-endian, fixed-width, readable and writable collectively. The
// version word at offset 0 selects the decoder: v2 carries (path,
// type) records, v3 adds the user/group tables and full stat trailers.
// The `chars` field in the header is authoritative for every rank.
// Records are split evenly, the first `count % ranks` ranks taking one
// extra, each rank reading or writing at its exscan offset.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::comm::{Comm, Reduce, ROOT};
use crate::ids::IdTable;
use crate::inventory::{be_u64, InventoryMode, PackedBuffer};

pub const VERSION_LITE: u64 = 2;
pub const VERSION_STAT: u64 = 3;

const V2_DATA_OFF: u64 = 8 + 4 * 8;
const V3_TABLES_OFF: u64 = 8 + 8 * 8;

pub struct CacheContents {
    pub files: PackedBuffer,
    pub users: IdTable,
    pub groups: IdTable,
    pub walk_start: u64,
    pub walk_end: u64,
}

impl CacheContents {
    fn empty() -> CacheContents {
        CacheContents {
            files: PackedBuffer::empty(InventoryMode::Lite),
            users: IdTable::default(),
            groups: IdTable::default(),
            walk_start: 0,
            walk_end: 0,
        }
    }
}

/// Collective read. Failures are logged on rank 0 and leave the
/// inventory empty; the job carries on with whatever it has.
pub fn read_cache<C: Comm>(comm: &C, name: &Path) -> CacheContents {
    let mut version_buf = vec![0u8; 8];
    let file = if comm.rank() == ROOT {
        match File::open(name) {
            Ok(f) => {
                if let Err(e) = f.read_exact_at(&mut version_buf, 0) {
                    eprintln!("Failed to read cache version from `{}': {}", name.display(), e);
                    version_buf.fill(0);
                }
                Some(f)
            }
            Err(e) => {
                eprintln!("Failed to open cache file `{}': {}", name.display(), e);
                None
            }
        }
    } else {
        None
    };
    comm.broadcast(ROOT, &mut version_buf);

    match be_u64(&version_buf) {
        VERSION_LITE => read_v2(comm, name, file.as_ref()),
        VERSION_STAT => read_v3(comm, name, file.as_ref()),
        0 => CacheContents::empty(),
        v => {
            if comm.rank() == ROOT {
                eprintln!("Unrecognized cache version {} in `{}'", v, name.display());
            }
            CacheContents::empty()
        }
    }
}

fn read_v2<C: Comm>(comm: &C, name: &Path, file: Option<&File>) -> CacheContents {
    let mut hdr = vec![0u8; 32];
    if comm.rank() == ROOT {
        if let Some(f) = file {
            if let Err(e) = f.read_exact_at(&mut hdr, 8) {
                eprintln!("Failed to read cache header from `{}': {}", name.display(), e);
                hdr.fill(0);
            }
        }
    }
    comm.broadcast(ROOT, &mut hdr);
    let walk_start = be_u64(&hdr[0..]);
    let walk_end = be_u64(&hdr[8..]);
    let all_count = be_u64(&hdr[16..]);
    let chars = be_u64(&hdr[24..]);

    let files = read_file_array(
        comm,
        name,
        file,
        V2_DATA_OFF,
        all_count,
        chars,
        InventoryMode::Lite,
    );
    CacheContents {
        files,
        users: IdTable::default(),
        groups: IdTable::default(),
        walk_start,
        walk_end,
    }
}

fn read_v3<C: Comm>(comm: &C, name: &Path, file: Option<&File>) -> CacheContents {
    let mut hdr = vec![0u8; 64];
    if comm.rank() == ROOT {
        if let Some(f) = file {
            if let Err(e) = f.read_exact_at(&mut hdr, 8) {
                eprintln!("Failed to read cache header from `{}': {}", name.display(), e);
                hdr.fill(0);
            }
        }
    }
    comm.broadcast(ROOT, &mut hdr);
    let walk_start = be_u64(&hdr[0..]);
    let walk_end = be_u64(&hdr[8..]);
    let users_count = be_u64(&hdr[16..]);
    let users_chars = be_u64(&hdr[24..]);
    let groups_count = be_u64(&hdr[32..]);
    let groups_chars = be_u64(&hdr[40..]);
    let all_count = be_u64(&hdr[48..]);
    let chars = be_u64(&hdr[56..]);

    // the tables are small and identical: rank 0 reads, everyone gets
    // the broadcast
    let users = read_table(comm, name, file, V3_TABLES_OFF, users_count, users_chars);
    let users_bytes = users_count * (users_chars + 4);
    let groups = read_table(
        comm,
        name,
        file,
        V3_TABLES_OFF + users_bytes,
        groups_count,
        groups_chars,
    );
    let groups_bytes = groups_count * (groups_chars + 4);

    let files = read_file_array(
        comm,
        name,
        file,
        V3_TABLES_OFF + users_bytes + groups_bytes,
        all_count,
        chars,
        InventoryMode::Stat,
    );
    CacheContents {
        files,
        users,
        groups,
        walk_start,
        walk_end,
    }
}

fn read_table<C: Comm>(
    comm: &C,
    name: &Path,
    file: Option<&File>,
    disp: u64,
    count: u64,
    chars: u64,
) -> IdTable {
    let mut buf = vec![0u8; (count * (chars + 4)) as usize];
    if comm.rank() == ROOT && !buf.is_empty() {
        if let Some(f) = file {
            if let Err(e) = f.read_exact_at(&mut buf, disp) {
                eprintln!("Failed to read id table from `{}': {}", name.display(), e);
                buf.fill(0);
            }
        }
    }
    comm.broadcast(ROOT, &mut buf);
    IdTable::from_packed(count, chars, buf)
}

/// Collective read of this rank's share of the record array.
fn read_file_array<C: Comm>(
    comm: &C,
    name: &Path,
    file: Option<&File>,
    disp: u64,
    all_count: u64,
    chars: u64,
    mode: InventoryMode,
) -> PackedBuffer {
    let ranks = comm.ranks() as u64;
    let mut count = all_count / ranks;
    if (comm.rank() as u64) < all_count % ranks {
        count += 1;
    }
    let offset = comm.exscan_sum(count);

    if all_count == 0 || chars == 0 {
        return PackedBuffer::empty(mode);
    }
    let rs = chars + mode.trailer_size() as u64;
    let mut buf = vec![0u8; (count * rs) as usize];
    if count > 0 {
        let opened;
        let f = match file {
            Some(f) => f,
            None => match File::open(name) {
                Ok(f) => {
                    opened = f;
                    &opened
                }
                Err(e) => {
                    eprintln!("Failed to open cache file `{}': {}", name.display(), e);
                    return PackedBuffer::empty(mode);
                }
            },
        };
        if let Err(e) = f.read_exact_at(&mut buf, disp + offset * rs) {
            eprintln!("Failed to read cache records from `{}': {}", name.display(), e);
            return PackedBuffer::empty(mode);
        }
    }
    PackedBuffer {
        mode,
        chars,
        count,
        buf,
    }
}

/// Collective write. Rank 0 lays down the version, header, and (for
/// stat inventories) the id tables; every rank then writes its record
/// slice at its exscan offset. Failures are logged and the job carries
/// on; the cache is best-effort.
pub fn write_cache<C: Comm>(
    comm: &C,
    name: &Path,
    files: &PackedBuffer,
    users: &IdTable,
    groups: &IdTable,
    walk_start: u64,
    walk_end: u64,
) {
    let all_count = comm.allreduce_u64(files.count, Reduce::Sum);
    let offset = comm.exscan_sum(files.count);

    let data_off = match files.mode {
        InventoryMode::Lite => V2_DATA_OFF,
        InventoryMode::Stat => {
            V3_TABLES_OFF + users.count * (users.chars + 4) + groups.count * (groups.chars + 4)
        }
    };

    let mut ok = vec![0u8];
    if comm.rank() == ROOT {
        let mut header = Vec::new();
        match files.mode {
            InventoryMode::Lite => {
                for v in [VERSION_LITE, walk_start, walk_end, all_count, files.chars] {
                    header.extend_from_slice(&v.to_be_bytes());
                }
            }
            InventoryMode::Stat => {
                for v in [
                    VERSION_STAT,
                    walk_start,
                    walk_end,
                    users.count,
                    users.chars,
                    groups.count,
                    groups.chars,
                    all_count,
                    files.chars,
                ] {
                    header.extend_from_slice(&v.to_be_bytes());
                }
                header.extend_from_slice(&users.buf);
                header.extend_from_slice(&groups.buf);
            }
        }
        match File::create(name) {
            Ok(f) => match f.write_all_at(&header, 0) {
                Ok(()) => ok[0] = 1,
                Err(e) => {
                    eprintln!("Failed to write cache header to `{}': {}", name.display(), e)
                }
            },
            Err(e) => eprintln!("Failed to create cache file `{}': {}", name.display(), e),
        }
    }
    comm.broadcast(ROOT, &mut ok);
    if ok[0] == 0 {
        return;
    }

    if files.count > 0 {
        let rs = files.record_size() as u64;
        match OpenOptions::new().write(true).open(name) {
            Ok(f) => {
                if let Err(e) = f.write_all_at(&files.buf, data_off + offset * rs) {
                    eprintln!("Failed to write cache records to `{}': {}", name.display(), e);
                }
            }
            Err(e) => eprintln!("Failed to open cache file `{}': {}", name.display(), e),
        }
    }
    comm.barrier();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_ranks;
    use crate::inventory::{FileRecord, FileStat, FileType};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn stat_record(path: &str, uid: u32, size: u64) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            ftype: FileType::File,
            st: Some(FileStat {
                mode: 0o100600,
                uid,
                gid: uid + 1,
                atime: 1_600_000_000,
                mtime: 1_600_000_001,
                ctime: 1_600_000_002,
                size,
            }),
        }
    }

    fn lite_record(path: &str, ftype: FileType) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            ftype,
            st: None,
        }
    }

    fn stat_rows(files: &PackedBuffer) -> Vec<(Vec<u8>, u32, u32, u32, u32, u32, u32, u64)> {
        files
            .records()
            .map(|r| {
                (
                    r.path().to_vec(),
                    r.mode_bits(),
                    r.uid(),
                    r.gid(),
                    r.atime(),
                    r.mtime(),
                    r.ctime(),
                    r.size(),
                )
            })
            .collect()
    }

    fn lite_rows(files: &PackedBuffer) -> Vec<(Vec<u8>, u32)> {
        files
            .records()
            .map(|r| (r.path().to_vec(), r.file_type().as_u32()))
            .collect()
    }

    #[test]
    fn v3_round_trip_preserves_records_and_tables() {
        let tmp = tempdir().unwrap();
        let name = tmp.path().join("out.cache");

        let written = run_ranks(2, |c| {
            let recs = if c.rank() == 0 {
                vec![stat_record("/t/a", 10, 1), stat_record("/t/b", 11, 2)]
            } else {
                vec![stat_record("/t/sub/c", 12, 3)]
            };
            let files = PackedBuffer::from_records(c, recs, InventoryMode::Stat);
            let users = IdTable::from_entries(&[("alice".into(), 10), ("bob".into(), 11)]);
            let groups = IdTable::from_entries(&[("staff".into(), 11)]);
            write_cache(c, &name, &files, &users, &groups, 1111, 2222);
            stat_rows(&files)
        });
        let mut expect: Vec<_> = written.into_iter().flatten().collect();
        expect.sort();

        let read = run_ranks(2, |c| {
            let contents = read_cache(c, &name);
            assert_eq!(contents.walk_start, 1111);
            assert_eq!(contents.walk_end, 2222);
            assert_eq!(contents.files.mode, InventoryMode::Stat);
            let mut users = contents.users;
            assert_eq!(users.name_from_id(10), "alice");
            let mut groups = contents.groups;
            assert_eq!(groups.name_from_id(11), "staff");
            stat_rows(&contents.files)
        });
        let mut got: Vec<_> = read.into_iter().flatten().collect();
        got.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn v2_round_trip_across_different_rank_counts() {
        let tmp = tempdir().unwrap();
        let name = tmp.path().join("out.cache");

        let written = run_ranks(3, |c| {
            let recs = match c.rank() {
                0 => vec![
                    lite_record("/t", FileType::Dir),
                    lite_record("/t/a", FileType::File),
                ],
                1 => vec![lite_record("/t/l", FileType::Link)],
                _ => vec![
                    lite_record("/t/sub", FileType::Dir),
                    lite_record("/t/sub/b", FileType::File),
                ],
            };
            let files = PackedBuffer::from_records(c, recs, InventoryMode::Lite);
            write_cache(c, &name, &files, &IdTable::default(), &IdTable::default(), 5, 6);
            lite_rows(&files)
        });
        let mut expect: Vec<_> = written.into_iter().flatten().collect();
        expect.sort();

        // A different group size reads the same file: the first
        // count % ranks ranks take one extra record.
        let read = run_ranks(2, |c| {
            let contents = read_cache(c, &name);
            assert_eq!(contents.files.mode, InventoryMode::Lite);
            let want = if c.rank() == 0 { 3 } else { 2 };
            assert_eq!(contents.files.count, want);
            lite_rows(&contents.files)
        });
        let mut got: Vec<_> = read.into_iter().flatten().collect();
        got.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn lite_walk_cache_round_trip_drives_identical_deletions() {
        use crate::queue::WorkQueue;
        use crate::walk::{walk, WalkMode};

        let tmp = tempdir().unwrap();
        let root = tmp.path().join("t");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a"), b"x").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/b"), b"y").unwrap();
        let name = tmp.path().join("out.cache");

        let queue = WorkQueue::new();
        let written = run_ranks(2, |c| {
            let records = walk(c, &queue, &root, WalkMode::Lite);
            let files = PackedBuffer::from_records(c, records, InventoryMode::Lite);
            write_cache(c, &name, &files, &IdTable::default(), &IdTable::default(), 0, 0);
            lite_rows(&files)
        });
        let mut expect: Vec<_> = written.into_iter().flatten().collect();
        expect.sort();
        assert_eq!(expect.len(), 4);

        // a fresh group reading the cache sees the same deletion set
        let read = run_ranks(2, |c| lite_rows(&read_cache(c, &name).files));
        let mut got: Vec<_> = read.into_iter().flatten().collect();
        got.sort();
        assert_eq!(got, expect);
    }

    #[test]
    fn unrecognized_version_leaves_inventory_empty() {
        let tmp = tempdir().unwrap();
        let name = tmp.path().join("bad.cache");
        std::fs::write(&name, 9u64.to_be_bytes()).unwrap();

        let out = run_ranks(2, |c| read_cache(c, &name).files.count);
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn missing_file_leaves_inventory_empty() {
        let tmp = tempdir().unwrap();
        let name = tmp.path().join("absent.cache");
        let out = run_ranks(2, |c| read_cache(c, &name).files.count);
        assert_eq!(out, vec![0, 0]);
    }
}
