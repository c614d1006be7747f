// remove.rs - Depth-ordered removal engine
//
// The engine owns the removal list and walks it one depth at a time,
// deepest first. Before any deletion, a top-down pass guarantees owner
// write+execute on every directory so children stay reachable. Within
// a depth, one of five redistribution strategies decides which rank
// deletes which item; a barrier separates depths. Deletion failures
// are logged and never abort the job.
use std::ffi::{CString, OsStr};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Instant;

use clap::ValueEnum;
use memchr::memchr;

use crate::comm::{Comm, Reduce, ROOT};
use crate::inventory::{FileType, InventoryMode, PackedBuffer, S_IFDIR, S_IFMT};
use crate::queue::WorkQueue;
use crate::util;

const S_IWUSR: u32 = 0o200;
const S_IRWXU: u32 = 0o700;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Each rank deletes the items it already holds.
    Direct,
    /// Evenly re-balance the depth's items across ranks.
    Spread,
    /// Route items by a hash of their parent directory, clustering
    /// siblings on one rank.
    Map,
    /// Globally sort items by path; neighboring paths share
    /// directories, so each rank touches few of them.
    Sort,
    /// Dynamic balancing through the work queue.
    Queue,
}

pub struct RemovalItem {
    pub path: Vec<u8>,
    pub depth: u64,
    pub ftype: FileType,
    pub mode: Option<u32>,
}

/// Build the removal list from the inventory. Stat inventories carry
/// the mode (directories recognized from it); lite inventories carry
/// the recorded type and no mode.
pub fn removal_items(files: &PackedBuffer) -> Vec<RemovalItem> {
    files
        .records()
        .map(|r| {
            let path = r.path().to_vec();
            let depth = util::depth(&path);
            match files.mode {
                InventoryMode::Stat => {
                    let mode = r.mode_bits();
                    let ftype = if mode & S_IFMT == S_IFDIR {
                        FileType::Dir
                    } else {
                        FileType::File
                    };
                    RemovalItem {
                        path,
                        depth,
                        ftype,
                        mode: Some(mode),
                    }
                }
                InventoryMode::Lite => RemovalItem {
                    path,
                    depth,
                    ftype: r.file_type(),
                    mode: None,
                },
            }
        })
        .collect()
}

pub struct RemovalEngine<'a, C: Comm> {
    comm: &'a C,
    queue: &'a WorkQueue,
    strategy: Strategy,
    verbose: bool,
    items: Vec<RemovalItem>,
}

impl<'a, C: Comm> RemovalEngine<'a, C> {
    pub fn new(
        comm: &'a C,
        queue: &'a WorkQueue,
        strategy: Strategy,
        verbose: bool,
        items: Vec<RemovalItem>,
    ) -> RemovalEngine<'a, C> {
        RemovalEngine {
            comm,
            queue,
            strategy,
            verbose,
            items,
        }
    }

    /// Delete everything on the list. Returns the number of items this
    /// rank removed.
    pub fn run(&self) -> u64 {
        let local = self.items.iter().map(|i| i.depth + 1).max().unwrap_or(0);
        let max_plus = self.comm.allreduce_u64(local, Reduce::Max);
        if max_plus == 0 {
            return 0;
        }
        let max_depth = max_plus - 1;

        self.prepare_permissions(max_depth);

        let mut total = 0;
        for depth in (0..=max_depth).rev() {
            let start = Instant::now();
            let count = self.remove_depth(depth);
            self.comm.barrier();
            let secs = start.elapsed().as_secs_f64();

            if self.verbose {
                let min = self.comm.allreduce_u64(count, Reduce::Min);
                let max = self.comm.allreduce_u64(count, Reduce::Max);
                let sum = self.comm.allreduce_u64(count, Reduce::Sum);
                let rate = if secs > 0.0 { sum as f64 / secs } else { 0.0 };
                if self.comm.rank() == ROOT {
                    println!(
                        "level={} min={} max={} sum={} rate={:.6} secs={:.6}",
                        depth, min, max, sum, rate, secs
                    );
                }
            }
            total += count;
        }
        total
    }

    /// Top-down, set rwx------ on every directory whose mode is unknown
    /// or lacks owner write, so deeper items stay removable. Errors are
    /// logged and ignored; a barrier closes each level.
    pub fn prepare_permissions(&self, max_depth: u64) {
        for depth in 0..=max_depth {
            for item in self.at_depth(depth) {
                if item.ftype != FileType::Dir {
                    continue;
                }
                let writable = item.mode.is_some_and(|m| m & S_IWUSR != 0);
                if !writable {
                    let p = bytes_path(&item.path);
                    let perms = fs::Permissions::from_mode(S_IRWXU);
                    if let Err(e) = fs::set_permissions(p, perms) {
                        eprintln!("Failed to chmod directory `{}': {}", p.display(), e);
                    }
                }
            }
            self.comm.barrier();
        }
    }

    fn at_depth(&self, depth: u64) -> impl Iterator<Item = &RemovalItem> {
        self.items.iter().filter(move |i| i.depth == depth)
    }

    fn remove_depth(&self, depth: u64) -> u64 {
        match self.strategy {
            Strategy::Direct => self.remove_direct(depth),
            Strategy::Spread => self.remove_spread(depth),
            Strategy::Map => self.remove_map(depth),
            Strategy::Sort => self.remove_sort(depth),
            Strategy::Queue => self.remove_queue(depth),
        }
    }

    fn remove_direct(&self, depth: u64) -> u64 {
        let mut count = 0;
        for item in self.at_depth(depth) {
            remove_item(item.ftype.tag(), &item.path);
            count += 1;
        }
        count
    }

    /// Even re-balance: rank i becomes responsible for a contiguous run
    /// of the globally ordered (rank, list-order) item sequence.
    fn remove_spread(&self, depth: u64) -> u64 {
        let ranks = self.comm.ranks();
        let my: Vec<&RemovalItem> = self.at_depth(depth).collect();
        let my_count = my.len() as u64;
        let all_count = self.comm.allreduce_u64(my_count, Reduce::Sum);
        let offset = self.comm.exscan_sum(my_count);

        let counts = spread_counts(all_count, ranks as u64, my_count, offset);
        let mut bufs = vec![Vec::new(); ranks];
        let mut it = my.into_iter();
        for (dest, &cnt) in counts.iter().enumerate() {
            for _ in 0..cnt {
                let item = it.next().expect("spread counts cover the local items");
                push_tagged(&mut bufs[dest], item);
            }
        }

        let recv = self.comm.alltoallv(bufs);
        recv.iter().map(|buf| delete_tagged(buf)).sum()
    }

    /// Hash routing: all items sharing a parent directory land on the
    /// same rank.
    fn remove_map(&self, depth: u64) -> u64 {
        let ranks = self.comm.ranks();
        let mut bufs = vec![Vec::new(); ranks];
        for item in self.at_depth(depth) {
            push_tagged(&mut bufs[map_rank(&item.path, ranks)], item);
        }
        let recv = self.comm.alltoallv(bufs);
        recv.iter().map(|buf| delete_tagged(buf)).sum()
    }

    /// Sample sort by path: local sort, splitters from gathered regular
    /// samples, alltoallv, then each rank deletes its ordered slice.
    fn remove_sort(&self, depth: u64) -> u64 {
        let mut my: Vec<(&[u8], u8)> = self
            .at_depth(depth)
            .map(|i| (i.path.as_slice(), i.ftype.tag()))
            .collect();
        let all_count = self.comm.allreduce_u64(my.len() as u64, Reduce::Sum);
        if all_count == 0 {
            return 0;
        }
        my.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let ranks = self.comm.ranks();
        if ranks == 1 {
            let mut count = 0;
            for (path, tag) in &my {
                remove_item(*tag, path);
                count += 1;
            }
            return count;
        }

        let mut samples = Vec::new();
        if !my.is_empty() {
            for k in 1..ranks {
                let idx = (k * my.len()) / ranks;
                samples.push(my[idx.min(my.len() - 1)].0);
            }
        }
        let gathered = self.comm.gather(ROOT, frame(&samples));
        let mut splitters_msg = if self.comm.rank() == ROOT {
            let mut all: Vec<Vec<u8>> = gathered.iter().flat_map(|b| unframe(b)).collect();
            all.sort_unstable();
            let splitters: Vec<&[u8]> = (1..ranks)
                .map(|k| all[(k * all.len()) / ranks].as_slice())
                .collect();
            frame(&splitters)
        } else {
            Vec::new()
        };
        self.comm.broadcast(ROOT, &mut splitters_msg);
        let splitters = unframe(&splitters_msg);

        let mut bufs = vec![Vec::new(); ranks];
        for (path, tag) in &my {
            let dest = splitters.partition_point(|s| s.as_slice() <= *path);
            bufs[dest].push(*tag);
            bufs[dest].extend_from_slice(path);
            bufs[dest].push(0);
        }
        let recv = self.comm.alltoallv(bufs);

        let mut mine: Vec<(Vec<u8>, u8)> = recv.iter().flat_map(|b| parse_tagged(b)).collect();
        mine.sort_unstable();
        let mut count = 0;
        for (path, tag) in &mine {
            remove_item(*tag, path);
            count += 1;
        }
        count
    }

    /// Dynamic balancing: tagged items go through the shared work
    /// queue, idle ranks pull from busy ones.
    fn remove_queue(&self, depth: u64) -> u64 {
        for item in self.at_depth(depth) {
            let mut msg = Vec::with_capacity(item.path.len() + 1);
            msg.push(item.ftype.tag());
            msg.extend_from_slice(&item.path);
            self.queue.enqueue(msg);
        }
        self.comm.barrier();
        let mut count = 0;
        self.queue.drain(|item, _| {
            remove_item(item[0], &item[1..]);
            count += 1;
        });
        count
    }
}

/// Per-destination item counts for the spread strategy: rank i is
/// responsible for `low+1` items if i < extra else `low`, taken from
/// the global sequence at this rank's exscan offset.
fn spread_counts(all_count: u64, ranks: u64, my_count: u64, offset: u64) -> Vec<u64> {
    let low = all_count / ranks;
    let extra = all_count - low * ranks;
    let mut counts = vec![0u64; ranks as usize];
    for i in 0..ranks {
        let (start, num) = if i < extra {
            (i * (low + 1), low + 1)
        } else {
            ((i - extra) * low + extra * (low + 1), low)
        };
        let mut cnt = 0;
        if my_count > 0 {
            if start <= offset && offset < start + num {
                cnt = (num - (offset - start)).min(my_count);
            } else if offset < start && start < offset + my_count {
                cnt = (my_count - (start - offset)).min(num);
            }
        }
        counts[i as usize] = cnt;
    }
    counts
}

/// Bob Jenkins one-at-a-time hash.
pub fn jenkins_one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in key {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Destination rank for the map strategy: depends only on the parent
/// directory and the group size.
pub fn map_rank(path: &[u8], ranks: usize) -> usize {
    (jenkins_one_at_a_time(util::dirname(path)) % ranks as u32) as usize
}

fn bytes_path(path: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(path))
}

fn push_tagged(buf: &mut Vec<u8>, item: &RemovalItem) {
    buf.push(item.ftype.tag());
    buf.extend_from_slice(&item.path);
    buf.push(0);
}

/// Delete every item in a tagged payload: a 1-byte type tag followed
/// by a NUL-terminated path, repeated.
fn delete_tagged(buf: &[u8]) -> u64 {
    let mut count = 0;
    let mut pos = 0;
    while pos < buf.len() {
        let tag = buf[pos];
        let end = memchr(0, &buf[pos + 1..])
            .map(|i| pos + 1 + i)
            .unwrap_or(buf.len());
        remove_item(tag, &buf[pos + 1..end]);
        count += 1;
        pos = end + 1;
    }
    count
}

fn parse_tagged(buf: &[u8]) -> Vec<(Vec<u8>, u8)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let tag = buf[pos];
        let end = memchr(0, &buf[pos + 1..])
            .map(|i| pos + 1 + i)
            .unwrap_or(buf.len());
        out.push((buf[pos + 1..end].to_vec(), tag));
        pos = end + 1;
    }
    out
}

/// The tag selects the syscall: rmdir for `d`, unlink for `f`, the
/// OS-native remove for `u`. Failures are logged with the errno text.
pub fn remove_item(tag: u8, path: &[u8]) {
    let p = bytes_path(path);
    let res = match tag {
        b'd' => fs::remove_dir(p),
        b'f' => fs::remove_file(p),
        b'u' => remove_native(path),
        other => {
            eprintln!("Unknown removal tag `{}' for `{}'", other as char, p.display());
            return;
        }
    };
    if let Err(e) = res {
        let op = match tag {
            b'd' => "rmdir",
            b'f' => "unlink",
            _ => "remove",
        };
        eprintln!("Failed to {} `{}': {}", op, p.display(), e);
    }
}

fn remove_native(path: &[u8]) -> io::Result<()> {
    let c = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    if unsafe { libc::remove(c.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fallback framing for sort-internal messages: count-prefixed,
/// length-prefixed byte strings.
fn frame(list: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(list.len() as u32).to_be_bytes());
    for item in list {
        out.extend_from_slice(&(item.len() as u32).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

fn unframe(buf: &[u8]) -> Vec<Vec<u8>> {
    if buf.len() < 4 {
        return Vec::new();
    }
    let count = crate::inventory::be_u32(buf) as usize;
    let mut out = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let len = crate::inventory::be_u32(&buf[pos..]) as usize;
        pos += 4;
        out.push(buf[pos..pos + len].to_vec());
        pos += len;
    }
    out
}
