// inventory.rs - File records and the packed inventory buffer
//
// The packed layout is the same in memory and on disk: each record is
// the NUL-padded path in `chars` bytes followed by a fixed big-endian
// trailer. `chars` is agreed globally, so buffers from different ranks
// concatenate into one array.
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use chrono::{Local, TimeZone};
use memchr::memchr;

use crate::comm::{Comm, Reduce};
use crate::ids::IdTable;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Null,
    Unknown,
    File,
    Dir,
    Link,
}

impl FileType {
    pub fn as_u32(self) -> u32 {
        match self {
            FileType::Null => 0,
            FileType::Unknown => 1,
            FileType::File => 2,
            FileType::Dir => 3,
            FileType::Link => 4,
        }
    }

    pub fn from_u32(v: u32) -> FileType {
        match v {
            0 => FileType::Null,
            2 => FileType::File,
            3 => FileType::Dir,
            4 => FileType::Link,
            _ => FileType::Unknown,
        }
    }

    pub fn from_mode(mode: u32) -> FileType {
        match mode & S_IFMT {
            S_IFDIR => FileType::Dir,
            S_IFREG => FileType::File,
            S_IFLNK => FileType::Link,
            _ => FileType::Unknown,
        }
    }

    pub fn from_fs(ft: fs::FileType) -> FileType {
        if ft.is_dir() {
            FileType::Dir
        } else if ft.is_file() {
            FileType::File
        } else if ft.is_symlink() {
            FileType::Link
        } else {
            FileType::Unknown
        }
    }

    /// Tag byte selecting the deletion syscall: rmdir for directories,
    /// unlink for files and links, the generic remove otherwise.
    pub fn tag(self) -> u8 {
        match self {
            FileType::Dir => b'd',
            FileType::File | FileType::Link => b'f',
            _ => b'u',
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

impl FileStat {
    pub fn from_metadata(md: &fs::Metadata) -> FileStat {
        FileStat {
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            atime: md.atime(),
            mtime: md.mtime(),
            ctime: md.ctime(),
            size: md.size(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    pub ftype: FileType,
    pub st: Option<FileStat>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InventoryMode {
    Lite,
    Stat,
}

impl InventoryMode {
    /// Fixed-width trailer after the padded path: the type word in lite
    /// mode; mode, uid, gid, three 32-bit times, and the size in stat
    /// mode.
    pub fn trailer_size(self) -> usize {
        match self {
            InventoryMode::Lite => 4,
            InventoryMode::Stat => 6 * 4 + 8,
        }
    }
}

pub struct PackedBuffer {
    pub mode: InventoryMode,
    pub chars: u64,
    pub count: u64,
    pub buf: Vec<u8>,
}

impl PackedBuffer {
    pub fn empty(mode: InventoryMode) -> PackedBuffer {
        PackedBuffer {
            mode,
            chars: 0,
            count: 0,
            buf: Vec::new(),
        }
    }

    /// Serialize the per-rank record list. The filename width is the
    /// global maximum of local name length + 1, rounded up to a
    /// multiple of 8 and agreed by allreduce, so it is identical on
    /// every rank. A globally empty walk yields an empty buffer.
    pub fn from_records<C: Comm>(
        comm: &C,
        records: Vec<FileRecord>,
        mode: InventoryMode,
    ) -> PackedBuffer {
        let mut max = 0u64;
        for r in &records {
            let len = r.path.as_os_str().len() as u64 + 1;
            if len > max {
                max = len;
            }
        }
        let chars = comm.allreduce_u64(max.div_ceil(8) * 8, Reduce::Max);
        if chars == 0 {
            return PackedBuffer::empty(mode);
        }

        let rs = chars as usize + mode.trailer_size();
        let mut buf = vec![0u8; records.len() * rs];
        for (i, r) in records.iter().enumerate() {
            let dst = &mut buf[i * rs..(i + 1) * rs];
            let path = r.path.as_os_str().as_bytes();
            dst[..path.len()].copy_from_slice(path);
            let c = chars as usize;
            match mode {
                InventoryMode::Lite => {
                    dst[c..c + 4].copy_from_slice(&r.ftype.as_u32().to_be_bytes());
                }
                InventoryMode::Stat => {
                    let st = r.st.clone().unwrap_or_default();
                    dst[c..c + 4].copy_from_slice(&st.mode.to_be_bytes());
                    dst[c + 4..c + 8].copy_from_slice(&st.uid.to_be_bytes());
                    dst[c + 8..c + 12].copy_from_slice(&st.gid.to_be_bytes());
                    dst[c + 12..c + 16].copy_from_slice(&(st.atime as u32).to_be_bytes());
                    dst[c + 16..c + 20].copy_from_slice(&(st.mtime as u32).to_be_bytes());
                    dst[c + 20..c + 24].copy_from_slice(&(st.ctime as u32).to_be_bytes());
                    dst[c + 24..c + 32].copy_from_slice(&st.size.to_be_bytes());
                }
            }
        }
        PackedBuffer {
            mode,
            chars,
            count: records.len() as u64,
            buf,
        }
    }

    pub fn record_size(&self) -> usize {
        self.chars as usize + self.mode.trailer_size()
    }

    pub fn record(&self, i: usize) -> Record<'_> {
        let rs = self.record_size();
        Record {
            data: &self.buf[i * rs..(i + 1) * rs],
            chars: self.chars as usize,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        (0..self.count as usize).map(move |i| self.record(i))
    }
}

/// View of one packed record.
pub struct Record<'a> {
    data: &'a [u8],
    chars: usize,
}

impl Record<'_> {
    pub fn path(&self) -> &[u8] {
        let padded = &self.data[..self.chars];
        match memchr(0, padded) {
            Some(n) => &padded[..n],
            None => padded,
        }
    }

    // lite trailer
    pub fn file_type(&self) -> FileType {
        FileType::from_u32(be_u32(&self.data[self.chars..]))
    }

    // stat trailer
    pub fn mode_bits(&self) -> u32 {
        be_u32(&self.data[self.chars..])
    }
    pub fn uid(&self) -> u32 {
        be_u32(&self.data[self.chars + 4..])
    }
    pub fn gid(&self) -> u32 {
        be_u32(&self.data[self.chars + 8..])
    }
    pub fn atime(&self) -> u32 {
        be_u32(&self.data[self.chars + 12..])
    }
    pub fn mtime(&self) -> u32 {
        be_u32(&self.data[self.chars + 16..])
    }
    pub fn ctime(&self) -> u32 {
        be_u32(&self.data[self.chars + 20..])
    }
    pub fn size(&self) -> u64 {
        be_u64(&self.data[self.chars + 24..])
    }
}

pub fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Dump the first and last ten records this rank holds, resolving ids
/// to names through the tables (unknown ids fall back to their decimal
/// rendering and stay cached).
pub fn print_records(
    rank: usize,
    files: &PackedBuffer,
    users: &mut IdTable,
    groups: &mut IdTable,
) {
    let count = files.count as usize;
    for i in 0..count {
        if i >= 10 && count - i > 10 {
            if i == 10 {
                println!("<snip>");
            }
            continue;
        }
        let rec = files.record(i);
        let path = String::from_utf8_lossy(rec.path()).into_owned();
        match files.mode {
            InventoryMode::Stat => {
                let uid = rec.uid();
                let gid = rec.gid();
                let user = users.name_from_id(uid).to_string();
                let group = groups.name_from_id(gid).to_string();
                println!(
                    "Rank {}: Mode={:o} UID={}({}) GID={}({}) Access={} Modify={} Create={} Size={} File={}",
                    rank,
                    rec.mode_bits(),
                    uid,
                    user,
                    gid,
                    group,
                    format_epoch(rec.atime()),
                    format_epoch(rec.mtime()),
                    format_epoch(rec.ctime()),
                    rec.size(),
                    path
                );
            }
            InventoryMode::Lite => {
                println!(
                    "Rank {}: Type={} File={}",
                    rank,
                    rec.file_type().as_u32(),
                    path
                );
            }
        }
    }
}

fn format_epoch(ts: u32) -> String {
    match Local.timestamp_opt(ts as i64, 0).single() {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => String::new(),
    }
}
