// ids.rs - User and group name/id tables
//
// Rank 0 enumerates the host account database once; everyone else gets
// the packed table by broadcast and builds identical maps. Lookups of
// ids with no entry return the decimal rendering of the id and cache
// it, so repeated misses are map hits.
use std::collections::HashMap;
use std::ffi::CStr;
use std::io;

use memchr::memchr;

use crate::comm::{Comm, ROOT};
use crate::inventory::be_u32;

#[derive(Default)]
pub struct IdTable {
    pub count: u64,
    pub chars: u64,
    pub buf: Vec<u8>,
    name_to_id: HashMap<String, u32>,
    id_to_name: HashMap<u32, String>,
}

impl IdTable {
    /// Pack `(name, id)` pairs into the fixed-width table. The name
    /// width is the longest name + 1 rounded up to a multiple of 4.
    pub fn from_entries(entries: &[(String, u32)]) -> IdTable {
        let mut chars = 0u64;
        for (name, _) in entries {
            let len = name.len() as u64 + 1;
            if len > chars {
                chars = len.div_ceil(4) * 4;
            }
        }
        let rs = chars as usize + 4;
        let mut buf = vec![0u8; entries.len() * rs];
        for (i, (name, id)) in entries.iter().enumerate() {
            let dst = &mut buf[i * rs..(i + 1) * rs];
            dst[..name.len()].copy_from_slice(name.as_bytes());
            dst[chars as usize..].copy_from_slice(&id.to_be_bytes());
        }
        IdTable::from_packed(entries.len() as u64, chars, buf)
    }

    /// Rebuild the two-way maps from a packed table, as received from a
    /// broadcast or a cache file.
    pub fn from_packed(count: u64, chars: u64, buf: Vec<u8>) -> IdTable {
        let mut name_to_id = HashMap::new();
        let mut id_to_name = HashMap::new();
        let rs = chars as usize + 4;
        for i in 0..count as usize {
            let rec = &buf[i * rs..(i + 1) * rs];
            let padded = &rec[..chars as usize];
            let name = match memchr(0, padded) {
                Some(n) => &padded[..n],
                None => padded,
            };
            let name = String::from_utf8_lossy(name).into_owned();
            let id = be_u32(&rec[chars as usize..]);
            name_to_id.insert(name.clone(), id);
            id_to_name.insert(id, name);
        }
        IdTable {
            count,
            chars,
            buf,
            name_to_id,
            id_to_name,
        }
    }

    /// Name for an id; unknown ids resolve to their decimal rendering,
    /// inserted into the map so the next miss is a hit.
    pub fn name_from_id(&mut self, id: u32) -> &str {
        self.id_to_name
            .entry(id)
            .or_insert_with(|| itoa::Buffer::new().format(id).to_string())
    }

    pub fn id_from_name(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).copied()
    }

    pub fn known_ids(&self) -> usize {
        self.id_to_name.len()
    }
}

/// Rank 0's table, broadcast to everyone.
fn broadcast_table<C: Comm>(comm: &C, entries: Option<Vec<(String, u32)>>) -> IdTable {
    if comm.rank() == ROOT {
        let table = IdTable::from_entries(&entries.unwrap_or_default());
        let mut msg = Vec::with_capacity(16 + table.buf.len());
        msg.extend_from_slice(&table.count.to_be_bytes());
        msg.extend_from_slice(&table.chars.to_be_bytes());
        msg.extend_from_slice(&table.buf);
        comm.broadcast(ROOT, &mut msg);
        table
    } else {
        let mut msg = Vec::new();
        comm.broadcast(ROOT, &mut msg);
        let count = crate::inventory::be_u64(&msg[..8]);
        let chars = crate::inventory::be_u64(&msg[8..16]);
        IdTable::from_packed(count, chars, msg[16..].to_vec())
    }
}

pub fn get_users<C: Comm>(comm: &C) -> IdTable {
    let entries = (comm.rank() == ROOT).then(enumerate_users);
    broadcast_table(comm, entries)
}

pub fn get_groups<C: Comm>(comm: &C) -> IdTable {
    let entries = (comm.rank() == ROOT).then(enumerate_groups);
    broadcast_table(comm, entries)
}

/// Walk the passwd database. Enumeration can fail transiently, so a
/// NULL with EIO or EINTR is retried up to three times before being
/// treated as the end of the list.
fn enumerate_users() -> Vec<(String, u32)> {
    let mut out = Vec::new();
    unsafe {
        libc::setpwent();
        let mut retries = 3;
        loop {
            let p = libc::getpwent();
            if p.is_null() {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                retries -= 1;
                if (errno == libc::EIO || errno == libc::EINTR) && retries > 0 {
                    continue;
                }
                break;
            }
            retries = 3;
            let name = CStr::from_ptr((*p).pw_name).to_string_lossy().into_owned();
            out.push((name, (*p).pw_uid));
        }
        libc::endpwent();
    }
    out
}

fn enumerate_groups() -> Vec<(String, u32)> {
    let mut out = Vec::new();
    unsafe {
        libc::setgrent();
        let mut retries = 3;
        loop {
            let g = libc::getgrent();
            if g.is_null() {
                let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                retries -= 1;
                if (errno == libc::EIO || errno == libc::EINTR) && retries > 0 {
                    continue;
                }
                break;
            }
            retries = 3;
            let name = CStr::from_ptr((*g).gr_name).to_string_lossy().into_owned();
            out.push((name, (*g).gr_gid));
        }
        libc::endgrent();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_ranks;

    fn entries() -> Vec<(String, u32)> {
        vec![
            ("root".to_string(), 0),
            ("daemon".to_string(), 1),
            ("somebody".to_string(), 1000),
        ]
    }

    #[test]
    fn chars_is_a_multiple_of_four() {
        let t = IdTable::from_entries(&entries());
        // "somebody" is 8 bytes, +1 for NUL, rounded up to 12.
        assert_eq!(t.chars, 12);
        assert_eq!(t.count, 3);
        assert_eq!(t.buf.len(), 3 * (12 + 4));
    }

    #[test]
    fn two_way_maps_agree() {
        let mut t = IdTable::from_entries(&entries());
        assert_eq!(t.name_from_id(0), "root");
        assert_eq!(t.name_from_id(1000), "somebody");
        assert_eq!(t.id_from_name("daemon"), Some(1));
        assert_eq!(t.id_from_name("nobody"), None);
    }

    #[test]
    fn unknown_id_falls_back_to_decimal_and_memoizes() {
        let mut t = IdTable::from_entries(&entries());
        let before = t.known_ids();
        assert_eq!(t.name_from_id(4242), "4242");
        assert_eq!(t.known_ids(), before + 1);
        // second lookup is a map hit, not a new insert
        assert_eq!(t.name_from_id(4242), "4242");
        assert_eq!(t.known_ids(), before + 1);
    }

    #[test]
    fn packed_round_trip_preserves_maps() {
        let t = IdTable::from_entries(&entries());
        let mut back = IdTable::from_packed(t.count, t.chars, t.buf.clone());
        assert_eq!(back.name_from_id(1), "daemon");
        assert_eq!(back.id_from_name("root"), Some(0));
    }

    #[test]
    fn broadcast_builds_identical_tables() {
        let out = run_ranks(3, |c| {
            let e = (c.rank() == 0).then(entries);
            let mut t = broadcast_table(c, e);
            (t.count, t.chars, t.name_from_id(1000).to_string())
        });
        for (count, chars, name) in out {
            assert_eq!(count, 3);
            assert_eq!(chars, 12);
            assert_eq!(name, "somebody");
        }
    }

    #[test]
    fn local_user_enumeration_finds_root() {
        let users = enumerate_users();
        assert!(users.iter().any(|(_, id)| *id == 0));
    }
}
