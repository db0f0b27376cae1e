//! Control-plane access to a blocklist.
//!
//! `BlocklistControl` is the only way entries get blocked, unblocked or
//! evicted. The packet path only ever bumps counters. Two backends exist: the
//! in-process `BlocklistTable` and `PinnedBlocklist`, which talks to the
//! kernel map pinned by `attach`.

use std::{
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use aya::maps::{HashMap as AyaHashMap, Map, MapData, MapError};
use parking_lot::Mutex;
use thiserror::Error;

use ssdp_filter_common::BlocklistEntry;

use crate::clock::monotonic_ns;

const BPF_EXIST: u64 = 2;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("blocklist is full")]
    CapacityExceeded,
    #[error("failed to open pinned map at {}", path.display())]
    Pin {
        path: PathBuf,
        #[source]
        source: MapError,
    },
    #[error("map {0} not found")]
    MissingMap(&'static str),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub trait BlocklistControl {
    /// Create `addr` with the given state, or overwrite the state of an
    /// existing entry. Fails with `CapacityExceeded` when the table is full.
    fn insert_or_update(&self, addr: Ipv4Addr, blocked: bool) -> Result<(), ControlError>;

    /// Returns `false` when `addr` has no entry; nothing is created.
    fn set_blocked(&self, addr: Ipv4Addr, blocked: bool) -> Result<bool, ControlError>;

    fn evict(&self, addr: Ipv4Addr) -> Result<bool, ControlError>;

    fn enumerate(&self) -> Result<Vec<(Ipv4Addr, BlocklistEntry)>, ControlError>;

    fn len(&self) -> Result<usize, ControlError>;

    fn is_empty(&self) -> Result<bool, ControlError> {
        Ok(self.len()? == 0)
    }

    /// Evict up to `count` entries, least recently seen first.
    fn evict_oldest(&self, count: usize) -> Result<usize, ControlError> {
        if count == 0 {
            return Ok(0);
        }
        let mut entries = self.enumerate()?;
        entries.sort_by_key(|(addr, entry)| (entry.last_seen, u32::from(*addr)));
        let mut evicted = 0;
        for (addr, _) in entries.into_iter().take(count) {
            if self.evict(addr)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

/// Blocklist map pinned in bpffs by a running `attach`.
///
/// Updates of an existing entry are read-modify-write through the syscall
/// interface: hot-path increments that land between the read and the write
/// are overwritten.
pub struct PinnedBlocklist {
    map: Mutex<AyaHashMap<MapData, u32, BlocklistEntry>>,
}

impl PinnedBlocklist {
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let data = MapData::from_pin(path).map_err(|source| ControlError::Pin {
            path: path.to_path_buf(),
            source,
        })?;
        let map = AyaHashMap::try_from(Map::HashMap(data))?;
        Ok(Self {
            map: Mutex::new(map),
        })
    }

    fn get(
        map: &AyaHashMap<MapData, u32, BlocklistEntry>,
        key: u32,
    ) -> Result<Option<BlocklistEntry>, ControlError> {
        match map.get(&key, 0) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl BlocklistControl for PinnedBlocklist {
    fn insert_or_update(&self, addr: Ipv4Addr, blocked: bool) -> Result<(), ControlError> {
        let key = u32::from(addr);
        let mut map = self.map.lock();
        let entry = match Self::get(&map, key)? {
            Some(mut entry) => {
                entry.blocked = blocked as u8;
                entry
            }
            None => BlocklistEntry::seeded(monotonic_ns(), blocked),
        };
        map.insert(key, entry, 0).map_err(capacity_or_map)
    }

    fn set_blocked(&self, addr: Ipv4Addr, blocked: bool) -> Result<bool, ControlError> {
        let key = u32::from(addr);
        let mut map = self.map.lock();
        let Some(mut entry) = Self::get(&map, key)? else {
            return Ok(false);
        };
        entry.blocked = blocked as u8;
        // BPF_EXIST: an entry evicted meanwhile stays evicted.
        match map.insert(key, entry, BPF_EXIST) {
            Ok(()) => Ok(true),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn evict(&self, addr: Ipv4Addr) -> Result<bool, ControlError> {
        let mut map = self.map.lock();
        match map.remove(&u32::from(addr)) {
            Ok(()) => Ok(true),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn enumerate(&self) -> Result<Vec<(Ipv4Addr, BlocklistEntry)>, ControlError> {
        let map = self.map.lock();
        let mut entries = Vec::new();
        for item in map.iter() {
            match item {
                Ok((key, entry)) => entries.push((Ipv4Addr::from(key), entry)),
                // Deleted between key iteration and lookup.
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(entries)
    }

    fn len(&self) -> Result<usize, ControlError> {
        let map = self.map.lock();
        let mut count = 0;
        for key in map.keys() {
            key?;
            count += 1;
        }
        Ok(count)
    }
}

fn is_missing(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(err) => err.io_error.raw_os_error() == Some(libc::ENOENT),
        _ => false,
    }
}

fn capacity_or_map(err: MapError) -> ControlError {
    match &err {
        MapError::SyscallError(sys) if sys.io_error.raw_os_error() == Some(libc::E2BIG) => {
            ControlError::CapacityExceeded
        }
        _ => ControlError::Map(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::cell::RefCell;

    struct Recorded {
        entries: RefCell<HashMap<Ipv4Addr, BlocklistEntry>>,
    }

    impl BlocklistControl for Recorded {
        fn insert_or_update(&self, addr: Ipv4Addr, blocked: bool) -> Result<(), ControlError> {
            self.entries
                .borrow_mut()
                .insert(addr, BlocklistEntry::seeded(0, blocked));
            Ok(())
        }

        fn set_blocked(&self, addr: Ipv4Addr, blocked: bool) -> Result<bool, ControlError> {
            Ok(match self.entries.borrow_mut().get_mut(&addr) {
                Some(entry) => {
                    entry.blocked = blocked as u8;
                    true
                }
                None => false,
            })
        }

        fn evict(&self, addr: Ipv4Addr) -> Result<bool, ControlError> {
            Ok(self.entries.borrow_mut().remove(&addr).is_some())
        }

        fn enumerate(&self) -> Result<Vec<(Ipv4Addr, BlocklistEntry)>, ControlError> {
            Ok(self.entries.borrow().iter().map(|(a, e)| (*a, *e)).collect())
        }

        fn len(&self) -> Result<usize, ControlError> {
            Ok(self.entries.borrow().len())
        }
    }

    #[test]
    fn default_evict_oldest_uses_last_seen() {
        let table = Recorded {
            entries: RefCell::new(HashMap::new()),
        };
        for (octet, last_seen) in [(1u8, 30u64), (2, 10), (3, 20), (4, 40)] {
            let mut entry = BlocklistEntry::first_hit(0);
            entry.last_seen = last_seen;
            table
                .entries
                .borrow_mut()
                .insert(Ipv4Addr::new(10, 0, 0, octet), entry);
        }

        assert_eq!(table.evict_oldest(2).unwrap(), 2);
        let mut left: Vec<_> = table.entries.borrow().keys().copied().collect();
        left.sort();
        assert_eq!(
            left,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 4)]
        );

        assert_eq!(table.evict_oldest(0).unwrap(), 0);
        assert_eq!(table.evict_oldest(10).unwrap(), 2);
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn opening_a_missing_pin_names_the_path() {
        let path = Path::new("/nonexistent/ssdp_filter_test/ssdp_blocklist");
        match PinnedBlocklist::open(path) {
            Err(ControlError::Pin { path: failed, .. }) => assert_eq!(failed, path),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("opened a pin that does not exist"),
        }
    }

    #[test]
    fn missing_key_errors_are_recognised() {
        assert!(is_missing(&MapError::KeyNotFound));
        assert!(!is_missing(&MapError::InvalidName {
            name: "x".to_string()
        }));
        assert!(matches!(
            capacity_or_map(MapError::KeyNotFound),
            ControlError::Map(MapError::KeyNotFound)
        ));
    }
}
