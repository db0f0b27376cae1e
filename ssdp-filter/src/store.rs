use std::{
    collections::{HashMap, hash_map::DefaultHasher, hash_map::Entry},
    hash::{Hash, Hasher},
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::RwLock;

use ssdp_filter_common::{BlocklistEntry, BlocklistStore, CapacityExceeded, Hit};

use crate::{
    clock::monotonic_ns,
    control::{BlocklistControl, ControlError},
};

pub const BLOCKLIST_SHARDS: usize = 64;

struct EntryCell {
    hit_count: AtomicU64,
    first_seen: AtomicU64,
    last_seen: AtomicU64,
    blocked: AtomicBool,
}

impl EntryCell {
    fn from_entry(entry: BlocklistEntry) -> Self {
        Self {
            hit_count: AtomicU64::new(entry.hit_count),
            first_seen: AtomicU64::new(entry.first_seen),
            last_seen: AtomicU64::new(entry.last_seen),
            blocked: AtomicBool::new(entry.is_blocked()),
        }
    }

    fn touch(&self, now: u64) -> Hit {
        let hit_count = self.hit_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.last_seen.fetch_max(now, Ordering::Relaxed);
        Hit {
            blocked: self.blocked.load(Ordering::Acquire),
            created: false,
            hit_count,
        }
    }

    fn load(&self) -> BlocklistEntry {
        BlocklistEntry {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            first_seen: self.first_seen.load(Ordering::Relaxed),
            last_seen: self.last_seen.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Acquire) as u8,
            pad: [0; 7],
        }
    }
}

/// Fixed-capacity source-address table shared by every packet worker.
///
/// Hits on an existing source take a shard read lock and update atomics in
/// place, so workers never serialise on a hot key. Creating or evicting an
/// entry write-locks a single shard. The capacity bound is global and is
/// reserved before the shard is touched.
pub struct BlocklistTable {
    shards: Vec<RwLock<HashMap<u32, EntryCell>>>,
    capacity: usize,
    len: AtomicUsize,
}

impl BlocklistTable {
    pub fn new(capacity: usize) -> Self {
        let mut shards = Vec::with_capacity(BLOCKLIST_SHARDS);
        for _ in 0..BLOCKLIST_SHARDS {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: u32) -> &RwLock<HashMap<u32, EntryCell>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len().max(1)]
    }

    fn reserve_slot(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    fn get(&self, key: u32) -> Option<BlocklistEntry> {
        self.shard(key).read().get(&key).map(EntryCell::load)
    }
}

impl BlocklistStore for BlocklistTable {
    fn lookup(&self, src_addr: u32) -> Option<BlocklistEntry> {
        self.get(src_addr)
    }

    fn record_hit(&self, src_addr: u32, now: u64) -> Result<Hit, CapacityExceeded> {
        let shard = self.shard(src_addr);
        if let Some(cell) = shard.read().get(&src_addr) {
            return Ok(cell.touch(now));
        }

        if !self.reserve_slot() {
            // Full, but another worker may have created this key meanwhile.
            return shard
                .read()
                .get(&src_addr)
                .map(|cell| cell.touch(now))
                .ok_or(CapacityExceeded);
        }

        let mut guard = shard.write();
        match guard.entry(src_addr) {
            Entry::Occupied(occupied) => {
                self.release_slot();
                Ok(occupied.get().touch(now))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntryCell::from_entry(BlocklistEntry::first_hit(now)));
                Ok(Hit {
                    blocked: false,
                    created: true,
                    hit_count: 1,
                })
            }
        }
    }
}

impl BlocklistControl for BlocklistTable {
    fn insert_or_update(&self, addr: Ipv4Addr, blocked: bool) -> Result<(), ControlError> {
        let key = u32::from(addr);
        let shard = self.shard(key);
        if let Some(cell) = shard.read().get(&key) {
            cell.blocked.store(blocked, Ordering::Release);
            return Ok(());
        }

        if !self.reserve_slot() {
            return match shard.read().get(&key) {
                Some(cell) => {
                    cell.blocked.store(blocked, Ordering::Release);
                    Ok(())
                }
                None => Err(ControlError::CapacityExceeded),
            };
        }

        let mut guard = shard.write();
        match guard.entry(key) {
            Entry::Occupied(occupied) => {
                self.release_slot();
                occupied.get().blocked.store(blocked, Ordering::Release);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntryCell::from_entry(BlocklistEntry::seeded(
                    monotonic_ns(),
                    blocked,
                )));
            }
        }
        Ok(())
    }

    fn set_blocked(&self, addr: Ipv4Addr, blocked: bool) -> Result<bool, ControlError> {
        let key = u32::from(addr);
        Ok(match self.shard(key).read().get(&key) {
            Some(cell) => {
                cell.blocked.store(blocked, Ordering::Release);
                true
            }
            None => false,
        })
    }

    fn evict(&self, addr: Ipv4Addr) -> Result<bool, ControlError> {
        let key = u32::from(addr);
        let removed = self.shard(key).write().remove(&key).is_some();
        if removed {
            self.release_slot();
        }
        Ok(removed)
    }

    fn enumerate(&self) -> Result<Vec<(Ipv4Addr, BlocklistEntry)>, ControlError> {
        let mut entries = Vec::with_capacity(self.len.load(Ordering::Acquire));
        for shard in &self.shards {
            let guard = shard.read();
            entries.extend(
                guard
                    .iter()
                    .map(|(key, cell)| (Ipv4Addr::from(*key), cell.load())),
            );
        }
        Ok(entries)
    }

    fn len(&self) -> Result<usize, ControlError> {
        Ok(self.len.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    fn addr(n: u32) -> Ipv4Addr {
        Ipv4Addr::from(0x0a00_0000 + n)
    }

    #[test]
    fn first_hit_creates_then_increments() {
        let table = BlocklistTable::new(8);
        let key = u32::from(Ipv4Addr::new(10, 0, 0, 5));

        let hit = table.record_hit(key, 100).unwrap();
        assert!(hit.created);
        assert_eq!(hit.hit_count, 1);

        let hit = table.record_hit(key, 200).unwrap();
        assert!(!hit.created);
        assert_eq!(hit.hit_count, 2);

        let entry = table.lookup(key).unwrap();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.first_seen, 100);
        assert_eq!(entry.last_seen, 200);
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let table = BlocklistTable::new(3);
        for n in 0..3 {
            table.record_hit(u32::from(addr(n)), 1).unwrap();
        }
        assert_eq!(
            table.record_hit(u32::from(addr(99)), 2),
            Err(CapacityExceeded)
        );
        assert!(matches!(
            table.insert_or_update(addr(98), true),
            Err(ControlError::CapacityExceeded)
        ));
        assert_eq!(table.len().unwrap(), 3);

        // Existing keys keep updating while full.
        assert_eq!(table.record_hit(u32::from(addr(0)), 3).unwrap().hit_count, 2);
        table.insert_or_update(addr(1), true).unwrap();
        assert!(table.lookup(u32::from(addr(1))).unwrap().is_blocked());

        assert!(table.evict(addr(2)).unwrap());
        assert!(table.record_hit(u32::from(addr(99)), 4).unwrap().created);
    }

    #[test]
    fn enumerate_returns_each_entry_once() {
        let table = BlocklistTable::new(1024);
        for n in 0..500 {
            table.record_hit(u32::from(addr(n)), n as u64).unwrap();
        }
        let entries = table.enumerate().unwrap();
        assert_eq!(entries.len(), 500);
        let unique: HashSet<_> = entries.iter().map(|(a, _)| *a).collect();
        assert_eq!(unique.len(), 500);
        assert_eq!(table.len().unwrap(), 500);
    }

    #[test]
    fn control_operations() {
        let table = BlocklistTable::new(8);
        let a = Ipv4Addr::new(10, 0, 0, 5);

        assert!(!table.set_blocked(a, true).unwrap());
        assert!(!table.evict(a).unwrap());

        table.insert_or_update(a, true).unwrap();
        let entry = table.lookup(u32::from(a)).unwrap();
        assert!(entry.is_blocked());
        assert_eq!(entry.hit_count, 0);

        let hit = table.record_hit(u32::from(a), entry.last_seen + 1).unwrap();
        assert!(hit.blocked);
        assert!(!hit.created);
        assert_eq!(hit.hit_count, 1);

        assert!(table.set_blocked(a, false).unwrap());
        assert!(!table.lookup(u32::from(a)).unwrap().is_blocked());

        assert!(table.evict(a).unwrap());
        assert!(table.lookup(u32::from(a)).is_none());
        assert!(table.is_empty().unwrap());
    }

    #[test]
    fn evict_oldest_removes_least_recent() {
        let table = BlocklistTable::new(16);
        for n in 0..6u32 {
            table.record_hit(u32::from(addr(n)), 100 - n as u64).unwrap();
        }
        assert_eq!(table.evict_oldest(2).unwrap(), 2);
        assert!(table.lookup(u32::from(addr(5))).is_none());
        assert!(table.lookup(u32::from(addr(4))).is_none());
        assert!(table.lookup(u32::from(addr(0))).is_some());
        assert_eq!(table.len().unwrap(), 4);
    }

    #[test]
    fn concurrent_hits_lose_no_updates() {
        const THREADS: u64 = 8;
        const HITS: u64 = 10_000;

        let table = Arc::new(BlocklistTable::new(4));
        let key = u32::from(Ipv4Addr::new(10, 0, 0, 5));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    for i in 0..HITS {
                        table.record_hit(key, t * HITS + i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entry = table.lookup(key).unwrap();
        assert_eq!(entry.hit_count, THREADS * HITS);
        assert_eq!(table.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_inserts_respect_capacity() {
        let table = Arc::new(BlocklistTable::new(100));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    let mut rejected = 0;
                    for n in 0..100u32 {
                        if table.record_hit(u32::from(addr(t * 1000 + n)), 1).is_err() {
                            rejected += 1;
                        }
                    }
                    rejected
                })
            })
            .collect();
        let rejected: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(table.len().unwrap(), 100);
        assert_eq!(table.enumerate().unwrap().len(), 100);
        assert_eq!(rejected, 300);
    }
}
