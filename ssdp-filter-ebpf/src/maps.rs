// Kernel maps backing the hot-path traits.
//
// ssdp_blocklist  HashMap<u32, BlocklistEntry>   source IPv4 (host order) -> entry
// ssdp_stats      PerCpuArray<u64>               one slot per StatCounter
// ssdp_features   RingBuf                        FeatureRecord stream
// ssdp_config     Array<FilterConfig>            slot 0: runtime knobs
//
// The blocklist is a plain hash map, not an LRU: a full table must reject new
// sources instead of silently evicting tracked ones.

use core::{
    ptr::{addr_of_mut, read_volatile, write_volatile},
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    macros::map,
    maps::{Array, HashMap, PerCpuArray, RingBuf},
};
use ssdp_filter_common::{
    BlocklistEntry, BlocklistStore, CONFIG_SLOT_RUNTIME, CapacityExceeded,
    DEFAULT_BLOCKLIST_CAPACITY, DEFAULT_FEATURE_RING_BYTES, ExportFull, FeatureRecord,
    FeatureSink, FilterConfig, Hit, STAT_COUNT, StatCounter, StatsSink,
};

#[map(name = "ssdp_blocklist")]
static SSDP_BLOCKLIST: HashMap<u32, BlocklistEntry> =
    HashMap::<u32, BlocklistEntry>::with_max_entries(DEFAULT_BLOCKLIST_CAPACITY, 0);

#[map(name = "ssdp_stats")]
static SSDP_STATS: PerCpuArray<u64> = PerCpuArray::<u64>::with_max_entries(STAT_COUNT as u32, 0);

#[map(name = "ssdp_features")]
static SSDP_FEATURES: RingBuf = RingBuf::with_byte_size(DEFAULT_FEATURE_RING_BYTES, 0);

#[map(name = "ssdp_config")]
static SSDP_CONFIG: Array<FilterConfig> = Array::<FilterConfig>::with_max_entries(1, 0);

/// Config block written by the loader; zeroed (defaults) until then.
#[inline(always)]
pub fn filter_config() -> FilterConfig {
    match SSDP_CONFIG.get(CONFIG_SLOT_RUNTIME) {
        Some(cfg) => *cfg,
        None => FilterConfig::default(),
    }
}

pub struct KernelBlocklist;

impl KernelBlocklist {
    // In-place update of an existing entry. The hit counter is bumped with an
    // atomic add so concurrent CPUs hitting the same key never lose counts.
    #[inline(always)]
    fn bump(src_addr: u32, now: u64) -> Option<Hit> {
        let ptr = SSDP_BLOCKLIST.get_ptr_mut(&src_addr)?;
        unsafe {
            AtomicU64::from_ptr(addr_of_mut!((*ptr).hit_count)).fetch_add(1, Ordering::Relaxed);
            write_volatile(addr_of_mut!((*ptr).last_seen), now);
            Some(Hit {
                blocked: read_volatile(addr_of_mut!((*ptr).blocked)) != 0,
                created: false,
                hit_count: read_volatile(addr_of_mut!((*ptr).hit_count)),
            })
        }
    }
}

impl BlocklistStore for KernelBlocklist {
    #[inline(always)]
    fn lookup(&self, src_addr: u32) -> Option<BlocklistEntry> {
        unsafe { SSDP_BLOCKLIST.get(&src_addr).copied() }
    }

    #[inline(always)]
    fn record_hit(&self, src_addr: u32, now: u64) -> Result<Hit, CapacityExceeded> {
        if let Some(hit) = Self::bump(src_addr, now) {
            return Ok(hit);
        }
        let fresh = BlocklistEntry::first_hit(now);
        match SSDP_BLOCKLIST.insert(&src_addr, &fresh, BPF_NOEXIST as u64) {
            Ok(()) => Ok(Hit {
                blocked: false,
                created: true,
                hit_count: 1,
            }),
            // -EEXIST: another CPU created the key first, update it in place.
            // -E2BIG: the table is full and the key is still absent.
            Err(_) => Self::bump(src_addr, now).ok_or(CapacityExceeded),
        }
    }
}

pub struct KernelStats;

impl StatsSink for KernelStats {
    #[inline(always)]
    fn bump(&self, counter: StatCounter) {
        // Per-CPU slot: no other context writes it concurrently.
        if let Some(ptr) = SSDP_STATS.get_ptr_mut(counter.index()) {
            unsafe {
                *ptr = (*ptr).wrapping_add(1);
            }
        }
    }
}

pub struct KernelFeatures;

impl FeatureSink for KernelFeatures {
    #[inline(always)]
    fn publish(&self, record: &FeatureRecord) -> Result<(), ExportFull> {
        match SSDP_FEATURES.reserve::<FeatureRecord>(0) {
            Some(mut entry) => {
                entry.write(*record);
                entry.submit(0);
                Ok(())
            }
            None => Err(ExportFull),
        }
    }
}
