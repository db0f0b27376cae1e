use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use aya::{
    maps::{Map, MapData, PerCpuArray, PerCpuValues},
    util::nr_cpus,
};
use crossbeam::utils::CachePadded;

use ssdp_filter_common::{STAT_COUNT, StatCounter, StatsRecord, StatsSink};

use crate::control::ControlError;

type Counters = [AtomicU64; STAT_COUNT];

/// Userspace statistics block: one cache-padded counter lane per packet
/// worker. Workers only ever increment their own lane; readers sum lanes.
pub struct StatsSurface {
    lanes: Vec<CachePadded<Counters>>,
}

impl StatsSurface {
    pub fn new(lanes: usize) -> Self {
        let lanes = (0..lanes.max(1))
            .map(|_| CachePadded::new(std::array::from_fn(|_| AtomicU64::new(0))))
            .collect();
        Self { lanes }
    }

    pub fn lane(&self, idx: usize) -> StatsLane<'_> {
        StatsLane {
            counters: &self.lanes[idx % self.lanes.len()],
        }
    }

    /// Best-effort: lanes are read one counter at a time while workers run.
    pub fn snapshot(&self) -> StatsRecord {
        let mut totals = [0u64; STAT_COUNT];
        for lane in &self.lanes {
            for (total, counter) in totals.iter_mut().zip(lane.iter()) {
                *total = total.wrapping_add(counter.load(Ordering::Relaxed));
            }
        }
        StatsRecord::from_counters(&totals)
    }

    #[cfg(test)]
    pub fn reset(&self) {
        for lane in &self.lanes {
            for counter in lane.iter() {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct StatsLane<'a> {
    counters: &'a Counters,
}

impl StatsSink for StatsLane<'_> {
    fn bump(&self, counter: StatCounter) {
        self.counters[counter.index() as usize].fetch_add(1, Ordering::Relaxed);
    }
}

/// The kernel statistics map pinned by `attach`.
pub struct PinnedStats {
    map: PerCpuArray<MapData, u64>,
}

impl PinnedStats {
    pub fn open(path: &Path) -> Result<Self, ControlError> {
        let data = MapData::from_pin(path).map_err(|source| ControlError::Pin {
            path: path.to_path_buf(),
            source,
        })?;
        let map = PerCpuArray::try_from(Map::PerCpuArray(data))?;
        Ok(Self { map })
    }

    pub fn snapshot(&self) -> Result<StatsRecord, ControlError> {
        let mut totals = [0u64; STAT_COUNT];
        for counter in StatCounter::ALL {
            let per_cpu = self.map.get(&counter.index(), 0)?;
            totals[counter.index() as usize] = saturate(sum_counters(per_cpu.iter()));
        }
        Ok(StatsRecord::from_counters(&totals))
    }

    pub fn reset(&mut self) -> Result<(), ControlError> {
        let cpus = nr_cpus().map_err(|(_, err)| err)?;
        for counter in StatCounter::ALL {
            let zeroes = PerCpuValues::try_from(vec![0u64; cpus])?;
            self.map.set(counter.index(), zeroes, 0)?;
        }
        Ok(())
    }
}

fn sum_counters<'a, I>(values: I) -> u128
where
    I: IntoIterator<Item = &'a u64>,
{
    let mut total: u128 = 0;
    for v in values {
        total = total.wrapping_add(*v as u128);
    }
    total
}

fn saturate(n: u128) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn sum_counters_accumulates_multiple_cpus() {
        let cpus = [100u64, 50, 0, 7];
        assert_eq!(sum_counters(cpus.iter()), 157);
    }

    #[test]
    fn sum_counters_handles_large_values() {
        let cpus = [u64::MAX, 1];
        let total = sum_counters(cpus.iter());
        assert_eq!(total, (u64::MAX as u128) + 1);
        assert_eq!(saturate(total), u64::MAX);
        assert_eq!(saturate(42), 42);
    }

    #[test]
    fn opening_a_missing_stats_pin_fails() {
        let path = Path::new("/nonexistent/ssdp_filter_test/ssdp_stats");
        assert!(matches!(
            PinnedStats::open(path),
            Err(ControlError::Pin { .. })
        ));
    }

    #[test]
    fn lanes_are_summed_on_snapshot() {
        let stats = StatsSurface::new(3);
        stats.lane(0).bump(StatCounter::PacketsSeen);
        stats.lane(1).bump(StatCounter::PacketsSeen);
        stats.lane(2).bump(StatCounter::Dropped);
        // Lane indices wrap.
        stats.lane(4).bump(StatCounter::PacketsSeen);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_seen, 3);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.passed, 0);
    }

    #[test]
    fn snapshot_has_no_side_effects_and_reset_zeroes() {
        let stats = StatsSurface::new(2);
        for _ in 0..5 {
            stats.lane(0).bump(StatCounter::SsdpMatched);
        }
        assert_eq!(stats.snapshot(), stats.snapshot());
        assert_eq!(stats.snapshot().ssdp_matched, 5);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsRecord::default());
    }

    #[test]
    fn concurrent_lanes_count_exactly() {
        let stats = Arc::new(StatsSurface::new(4));
        let handles: Vec<_> = (0..4)
            .map(|lane| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..25_000 {
                        stats.lane(lane).bump(StatCounter::PacketsSeen);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().packets_seen, 100_000);
    }
}
