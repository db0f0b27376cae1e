use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{info, warn};
use tokio::time;

use crate::{
    clock::monotonic_ns,
    config::FilterSettings,
    control::{BlocklistControl, ControlError},
};

// Pressure eviction starts above the high mark and trims to the low mark.
const HIGH_WATER_PERCENT: usize = 90;
const LOW_WATER_PERCENT: usize = 75;

/// Blocking decisions made outside the packet path.
#[derive(Clone, Debug)]
pub struct ThresholdPolicy {
    pub block_threshold: Option<u64>,
    pub idle_timeout_ns: Option<u64>,
    pub capacity: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    pub promoted: usize,
    pub aged_out: usize,
    pub pressure_evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ThresholdPolicy {
    pub fn from_settings(settings: &FilterSettings) -> Self {
        Self {
            block_threshold: settings.block_threshold,
            idle_timeout_ns: settings
                .idle_timeout()
                .map(|idle| idle.as_nanos().min(u64::MAX as u128) as u64),
            capacity: settings.blocklist_capacity as usize,
        }
    }

    /// One pass over the table:
    /// - unblocked entries idle past the timeout are evicted (blocked ones
    ///   stay until unblocked or evicted explicitly);
    /// - unblocked entries at or above the threshold are blocked;
    /// - above the high-water mark, least recently seen entries are evicted
    ///   down to the low-water mark.
    pub fn sweep<C>(&self, control: &C, now: u64) -> Result<SweepReport, ControlError>
    where
        C: BlocklistControl + ?Sized,
    {
        let mut report = SweepReport::default();

        for (addr, entry) in control.enumerate()? {
            if entry.is_blocked() {
                continue;
            }
            if let Some(idle) = self.idle_timeout_ns {
                if now.saturating_sub(entry.last_seen) > idle {
                    if control.evict(addr)? {
                        report.aged_out += 1;
                    }
                    continue;
                }
            }
            if let Some(threshold) = self.block_threshold {
                if entry.hit_count >= threshold && control.set_blocked(addr, true)? {
                    info!(
                        "blocking {addr}: {} hits reached threshold {threshold}",
                        entry.hit_count
                    );
                    report.promoted += 1;
                }
            }
        }

        let len = control.len()?;
        let high = self.capacity * HIGH_WATER_PERCENT / 100;
        if len > high {
            let low = self.capacity * LOW_WATER_PERCENT / 100;
            report.pressure_evicted = control.evict_oldest(len - low)?;
        }

        Ok(report)
    }
}

/// Sweep `control` every `every` until `running` is cleared. Errors are
/// logged and the next tick retries.
pub async fn run_sweeper<C>(
    control: Arc<C>,
    policy: ThresholdPolicy,
    every: Duration,
    running: Arc<AtomicBool>,
) where
    C: BlocklistControl + Send + Sync + ?Sized,
{
    let mut ticker = time::interval(every);
    loop {
        ticker.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match policy.sweep(control.as_ref(), monotonic_ns()) {
            Ok(report) if !report.is_empty() => info!(
                "sweep: promoted {} aged out {} evicted under pressure {}",
                report.promoted, report.aged_out, report.pressure_evicted
            ),
            Ok(_) => {}
            Err(err) => warn!("sweep failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use ssdp_filter_common::BlocklistStore;

    use crate::store::BlocklistTable;

    const SEC: u64 = 1_000_000_000;

    fn addr(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, n)
    }

    fn hit(table: &BlocklistTable, a: Ipv4Addr, times: u64, now: u64) {
        for _ in 0..times {
            table.record_hit(u32::from(a), now).unwrap();
        }
    }

    fn policy(
        threshold: Option<u64>,
        idle_secs: Option<u64>,
        capacity: usize,
    ) -> ThresholdPolicy {
        ThresholdPolicy {
            block_threshold: threshold,
            idle_timeout_ns: idle_secs.map(|s| s * SEC),
            capacity,
        }
    }

    #[test]
    fn promotes_at_threshold() {
        let table = BlocklistTable::new(100);
        hit(&table, addr(1), 9, 10 * SEC);
        hit(&table, addr(2), 10, 10 * SEC);
        hit(&table, addr(3), 50, 10 * SEC);

        let report = policy(Some(10), None, 100).sweep(&table, 11 * SEC).unwrap();
        assert_eq!(report.promoted, 2);
        assert!(!table.lookup(u32::from(addr(1))).unwrap().is_blocked());
        assert!(table.lookup(u32::from(addr(2))).unwrap().is_blocked());
        assert!(table.lookup(u32::from(addr(3))).unwrap().is_blocked());

        // Already blocked entries are not promoted again.
        let report = policy(Some(10), None, 100).sweep(&table, 12 * SEC).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn no_threshold_never_promotes() {
        let table = BlocklistTable::new(100);
        hit(&table, addr(1), 10_000, SEC);
        let report = policy(None, None, 100).sweep(&table, 2 * SEC).unwrap();
        assert!(report.is_empty());
        assert!(!table.lookup(u32::from(addr(1))).unwrap().is_blocked());
    }

    #[test]
    fn idle_unblocked_entries_age_out() {
        let table = BlocklistTable::new(100);
        hit(&table, addr(1), 1, 100 * SEC);
        hit(&table, addr(2), 1, 1000 * SEC);
        table.insert_or_update(addr(3), true).unwrap();
        hit(&table, addr(3), 1, 100 * SEC);

        let report = policy(None, Some(600), 100)
            .sweep(&table, 1000 * SEC)
            .unwrap();
        assert_eq!(report.aged_out, 1);
        assert!(table.lookup(u32::from(addr(1))).is_none());
        assert!(table.lookup(u32::from(addr(2))).is_some());
        assert!(table.lookup(u32::from(addr(3))).is_some());
    }

    #[test]
    fn pressure_evicts_down_to_low_water() {
        let table = BlocklistTable::new(20);
        for n in 0..19u8 {
            hit(&table, addr(n), 1, n as u64 * SEC);
        }
        let report = policy(None, None, 20).sweep(&table, 20 * SEC).unwrap();
        assert_eq!(report.pressure_evicted, 4);
        assert_eq!(table.len().unwrap(), 15);
        for n in 0..4u8 {
            assert!(table.lookup(u32::from(addr(n))).is_none());
        }
        assert!(table.lookup(u32::from(addr(4))).is_some());

        // Below the high-water mark nothing more happens.
        assert!(policy(None, None, 20).sweep(&table, 21 * SEC).unwrap().is_empty());
    }

    #[test]
    fn from_settings_maps_keys() {
        let settings = FilterSettings {
            block_threshold: Some(25),
            idle_timeout_secs: 3,
            blocklist_capacity: 10,
            ..FilterSettings::default()
        };
        let p = ThresholdPolicy::from_settings(&settings);
        assert_eq!(p.block_threshold, Some(25));
        assert_eq!(p.idle_timeout_ns, Some(3 * SEC));
        assert_eq!(p.capacity, 10);

        let p = ThresholdPolicy::from_settings(&FilterSettings {
            idle_timeout_secs: 0,
            ..FilterSettings::default()
        });
        assert_eq!(p.idle_timeout_ns, None);
    }
}
