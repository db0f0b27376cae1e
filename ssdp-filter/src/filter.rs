use std::sync::Arc;

use ssdp_filter_common::{Decision, FilterConfig, PacketView, decide};

use crate::{
    config::FilterSettings, export::FeatureRing, stats::StatsSurface, store::BlocklistTable,
};

/// The XDP decision path run in-process: same engine, userspace-backed
/// blocklist, statistics and feature channel. Cheap to clone into workers.
#[derive(Clone)]
pub struct SsdpFilter {
    config: FilterConfig,
    blocklist: Arc<BlocklistTable>,
    stats: Arc<StatsSurface>,
    export: Arc<FeatureRing>,
}

impl SsdpFilter {
    pub fn new(
        config: FilterConfig,
        blocklist: Arc<BlocklistTable>,
        stats: Arc<StatsSurface>,
        export: Arc<FeatureRing>,
    ) -> Self {
        Self {
            config,
            blocklist,
            stats,
            export,
        }
    }

    /// Builds fresh structures sized from `settings`, one stats lane per
    /// worker.
    pub fn from_settings(settings: &FilterSettings, lanes: usize) -> Self {
        Self::new(
            settings.filter_config(),
            Arc::new(BlocklistTable::new(settings.blocklist_capacity as usize)),
            Arc::new(StatsSurface::new(lanes)),
            Arc::new(FeatureRing::new(settings.export_capacity as usize)),
        )
    }

    /// Decide one frame. `lane` selects the caller's statistics lane; `now`
    /// is `CLOCK_MONOTONIC` nanoseconds.
    pub fn process(&self, lane: usize, frame: &[u8], now: u64) -> Decision {
        decide(
            PacketView::new(frame),
            &self.config,
            now,
            self.blocklist.as_ref(),
            &self.stats.lane(lane),
            self.export.as_ref(),
        )
    }

    pub fn blocklist(&self) -> &Arc<BlocklistTable> {
        &self.blocklist
    }

    pub fn stats(&self) -> &Arc<StatsSurface> {
        &self.stats
    }

    pub fn export(&self) -> &Arc<FeatureRing> {
        &self.export
    }
}
