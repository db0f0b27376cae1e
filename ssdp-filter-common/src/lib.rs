#![cfg_attr(not(any(test, feature = "test-utils")), no_std)]

// Hot-path core shared between the XDP program and the userspace agent.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub mod classify;
pub mod engine;
pub mod parser;

#[cfg(any(test, feature = "test-utils"))]
pub mod frame;

pub use classify::{FlowKey, classify};
pub use engine::{
    BlocklistStore, CapacityExceeded, Decision, ExportFull, FeatureSink, Hit, StatsSink, decide,
};
pub use parser::{PacketView, ParseError, ParsedHeaders, parse_headers};

pub const SSDP_PORT: u16 = 1900;

pub const MAP_BLOCKLIST: &str = "ssdp_blocklist";
pub const MAP_STATS: &str = "ssdp_stats";
pub const MAP_FEATURES: &str = "ssdp_features";
pub const MAP_CONFIG: &str = "ssdp_config";
pub const XDP_PROGRAM: &str = "xdp_ssdp_filter";

pub const CONFIG_SLOT_RUNTIME: u32 = 0;

// Compile-time map sizes; the loader overrides them from configuration.
pub const DEFAULT_BLOCKLIST_CAPACITY: u32 = 65_536;
pub const DEFAULT_FEATURE_RING_BYTES: u32 = 256 * 1024;

pub const FLAG_EXPORT_ENABLED: u16 = 0x0001;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[cfg_attr(feature = "user", serde(rename_all = "snake_case"))]
pub enum Verdict {
    Pass = 0,
    Drop = 1,
}

impl Verdict {
    pub fn from_u8(raw: u8) -> Self {
        if raw == Verdict::Drop as u8 {
            Verdict::Drop
        } else {
            Verdict::Pass
        }
    }
}

/// Why a packet got its verdict. Every fail-open path has its own tag.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
#[cfg_attr(feature = "user", serde(rename_all = "snake_case"))]
pub enum Reason {
    /// Not IPv4, or IPv4 but not UDP.
    Unsupported = 0,
    /// Truncated, malformed or fragmented headers.
    ParseError = 1,
    /// UDP, but not addressed to the SSDP port.
    NotSsdp = 2,
    /// SSDP from a source that is tracked but not blocked.
    Observed = 3,
    /// SSDP from a blocked source.
    Blocked = 4,
    /// SSDP from a new source while the blocklist was full.
    CapacityExhausted = 5,
}

impl Reason {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Reason::Unsupported,
            1 => Reason::ParseError,
            2 => Reason::NotSsdp,
            3 => Reason::Observed,
            4 => Reason::Blocked,
            5 => Reason::CapacityExhausted,
            _ => return None,
        })
    }
}

/// Blocklist value keyed by the source IPv4 address (host order `u32`).
///
/// Timestamps are `CLOCK_MONOTONIC` nanoseconds, the clock behind
/// `bpf_ktime_get_ns`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct BlocklistEntry {
    pub hit_count: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub blocked: u8,
    #[cfg_attr(feature = "user", serde(skip))]
    pub pad: [u8; 7],
}

impl BlocklistEntry {
    pub const fn first_hit(now: u64) -> Self {
        Self {
            hit_count: 1,
            first_seen: now,
            last_seen: now,
            blocked: 0,
            pad: [0; 7],
        }
    }

    /// Entry created by the control plane before any packet was seen.
    pub const fn seeded(now: u64, blocked: bool) -> Self {
        Self {
            hit_count: 0,
            first_seen: now,
            last_seen: now,
            blocked: blocked as u8,
            pad: [0; 7],
        }
    }

    pub const fn is_blocked(&self) -> bool {
        self.blocked != 0
    }
}

/// One exported observation of an SSDP packet. Fixed 40-byte layout; the
/// consumer reads it straight out of the ring buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FeatureRecord {
    pub timestamp_ns: u64,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_len: u32,
    pub udp_len: u16,
    pub protocol: u8,
    pub verdict: u8,
    pub reason: u8,
    pub pad: [u8; 3],
    /// `hit_count` of the source after this packet, 0 if it was not recorded.
    pub hit_count: u64,
}

impl FeatureRecord {
    pub fn verdict(&self) -> Verdict {
        Verdict::from_u8(self.verdict)
    }

    pub fn reason(&self) -> Option<Reason> {
        Reason::from_u8(self.reason)
    }
}

/// Runtime knobs read by the XDP program from `ssdp_config[0]`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterConfig {
    /// 0 selects `SSDP_PORT`.
    pub ssdp_port: u16,
    pub flags: u16,
    pub reserved: u32,
}

impl FilterConfig {
    pub const fn new(ssdp_port: u16, export_enabled: bool) -> Self {
        Self {
            ssdp_port,
            flags: if export_enabled { FLAG_EXPORT_ENABLED } else { 0 },
            reserved: 0,
        }
    }

    #[inline(always)]
    pub fn ssdp_port(&self) -> u16 {
        if self.ssdp_port == 0 {
            SSDP_PORT
        } else {
            self.ssdp_port
        }
    }

    #[inline(always)]
    pub fn export_enabled(&self) -> bool {
        self.flags & FLAG_EXPORT_ENABLED != 0
    }
}

/// Index of each counter in the statistics block.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StatCounter {
    PacketsSeen = 0,
    Passed = 1,
    Dropped = 2,
    ParseErrors = 3,
    Unsupported = 4,
    BlocklistHits = 5,
    SsdpMatched = 6,
    CapacityExhausted = 7,
    ExportDropped = 8,
}

pub const STAT_COUNT: usize = 9;

impl StatCounter {
    pub const ALL: [StatCounter; STAT_COUNT] = [
        StatCounter::PacketsSeen,
        StatCounter::Passed,
        StatCounter::Dropped,
        StatCounter::ParseErrors,
        StatCounter::Unsupported,
        StatCounter::BlocklistHits,
        StatCounter::SsdpMatched,
        StatCounter::CapacityExhausted,
        StatCounter::ExportDropped,
    ];

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }
}

/// Named view of the counter block, as returned by a statistics snapshot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct StatsRecord {
    pub packets_seen: u64,
    pub passed: u64,
    pub dropped: u64,
    pub parse_errors: u64,
    pub unsupported: u64,
    pub blocklist_hits: u64,
    pub ssdp_matched: u64,
    pub capacity_exhausted: u64,
    pub export_dropped: u64,
}

impl StatsRecord {
    pub fn from_counters(counters: &[u64; STAT_COUNT]) -> Self {
        Self {
            packets_seen: counters[StatCounter::PacketsSeen as usize],
            passed: counters[StatCounter::Passed as usize],
            dropped: counters[StatCounter::Dropped as usize],
            parse_errors: counters[StatCounter::ParseErrors as usize],
            unsupported: counters[StatCounter::Unsupported as usize],
            blocklist_hits: counters[StatCounter::BlocklistHits as usize],
            ssdp_matched: counters[StatCounter::SsdpMatched as usize],
            capacity_exhausted: counters[StatCounter::CapacityExhausted as usize],
            export_dropped: counters[StatCounter::ExportDropped as usize],
        }
    }

    pub fn get(&self, counter: StatCounter) -> u64 {
        match counter {
            StatCounter::PacketsSeen => self.packets_seen,
            StatCounter::Passed => self.passed,
            StatCounter::Dropped => self.dropped,
            StatCounter::ParseErrors => self.parse_errors,
            StatCounter::Unsupported => self.unsupported,
            StatCounter::BlocklistHits => self.blocklist_hits,
            StatCounter::SsdpMatched => self.ssdp_matched,
            StatCounter::CapacityExhausted => self.capacity_exhausted,
            StatCounter::ExportDropped => self.export_dropped,
        }
    }
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for the map values so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{BlocklistEntry, FeatureRecord, FilterConfig};
    use aya::Pod;

    unsafe impl Pod for BlocklistEntry {}
    unsafe impl Pod for FeatureRecord {}
    unsafe impl Pod for FilterConfig {}
}
