//! PASS/DROP decision for one packet.
//!
//! The engine owns no state. It is generic over the three shared structures
//! so the XDP program can back them with kernel maps and the userspace agent
//! with in-process tables, while both run exactly this control flow.

use crate::{
    FeatureRecord, FilterConfig, Reason, StatCounter, Verdict,
    classify::{FlowKey, classify},
    parser::{PacketView, ParsedHeaders, parse_headers},
};

/// The blocklist is full and the source has no entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapacityExceeded;

/// The feature channel has no room for another record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExportFull;

/// Entry state right after `record_hit`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Hit {
    pub blocked: bool,
    /// The entry did not exist before this packet.
    pub created: bool,
    pub hit_count: u64,
}

pub trait BlocklistStore {
    fn lookup(&self, src_addr: u32) -> Option<crate::BlocklistEntry>;

    /// Bump `hit_count` and `last_seen` for `src_addr`, creating the entry
    /// on first sight. Must not lose increments under concurrent callers.
    fn record_hit(&self, src_addr: u32, now: u64) -> Result<Hit, CapacityExceeded>;
}

pub trait StatsSink {
    fn bump(&self, counter: StatCounter);
}

pub trait FeatureSink {
    /// Never blocks; a full channel is reported, not waited on.
    fn publish(&self, record: &FeatureRecord) -> Result<(), ExportFull>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: Reason,
    /// Source address of a classified packet, 0 otherwise.
    pub src_addr: u32,
}

impl Decision {
    const fn pass(reason: Reason) -> Self {
        Self {
            verdict: Verdict::Pass,
            reason,
            src_addr: 0,
        }
    }
}

#[inline(always)]
pub fn decide<B, S, F>(
    mut view: PacketView<'_>,
    config: &FilterConfig,
    now: u64,
    blocklist: &B,
    stats: &S,
    export: &F,
) -> Decision
where
    B: BlocklistStore,
    S: StatsSink,
    F: FeatureSink,
{
    stats.bump(StatCounter::PacketsSeen);

    let decision = match parse_headers(&mut view) {
        Err(err) => {
            stats.bump(err.counter());
            Decision::pass(err.reason())
        }
        Ok(headers) => match classify(&headers, config.ssdp_port()) {
            None => Decision::pass(Reason::NotSsdp),
            Some(key) => enforce(&headers, key, config, now, blocklist, stats, export),
        },
    };

    stats.bump(match decision.verdict {
        Verdict::Pass => StatCounter::Passed,
        Verdict::Drop => StatCounter::Dropped,
    });
    decision
}

#[inline(always)]
fn enforce<B, S, F>(
    headers: &ParsedHeaders,
    key: FlowKey,
    config: &FilterConfig,
    now: u64,
    blocklist: &B,
    stats: &S,
    export: &F,
) -> Decision
where
    B: BlocklistStore,
    S: StatsSink,
    F: FeatureSink,
{
    // A source the full table cannot track counts as unmatched.
    let (verdict, reason, hit_count) = match blocklist.record_hit(key.src_addr, now) {
        Err(CapacityExceeded) => {
            stats.bump(StatCounter::CapacityExhausted);
            (Verdict::Pass, Reason::CapacityExhausted, 0)
        }
        Ok(hit) => {
            stats.bump(StatCounter::SsdpMatched);
            if !hit.created {
                stats.bump(StatCounter::BlocklistHits);
            }
            if hit.blocked {
                (Verdict::Drop, Reason::Blocked, hit.hit_count)
            } else {
                (Verdict::Pass, Reason::Observed, hit.hit_count)
            }
        }
    };

    if config.export_enabled() {
        let record = FeatureRecord {
            timestamp_ns: now,
            src_addr: key.src_addr,
            dst_addr: key.dst_addr,
            src_port: key.src_port,
            dst_port: key.dst_port,
            packet_len: headers.packet_len,
            udp_len: headers.udp.len,
            protocol: key.protocol,
            verdict: verdict as u8,
            reason: reason as u8,
            pad: [0; 3],
            hit_count,
        };
        if export.publish(&record).is_err() {
            stats.bump(StatCounter::ExportDropped);
        }
    }

    Decision {
        verdict,
        reason,
        src_addr: key.src_addr,
    }
}
