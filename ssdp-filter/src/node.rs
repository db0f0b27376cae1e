//! Shadow pipeline: frames read from an AF_PACKET TPACKET_V3 ring run
//! through the same decision engine as the XDP program, against in-process
//! state. The socket only observes traffic, so verdicts are advisory.

use std::{
    ffi::CString,
    io, mem,
    net::Ipv4Addr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering, fence},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, info, warn};
use tokio::{signal, task, time};

use ssdp_filter_common::{StatsRecord, Verdict};

use crate::{
    clock::{monotonic_ns, wall_timestamp},
    config::FilterSettings,
    export::FeatureLog,
    filter::SsdpFilter,
    model::SeedList,
    policy::{ThresholdPolicy, run_sweeper},
};

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20; // 1 MiB
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u32 = 100;

const FEATURE_BATCH: usize = 256;
const FEATURE_WAIT: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub block_timeout_ms: u32,
}

pub struct NodeOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub ring: RingConfig,
    pub settings: FilterSettings,
    pub seed: Option<PathBuf>,
    pub feature_log: Option<PathBuf>,
}

fn validate_ring_config(cfg: &RingConfig) -> Result<()> {
    if cfg.block_size == 0 || cfg.block_count == 0 || cfg.frame_size == 0 {
        return Err(anyhow!("ring parameters must be non-zero"));
    }
    if cfg.block_size % cfg.frame_size != 0 {
        return Err(anyhow!("block size must be a multiple of frame size"));
    }
    let alignment = libc::TPACKET_ALIGNMENT as u32;
    if cfg.block_size % alignment != 0 || cfg.frame_size % alignment != 0 {
        return Err(anyhow!(
            "block and frame sizes must be aligned to {} bytes",
            alignment
        ));
    }
    Ok(())
}

pub async fn run_shadow_pipeline(opts: NodeOptions) -> Result<()> {
    ensure!(opts.workers > 0, "workers must be at least 1");
    validate_ring_config(&opts.ring)?;
    opts.settings.validate()?;

    let filter = SsdpFilter::from_settings(&opts.settings, opts.workers);
    let seed = SeedList::from_option(opts.seed.as_deref())?;
    if !seed.is_empty() {
        let outcome = seed.apply(filter.blocklist().as_ref())?;
        info!(
            "seeded {} blocklist entries ({} rejected, table full)",
            outcome.applied, outcome.rejected
        );
    }

    let running = Arc::new(AtomicBool::new(true));
    let advisory_drops = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(opts.workers);
    for lane in 0..opts.workers {
        let iface = opts.iface.clone();
        let fanout = opts.fanout_group;
        let filter = filter.clone();
        let running = running.clone();
        let drops = advisory_drops.clone();
        let ring_cfg = opts.ring;
        handles.push(task::spawn(async move {
            worker_loop(lane, &iface, fanout, running, filter, drops, ring_cfg).await
        }));
    }

    let sweeper = tokio::spawn(run_sweeper(
        filter.blocklist().clone(),
        ThresholdPolicy::from_settings(&opts.settings),
        opts.settings.sweep_interval(),
        running.clone(),
    ));

    let reporter_filter = filter.clone();
    let reporter_running = running.clone();
    let report_interval = opts.settings.report_interval();
    let reporter = tokio::spawn(async move {
        let mut ticker = time::interval(report_interval);
        loop {
            ticker.tick().await;
            if !reporter_running.load(Ordering::Relaxed) {
                break;
            }
            log_snapshot(&reporter_filter.stats().snapshot());
        }
    });

    let mut feature_log = FeatureLog::from_option(opts.feature_log.as_deref())?;
    let drain_filter = filter.clone();
    let drain_running = running.clone();
    let drain = tokio::spawn(async move {
        let ring = drain_filter.export();
        let mut batch = Vec::with_capacity(FEATURE_BATCH);
        while drain_running.load(Ordering::Relaxed) {
            batch.clear();
            let Some(first) = ring.wait_and_poll(FEATURE_WAIT).await else {
                continue;
            };
            batch.push(first);
            ring.poll_batch(&mut batch, FEATURE_BATCH - 1);
            if let Err(err) = feature_log.write_all(&batch) {
                warn!("feature log: {err:#}");
            }
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    println!("Received shutdown signal, draining...");
    running.store(false, Ordering::Relaxed);

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("worker panicked: {err}")),
        }
    }

    sweeper.abort();
    reporter.abort();
    let _ = sweeper.await;
    let _ = reporter.await;
    let _ = drain.await;

    log_snapshot(&filter.stats().snapshot());
    info!(
        "{} packets would have been dropped",
        advisory_drops.load(Ordering::Relaxed)
    );
    Ok(())
}

fn log_snapshot(s: &StatsRecord) {
    info!(
        "[{}] seen {} passed {} dropped {} ssdp {} hits {} parse_errors {} unsupported {} capacity_exhausted {} export_dropped {}",
        wall_timestamp(),
        s.packets_seen,
        s.passed,
        s.dropped,
        s.ssdp_matched,
        s.blocklist_hits,
        s.parse_errors,
        s.unsupported,
        s.capacity_exhausted,
        s.export_dropped
    );
}

async fn worker_loop(
    lane: usize,
    iface: &str,
    fanout_group: Option<u16>,
    running: Arc<AtomicBool>,
    filter: SsdpFilter,
    drops: Arc<AtomicU64>,
    ring_cfg: RingConfig,
) -> Result<()> {
    let mut socket = PacketSocket::bind(iface, fanout_group, ring_cfg)
        .with_context(|| format!("worker {lane}: failed to bind packet socket"))?;
    let mut worker = Worker {
        lane,
        filter,
        drops,
    };
    socket.pump(&running, &mut worker).await
}

struct Worker {
    lane: usize,
    filter: SsdpFilter,
    drops: Arc<AtomicU64>,
}

impl Worker {
    fn handle(&mut self, frame: &[u8], now: u64) {
        let decision = self.filter.process(self.lane, frame, now);
        if decision.verdict == Verdict::Drop {
            self.drops.fetch_add(1, Ordering::Relaxed);
            debug!(
                "lane {}: would drop ssdp from {}",
                self.lane,
                Ipv4Addr::from(decision.src_addr)
            );
        }
    }
}

struct PacketSocket {
    fd: OwnedFd,
    ring: PacketRing,
}

impl PacketSocket {
    fn bind(iface: &str, fanout_group: Option<u16>, ring_cfg: RingConfig) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }

        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let version: libc::c_int = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                owned_fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                mem::size_of_val(&version) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to enable TPACKET_V3");
        }

        bind_interface(owned_fd.as_raw_fd(), iface, protocol)?;
        configure_fanout(owned_fd.as_raw_fd(), fanout_group)?;

        let ring = PacketRing::new(owned_fd.as_raw_fd(), ring_cfg)?;

        Ok(Self { fd: owned_fd, ring })
    }

    async fn pump(&mut self, running: &AtomicBool, worker: &mut Worker) -> Result<()> {
        let block_nr = self.ring.block_count() as usize;
        while running.load(Ordering::Relaxed) {
            let mut made_progress = false;
            for _ in 0..block_nr {
                if self.ring.consume_next_block(worker) {
                    made_progress = true;
                }
            }

            if !made_progress {
                // Bounded so a quiet interface still notices shutdown.
                let readable = wait_for_read(self.fd.as_raw_fd());
                let _ = time::timeout(Duration::from_millis(500), readable).await;
            }
        }

        Ok(())
    }
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<()> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error()).context("failed to lookup interface index");
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("failed to bind packet socket");
    }

    Ok(())
}

fn configure_fanout(fd: RawFd, fanout_group: Option<u16>) -> Result<()> {
    if let Some(group) = fanout_group {
        let fanout_type = libc::PACKET_FANOUT_HASH;
        let val: u32 = (group as u32) | (fanout_type << 16);
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_FANOUT,
                &val as *const _ as *const libc::c_void,
                mem::size_of_val(&val) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_FANOUT");
        }
    }

    Ok(())
}

struct PacketRing {
    base: *mut u8,
    len: usize,
    req: libc::tpacket_req3,
    current_block: u32,
}

// Each ring belongs to one PacketSocket, which is driven by one worker task.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    fn new(fd: RawFd, cfg: RingConfig) -> Result<Self> {
        if cfg.frame_size > cfg.block_size {
            return Err(anyhow!("frame size must be <= block size"));
        }
        let frames_per_block = cfg.block_size / cfg.frame_size;
        let frame_nr = frames_per_block
            .checked_mul(cfg.block_count)
            .ok_or_else(|| anyhow!("ring size overflow"))?;

        let req = libc::tpacket_req3 {
            tp_block_size: cfg.block_size,
            tp_block_nr: cfg.block_count,
            tp_frame_size: cfg.frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: cfg.block_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };

        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const _ as *const libc::c_void,
                mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_RX_RING");
        }

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| anyhow!("ring mmap length overflow"))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("failed to mmap PACKET_RX_RING");
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            req,
            current_block: 0,
        })
    }

    fn block_count(&self) -> u32 {
        self.req.tp_block_nr
    }

    fn block_size(&self) -> usize {
        self.req.tp_block_size as usize
    }

    fn consume_next_block(&mut self, worker: &mut Worker) -> bool {
        let idx = self.current_block;
        self.current_block = (self.current_block + 1) % self.req.tp_block_nr.max(1);
        self.consume_block(idx, worker)
    }

    /// Runs every frame of block `idx` through `worker` and hands the block
    /// back to the kernel. `false` if the kernel still owns it.
    fn consume_block(&mut self, idx: u32, worker: &mut Worker) -> bool {
        let block_size = self.block_size();
        let block_ptr = unsafe { self.base.add(idx as usize * block_size) };
        let desc = block_ptr as *mut libc::tpacket_block_desc;
        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*desc).hdr.bh1.block_status)) };
        if status & libc::TP_STATUS_USER == 0 {
            return false;
        }

        fence(Ordering::Acquire);
        // One clock read per block; frames in a block arrived within the
        // block retire timeout of each other.
        let now = monotonic_ns();
        {
            // SAFETY: the block is ours until its status is handed back below.
            let block = unsafe { slice::from_raw_parts(block_ptr, block_size) };
            for frame in BlockFrames::new(block) {
                worker.handle(frame, now);
            }
        }
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(
                ptr::addr_of_mut!((*desc).hdr.bh1.block_status),
                libc::TP_STATUS_KERNEL,
            );
        }
        true
    }
}

/// Frames of one retired TPACKET_V3 block. Stops at the first header or
/// frame that would run past the block.
struct BlockFrames<'a> {
    block: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> BlockFrames<'a> {
    fn new(block: &'a [u8]) -> Self {
        if block.len() < mem::size_of::<libc::tpacket_block_desc>() {
            return Self {
                block,
                offset: 0,
                remaining: 0,
            };
        }
        // SAFETY: length checked; the descriptor is plain integers.
        let desc = unsafe {
            ptr::read_unaligned(block.as_ptr() as *const libc::tpacket_block_desc)
        };
        let (offset, remaining) =
            unsafe { (desc.hdr.bh1.offset_to_first_pkt as usize, desc.hdr.bh1.num_pkts) };
        Self {
            block,
            offset,
            remaining,
        }
    }
}

impl<'a> Iterator for BlockFrames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let hdr_end = self.offset.checked_add(mem::size_of::<libc::tpacket3_hdr>())?;
        if hdr_end > self.block.len() {
            self.remaining = 0;
            return None;
        }
        // SAFETY: header bounds checked above.
        let hdr = unsafe {
            ptr::read_unaligned(self.block.as_ptr().add(self.offset) as *const libc::tpacket3_hdr)
        };
        let start = self.offset + hdr.tp_mac as usize;
        let end = start + hdr.tp_snaplen as usize;
        if hdr.tp_snaplen == 0 || end > self.block.len() {
            self.remaining = 0;
            return None;
        }

        if hdr.tp_next_offset == 0 {
            self.remaining = 0;
        } else {
            self.offset += hdr.tp_next_offset as usize;
        }
        Some(&self.block[start..end])
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        if !self.base.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

async fn wait_for_read(fd: RawFd) -> Result<()> {
    use tokio::io::unix::AsyncFd;

    let async_fd = AsyncFd::new(fd).context("failed to create AsyncFd")?;
    loop {
        let mut guard = async_fd
            .readable()
            .await
            .context("failed to wait for socket readability")?;
        match guard.try_io(|_| Ok(())) {
            Ok(result) => {
                result?;
                return Ok(());
            }
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssdp_filter_common::frame::ssdp_frame;

    use crate::control::BlocklistControl;

    fn ring(block_size: u32, frame_size: u32) -> RingConfig {
        RingConfig {
            block_size,
            block_count: 4,
            frame_size,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }

    #[test]
    fn default_ring_config_is_valid() {
        assert!(validate_ring_config(&ring(DEFAULT_BLOCK_SIZE, DEFAULT_FRAME_SIZE)).is_ok());
    }

    #[test]
    fn ring_config_rejects_bad_geometry() {
        assert!(validate_ring_config(&ring(0, 2048)).is_err());
        assert!(validate_ring_config(&ring(4096, 0)).is_err());
        assert!(validate_ring_config(&ring(4096, 3000)).is_err());
        assert!(validate_ring_config(&ring(4100, 2050)).is_err());
    }

    // Lays `frames` out the way the kernel fills a TPACKET_V3 block and
    // returns the block plus each frame header's offset.
    fn synthetic_block(frames: &[Vec<u8>], block_size: usize) -> (Vec<u8>, Vec<usize>) {
        let mut block = vec![0u8; block_size];
        let first = mem::size_of::<libc::tpacket_block_desc>().next_multiple_of(8);
        let mac = mem::size_of::<libc::tpacket3_hdr>().next_multiple_of(16);

        let mut desc: libc::tpacket_block_desc = unsafe { mem::zeroed() };
        unsafe {
            desc.hdr.bh1.block_status = libc::TP_STATUS_USER;
            desc.hdr.bh1.num_pkts = frames.len() as u32;
            desc.hdr.bh1.offset_to_first_pkt = first as u32;
            ptr::write_unaligned(block.as_mut_ptr() as *mut libc::tpacket_block_desc, desc);
        }

        let mut offsets = Vec::new();
        let mut offset = first;
        for (i, frame) in frames.iter().enumerate() {
            let stride = (mac + frame.len()).next_multiple_of(16);
            let mut hdr: libc::tpacket3_hdr = unsafe { mem::zeroed() };
            hdr.tp_next_offset = if i + 1 == frames.len() { 0 } else { stride as u32 };
            hdr.tp_snaplen = frame.len() as u32;
            hdr.tp_len = frame.len() as u32;
            hdr.tp_mac = mac as u16;
            unsafe {
                ptr::write_unaligned(
                    block.as_mut_ptr().add(offset) as *mut libc::tpacket3_hdr,
                    hdr,
                );
            }
            block[offset + mac..offset + mac + frame.len()].copy_from_slice(frame);
            offsets.push(offset);
            offset += stride;
        }
        (block, offsets)
    }

    #[test]
    fn block_frames_walks_every_frame() {
        let frames = vec![
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 5), b"M-SEARCH"),
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 6), b""),
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 7), b"NOTIFY * HTTP/1.1"),
        ];
        let (block, _) = synthetic_block(&frames, 4096);

        let seen: Vec<&[u8]> = BlockFrames::new(&block).collect();
        assert_eq!(seen.len(), 3);
        for (got, want) in seen.iter().zip(&frames) {
            assert_eq!(*got, want.as_slice());
        }
    }

    #[test]
    fn block_frames_stops_at_the_block_edge() {
        let frames = vec![
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 5), b""),
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 6), b""),
        ];
        let (block, offsets) = synthetic_block(&frames, 4096);

        // Second frame's payload cut short.
        let mac = mem::size_of::<libc::tpacket3_hdr>().next_multiple_of(16);
        let cut = &block[..offsets[1] + mac + 4];
        assert_eq!(BlockFrames::new(cut).count(), 1);

        // Second frame's header cut short.
        let cut = &block[..offsets[1] + 2];
        assert_eq!(BlockFrames::new(cut).count(), 1);

        assert_eq!(BlockFrames::new(&[0u8; 8]).count(), 0);
    }

    #[test]
    fn block_frames_feed_the_worker() {
        let blocked = Ipv4Addr::new(10, 0, 0, 5);
        let filter = SsdpFilter::from_settings(&FilterSettings::default(), 1);
        filter.blocklist().insert_or_update(blocked, true).unwrap();
        let mut worker = Worker {
            lane: 0,
            filter: filter.clone(),
            drops: Arc::new(AtomicU64::new(0)),
        };

        let frames = vec![
            ssdp_frame(blocked, b""),
            ssdp_frame(Ipv4Addr::new(10, 0, 0, 9), b""),
            ssdp_frame(blocked, b""),
        ];
        let (block, _) = synthetic_block(&frames, 4096);
        for frame in BlockFrames::new(&block) {
            worker.handle(frame, 1);
        }

        assert_eq!(worker.drops.load(Ordering::Relaxed), 2);
        let stats = filter.stats().snapshot();
        assert_eq!(stats.packets_seen, 3);
        assert_eq!(stats.passed, 1);
    }

    #[test]
    fn worker_counts_advisory_drops() {
        let filter = SsdpFilter::from_settings(&FilterSettings::default(), 2);
        let source = Ipv4Addr::new(10, 0, 0, 5);
        filter.blocklist().insert_or_update(source, true).unwrap();

        let mut worker = Worker {
            lane: 1,
            filter: filter.clone(),
            drops: Arc::new(AtomicU64::new(0)),
        };
        let frame = ssdp_frame(source, b"");
        worker.handle(&frame, 1);
        worker.handle(&frame, 2);
        worker.handle(&ssdp_frame(Ipv4Addr::new(10, 0, 0, 6), b""), 3);

        assert_eq!(worker.drops.load(Ordering::Relaxed), 2);
        let stats = filter.stats().snapshot();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.passed, 1);
    }
}
