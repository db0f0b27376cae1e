use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use aya::pin::PinError;
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{Array, RingBuf},
};
use aya_log::EbpfLogger;
use clap::ValueEnum;
use log::{info, warn};
use tokio::{signal, task::JoinHandle, time};

use ssdp_filter_common::{
    CONFIG_SLOT_RUNTIME, FilterConfig, MAP_BLOCKLIST, MAP_CONFIG, MAP_FEATURES, MAP_STATS,
    StatsRecord, XDP_PROGRAM,
};

use crate::{
    clock::wall_timestamp,
    config::FilterSettings,
    control::{ControlError, PinnedBlocklist},
    export::{FeatureLog, KernelFeatureStream},
    model::SeedList,
    policy::{ThresholdPolicy, run_sweeper},
    stats::PinnedStats,
};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/ssdp-filter"));
const FEATURE_BATCH_WAIT: Duration = Duration::from_millis(500);

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/ssdp_filter";

/// Where `attach` pins each map, and where the other commands find them.
#[derive(Clone, Debug)]
pub struct MapPins {
    pub blocklist: PathBuf,
    pub stats: PathBuf,
    pub features: PathBuf,
    pub config: PathBuf,
}

impl MapPins {
    pub fn under(dir: &Path) -> Self {
        Self {
            blocklist: dir.join(MAP_BLOCKLIST),
            stats: dir.join(MAP_STATS),
            features: dir.join(MAP_FEATURES),
            config: dir.join(MAP_CONFIG),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub xdp_mode: XdpMode,
    pub pins: MapPins,
    pub settings: FilterSettings,
    pub seed: Option<PathBuf>,
    pub feature_log: Option<PathBuf>,
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    opts.settings.validate()?;
    let seed = SeedList::from_option(opts.seed.as_deref())?;

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // `set_max_entries` is currently the only stable API across our Aya pin.
        loader.set_max_entries(MAP_BLOCKLIST, opts.settings.blocklist_capacity);
        loader.set_max_entries(MAP_FEATURES, opts.settings.ring_bytes());
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    if let Err(err) = EbpfLogger::init(&mut bpf) {
        warn!("failed to initialise eBPF logger: {err}");
    }

    write_filter_config(&mut bpf, opts.settings.filter_config())?;

    pin_map(&mut bpf, MAP_BLOCKLIST, &opts.pins.blocklist)?;
    pin_map(&mut bpf, MAP_STATS, &opts.pins.stats)?;
    pin_map(&mut bpf, MAP_CONFIG, &opts.pins.config)?;
    pin_map(&mut bpf, MAP_FEATURES, &opts.pins.features)?;

    let blocklist = Arc::new(
        PinnedBlocklist::open(&opts.pins.blocklist).context("failed to reopen blocklist pin")?,
    );
    if !seed.is_empty() {
        let outcome = seed.apply(blocklist.as_ref())?;
        info!(
            "seeded {} blocklist entries ({} rejected, table full)",
            outcome.applied, outcome.rejected
        );
    }

    let features = take_feature_stream(&mut bpf)?;

    let link = attach_xdp(&mut bpf, &opts.iface, opts.xdp_mode)?;
    info!(
        "attached {XDP_PROGRAM} to {} ({:?} mode), port {}, blocklist capacity {}",
        opts.iface,
        opts.xdp_mode,
        opts.settings.ssdp_port,
        opts.settings.blocklist_capacity
    );
    println!(
        "Attached {XDP_PROGRAM} to {}. Press Ctrl+C to detach.",
        opts.iface
    );

    let running = Arc::new(AtomicBool::new(true));
    let sweeper = tokio::spawn(run_sweeper(
        blocklist,
        ThresholdPolicy::from_settings(&opts.settings),
        opts.settings.sweep_interval(),
        running.clone(),
    ));
    let reporter = spawn_reporter(
        opts.pins.stats.clone(),
        opts.settings.report_interval(),
        running.clone(),
    );
    let drain = match (opts.settings.export_enabled, features) {
        (true, Some(stream)) => {
            let log = FeatureLog::from_option(opts.feature_log.as_deref())?;
            Some(tokio::spawn(drain_features(stream, log, running.clone())))
        }
        _ => None,
    };

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    println!("Detaching {XDP_PROGRAM} from {}...", opts.iface);
    running.store(false, Ordering::Relaxed);

    sweeper.abort();
    reporter.abort();
    if let Some(drain) = drain {
        drain.abort();
        let _ = drain.await;
    }
    let _ = sweeper.await;
    let _ = reporter.await;

    detach(&mut bpf, link)?;
    Ok(())
}

/// Counters summed across CPUs from the pinned statistics map.
pub fn read_stats(pins: &MapPins, reset: bool) -> Result<StatsRecord> {
    let mut stats = PinnedStats::open(&pins.stats)
        .context("statistics map not pinned; is `ssdp-filter attach` running?")?;
    let snapshot = stats.snapshot()?;
    if reset {
        stats.reset()?;
    }
    Ok(snapshot)
}

pub fn open_blocklist(pins: &MapPins) -> Result<PinnedBlocklist> {
    PinnedBlocklist::open(&pins.blocklist)
        .context("blocklist map not pinned; is `ssdp-filter attach` running?")
}

fn write_filter_config(bpf: &mut Ebpf, cfg: FilterConfig) -> Result<()> {
    let map = bpf
        .map_mut(MAP_CONFIG)
        .with_context(|| format!("map {MAP_CONFIG} not found"))?;
    let mut array =
        Array::<_, FilterConfig>::try_from(map).context("config map has unexpected type")?;
    array
        .set(CONFIG_SLOT_RUNTIME, cfg, 0)
        .with_context(|| "failed to write filter config")?;
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            // A pin left by an earlier run points at a map this program no
            // longer uses.
            warn!("replacing stale pin {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale pin {}", path.display()))?;
            map.pin(path)
                .map_err(|err| anyhow!("failed to pin map {map_name} at {}: {err}", path.display()))
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

fn take_feature_stream(bpf: &mut Ebpf) -> Result<Option<KernelFeatureStream>> {
    let map = bpf
        .take_map(MAP_FEATURES)
        .ok_or(ControlError::MissingMap(MAP_FEATURES))?;
    let ring = RingBuf::try_from(map).context("feature map has unexpected type")?;
    match KernelFeatureStream::new(ring) {
        Ok(stream) => Ok(Some(stream)),
        Err(err) => {
            warn!("feature export unavailable: {err}");
            Ok(None)
        }
    }
}

fn spawn_reporter(path: PathBuf, every: Duration, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        loop {
            ticker.tick().await;
            if !running.load(Ordering::Relaxed) {
                break;
            }
            match PinnedStats::open(&path).and_then(|stats| stats.snapshot()) {
                Ok(s) => info!(
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
                ),
                Err(err) => warn!("failed to read statistics: {err}"),
            }
        }
    })
}

async fn drain_features(
    mut stream: KernelFeatureStream,
    mut log: FeatureLog,
    running: Arc<AtomicBool>,
) {
    let mut batch = Vec::new();
    while running.load(Ordering::Relaxed) {
        batch.clear();
        match stream.wait_and_poll(&mut batch, FEATURE_BATCH_WAIT).await {
            Ok(0) => continue,
            Ok(_) => {
                if let Err(err) = log.write_all(&batch) {
                    warn!("feature log: {err:#}");
                }
            }
            Err(err) => {
                warn!("feature stream failed: {err}");
                break;
            }
        }
    }
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let flags = xdp_flags(mode);
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, flags)
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn detach(bpf: &mut Ebpf, link: XdpLinkId) -> Result<()> {
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.detach(link).context("failed to detach xdp program")
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_named_after_maps() {
        let pins = MapPins::under(Path::new(DEFAULT_PIN_DIR));
        assert_eq!(
            pins.blocklist,
            PathBuf::from("/sys/fs/bpf/ssdp_filter/ssdp_blocklist")
        );
        assert_eq!(pins.stats, PathBuf::from("/sys/fs/bpf/ssdp_filter/ssdp_stats"));
        assert_eq!(
            pins.features,
            PathBuf::from("/sys/fs/bpf/ssdp_filter/ssdp_features")
        );
        assert_eq!(pins.config, PathBuf::from("/sys/fs/bpf/ssdp_filter/ssdp_config"));
    }

    #[test]
    fn xdp_modes_map_to_flags() {
        assert_eq!(xdp_flags(XdpMode::Skb).bits(), XdpFlags::SKB_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Driver).bits(), XdpFlags::DRV_MODE.bits());
        assert_eq!(xdp_flags(XdpMode::Hw).bits(), XdpFlags::HW_MODE.bits());
    }

    #[test]
    fn missing_pins_are_reported() {
        let pins = MapPins::under(Path::new("/nonexistent/ssdp_filter_test"));
        let err = read_stats(&pins, false).unwrap_err();
        assert!(format!("{err:#}").contains("not pinned"));
        assert!(open_blocklist(&pins).is_err());
    }
}
