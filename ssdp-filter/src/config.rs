use std::{fs, mem, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use ssdp_filter_common::{
    DEFAULT_BLOCKLIST_CAPACITY, FeatureRecord, FilterConfig, SSDP_PORT,
};

const PAGE_SIZE: u32 = 4096;
// Per-record ring buffer header (struct bpf_ringbuf_hdr).
const RINGBUF_RECORD_HEADER: u32 = 8;

/// Runtime settings, loaded from an optional TOML file. Every key is
/// optional; missing keys take the defaults below.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    pub ssdp_port: u16,
    pub blocklist_capacity: u32,
    pub export_capacity: u32,
    pub export_enabled: bool,
    /// Sweeper promotes an entry once `hit_count` reaches this value.
    /// Unset means never promote automatically.
    pub block_threshold: Option<u64>,
    /// Unblocked entries idle longer than this are evicted. 0 disables aging.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub report_interval_secs: u64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            ssdp_port: SSDP_PORT,
            blocklist_capacity: DEFAULT_BLOCKLIST_CAPACITY,
            export_capacity: 4096,
            export_enabled: true,
            block_threshold: None,
            idle_timeout_secs: 600,
            sweep_interval_secs: 5,
            report_interval_secs: 10,
        }
    }
}

impl FilterSettings {
    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let settings = Self::from_toml(&raw)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).context("failed to parse TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.ssdp_port != 0, "ssdp_port must be non-zero");
        ensure!(
            self.blocklist_capacity > 0,
            "blocklist_capacity must be greater than zero"
        );
        ensure!(
            self.export_capacity > 0,
            "export_capacity must be greater than zero"
        );
        ensure!(
            self.sweep_interval_secs > 0,
            "sweep_interval_secs must be greater than zero"
        );
        ensure!(
            self.report_interval_secs > 0,
            "report_interval_secs must be greater than zero"
        );
        if let Some(threshold) = self.block_threshold {
            ensure!(threshold > 0, "block_threshold must be greater than zero");
        }
        ensure!(
            self.export_capacity <= (1 << 24),
            "export_capacity {} is too large",
            self.export_capacity
        );
        Ok(())
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig::new(self.ssdp_port, self.export_enabled)
    }

    /// Kernel ring buffer size holding at least `export_capacity` records:
    /// a power of two and a multiple of the page size.
    pub fn ring_bytes(&self) -> u32 {
        let record = mem::size_of::<FeatureRecord>() as u32 + RINGBUF_RECORD_HEADER;
        let wanted = self.export_capacity.saturating_mul(record);
        wanted.max(PAGE_SIZE).next_power_of_two()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}
