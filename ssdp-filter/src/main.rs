use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::info;
use serde::Serialize;

use ssdp_filter_common::BlocklistEntry;

mod clock;
mod config;
mod control;
mod ebpf_loader;
mod export;
mod filter;
mod model;
mod node;
mod policy;
mod stats;
mod store;

use crate::config::FilterSettings;
use crate::control::BlocklistControl;
use crate::ebpf_loader::{DEFAULT_PIN_DIR, MapPins, XdpMode};

#[derive(Parser)]
#[command(name = "ssdp-filter")]
#[command(about = "XDP filter for SSDP reflection traffic", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the XDP program, attach it and run until Ctrl+C
    Attach(AttachCommand),
    /// Print counters from a running filter as JSON
    Stats(StatsCommand),
    /// Inspect or change the blocklist of a running filter
    Blocklist(BlocklistCommand),
    /// Run the filter in-process over an AF_PACKET socket (advisory verdicts)
    Node(NodeCommand),
}

#[derive(Args)]
struct PinArgs {
    /// bpffs directory holding the pinned maps
    #[arg(long, value_name = "DIR", default_value = DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

impl PinArgs {
    fn pins(&self) -> MapPins {
        MapPins::under(&self.pin_dir)
    }
}

#[derive(Args)]
struct AttachCommand {
    /// Network interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
    /// TOML settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(flatten)]
    pins: PinArgs,
    /// Addresses to preload into the blocklist
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,
    /// Write exported feature records to FILE as NDJSON
    #[arg(long, value_name = "FILE")]
    feature_log: Option<PathBuf>,
}

#[derive(Args)]
struct StatsCommand {
    #[command(flatten)]
    pins: PinArgs,
    /// Zero the counters after reading them
    #[arg(long)]
    reset: bool,
}

#[derive(Args)]
struct BlocklistCommand {
    #[command(flatten)]
    pins: PinArgs,
    #[command(subcommand)]
    action: BlocklistAction,
}

#[derive(Subcommand)]
enum BlocklistAction {
    /// Print every entry as JSON
    List,
    /// Block an address, creating its entry if needed
    Block { addr: Ipv4Addr },
    /// Clear the blocked flag of an address
    Unblock { addr: Ipv4Addr },
    /// Remove an address
    Evict { addr: Ipv4Addr },
    /// Remove the COUNT least recently seen entries
    EvictOldest { count: usize },
    /// Apply a seed file
    Load { file: PathBuf },
}

#[derive(Args)]
struct NodeCommand {
    /// Network interface to join via AF_PACKET
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Number of worker threads pulling frames from the fanout group
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Optional PACKET_FANOUT group id
    #[arg(long, value_name = "GROUP")]
    fanout_group: Option<u16>,
    /// TOML settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Addresses to preload into the blocklist
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,
    /// Write exported feature records to FILE as NDJSON
    #[arg(long, value_name = "FILE")]
    feature_log: Option<PathBuf>,
    /// Size of each tpacket block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks provisioned for the RX ring
    #[arg(long, value_name = "COUNT", default_value_t = node::DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// Size of each frame within a block (bytes)
    #[arg(long, value_name = "BYTES", default_value_t = node::DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    /// Milliseconds before an idle block is recycled
    #[arg(long, value_name = "MILLIS", default_value_t = node::DEFAULT_BLOCK_TIMEOUT_MS)]
    block_timeout_ms: u32,
}

#[derive(Serialize)]
struct EntryRow {
    addr: Ipv4Addr,
    #[serde(flatten)]
    entry: BlocklistEntry,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("ssdp-filter error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                xdp_mode: cmd.xdp_mode,
                pins: cmd.pins.pins(),
                settings: FilterSettings::from_option(cmd.config.as_deref())?,
                seed: cmd.seed,
                feature_log: cmd.feature_log,
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Stats(cmd)) => {
            let snapshot = ebpf_loader::read_stats(&cmd.pins.pins(), cmd.reset)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Some(Commands::Blocklist(cmd)) => {
            let blocklist = ebpf_loader::open_blocklist(&cmd.pins.pins())?;
            run_blocklist_action(&blocklist, cmd.action)?;
        }
        Some(Commands::Node(cmd)) => {
            let opts = node::NodeOptions {
                iface: cmd.iface,
                workers: cmd.workers,
                fanout_group: cmd.fanout_group,
                ring: node::RingConfig {
                    block_size: cmd.block_size,
                    block_count: cmd.block_count,
                    frame_size: cmd.frame_size,
                    block_timeout_ms: cmd.block_timeout_ms,
                },
                settings: FilterSettings::from_option(cmd.config.as_deref())?,
                seed: cmd.seed,
                feature_log: cmd.feature_log,
            };
            node::run_shadow_pipeline(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn run_blocklist_action<C>(blocklist: &C, action: BlocklistAction) -> Result<()>
where
    C: BlocklistControl + ?Sized,
{
    match action {
        BlocklistAction::List => {
            let mut rows: Vec<EntryRow> = blocklist
                .enumerate()?
                .into_iter()
                .map(|(addr, entry)| EntryRow { addr, entry })
                .collect();
            rows.sort_by_key(|row| row.addr);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        BlocklistAction::Block { addr } => {
            blocklist
                .insert_or_update(addr, true)
                .with_context(|| format!("failed to block {addr}"))?;
            info!("blocked {addr}");
        }
        BlocklistAction::Unblock { addr } => {
            if blocklist.set_blocked(addr, false)? {
                info!("unblocked {addr}");
            } else {
                println!("{addr} has no entry");
            }
        }
        BlocklistAction::Evict { addr } => {
            if blocklist.evict(addr)? {
                info!("evicted {addr}");
            } else {
                println!("{addr} has no entry");
            }
        }
        BlocklistAction::EvictOldest { count } => {
            let evicted = blocklist.evict_oldest(count)?;
            info!("evicted {evicted} entries");
        }
        BlocklistAction::Load { file } => load_seed(blocklist, &file)?,
    }
    Ok(())
}

fn load_seed<C>(blocklist: &C, file: &Path) -> Result<()>
where
    C: BlocklistControl + ?Sized,
{
    let seed = model::SeedList::from_path(file)?;
    let outcome = seed.apply(blocklist)?;
    info!(
        "applied {} of {} seed entries from {} ({} rejected, table full)",
        outcome.applied,
        seed.len(),
        file.display(),
        outcome.rejected
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssdp_filter_common::BlocklistStore;

    use crate::store::BlocklistTable;

    #[test]
    fn cli_parses_subcommands() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "ssdp-filter",
            "blocklist",
            "--pin-dir",
            "/tmp/pins",
            "block",
            "10.0.0.5",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Blocklist(cmd)) => {
                assert_eq!(cmd.pins.pin_dir, PathBuf::from("/tmp/pins"));
                assert!(matches!(
                    cmd.action,
                    BlocklistAction::Block { addr } if addr == Ipv4Addr::new(10, 0, 0, 5)
                ));
            }
            _ => panic!("expected blocklist command"),
        }

        let cli = Cli::try_parse_from(["ssdp-filter", "attach", "--iface", "eth0"]).unwrap();
        match cli.command {
            Some(Commands::Attach(cmd)) => {
                assert_eq!(cmd.xdp_mode, XdpMode::Skb);
                assert_eq!(cmd.pins.pin_dir, PathBuf::from(DEFAULT_PIN_DIR));
            }
            _ => panic!("expected attach command"),
        }

        assert!(Cli::try_parse_from(["ssdp-filter", "blocklist", "block", "::1"]).is_err());
    }

    #[test]
    fn blocklist_actions_drive_control_interface() {
        let table = BlocklistTable::new(8);
        let a = Ipv4Addr::new(10, 0, 0, 5);

        run_blocklist_action(&table, BlocklistAction::Block { addr: a }).unwrap();
        assert!(table.lookup(u32::from(a)).unwrap().is_blocked());

        run_blocklist_action(&table, BlocklistAction::Unblock { addr: a }).unwrap();
        assert!(!table.lookup(u32::from(a)).unwrap().is_blocked());

        run_blocklist_action(&table, BlocklistAction::List).unwrap();

        run_blocklist_action(&table, BlocklistAction::Evict { addr: a }).unwrap();
        assert!(table.lookup(u32::from(a)).is_none());

        run_blocklist_action(&table, BlocklistAction::EvictOldest { count: 3 }).unwrap();
    }

    #[test]
    fn entry_rows_flatten_entry_fields() {
        let row = EntryRow {
            addr: Ipv4Addr::new(10, 0, 0, 5),
            entry: BlocklistEntry::first_hit(7),
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["addr"], "10.0.0.5");
        assert_eq!(json["hit_count"], 1);
        assert_eq!(json["last_seen"], 7);
        assert_eq!(json["blocked"], 0);
        assert!(json.get("pad").is_none());
    }
}
