use std::{
    fs::File,
    io::{BufRead, BufReader},
    net::{IpAddr, Ipv4Addr},
    path::Path,
};

use anyhow::{Context, Result, anyhow};

use crate::control::{BlocklistControl, ControlError};

// Largest CIDR block a seed line may expand to.
const MIN_SEED_PREFIX: u8 = 16;

/// Addresses to preload into a blocklist, one entry per line:
///
/// ```text
/// 203.0.113.7            # blocked
/// 198.51.100.0/30 observe
/// ```
///
/// `block` is the default action. `#` starts a comment.
#[derive(Debug, Default)]
pub struct SeedList {
    entries: Vec<SeedEntry>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SeedEntry {
    pub addr: Ipv4Addr,
    pub blocked: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SeedOutcome {
    pub applied: usize,
    pub rejected: usize,
}

impl SeedList {
    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open seed list at {}", path.display()))?;
        Self::from_reader(BufReader::new(file), &path.display().to_string())
    }

    pub fn from_reader<R: BufRead>(reader: R, label: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("failed to read line {} of {label}", line_no + 1))?;
            let trimmed = line.split('#').next().unwrap_or("").trim();
            if trimmed.is_empty() {
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let target = fields.next().unwrap_or_default();
            let blocked = match fields.next() {
                None | Some("block") => true,
                Some("observe") => false,
                Some(other) => {
                    return Err(anyhow!(
                        "unknown action '{other}' on line {} of {label}",
                        line_no + 1
                    ));
                }
            };
            if let Some(extra) = fields.next() {
                return Err(anyhow!(
                    "unexpected '{extra}' on line {} of {label}",
                    line_no + 1
                ));
            }

            let (addr_part, prefix) = match target.split_once('/') {
                Some((addr, prefix)) => {
                    let prefix: u8 = prefix.parse().with_context(|| {
                        format!("invalid prefix '{prefix}' on line {} of {label}", line_no + 1)
                    })?;
                    (addr, prefix)
                }
                None => (target, 32),
            };
            let addr = match addr_part.parse::<IpAddr>().with_context(|| {
                format!(
                    "invalid IP address '{addr_part}' on line {} of {label}",
                    line_no + 1
                )
            })? {
                IpAddr::V4(addr) => addr,
                IpAddr::V6(_) => {
                    return Err(anyhow!(
                        "IPv6 address '{addr_part}' on line {} of {label} is not supported",
                        line_no + 1
                    ));
                }
            };
            if !(MIN_SEED_PREFIX..=32).contains(&prefix) {
                return Err(anyhow!(
                    "prefix /{prefix} on line {} of {label} must be between /{MIN_SEED_PREFIX} and /32",
                    line_no + 1
                ));
            }

            let mask = ipv4_mask(prefix);
            let network = u32::from(addr) & mask;
            let hosts = !mask;
            for offset in 0..=hosts {
                entries.push(SeedEntry {
                    addr: Ipv4Addr::from(network | offset),
                    blocked,
                });
            }
        }

        Ok(Self { entries })
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[SeedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert every entry. Entries that do not fit are counted, not fatal;
    /// any other control error aborts.
    pub fn apply<C>(&self, control: &C) -> Result<SeedOutcome, ControlError>
    where
        C: BlocklistControl + ?Sized,
    {
        let mut outcome = SeedOutcome::default();
        for entry in &self.entries {
            match control.insert_or_update(entry.addr, entry.blocked) {
                Ok(()) => outcome.applied += 1,
                Err(ControlError::CapacityExceeded) => outcome.rejected += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }
}

fn ipv4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use ssdp_filter_common::BlocklistStore;

    use crate::store::BlocklistTable;

    fn parse(text: &str) -> Result<SeedList> {
        SeedList::from_reader(Cursor::new(text), "test")
    }

    #[test]
    fn parses_addresses_actions_and_comments() {
        let list = parse(
            "# reflectors\n\
             203.0.113.7\n\
             \n\
             198.51.100.9 observe   # watch only\n\
             192.0.2.1 block\n",
        )
        .unwrap();
        assert_eq!(
            list.entries(),
            &[
                SeedEntry {
                    addr: Ipv4Addr::new(203, 0, 113, 7),
                    blocked: true
                },
                SeedEntry {
                    addr: Ipv4Addr::new(198, 51, 100, 9),
                    blocked: false
                },
                SeedEntry {
                    addr: Ipv4Addr::new(192, 0, 2, 1),
                    blocked: true
                },
            ]
        );
    }

    #[test]
    fn cidr_expands_to_every_host() {
        let list = parse("198.51.100.0/30\n").unwrap();
        let addrs: Vec<_> = list.entries().iter().map(|e| e.addr).collect();
        assert_eq!(
            addrs,
            (0..4)
                .map(|n| Ipv4Addr::new(198, 51, 100, n))
                .collect::<Vec<_>>()
        );

        // Host bits are masked off before expansion.
        let list = parse("198.51.100.5/30\n").unwrap();
        let addrs: Vec<_> = list.entries().iter().map(|e| e.addr).collect();
        assert_eq!(
            addrs,
            (4..8)
                .map(|n| Ipv4Addr::new(198, 51, 100, n))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn rejects_bad_lines() {
        let err = parse("10.0.0.1\nnot-an-ip\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        assert!(parse("2001:db8::1\n").is_err());
        assert!(parse("10.0.0.0/8\n").is_err());
        assert!(parse("10.0.0.0/33\n").is_err());
        assert!(parse("10.0.0.1 drop\n").is_err());
        assert!(parse("10.0.0.1 block extra\n").is_err());
    }

    #[test]
    fn apply_counts_capacity_rejections() {
        let list = parse("10.0.0.0/30\n").unwrap();
        let table = BlocklistTable::new(3);
        let outcome = list.apply(&table).unwrap();
        assert_eq!(
            outcome,
            SeedOutcome {
                applied: 3,
                rejected: 1
            }
        );
        let entry = table.lookup(u32::from(Ipv4Addr::new(10, 0, 0, 0))).unwrap();
        assert!(entry.is_blocked());
        assert_eq!(entry.hit_count, 0);
    }
}
