//! Feature record channels.
//!
//! `FeatureRing` is the in-process channel used by the shadow pipeline.
//! `KernelFeatureStream` drains the ring buffer map the XDP program writes.
//! Both hand `FeatureRecord`s to a single consumer; producers never wait.

use std::{
    fs::File,
    io::{BufWriter, Write},
    mem,
    net::Ipv4Addr,
    path::Path,
    ptr,
    time::Duration,
};

use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use crossbeam::queue::ArrayQueue;
use log::trace;
use serde::Serialize;
use tokio::{io::unix::AsyncFd, sync::Notify, time};

use ssdp_filter_common::{ExportFull, FeatureRecord, FeatureSink, Reason, Verdict};

use crate::control::ControlError;

pub struct FeatureRing {
    queue: ArrayQueue<FeatureRecord>,
    // Wakes the consumer parked in `wait_and_poll`; holds one permit when
    // nobody is waiting.
    ready: Notify,
}

impl FeatureRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Next record if one is queued.
    pub fn poll(&self) -> Option<FeatureRecord> {
        self.queue.pop()
    }

    /// Drain up to `max` queued records into `out`.
    pub fn poll_batch(&self, out: &mut Vec<FeatureRecord>, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.queue.pop() {
                Some(record) => {
                    out.push(record);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Wait up to `timeout` for a record. `None` on timeout.
    pub async fn wait_and_poll(&self, timeout: Duration) -> Option<FeatureRecord> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.queue.pop() {
                return Some(record);
            }
            // A stale permit only costs one extra empty pass.
            if time::timeout_at(deadline, self.ready.notified()).await.is_err() {
                return self.queue.pop();
            }
        }
    }
}

impl FeatureSink for FeatureRing {
    fn publish(&self, record: &FeatureRecord) -> Result<(), ExportFull> {
        self.queue.push(*record).map_err(|_| ExportFull)?;
        self.ready.notify_one();
        Ok(())
    }
}

/// Consumer side of the kernel `ssdp_features` ring buffer.
pub struct KernelFeatureStream {
    ring: AsyncFd<RingBuf<MapData>>,
}

impl KernelFeatureStream {
    pub fn new(ring: RingBuf<MapData>) -> Result<Self, ControlError> {
        Ok(Self {
            ring: AsyncFd::new(ring)?,
        })
    }

    /// Records already in the ring, without waiting.
    pub fn poll(&mut self, out: &mut Vec<FeatureRecord>) -> usize {
        drain_ring(self.ring.get_mut(), out)
    }

    /// Wait for the ring to become readable, then drain it. Returns 0 on
    /// timeout.
    pub async fn wait_and_poll(
        &mut self,
        out: &mut Vec<FeatureRecord>,
        timeout: Duration,
    ) -> Result<usize, ControlError> {
        let taken = self.poll(out);
        if taken > 0 {
            return Ok(taken);
        }
        let mut guard = match time::timeout(timeout, self.ring.readable_mut()).await {
            Ok(guard) => guard?,
            Err(_elapsed) => return Ok(0),
        };
        let taken = drain_ring(guard.get_inner_mut(), out);
        guard.clear_ready();
        Ok(taken)
    }
}

fn drain_ring(ring: &mut RingBuf<MapData>, out: &mut Vec<FeatureRecord>) -> usize {
    let mut taken = 0;
    while let Some(item) = ring.next() {
        if let Some(record) = decode_record(&item) {
            out.push(record);
            taken += 1;
        }
    }
    taken
}

fn decode_record(bytes: &[u8]) -> Option<FeatureRecord> {
    if bytes.len() < mem::size_of::<FeatureRecord>() {
        return None;
    }
    // SAFETY: length checked above; FeatureRecord is plain old data.
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const FeatureRecord) })
}

/// One feature record as written to the NDJSON feature log.
#[derive(Debug, Serialize)]
pub struct FeatureLine {
    pub timestamp_ns: u64,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_len: u32,
    pub udp_len: u16,
    pub protocol: u8,
    pub verdict: Verdict,
    pub reason: Option<Reason>,
    pub hit_count: u64,
}

impl From<&FeatureRecord> for FeatureLine {
    fn from(record: &FeatureRecord) -> Self {
        Self {
            timestamp_ns: record.timestamp_ns,
            src: Ipv4Addr::from(record.src_addr),
            dst: Ipv4Addr::from(record.dst_addr),
            src_port: record.src_port,
            dst_port: record.dst_port,
            packet_len: record.packet_len,
            udp_len: record.udp_len,
            protocol: record.protocol,
            verdict: record.verdict(),
            reason: record.reason(),
            hit_count: record.hit_count,
        }
    }
}

/// Where drained records go: an NDJSON file, or the trace log.
pub enum FeatureLog {
    File(BufWriter<File>),
    Trace,
}

impl FeatureLog {
    pub fn from_option(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let file = File::create(path).with_context(|| {
                    format!("failed to create feature log at {}", path.display())
                })?;
                Ok(Self::File(BufWriter::new(file)))
            }
            None => Ok(Self::Trace),
        }
    }

    pub fn write_all(&mut self, records: &[FeatureRecord]) -> Result<()> {
        match self {
            Self::File(writer) => {
                for record in records {
                    serde_json::to_writer(&mut *writer, &FeatureLine::from(record))
                        .context("failed to encode feature record")?;
                    writer
                        .write_all(b"\n")
                        .context("failed to write feature log")?;
                }
                writer.flush().context("failed to flush feature log")?;
            }
            Self::Trace => {
                for record in records {
                    trace!("feature {:?}", FeatureLine::from(record));
                }
            }
        }
        Ok(())
    }
}
