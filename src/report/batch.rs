//! The capture-worker side of the fabric: batching IP updates toward shards.
//!
//! Each capture worker owns one [`WorkerBatcher`] holding one batch slot per
//! shard. A packet becomes two update entries (source leg, destination leg)
//! routed by the shard hash of each address; entries accumulate into
//! fixed-size batches that are pushed onto the shard's bounded ingress
//! queue. Every message carries a per-(worker, shard) sequence number so
//! the consumer can account for loss.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::{debug, warn};

use super::metrics::MetricTag;
use super::policy::{ReportPolicy, MAX_TAGS_PER_PACKET};
use super::{TagRecord, WorkerId};

/// The number of IP updates carried by a full batch.
pub const REPORT_BATCH_SIZE: usize = 10_000;

/// Enqueue stalls longer than this are logged as backpressure events.
const SLOW_ENQUEUE: Duration = Duration::from_millis(100);

/// One observation of an address within a packet.
#[derive(Debug, Clone)]
pub(crate) struct IpUpdate {
    /// The observed address.
    pub ip: u32,
    /// Whether the address was the packet's source.
    pub is_src: bool,
    /// Origin ASN of the source address; 0 on the destination leg.
    pub src_asn: u32,
    /// IP-layer bytes on the source leg; 0 on the destination leg so the
    /// packet is never tallied twice.
    pub bytes: u32,
    /// The metric cells this observation accrues to; first is `Combined`.
    pub tags: Vec<MetricTag>,
}

/// A batch of updates from one capture worker to one shard.
#[derive(Debug)]
pub(crate) struct UpdateBatch {
    pub sender: WorkerId,
    pub seq: u32,
    pub updates: Vec<IpUpdate>,
}

/// Messages understood by a shard tally worker.
#[derive(Debug)]
pub(crate) enum TrackerMsg {
    /// A batch of IP + tag observations.
    Update(UpdateBatch),
    /// A capture worker has finished the interval starting at this
    /// timestamp.
    IntervalEnd {
        sender: WorkerId,
        seq: u32,
        interval_ts: u32,
    },
    /// Begin shutting down once outstanding intervals allow it.
    Halt,
}

/// Routes an address to its shard.
///
/// Must depend only on the address so both legs of every capture worker
/// agree; the suffix octet is already decorrelated from flow direction by
/// capture-side RSS.
#[must_use]
pub fn shard_for_ip(ip: u32, shard_count: usize) -> usize {
    (ip >> 24) as usize % shard_count.max(1)
}

struct BatchSlot {
    tx: Sender<TrackerMsg>,
    seq: u32,
    pending: Vec<IpUpdate>,
    queue_blocks: u64,
}

impl BatchSlot {
    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn send(&mut self, worker: WorkerId, shard: usize, msg: TrackerMsg) {
        if self.tx.is_full() {
            // Intended backpressure path: block until the tally worker
            // catches up, but make long stalls visible.
            self.queue_blocks += 1;
            let start = Instant::now();
            if self.tx.send(msg).is_err() {
                debug!(worker, shard, "shard queue closed, dropping message");
                return;
            }
            let stalled = start.elapsed();
            if stalled >= SLOW_ENQUEUE {
                warn!(worker, shard, ?stalled, "shard queue backpressure");
            }
        } else if self.tx.send(msg).is_err() {
            debug!(worker, shard, "shard queue closed, dropping message");
        }
    }
}

/// Per-capture-worker front end of the aggregation fabric.
///
/// Not `Sync`: each capture worker owns exactly one batcher and calls it
/// from its own thread.
pub struct WorkerBatcher {
    worker: WorkerId,
    policy: Arc<ReportPolicy>,
    slots: Vec<BatchSlot>,
    scratch: Vec<MetricTag>,
}

impl WorkerBatcher {
    pub(crate) fn new(
        worker: WorkerId,
        policy: Arc<ReportPolicy>,
        shard_txs: Vec<Sender<TrackerMsg>>,
    ) -> Self {
        Self {
            worker,
            policy,
            slots: shard_txs
                .into_iter()
                .map(|tx| BatchSlot {
                    tx,
                    seq: 0,
                    pending: Vec::new(),
                    queue_blocks: 0,
                })
                .collect(),
            scratch: Vec::with_capacity(MAX_TAGS_PER_PACKET),
        }
    }

    /// The capture worker this batcher belongs to.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Total number of flushes that found a shard queue full.
    #[must_use]
    pub fn queue_blocks(&self) -> u64 {
        self.slots.iter().map(|slot| slot.queue_blocks).sum()
    }

    /// Converts a tagged packet into its two update entries and enqueues
    /// them toward the owning shards.
    ///
    /// May block on a full shard queue; this is the intended backpressure
    /// path and no packet is ever silently dropped here.
    pub fn observe_packet(&mut self, rec: &TagRecord) {
        let mut tags = mem::take(&mut self.scratch);
        self.policy.build_tag_list(rec, &mut tags);

        self.enqueue(IpUpdate {
            ip: rec.src_ip,
            is_src: true,
            src_asn: rec.src_asn,
            bytes: rec.bytes,
            tags: tags.clone(),
        });
        // The destination leg shares the tag list but carries no bytes and
        // no source ASN.
        self.enqueue(IpUpdate {
            ip: rec.dst_ip,
            is_src: false,
            src_asn: 0,
            bytes: 0,
            tags: tags.clone(),
        });

        tags.clear();
        self.scratch = tags;
    }

    fn enqueue(&mut self, update: IpUpdate) {
        let shard = shard_for_ip(update.ip, self.slots.len());
        let saturated_tags = update.tags.len() >= MAX_TAGS_PER_PACKET;
        self.slots[shard].pending.push(update);
        if self.slots[shard].pending.len() >= REPORT_BATCH_SIZE || saturated_tags {
            self.flush_shard(shard);
        }
    }

    /// Flushes every partially-filled batch.
    pub fn flush(&mut self) {
        for shard in 0..self.slots.len() {
            self.flush_shard(shard);
        }
    }

    /// Flushes all pending batches and announces end-of-interval for the
    /// interval starting at `interval_ts` to every shard, once each.
    pub fn end_interval(&mut self, interval_ts: u32) {
        for shard in 0..self.slots.len() {
            self.flush_shard(shard);
            let slot = &mut self.slots[shard];
            let seq = slot.next_seq();
            let msg = TrackerMsg::IntervalEnd {
                sender: self.worker,
                seq,
                interval_ts,
            };
            self.slots[shard].send(self.worker, shard, msg);
        }
    }

    fn flush_shard(&mut self, shard: usize) {
        let slot = &mut self.slots[shard];
        if slot.pending.is_empty() {
            return;
        }
        let updates = mem::take(&mut slot.pending);
        let seq = slot.next_seq();
        let msg = TrackerMsg::Update(UpdateBatch {
            sender: self.worker,
            seq,
            updates,
        });
        slot.send(self.worker, shard, msg);
    }
}
