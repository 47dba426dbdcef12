//! Shard tally workers.
//!
//! Each worker owns one partition of the IPv4 address space and maintains,
//! for the interval in progress, a map of observed addresses and a map of
//! per-metric tallies. Capture workers advance independently, so the worker
//! keeps a *current* and a *next* interval map pair: once a producer has
//! announced end-of-interval, its further updates land in the next pair.
//! When every producer has announced, the current pair is sealed and its
//! tallies published for the merge collector under a mutex.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::batch::{IpUpdate, TrackerMsg, UpdateBatch};
use super::metrics::MetricId;
use super::policy::{IpCountMethod, IpCountPolicy};
use super::WorkerId;

/// Queue poll timeout; keeps halt responsive without burning CPU.
const RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// Most addresses see only a handful of metrics, so per-IP metric presence
/// starts in a fixed array and spills into a hash map beyond this size.
const METRIC_ARRAY_SIZE: usize = 16;

const SEEN_AS_SOURCE: u8 = 0x01;
const SEEN_AS_DEST: u8 = 0x02;

/// The per-interval tally for a single metric cell on one shard.
#[derive(Debug, Default, Clone)]
pub(crate) struct MetricTally {
    /// Packets tagged with this cell.
    pub packets: u64,
    /// IP-layer bytes in packets tagged with this cell.
    pub bytes: u64,
    /// Unique source addresses, counted on first sighting.
    pub src_ips: u32,
    /// Unique destination addresses, counted on first sighting.
    pub dst_ips: u32,
    /// Unique source ASNs; maintained for geo cells, merged by union.
    pub src_asns: HashSet<u32>,
}

/// Per-address record of which metrics have seen it, and in which role.
#[derive(Debug)]
struct IpEntry {
    first: [(MetricId, u8); METRIC_ARRAY_SIZE],
    used: u8,
    spill: Option<Box<HashMap<MetricId, u8>>>,
}

impl IpEntry {
    fn new() -> Self {
        Self {
            first: [(MetricId::COMBINED, 0); METRIC_ARRAY_SIZE],
            used: 0,
            spill: None,
        }
    }

    /// Marks the (metric, role) pair as seen; returns true on the first
    /// sighting of that pair for this address.
    fn mark(&mut self, id: MetricId, is_src: bool) -> bool {
        let bit = if is_src { SEEN_AS_SOURCE } else { SEEN_AS_DEST };

        if let Some(map) = self.spill.as_mut() {
            let flags = map.entry(id).or_insert(0);
            if *flags & bit != 0 {
                return false;
            }
            *flags |= bit;
            return true;
        }

        let used = usize::from(self.used);
        for slot in &mut self.first[..used] {
            if slot.0 == id {
                if slot.1 & bit != 0 {
                    return false;
                }
                slot.1 |= bit;
                return true;
            }
        }

        if used == METRIC_ARRAY_SIZE {
            // Array is full: convert to a map and track there from now on.
            let mut map = Box::new(HashMap::with_capacity(METRIC_ARRAY_SIZE * 2));
            for (slot_id, flags) in self.first {
                map.insert(slot_id, flags);
            }
            map.insert(id, bit);
            self.spill = Some(map);
            return true;
        }

        self.first[used] = (id, bit);
        self.used += 1;
        true
    }
}

/// The interval-scoped state owned by one shard worker.
#[derive(Debug, Default)]
pub(crate) struct TrackerMaps {
    ips: HashMap<u32, IpEntry>,
    tallies: HashMap<MetricId, MetricTally>,
}

/// The sealed-result slot shared with the merge collector.
#[derive(Debug, Default)]
pub(crate) struct SealedSlot {
    /// Tallies of the most recently sealed interval, until consumed.
    pub tallies: Option<HashMap<MetricId, MetricTally>>,
    /// Timestamp of the most recently sealed interval.
    pub last_sealed_ts: u32,
    /// Set once the worker has exited; no further seals will happen.
    pub stopped: bool,
}

/// Mutex-guarded handoff point between a shard worker and the merge
/// collector.
#[derive(Debug, Default)]
pub(crate) struct ShardResult {
    pub slot: Mutex<SealedSlot>,
}

#[derive(Debug, Default)]
struct SourceTrack {
    expected: u32,
    lost: u64,
}

#[derive(Debug)]
struct OutstandingInterval {
    ts: u32,
    reported: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HaltPhase {
    Running,
    Draining,
}

pub(crate) struct ShardWorker {
    shard: usize,
    rx: Receiver<TrackerMsg>,
    result: Arc<ShardResult>,
    source_count: u32,
    src_ip_count: IpCountPolicy,
    dst_ip_count: IpCountPolicy,
    src_sample_index: u32,
    dst_sample_index: u32,
    curr: TrackerMaps,
    next: TrackerMaps,
    outstanding: VecDeque<OutstandingInterval>,
    sources: Vec<SourceTrack>,
    last_sealed: u32,
    halt: HaltPhase,
    stale_eoi_dropped: u64,
    malformed_dropped: u64,
}

impl ShardWorker {
    pub(crate) fn new(
        shard: usize,
        rx: Receiver<TrackerMsg>,
        result: Arc<ShardResult>,
        source_count: usize,
        src_ip_count: IpCountPolicy,
        dst_ip_count: IpCountPolicy,
    ) -> Self {
        Self {
            shard,
            rx,
            result,
            source_count: source_count as u32,
            src_ip_count,
            dst_ip_count,
            src_sample_index: src_ip_count.sample_index(shard, true),
            dst_sample_index: dst_ip_count.sample_index(shard, false),
            curr: TrackerMaps::default(),
            next: TrackerMaps::default(),
            outstanding: VecDeque::new(),
            sources: (0..source_count).map(|_| SourceTrack::default()).collect(),
            last_sealed: 0,
            halt: HaltPhase::Running,
            stale_eoi_dropped: 0,
            malformed_dropped: 0,
        }
    }

    /// The worker main loop; runs until halted or every producer is gone.
    pub(crate) fn run(mut self) {
        loop {
            match self.rx.recv_timeout(RECV_TIMEOUT) {
                Ok(TrackerMsg::Update(batch)) => self.handle_update(batch),
                Ok(TrackerMsg::IntervalEnd {
                    sender,
                    seq,
                    interval_ts,
                }) => {
                    if self.handle_interval_end(sender, seq, interval_ts) {
                        break;
                    }
                }
                Ok(TrackerMsg::Halt) => {
                    if self.handle_halt() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.force_complete();
                    break;
                }
            }
        }

        self.result.slot.lock().stopped = true;
        info!(shard = self.shard, "tally worker stopped");
    }

    fn handle_update(&mut self, batch: UpdateBatch) {
        if usize::from(batch.sender) >= self.sources.len() {
            self.malformed_dropped += 1;
            warn!(shard = self.shard, sender = batch.sender, "unknown producer, dropping batch");
            return;
        }
        self.track_seq(batch.sender, batch.seq);

        // A producer that has already ended the head interval is ahead of
        // the barrier; its updates belong to the next interval.
        let to_next =
            !self.outstanding.is_empty() && self.sender_in_outstanding(batch.sender);

        // A tag list that does not lead with the combined cell is a
        // protocol violation; refuse the whole batch.
        if batch
            .updates
            .iter()
            .any(|update| update.tags.first().map(|tag| tag.id) != Some(MetricId::COMBINED))
        {
            self.malformed_dropped += batch.updates.len() as u64;
            warn!(
                shard = self.shard,
                sender = batch.sender,
                "update batch without leading combined tag, dropping batch"
            );
            return;
        }

        for update in batch.updates {
            self.apply_update(update, to_next);
        }
    }

    fn apply_update(&mut self, update: IpUpdate, to_next: bool) {
        let (policy, sample_index) = if update.is_src {
            (self.src_ip_count, self.src_sample_index)
        } else {
            (self.dst_ip_count, self.dst_sample_index)
        };
        let ip_key = ip_count_key(policy, sample_index, update.ip);

        let maps = if to_next { &mut self.next } else { &mut self.curr };
        let mut malformed = 0u64;
        for tag in &update.tags {
            if !tag.id.in_bounds() {
                malformed += 1;
                continue;
            }
            upsert_metric(maps, tag.id, ip_key, update.is_src, update.src_asn, update.bytes);
            for assoc in &tag.associated {
                if !assoc.in_bounds() {
                    malformed += 1;
                    continue;
                }
                upsert_metric(maps, *assoc, ip_key, update.is_src, update.src_asn, update.bytes);
            }
        }
        if malformed > 0 {
            self.malformed_dropped += malformed;
            debug!(shard = self.shard, malformed, "dropped out-of-bounds metric values");
        }
    }

    /// Records an end-of-interval report from one producer. Returns true
    /// when the worker should stop (drain finished).
    fn handle_interval_end(&mut self, sender: WorkerId, seq: u32, ts: u32) -> bool {
        self.track_seq(sender, seq);

        if ts == 0 || usize::from(sender) >= self.sources.len() {
            return false;
        }
        if ts <= self.last_sealed && self.last_sealed != 0 {
            // This interval is already sealed; the report is stale.
            self.stale_eoi_dropped += 1;
            debug!(shard = self.shard, sender, ts, "stale end-of-interval dropped");
            return false;
        }

        let pos = match self.outstanding.iter().position(|o| o.ts == ts) {
            Some(pos) => pos,
            None => {
                if let Some(tail) = self.outstanding.back() {
                    if ts < tail.ts {
                        // An interval we never opened, announced after a
                        // later one: drop it rather than guess.
                        self.stale_eoi_dropped += 1;
                        warn!(
                            shard = self.shard,
                            sender, ts, "out-of-order end-of-interval dropped"
                        );
                        return false;
                    }
                }
                self.outstanding.push_back(OutstandingInterval {
                    ts,
                    reported: 0,
                    count: 0,
                });
                self.outstanding.len() - 1
            }
        };

        let entry = &mut self.outstanding[pos];
        let bit = 1u64 << sender;
        if entry.reported & bit != 0 {
            // Duplicate report from the same producer; idempotent.
            return false;
        }
        entry.reported |= bit;
        entry.count += 1;
        if entry.count < self.source_count {
            return false;
        }

        // Barrier reached. Preceding incomplete intervals will never
        // complete now; prune them.
        for dropped in self.outstanding.drain(..pos) {
            warn!(
                shard = self.shard,
                ts = dropped.ts,
                reports = dropped.count,
                "abandoning incomplete interval"
            );
        }
        self.outstanding.pop_front();

        self.seal(ts);

        if self.halt == HaltPhase::Draining && self.outstanding.is_empty() {
            info!(shard = self.shard, "drain complete, tally worker halting");
            return true;
        }
        false
    }

    /// Seals the current interval: publishes its tallies and rotates the
    /// next-interval maps into place.
    fn seal(&mut self, ts: u32) {
        let sealed = mem::replace(&mut self.curr, mem::take(&mut self.next));
        let TrackerMaps { ips, tallies } = sealed;
        drop(ips);

        {
            let mut slot = self.result.slot.lock();
            if slot.tallies.is_some() {
                warn!(
                    shard = self.shard,
                    stale_ts = slot.last_sealed_ts,
                    "merge collector has not consumed previous tally, overwriting"
                );
            }
            slot.tallies = Some(tallies);
            slot.last_sealed_ts = ts;
        }
        self.last_sealed = ts;

        self.report_interval_counters(ts);
    }

    fn report_interval_counters(&mut self, ts: u32) {
        let lost: u64 = self.sources.iter().map(|s| s.lost).sum();
        if lost > 0 || self.stale_eoi_dropped > 0 || self.malformed_dropped > 0 {
            warn!(
                shard = self.shard,
                ts,
                lost_messages = lost,
                stale_eoi = self.stale_eoi_dropped,
                malformed = self.malformed_dropped,
                "interval sealed with anomalies"
            );
        }
        for source in &mut self.sources {
            source.lost = 0;
        }
        self.stale_eoi_dropped = 0;
        self.malformed_dropped = 0;
    }

    /// Returns true when the worker can stop immediately.
    fn handle_halt(&mut self) -> bool {
        if self.outstanding.is_empty() {
            info!(shard = self.shard, "tally worker halting");
            return true;
        }
        info!(
            shard = self.shard,
            outstanding = self.outstanding.len(),
            "halt requested, draining outstanding intervals"
        );
        self.halt = HaltPhase::Draining;
        false
    }

    /// All producers are gone; whatever is outstanding will never complete.
    fn force_complete(&mut self) {
        if !self.outstanding.is_empty() {
            warn!(
                shard = self.shard,
                outstanding = self.outstanding.len(),
                "producers disconnected, abandoning outstanding intervals"
            );
            self.outstanding.clear();
        }
    }

    fn track_seq(&mut self, sender: WorkerId, seq: u32) {
        let Some(source) = self.sources.get_mut(usize::from(sender)) else {
            self.malformed_dropped += 1;
            return;
        };
        if seq != source.expected {
            let gap = seq.wrapping_sub(source.expected);
            source.lost += u64::from(gap);
            debug!(shard = self.shard, sender, gap, "sequence gap on shard ingress");
        }
        source.expected = seq.wrapping_add(1);
    }

    fn sender_in_outstanding(&self, sender: WorkerId) -> bool {
        let bit = 1u64 << sender;
        self.outstanding.iter().any(|o| o.reported & bit != 0)
    }
}

/// Applies the unique-IP counting policy to an address, yielding the key
/// under which it is tracked, or `None` when a sampled-out address should
/// not contribute to unique counts at all.
fn ip_count_key(policy: IpCountPolicy, sample_index: u32, ip: u32) -> Option<u32> {
    match policy.method {
        IpCountMethod::All => Some(ip),
        IpCountMethod::PrefixAgg => Some(ip & policy.prefix_mask()),
        IpCountMethod::Sample => {
            let mask = policy.prefix_mask();
            (ip & !mask == sample_index).then_some(ip & mask)
        }
    }
}

fn upsert_metric(
    maps: &mut TrackerMaps,
    id: MetricId,
    ip_key: Option<u32>,
    is_src: bool,
    src_asn: u32,
    bytes: u32,
) {
    let tally = maps.tallies.entry(id).or_default();

    // Zero bytes == the destination leg; the packet was already tallied
    // for this metric on the source leg.
    if bytes > 0 {
        tally.packets += 1;
        tally.bytes += u64::from(bytes);
    }

    if is_src && src_asn != 0 && id.class().is_geo() {
        tally.src_asns.insert(src_asn);
    }

    if let Some(key) = ip_key {
        let entry = maps.ips.entry(key).or_insert_with(IpEntry::new);
        if entry.mark(id, is_src) {
            if is_src {
                tally.src_ips += 1;
            } else {
                tally.dst_ips += 1;
            }
        }
    }
}
