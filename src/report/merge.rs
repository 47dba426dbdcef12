//! The merge collector.
//!
//! Runs on its own thread. For every interval-boundary trigger it polls
//! each shard's sealed-result slot under trylock, folds the per-shard
//! tallies into one accumulator per metric cell, and emits one result row
//! per cell to the configured sink. Shards partition the address space, so
//! unique-IP counts sum exactly; unique-ASN sets are unioned because an
//! ASN can appear behind addresses on several shards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bumpalo::Bump;
use crossbeam::channel::Receiver;
use hashbrown::HashMap;
use tracing::{debug, error, info, warn};

use super::metrics::{geo_code_chars, MetricClass, MetricId};
use super::tracker::{MetricTally, ShardResult};
use super::{ReportSink, ResultRow, TagLabelResolver};

/// Pause between trylock sweeps over shards that have not sealed yet.
const MERGE_POLL_BACKOFF: Duration = Duration::from_micros(100);

pub(crate) struct MergeCollector {
    shards: Vec<Arc<ShardResult>>,
    sink: Box<dyn ReportSink>,
    resolver: Option<Box<dyn TagLabelResolver>>,
    label: String,
    query_labels: bool,
    /// Cells emitted in earlier intervals; pre-seeded into the accumulator
    /// so an established series reports explicit zeros in quiet intervals.
    seen_cells: Vec<MetricId>,
    bump: Bump,
    itoa: itoa::Buffer,
}

impl MergeCollector {
    pub(crate) fn new(
        shards: Vec<Arc<ShardResult>>,
        sink: Box<dyn ReportSink>,
        resolver: Option<Box<dyn TagLabelResolver>>,
        label: String,
        query_labels: bool,
    ) -> Self {
        Self {
            shards,
            sink,
            resolver,
            label,
            query_labels,
            seen_cells: Vec::new(),
            bump: Bump::new(),
            itoa: itoa::Buffer::new(),
        }
    }

    /// Consumes interval-boundary triggers until the engine closes the
    /// channel.
    pub(crate) fn run(mut self, triggers: &Receiver<u32>) {
        while let Ok(ts) = triggers.recv() {
            self.merge_interval(ts);
        }
        debug!("merge collector stopped");
    }

    fn merge_interval(&mut self, ts: u32) {
        let shard_count = self.shards.len();
        let mut done = vec![false; shard_count];
        let mut remaining = shard_count;
        let mut skipped = false;

        let mut acc: HashMap<MetricId, MetricTally> = HashMap::new();
        for id in &self.seen_cells {
            acc.insert(*id, MetricTally::default());
        }

        while remaining > 0 {
            for (index, shard) in self.shards.iter().enumerate() {
                if done[index] {
                    continue;
                }
                let Some(mut slot) = shard.slot.try_lock() else {
                    continue;
                };
                if slot.last_sealed_ts == ts {
                    if let Some(tallies) = slot.tallies.take() {
                        fold_tallies(&mut acc, tallies);
                    } else {
                        // Sealed but already consumed: a duplicate trigger.
                        warn!(shard = index, ts, "shard tally consumed twice");
                        skipped = true;
                    }
                    done[index] = true;
                    remaining -= 1;
                } else if slot.last_sealed_ts > ts {
                    // The shard has moved on; this interval's tally is gone.
                    warn!(shard = index, ts, sealed = slot.last_sealed_ts, "shard tally missed");
                    skipped = true;
                    done[index] = true;
                    remaining -= 1;
                } else if slot.stopped {
                    // Halted without sealing this interval; it never will.
                    skipped = true;
                    done[index] = true;
                    remaining -= 1;
                }
            }
            if remaining > 0 {
                thread::sleep(MERGE_POLL_BACKOFF);
            }
        }

        if skipped {
            // Emitting a partial sum would under-count; drop the interval.
            warn!(ts, "dropping interval, not all shards produced a tally");
            return;
        }

        self.seen_cells = acc.keys().copied().collect();

        let mut cells: Vec<(MetricId, MetricTally)> = acc.drain().collect();
        cells.sort_unstable_by_key(|(id, _)| (id.class(), id.value()));

        let mut written = 0usize;
        for (id, tally) in &cells {
            let row = ResultRow {
                bin_timestamp: u64::from(ts),
                source_label: &self.label,
                metric_name: id.class().name(),
                metric_value: value_text(
                    &self.bump,
                    &mut self.itoa,
                    self.query_labels,
                    self.resolver.as_deref(),
                    *id,
                ),
                src_ip_cnt: u64::from(tally.src_ips),
                dest_ip_cnt: u64::from(tally.dst_ips),
                pkt_cnt: tally.packets,
                byte_cnt: tally.bytes,
                src_asn_cnt: tally.src_asns.len() as u64,
            };
            if let Err(err) = self.sink.write_row(&row) {
                error!(ts, "failed to write result row: {err}");
                break;
            }
            written += 1;
        }
        info!(ts, cells = written, "interval merged");
        self.bump.reset();
    }
}

fn fold_tallies(acc: &mut HashMap<MetricId, MetricTally>, tallies: HashMap<MetricId, MetricTally>) {
    for (id, tally) in tallies {
        let merged = acc.entry(id).or_default();
        merged.packets += tally.packets;
        merged.bytes += tally.bytes;
        // Shards are disjoint on address, so unique-IP counts sum exactly.
        merged.src_ips += tally.src_ips;
        merged.dst_ips += tally.dst_ips;
        // ASNs repeat across shards; union, never sum.
        merged.src_asns.extend(tally.src_asns);
    }
}

/// Formats the value half of a metric ID into the interval arena.
fn value_text<'b>(
    bump: &'b Bump,
    itoa: &mut itoa::Buffer,
    query_labels: bool,
    resolver: Option<&dyn TagLabelResolver>,
    id: MetricId,
) -> &'b str {
    match id.class() {
        MetricClass::Combined => "all",
        MetricClass::MaxmindContinent
        | MetricClass::MaxmindCountry
        | MetricClass::NetacqContinent
        | MetricClass::NetacqCountry
        | MetricClass::IpinfoContinent
        | MetricClass::IpinfoCountry => {
            let chars = geo_code_chars(id.value());
            bump.alloc_str(str_from_code(chars).as_str())
        }
        MetricClass::NetacqRegion
        | MetricClass::NetacqPolygon
        | MetricClass::IpinfoRegion => {
            if let Some(label) = lookup(query_labels, resolver, id.class(), id.value()) {
                bump.alloc_str(&label)
            } else {
                bump.alloc_str(itoa.format(id.value()))
            }
        }
        MetricClass::IpinfoCountryPrefixAsn => {
            let geo = str_from_code(geo_code_chars(u64::from(id.couplet_geo())));
            let text = format!("{}-{}", geo.as_str(), id.couplet_asn());
            bump.alloc_str(&text)
        }
        MetricClass::IpinfoRegionPrefixAsn => {
            let geo = lookup(
                query_labels,
                resolver,
                MetricClass::IpinfoRegion,
                u64::from(id.couplet_geo()),
            )
            .unwrap_or_else(|| id.couplet_geo().to_string());
            let text = format!("{geo}-{}", id.couplet_asn());
            bump.alloc_str(&text)
        }
        MetricClass::PrefixAsn
        | MetricClass::TcpSourcePort
        | MetricClass::TcpDestPort
        | MetricClass::UdpSourcePort
        | MetricClass::UdpDestPort
        | MetricClass::IpProtocol
        | MetricClass::IcmpTypeCode
        | MetricClass::FilterCriteria => bump.alloc_str(itoa.format(id.value())),
    }
}

fn lookup(
    query_labels: bool,
    resolver: Option<&dyn TagLabelResolver>,
    class: MetricClass,
    value: u64,
) -> Option<String> {
    if !query_labels {
        return None;
    }
    resolver.and_then(|r| r.lookup_label(class, value))
}

fn str_from_code(chars: [u8; 2]) -> String {
    String::from_utf8_lossy(&chars).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::metrics::pack_geo_code;

    #[test]
    fn test_fold_sums_counts_and_unions_asns() {
        let id = MetricId::new(MetricClass::IpinfoCountry, 7);
        let mut acc = HashMap::new();
        let mut a = HashMap::new();
        a.insert(
            id,
            MetricTally {
                packets: 2,
                bytes: 100,
                src_ips: 2,
                dst_ips: 1,
                src_asns: [64_512, 64_513].into_iter().collect(),
            },
        );
        let mut b = HashMap::new();
        b.insert(
            id,
            MetricTally {
                packets: 3,
                bytes: 50,
                src_ips: 1,
                dst_ips: 2,
                src_asns: [64_512].into_iter().collect(),
            },
        );
        fold_tallies(&mut acc, a);
        fold_tallies(&mut acc, b);
        let merged = &acc[&id];
        assert_eq!(merged.packets, 5);
        assert_eq!(merged.bytes, 150);
        assert_eq!(merged.src_ips, 3);
        assert_eq!(merged.dst_ips, 3);
        assert_eq!(merged.src_asns.len(), 2);
    }

    #[test]
    fn test_value_text_forms() {
        let bump = Bump::new();
        let mut itoa = itoa::Buffer::new();
        assert_eq!(
            value_text(&bump, &mut itoa, false, None, MetricId::COMBINED),
            "all"
        );
        assert_eq!(
            value_text(
                &bump,
                &mut itoa,
                false,
                None,
                MetricId::new(MetricClass::TcpDestPort, 443)
            ),
            "443"
        );
        let country = MetricId::new(
            MetricClass::NetacqCountry,
            u64::from(pack_geo_code(*b"NZ")),
        );
        assert_eq!(value_text(&bump, &mut itoa, false, None, country), "NZ");
        let couplet = MetricId::couplet(
            MetricClass::IpinfoCountryPrefixAsn,
            u32::from(pack_geo_code(*b"AU")),
            64_512,
        );
        assert_eq!(value_text(&bump, &mut itoa, false, None, couplet), "AU-64512");
    }

    struct Prefixer;
    impl TagLabelResolver for Prefixer {
        fn lookup_label(&self, class: MetricClass, value: u64) -> Option<String> {
            (class == MetricClass::IpinfoRegion).then(|| format!("region-{value}"))
        }
    }

    #[test]
    fn test_region_labels_come_from_resolver() {
        let bump = Bump::new();
        let mut itoa = itoa::Buffer::new();
        let region = MetricId::new(MetricClass::IpinfoRegion, 23);
        assert_eq!(
            value_text(&bump, &mut itoa, true, Some(&Prefixer), region),
            "region-23"
        );
        // Lookups are suppressed when querytaggerlabels is off.
        assert_eq!(
            value_text(&bump, &mut itoa, false, Some(&Prefixer), region),
            "23"
        );
        // And fall back to the numeric form for classes the tagger does
        // not know.
        let polygon = MetricId::new(MetricClass::NetacqPolygon, 99);
        assert_eq!(
            value_text(&bump, &mut itoa, true, Some(&Prefixer), polygon),
            "99"
        );
    }
}
