#![no_main]

use libfuzzer_sys::fuzz_target;
use telescope_report::{MetricTag, ReportPolicy, TagRecord, MAX_TAGS_PER_PACKET};

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// Tag lists built from arbitrary records must stay within bounds and
// always lead with the combined cell.
fuzz_target!(|data: &[u8]| {
    if data.len() < 40 {
        return;
    }

    let rec = TagRecord {
        src_ip: read_u32(data, 0),
        dst_ip: read_u32(data, 4),
        src_asn: read_u32(data, 8),
        bytes: read_u32(data, 12),
        protocol: data[16],
        src_port: read_u16(data, 17),
        dst_port: read_u16(data, 19),
        providers: data[21],
        maxmind_continent: read_u16(data, 22),
        maxmind_country: read_u16(data, 24),
        netacq_continent: read_u16(data, 26),
        netacq_country: read_u16(data, 28),
        netacq_region: read_u16(data, 30),
        netacq_polygon: read_u32(data, 32),
        ipinfo_continent: read_u16(data, 36),
        ipinfo_country: read_u16(data, 38),
        ipinfo_region: read_u16(data, 22),
        prefix_asn: read_u32(data, 8),
        filter_bits: u64::from(read_u32(data, 12)),
    };

    let policy = ReportPolicy::default();
    let mut tags: Vec<MetricTag> = Vec::new();
    policy.build_tag_list(&rec, &mut tags);

    assert!(!tags.is_empty());
    assert!(tags.len() <= MAX_TAGS_PER_PACKET);
    assert_eq!(tags[0].id, telescope_report::MetricId::COMBINED);
    for tag in &tags {
        assert!(tag.id.in_bounds());
    }
});
