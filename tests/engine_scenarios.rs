use telescope_report::{
    providers, Config, MemorySink, ReportEngine, RowRecord, TagRecord, WorkerBatcher,
};

// ============================================================================
// Helper functions to reduce test code duplication
// ============================================================================

fn test_config(pkt_threads: usize, shards: usize) -> Config {
    let mut config = Config::default();
    config.input_sources = vec!["synthetic:test".to_string()];
    config.pkt_threads = pkt_threads;
    config.iptracker_threads = shards;
    config.output_row_label = Some("test".to_string());
    config
}

fn tcp_packet(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, bytes: u32) -> TagRecord {
    TagRecord {
        src_ip,
        dst_ip,
        bytes,
        protocol: 6,
        src_port,
        dst_port,
        providers: providers::BASIC,
        ..TagRecord::default()
    }
}

fn start(config: &Config) -> (MemorySink, ReportEngine, Vec<WorkerBatcher>) {
    let sink = MemorySink::new();
    let (engine, workers) =
        ReportEngine::start(config, Box::new(sink.clone()), None).expect("engine should start");
    (sink, engine, workers)
}

fn row<'a>(rows: &'a [RowRecord], ts: u64, name: &str, value: &str) -> &'a RowRecord {
    rows.iter()
        .find(|r| r.bin_timestamp == ts && r.metric_name == name && r.metric_value == value)
        .unwrap_or_else(|| panic!("no row for {name}/{value} at {ts}"))
}

fn has_row(rows: &[RowRecord], ts: u64, name: &str) -> bool {
    rows.iter()
        .any(|r| r.bin_timestamp == ts && r.metric_name == name)
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[test]
fn test_single_packet() {
    let config = test_config(1, 2);
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 80, 12345, 100));
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    for (name, value) in [
        ("combined", "all"),
        ("ipprotocol", "6"),
        ("tcpsourceport", "80"),
        ("tcpdestport", "12345"),
    ] {
        let r = row(&rows, 60, name, value);
        assert_eq!(r.src_ip_cnt, 1, "{name} src");
        assert_eq!(r.dest_ip_cnt, 1, "{name} dst");
        assert_eq!(r.pkt_cnt, 1, "{name} pkt");
        assert_eq!(r.byte_cnt, 100, "{name} byte");
        assert_eq!(r.source_label, "test");
    }
}

#[test]
fn test_same_ip_pair_two_metrics() {
    let config = test_config(1, 2);
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 5555, 80, 60));
    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 5555, 443, 60));
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    let combined = row(&rows, 60, "combined", "all");
    assert_eq!(combined.pkt_cnt, 2);
    assert_eq!(combined.byte_cnt, 120);
    assert_eq!(combined.src_ip_cnt, 1);
    assert_eq!(combined.dest_ip_cnt, 1);

    assert_eq!(row(&rows, 60, "tcpdestport", "80").pkt_cnt, 1);
    assert_eq!(row(&rows, 60, "tcpdestport", "443").pkt_cnt, 1);
    assert_eq!(row(&rows, 60, "tcpsourceport", "5555").pkt_cnt, 2);
}

#[test]
fn test_unique_ips_partition_across_shards() {
    let config = test_config(1, 2);
    let (sink, engine, mut workers) = start(&config);

    // Top octets 10..13 alternate between the two shards.
    for (i, src) in [0x0a00_0001u32, 0x0b00_0001, 0x0c00_0001, 0x0d00_0001]
        .into_iter()
        .enumerate()
    {
        workers[0].observe_packet(&tcp_packet(src, 0x6300_0001, 4000 + i as u16, 80, 50));
    }
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    let combined = row(&rows, 60, "combined", "all");
    assert_eq!(combined.src_ip_cnt, 4);
    assert_eq!(combined.dest_ip_cnt, 1);
    assert_eq!(combined.pkt_cnt, 4);
}

#[test]
fn test_late_producer_rolls_into_next_interval() {
    let config = test_config(2, 2);
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0a00_0001, 0x0b00_0001, 40000, 80, 100));
    workers[0].end_interval(60);
    // Worker 0 has ended interval 60; this packet must land in 120.
    workers[0].observe_packet(&tcp_packet(0x0a00_0002, 0x0b00_0002, 40000, 80, 77));
    workers[1].end_interval(60);
    engine.merge_interval(60);

    workers[0].end_interval(120);
    workers[1].end_interval(120);
    engine.merge_interval(120);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    let first = row(&rows, 60, "combined", "all");
    assert_eq!(first.pkt_cnt, 1);
    assert_eq!(first.byte_cnt, 100);

    let second = row(&rows, 120, "combined", "all");
    assert_eq!(second.pkt_cnt, 1);
    assert_eq!(second.byte_cnt, 77);
}

#[test]
fn test_missing_eoi_drops_interval() {
    let config = test_config(2, 2);
    let (sink, engine, mut workers) = start(&config);

    workers[1].end_interval(60);
    // Worker 0 never ends interval 60, but both end 120.
    workers[0].observe_packet(&tcp_packet(0x0a00_0001, 0x0b00_0001, 40000, 80, 100));
    workers[0].end_interval(120);
    workers[1].end_interval(120);
    engine.merge_interval(60);
    engine.merge_interval(120);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    assert!(
        !rows.iter().any(|r| r.bin_timestamp == 60),
        "interval 60 must be dropped"
    );
    let second = row(&rows, 120, "combined", "all");
    assert_eq!(second.pkt_cnt, 1);
}

#[test]
fn test_port_whitelist() {
    let mut config = test_config(1, 2);
    config.tcp_source_port_range = vec!["80".to_string()];
    config.tcp_dest_port_range = vec!["80".to_string()];
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 9999, 443, 100));
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    assert_eq!(row(&rows, 60, "combined", "all").pkt_cnt, 1);
    assert_eq!(row(&rows, 60, "ipprotocol", "6").pkt_cnt, 1);
    assert!(!has_row(&rows, 60, "tcpsourceport"));
    assert!(!has_row(&rows, 60, "tcpdestport"));
}

// ============================================================================
// Policy and configuration behaviour
// ============================================================================

#[test]
fn test_limitmetrics_masks_classes() {
    let mut config = test_config(1, 2);
    config.limitmetrics = vec!["basic".to_string()];
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 80, 443, 100));
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    assert!(has_row(&rows, 60, "combined"));
    assert!(has_row(&rows, 60, "ipprotocol"));
    assert!(!has_row(&rows, 60, "tcpsourceport"));
    assert!(!has_row(&rows, 60, "tcpdestport"));
}

#[test]
fn test_geo_rows_and_asn_union() {
    let config = test_config(1, 2);
    let (sink, engine, mut workers) = start(&config);

    let country = telescope_report::MetricClass::IpinfoCountry;
    assert_eq!(country.name(), "ipinfo-country");

    let mut rec = tcp_packet(0x0a00_0001, 0x0b00_0001, 4000, 80, 50);
    rec.providers |= providers::IPINFO | providers::PFX2AS;
    rec.ipinfo_country = u16::from_le_bytes(*b"AU");
    rec.ipinfo_continent = u16::from_le_bytes(*b"OC");
    rec.prefix_asn = 64_512;
    rec.src_asn = 64_512;
    workers[0].observe_packet(&rec);

    // A second source address in the same country and ASN.
    let mut rec2 = rec;
    rec2.src_ip = 0x0c00_0001;
    workers[0].observe_packet(&rec2);

    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    let au = row(&rows, 60, "ipinfo-country", "AU");
    assert_eq!(au.pkt_cnt, 2);
    assert_eq!(au.src_ip_cnt, 2);
    // Both packets came from the same origin ASN.
    assert_eq!(au.src_asn_cnt, 1);
    // The coupled (country, ASN) cell accrued alongside.
    let couplet = row(&rows, 60, "ipinfo-country-pfx2asn", "AU-64512");
    assert_eq!(couplet.pkt_cnt, 2);
    assert_eq!(couplet.src_ip_cnt, 2);
}

#[test]
fn test_established_cells_report_zeros() {
    let config = test_config(1, 2);
    let (sink, engine, mut workers) = start(&config);

    workers[0].observe_packet(&tcp_packet(0x0102_0304, 0x0506_0708, 80, 443, 100));
    workers[0].end_interval(60);
    engine.merge_interval(60);

    // A quiet interval: the established port cell reports explicit zeros.
    workers[0].end_interval(120);
    engine.merge_interval(120);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    assert_eq!(row(&rows, 60, "tcpdestport", "443").pkt_cnt, 1);
    let quiet = row(&rows, 120, "tcpdestport", "443");
    assert_eq!(quiet.pkt_cnt, 0);
    assert_eq!(quiet.src_ip_cnt, 0);
}

#[test]
fn test_start_rejects_invalid_config() {
    let sink = MemorySink::new();
    let mut config = Config::default();
    assert!(ReportEngine::start(&config, Box::new(sink.clone()), None).is_err());

    config.input_sources = vec!["synthetic:test".to_string()];
    config.iptracker_threads = 64;
    assert!(ReportEngine::start(&config, Box::new(sink), None).is_err());
}

#[test]
fn test_prefix_aggregated_source_counting() {
    let mut config = test_config(1, 1);
    config.source_ip_counting.method = telescope_report::IpCountMethod::PrefixAgg;
    config.source_ip_counting.subnetmask = 24;
    let (sink, engine, mut workers) = start(&config);

    // Four sources in two /24s.
    for src in [0x0a000001u32, 0x0a000002, 0x0a000103, 0x0a000104] {
        workers[0].observe_packet(&tcp_packet(src, 0x0b00_0001, 4000, 80, 50));
    }
    workers[0].end_interval(60);
    engine.merge_interval(60);
    engine.stop(workers).unwrap();

    let rows = sink.rows();
    let combined = row(&rows, 60, "combined", "all");
    assert_eq!(combined.src_ip_cnt, 2);
    assert_eq!(combined.dest_ip_cnt, 1);
    assert_eq!(combined.pkt_cnt, 4);
}
