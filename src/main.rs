//! Demo driver: runs the aggregation fabric over a burst of synthetic
//! tagged packets and prints the merged rows for one interval.

use std::env;
use std::process;

use telescope_report::{
    providers, Config, MemorySink, ReportEngine, ReportResult, TagRecord,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match env::args().nth(1) {
        Some(path) => Config::from_file(path),
        None => demo_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("telescope-report: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = run(&config) {
        eprintln!("telescope-report: {err}");
        process::exit(1);
    }
}

fn demo_config() -> ReportResult<Config> {
    Config::from_toml(
        r#"
        input_sources = ["synthetic:demo"]
        pkt_threads = 2
        iptracker_threads = 4
        output_row_label = "demo"
        "#,
    )
}

fn run(config: &Config) -> ReportResult<()> {
    let sink = MemorySink::new();
    let (engine, workers) = ReportEngine::start(config, Box::new(sink.clone()), None)?;

    let handles: Vec<_> = workers
        .into_iter()
        .map(|mut worker| {
            std::thread::spawn(move || {
                let base = 0x0a00_0000 + (u32::from(worker.worker_id()) << 16);
                for i in 0..50_000u32 {
                    worker.observe_packet(&synthetic_packet(base, i));
                }
                worker.end_interval(60);
                worker
            })
        })
        .collect();

    let mut workers = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(worker) => workers.push(worker),
            Err(_) => return Err("capture worker panicked".into()),
        }
    }

    engine.merge_interval(60);
    engine.stop(workers)?;

    let mut rows = sink.rows();
    rows.sort_by(|a, b| b.pkt_cnt.cmp(&a.pkt_cnt));
    println!("interval 60 produced {} metric cells; top 10:", rows.len());
    for row in rows.iter().take(10) {
        println!(
            "  {:>16} {:>8} pkts={:<8} bytes={:<10} src={:<6} dst={}",
            row.metric_name, row.metric_value, row.pkt_cnt, row.byte_cnt, row.src_ip_cnt,
            row.dest_ip_cnt,
        );
    }
    Ok(())
}

fn synthetic_packet(base: u32, i: u32) -> TagRecord {
    TagRecord {
        src_ip: base | (i % 4096),
        dst_ip: 0xc0a8_0000 | (i % 977),
        bytes: 40 + (i % 1400),
        protocol: if i % 3 == 0 { 17 } else { 6 },
        src_port: (1024 + (i % 60_000)) as u16,
        dst_port: if i % 2 == 0 { 23 } else { 445 },
        providers: providers::BASIC,
        ..TagRecord::default()
    }
}
