//! # telescope-report
//!
//! A parallel traffic-report aggregation engine for network telescope
//! pipelines.
//!
//! Tagged packets flow from capture workers through per-shard batchers
//! onto bounded queues, into shard tally workers that each own a partition
//! of the IPv4 address space, and finally through a merge collector that
//! emits one result row per metric cell once every capture worker has
//! announced the end of an interval.
//!
//! ## Features
//!
//! - **Exact unique-IP counts**: per-interval source and destination
//!   address cardinality with no probabilistic sketches.
//! - **Deterministic interval closure**: a barrier protocol tolerates
//!   capture workers advancing independently and messages arriving in any
//!   order across queues.
//! - **Loss accounting**: per-producer sequence numbers surface transport
//!   loss without desynchronising the barrier.
//! - **Bounded memory**: per-interval maps are discarded in bulk; sampled
//!   and prefix-aggregated counting bound the footprint on wide telescopes.
//!
//! ## Quick start
//!
//! ```no_run
//! use telescope_report::{providers, Config, MemorySink, ReportEngine, TagRecord};
//!
//! let config = Config::from_toml(
//!     r#"
//!     input_sources = ["pcapint:eth0"]
//!     pkt_threads = 1
//!     iptracker_threads = 2
//!     "#,
//! )
//! .unwrap();
//!
//! let sink = MemorySink::new();
//! let (engine, mut workers) =
//!     ReportEngine::start(&config, Box::new(sink.clone()), None).unwrap();
//!
//! let rec = TagRecord {
//!     src_ip: 0x0102_0304,
//!     dst_ip: 0x0506_0708,
//!     bytes: 100,
//!     protocol: 6,
//!     src_port: 80,
//!     dst_port: 12345,
//!     providers: providers::BASIC,
//!     ..TagRecord::default()
//! };
//! workers[0].observe_packet(&rec);
//! workers[0].end_interval(60);
//!
//! engine.merge_interval(60);
//! engine.stop(workers).unwrap();
//!
//! for row in sink.rows() {
//!     println!("{} {} = {} pkts", row.metric_name, row.metric_value, row.pkt_cnt);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
mod error;
mod report;

pub use config::{Config, IpCountingConfig, OutputFormat};
pub use error::ReportError;
pub use report::batch::{shard_for_ip, WorkerBatcher, REPORT_BATCH_SIZE};
pub use report::engine::ReportEngine;
pub use report::metrics::{MetricClass, MetricId, MetricTag, MAX_ASSOCIATED_METRICS};
pub use report::policy::{
    GeoAsnWhitelist, GeoMode, IpCountMethod, PortBitmap, ReportPolicy, MAX_TAGS_PER_PACKET,
};
pub use report::{
    providers, MemorySink, ReportSink, ResultRow, RowRecord, TagLabelResolver, TagRecord,
    WorkerId, MAX_PKT_WORKERS, MAX_SHARDS,
};

/// Result type for engine operations.
pub type ReportResult<T> = Result<T, ReportError>;
