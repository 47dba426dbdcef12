//! The control plane: engine start, interval triggering, halt.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Sender};
use crossbeam::sync::WaitGroup;
use tracing::{debug, info};

use super::batch::{TrackerMsg, WorkerBatcher};
use super::merge::MergeCollector;
use super::policy::ReportPolicy;
use super::tracker::{ShardResult, ShardWorker};
use super::{ReportSink, TagLabelResolver, WorkerId};
use crate::config::Config;
use crate::{ReportError, ReportResult};

/// The running aggregation fabric.
///
/// [`ReportEngine::start`] spawns one tally worker per shard and the merge
/// collector, and hands back one [`WorkerBatcher`] per configured capture
/// worker. The engine does not return until every thread is running, so
/// the first packet is never admitted into a half-built fabric.
pub struct ReportEngine {
    shard_txs: Vec<Sender<TrackerMsg>>,
    shard_threads: Vec<JoinHandle<()>>,
    merge_tx: Option<Sender<u32>>,
    merge_thread: Option<JoinHandle<()>>,
}

impl ReportEngine {
    /// Starts the fabric described by `config`, emitting result rows to
    /// `sink`. `resolver` is the optional tagger label-lookup seam used
    /// when `querytaggerlabels` is enabled.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or a worker
    /// thread cannot be spawned.
    pub fn start(
        config: &Config,
        sink: Box<dyn ReportSink>,
        resolver: Option<Box<dyn TagLabelResolver>>,
    ) -> ReportResult<(Self, Vec<WorkerBatcher>)> {
        config.validate()?;
        let policy = Arc::new(ReportPolicy::from_config(config)?);

        let shard_count = config.iptracker_threads;
        let worker_count = config.pkt_threads;
        // One bounded queue per shard, shared by all producers.
        let capacity = config.internalhwm.max(1) * worker_count;

        let ready = WaitGroup::new();
        let mut shard_txs = Vec::with_capacity(shard_count);
        let mut shard_threads = Vec::with_capacity(shard_count);
        let mut shard_results = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = bounded(capacity);
            let result = Arc::new(ShardResult::default());
            let worker = ShardWorker::new(
                shard,
                rx,
                Arc::clone(&result),
                worker_count,
                policy.src_ip_count,
                policy.dst_ip_count,
            );
            let ready = ready.clone();
            let handle = thread::Builder::new()
                .name(format!("iptracker-{shard}"))
                .spawn(move || {
                    drop(ready);
                    worker.run();
                })
                .map_err(|err| {
                    ReportError::Worker(format!("unable to start tally worker {shard}: {err}"))
                })?;
            shard_txs.push(tx);
            shard_threads.push(handle);
            shard_results.push(result);
        }

        let (merge_tx, merge_rx) = unbounded();
        let collector = MergeCollector::new(
            shard_results,
            sink,
            resolver,
            config.output_row_label.clone().unwrap_or_default(),
            config.querytaggerlabels,
        );
        let merge_ready = ready.clone();
        let merge_thread = thread::Builder::new()
            .name("report-merge".to_string())
            .spawn(move || {
                drop(merge_ready);
                collector.run(&merge_rx);
            })
            .map_err(|err| {
                ReportError::Worker(format!("unable to start merge collector: {err}"))
            })?;

        // No packet is admitted until every worker is running.
        ready.wait();

        #[allow(clippy::cast_possible_truncation)]
        let batchers = (0..worker_count)
            .map(|worker| {
                WorkerBatcher::new(worker as WorkerId, Arc::clone(&policy), shard_txs.clone())
            })
            .collect();

        info!(
            shards = shard_count,
            capture_workers = worker_count,
            queue_capacity = capacity,
            "report engine running"
        );

        Ok((
            Self {
                shard_txs,
                shard_threads,
                merge_tx: Some(merge_tx),
                merge_thread: Some(merge_thread),
            },
            batchers,
        ))
    }

    /// Triggers the merge collector for the interval starting at `ts`.
    ///
    /// Rows for the interval are emitted asynchronously, strictly after
    /// every shard has sealed it.
    pub fn merge_interval(&self, ts: u32) {
        if let Some(tx) = &self.merge_tx {
            if tx.send(ts).is_err() {
                debug!(ts, "merge collector gone, dropping interval trigger");
            }
        }
    }

    /// Stops the fabric: flushes every batcher's final messages, halts the
    /// shard workers, and waits for all threads to finish.
    ///
    /// Shards drain outstanding intervals when feasible; abandoned
    /// intervals are logged and never emitted.
    ///
    /// # Errors
    /// Returns an error when a worker thread panicked.
    pub fn stop(mut self, workers: Vec<WorkerBatcher>) -> ReportResult<()> {
        for mut worker in workers {
            worker.flush();
        }

        for tx in &self.shard_txs {
            let _ = tx.send(TrackerMsg::Halt);
        }
        self.shard_txs.clear();

        for handle in self.shard_threads.drain(..) {
            handle
                .join()
                .map_err(|_| ReportError::Worker("tally worker panicked".to_string()))?;
        }

        drop(self.merge_tx.take());
        if let Some(handle) = self.merge_thread.take() {
            handle
                .join()
                .map_err(|_| ReportError::Worker("merge collector panicked".to_string()))?;
        }

        info!("report engine stopped");
        Ok(())
    }
}

impl Drop for ReportEngine {
    fn drop(&mut self) {
        // Dropping the senders is enough to stop every thread; an explicit
        // stop() additionally joins them.
        self.shard_txs.clear();
        drop(self.merge_tx.take());
    }
}
