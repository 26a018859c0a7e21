//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where mail files pile up endlessly..."
//! 🎬 "One supervisor dared to batch them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor module — part middle manager, part helicopter parent,
//! part night-shift janitor who ALSO does crash recovery before breakfast.
//!
//! 🧠 Knowledge graph: the supervisor owns the whole lifecycle —
//! ```text
//!   startup:  open ledger → ensure collection → recover run/ → spawn workers
//!   loop:     capacity check → scan wait/ → plan → route rejects
//!             → per batch: move to run/ → pending rows (one tx) → enqueue
//!   shutdown: stop admitting → N Retire pills → bounded join → report
//! ```
//! It is the ONLY writer on the `wait/ → run/` edge and the only bulk
//! scanner; workers own the terminal edges. Filenames are minted once and
//! live in exactly one in-flight batch, which is why nobody needs a lock.
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB EVER
//! ⚠️ YOU HAVE BEEN WARNED
//! 🔒 Like Fight Club, but for async tasks. First rule: you don't pub the workers.

mod workers;

use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::batcher;
use crate::common::{Batch, peek_identity};
use crate::ledger::{Ledger, PendingRow};
use crate::sinks::{CollectionSpec, SinkBackend, VectorSink};
use crate::stager::Stager;
use workers::{ImportWorker, WorkOrder, Worker};

/// 📋 How many pending filenames one poll cycle will even look at.
const SCAN_LIMIT: usize = 1000;

/// ⏰ How long shutdown waits for workers to finish their in-flight batches
/// before abandoning them. Abandoned batches leave files in `run/`, and the
/// next startup's recovery sweep reclaims those — nothing is lost, only late.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// 📦 The Supervisor: because even async tasks need someone hovering over
/// them asking "is it done yet?" every poll interval.
pub(crate) struct Supervisor {
    /// 🔧 The sacred scrolls of configuration, passed down from main()
    /// through the ancient ritual of .clone()
    app_config: AppConfig,
}

impl Supervisor {
    /// 🚀 Birth of a Supervisor. It's like a baby, but less crying.
    /// Actually no, there's plenty of crying. Mostly from the developer.
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self { app_config }
    }

    /// 🧵 The whole show: startup, recovery, workers, poll loop, shutdown.
    ///
    /// Takes one sink backend for itself (the collection check happens on
    /// the orchestrator's connection ONLY) and one per worker — sinks are
    /// owned, never shared, exactly like the ledger connections.
    ///
    /// Returns when the shutdown token fires and the drain completes.
    /// Any error before the workers spawn is startup-fatal and propagates
    /// to the caller, who turns it into a non-zero exit.
    pub(crate) async fn start(
        &self,
        mut orchestrator_sink: SinkBackend,
        worker_sinks: Vec<SinkBackend>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        // 🏗️ Startup sequence. Every step here is allowed to kill the
        // process — better a loud death at boot than a quiet one at 3am.
        let stager = Stager::new(&self.app_config.paths)
            .await
            .context("💀 Could not stand up the staging directories.")?;
        let mut ledger = Ledger::open(&self.app_config.paths.sqlite_path)
            .context("💀 Could not open the status ledger at startup.")?;

        let collection_spec = CollectionSpec::from_weaviate_config(&self.app_config.weaviate);
        orchestrator_sink
            .ensure_collection(&collection_spec)
            .await
            .context("💀 Could not ensure the vector collection exists. No collection, no pipeline.")?;

        // 🩹 Recovery: everything stranded in run/ goes back to wait/.
        // Stale pending rows get overwritten at the next enqueue, so the
        // ledger needs no ceremony here.
        let recovered = stager
            .recover_run_files()
            .await
            .context("💀 Startup recovery failed. Refusing to run on top of stranded files.")?;
        if recovered > 0 {
            info!("🩹 recovered {recovered} file(s) from run/ — a previous run left mid-sentence");
        }

        // 📬 The bounded work queue: backpressure lives here. Producers block
        // when it's full, consumers block when it's empty, and both unblock
        // for shutdown.
        let (tx, rx) = async_channel::bounded(self.app_config.queue.maxsize);

        let worker_count = worker_sinks.len();
        let mut worker_handles = Vec::with_capacity(worker_count);
        for (worker_id, sink) in worker_sinks.into_iter().enumerate() {
            // 🔒 Per-worker owned resources: own sink client, own ledger
            // connection, own stager handle. Shared-nothing by construction.
            let worker_ledger = Ledger::open(&self.app_config.paths.sqlite_path)
                .context("💀 Could not open a worker's ledger connection.")?;
            let worker = ImportWorker::new(worker_id, rx.clone(), sink, worker_ledger, stager.clone());
            worker_handles.push(worker.start());
        }

        info!(
            "🚀 MAILVEX IS OPEN FOR BUSINESS — {worker_count} worker(s), queue capacity {}, polling every {}s",
            self.app_config.queue.maxsize, self.app_config.worker.poll_interval
        );

        self.poll_loop(&stager, &mut ledger, &tx, &shutdown).await;

        // 🛑 Shutdown: stop admitting, then one Retire pill per worker. If
        // the queue is full the sends block — and unblock as workers drain.
        info!("🛑 shutdown requested — retiring {worker_count} worker(s)");
        for _ in 0..worker_count {
            if tx.send(WorkOrder::Retire).await.is_err() {
                // 📪 Channel already closed — workers are gone anyway.
                break;
            }
        }

        match tokio::time::timeout(SHUTDOWN_DEADLINE, futures::future::join_all(worker_handles))
            .await
        {
            Ok(results) => {
                for result in results {
                    // 🤯 result?? — the outer `?` unwraps the JoinHandle, the
                    // inner `?` unwraps the worker's own Result.
                    result??;
                }
                info!("🏁 all workers retired cleanly — the floor is swept, the lights are off");
            }
            Err(_) => {
                // ⏰ Deadline blown. Whatever is still in run/ gets reclaimed
                // by the next startup's recovery sweep.
                warn!(
                    "⏰ workers did not retire within {}s — abandoning them; run/ residue will be recovered at next startup",
                    SHUTDOWN_DEADLINE.as_secs()
                );
            }
        }
        Ok(())
    }

    /// 🔄 Wake, look at wait/, plan, enqueue, sleep. Repeat until told not to.
    ///
    /// A failed cycle is logged and retried next wake — a transient scan or
    /// ledger hiccup must not take the daemon down. The sleep races the
    /// shutdown token so "stop" never waits out a poll interval.
    async fn poll_loop(
        &self,
        stager: &Stager,
        ledger: &mut Ledger,
        tx: &Sender<WorkOrder>,
        shutdown: &CancellationToken,
    ) {
        let poll_interval = Duration::from_secs_f64(self.app_config.worker.poll_interval);
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = self.poll_cycle(stager, ledger, tx, shutdown).await {
                error!("💀 poll cycle failed: {e:#} — retrying next cycle");
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// 🔄 One poll cycle. The order inside matters and is load-bearing:
    /// capacity first (no capacity = no work, not even a scan), rejects
    /// before batches (they were never enqueued, they shouldn't wait),
    /// and per batch: move files → commit pending rows → enqueue.
    async fn poll_cycle(
        &self,
        stager: &Stager,
        ledger: &mut Ledger,
        tx: &Sender<WorkOrder>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        // 📏 Remaining queue capacity. Zero means the importers are behind;
        // we nap instead of scanning — backpressure includes the scanner.
        let capacity = self.app_config.queue.maxsize.saturating_sub(tx.len());
        if capacity == 0 {
            debug!("📬 queue is full — skipping this cycle entirely");
            return Ok(());
        }

        let names = stager.list_pending(SCAN_LIMIT).await?;
        if names.is_empty() {
            return Ok(());
        }
        debug!("📋 scan found {} pending file(s), capacity for {capacity} batch(es)", names.len());

        let plan = batcher::plan(stager, names, capacity).await;

        // 🚑 Rejects: terminal without ever entering run/. Ledger rows first
        // (one transaction, identity where known), then the moves.
        if !plan.rejects.is_empty() {
            let rows: Vec<(PendingRow, String)> = plan
                .rejects
                .iter()
                .filter(|reject| reject.mail_id.is_some())
                .map(|reject| {
                    (
                        PendingRow {
                            mail_id: reject.mail_id.clone().unwrap_or_default(),
                            user_id: reject.user_id.clone().unwrap_or_default(),
                            domain: String::new(),
                            received_time: reject.received_time.clone().unwrap_or_default(),
                        },
                        reject.reason.clone(),
                    )
                })
                .collect();
            if !rows.is_empty() {
                ledger
                    .record_failed_batch(&rows)
                    .context("💀 Could not record reject rows.")?;
            }
            for reject in &plan.rejects {
                warn!(
                    "🚑 routing '{}' straight to buggy/: {}",
                    reject.file_name, reject.reason
                );
                if let Err(e) = stager.move_to_buggy(&stager.wait_path(&reject.file_name)).await {
                    warn!("🚧 could not move reject '{}' to buggy/: {e:#}", reject.file_name);
                }
            }
        }

        // 📦 Selected batches: move → pending rows → enqueue, one at a time.
        for planned in plan.batches {
            let mut run_paths = Vec::with_capacity(planned.names.len());
            let mut moved_names = Vec::with_capacity(planned.names.len());
            let mut pending_rows = Vec::with_capacity(planned.names.len());
            for name in &planned.names {
                match stager.move_to_run(name).await {
                    Ok(run_path) => {
                        // 🕵️ Loose identity read for the pending row. Full
                        // parsing (and full judgment) is the worker's job;
                        // a file with no sniffable mail_id gets its row at
                        // terminal time instead.
                        if let Ok(raw) = tokio::fs::read_to_string(&run_path).await {
                            if let Some((mail_id, user_id, received_time)) = peek_identity(&raw) {
                                pending_rows.push(PendingRow {
                                    mail_id,
                                    user_id,
                                    domain: planned.domain.clone(),
                                    received_time,
                                });
                            }
                        }
                        run_paths.push(run_path);
                        moved_names.push(name.clone());
                    }
                    Err(e) => {
                        // 🚧 Fatal for this file only: it stays in wait/ and
                        // the next cycle tries again.
                        warn!("🚧 could not move '{name}' to run/ — leaving it for the next cycle: {e:#}");
                    }
                }
            }
            if run_paths.is_empty() {
                continue;
            }

            // 🗄️ Pending rows commit BEFORE the enqueue: while a file sits in
            // run/, its row exists. One transaction per batch.
            ledger
                .upsert_pending_batch(&pending_rows)
                .context("💀 Could not commit pending rows for a batch.")?;

            let batch = Batch::new(planned.domain, run_paths);
            debug!("📬 enqueueing {} file(s) for '{}'", batch.len(), batch.domain);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // 🛑 Shutdown won the race against this enqueue. Hand the
                    // batch straight back: no worker will ever dequeue it, and
                    // run/ must not keep files nobody owns. The pending rows
                    // go stale and get overwritten at the next admission.
                    for name in &moved_names {
                        if let Err(e) = stager.move_run_back_to_wait(name).await {
                            warn!("🚧 could not return '{name}' to wait/ during shutdown: {e:#} — next startup's recovery will");
                        }
                    }
                    return Ok(());
                }
                sent = tx.send(WorkOrder::Batch(batch)) => {
                    if sent.is_err() {
                        // 📪 Channel closed under us; same story as shutdown.
                        for name in &moved_names {
                            if let Err(e) = stager.move_run_back_to_wait(name).await {
                                warn!("🚧 could not return '{name}' to wait/: {e:#} — next startup's recovery will");
                            }
                        }
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{
        EmbeddingConfig, EmbeddingProvider, LoggingConfig, PathsConfig, QueueConfig,
        WeaviateConfig, WorkerConfig,
    };
    use tempfile::TempDir;

    fn config_in(temp: &TempDir, queue_maxsize: usize) -> AppConfig {
        AppConfig {
            paths: PathsConfig {
                wait_dir: temp.path().join("wait"),
                run_dir: temp.path().join("run"),
                buggy_dir: temp.path().join("buggy"),
                sqlite_path: temp.path().join("status.db"),
            },
            weaviate: WeaviateConfig {
                host: "http://in-memory.invalid".to_string(),
                api_key: None,
                collection_name: "MailMessage".to_string(),
                embedding: EmbeddingConfig {
                    provider: EmbeddingProvider::OpenAi,
                    model: "test-model".to_string(),
                    vector_dimensions: 8,
                },
                extra_filter_fields: vec![],
            },
            queue: QueueConfig { maxsize: queue_maxsize },
            worker: WorkerConfig {
                threads: 1,
                poll_interval: 0.05,
            },
            logging: LoggingConfig::default(),
        }
    }

    /// 🧪 Boundary: a cycle with zero remaining capacity does NOTHING.
    /// No scan effects, no moves, no pending rows, no enqueues.
    #[tokio::test]
    async fn the_one_where_a_full_queue_means_a_lazy_cycle() {
        let temp = TempDir::new().unwrap();
        let app_config = config_in(&temp, 1);
        let supervisor = Supervisor::new(app_config.clone());
        let stager = Stager::new(&app_config.paths).await.unwrap();
        let mut ledger = Ledger::open(&app_config.paths.sqlite_path).unwrap();
        tokio::fs::write(
            stager.wait_path("m1__domain=ex.com__.json"),
            r#"{"mail_id":"m1","user_id":"a@ex.com","received_time":"2026-01-01T00:00:00"}"#,
        )
        .await
        .unwrap();

        // 📬 Fill the whole queue (capacity 1) so remaining capacity is 0.
        let (tx, _rx) = async_channel::bounded(app_config.queue.maxsize);
        tx.send(WorkOrder::Retire).await.unwrap();

        let shutdown = CancellationToken::new();
        supervisor
            .poll_cycle(&stager, &mut ledger, &tx, &shutdown)
            .await
            .unwrap();

        // 🛋️ The file never moved, the ledger never heard about it, and
        // nothing new joined the queue.
        assert!(stager.wait_path("m1__domain=ex.com__.json").exists());
        assert!(ledger.get("m1").unwrap().is_none());
        assert_eq!(tx.len(), 1);
    }
}
