//! 📬 mvx — the core library crate, the beating heart, the engine room
//! where dreams of unattended mail ingestion become mildly-configured reality.
//!
//! 📦 This crate contains the supervisor, the workers, the stager, the
//! ledger, the batcher, the sinks, and all the existential dread that comes
//! with promising "exactly one terminal state per file". 🦆
//!
//! 🧠 Knowledge graph: the pipeline flow is:
//! ```text
//!   wait/ → [scan + batch] → run/ → channel → ImportWorker(parse + bulk import)
//!         → ledger commit → deleted (success) | buggy/ (failure)
//! ```
//! Everything is owned, nothing is shared, and the only global state is the
//! filesystem itself — which is the one global state a crash can't corrupt.

pub mod app_config;
pub mod batcher;
pub(crate) mod common;
pub(crate) mod ledger;
pub(crate) mod sinks;
pub(crate) mod stager;
mod supervisors;

use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app_config::AppConfig;
use crate::sinks::{SinkBackend, WeaviateSink};
use crate::supervisors::Supervisor;

pub use ledger::{DomainStatus, UserStatus};

/// 🚀 The grand entry point. The big kahuna. The main event.
///
/// Builds one Weaviate client for the orchestrator (collection check) and
/// one per worker, wires the signal handlers to a cancellation token, and
/// hands the whole thing to the Supervisor. Returns when a signal arrives
/// and the drain completes — or with an error if startup can't even.
pub async fn run(app_config: AppConfig) -> Result<()> {
    let start_time = SystemTime::now();
    info!("📬 MAILVEX IS WAKING UP — wait/ is about to get a lot emptier, baby!");

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    // 📡 One sink client per task — the orchestrator's is used exactly once
    // (ensure_collection), the workers' live as long as the workers do.
    // Every constructor pings the cluster, so an unreachable vector store
    // dies HERE with a non-zero exit, before any file moves anywhere.
    let orchestrator_sink = SinkBackend::Weaviate(
        WeaviateSink::new(app_config.weaviate.clone())
            .await
            .context("Failed to create the orchestrator's vector sink")?,
    );
    let mut worker_sinks = Vec::with_capacity(app_config.worker.threads);
    for _ in 0..app_config.worker.threads {
        worker_sinks.push(SinkBackend::Weaviate(
            WeaviateSink::new(app_config.weaviate.clone())
                .await
                .context("Failed to create a worker's vector sink")?,
        ));
    }

    let supervisor = Supervisor::new(app_config);
    supervisor
        .start(orchestrator_sink, worker_sinks, shutdown)
        .await?;

    info!(
        "🎉 MAILVEX SHUT DOWN CLEANLY — uptime {:#?}, every admitted file reached a terminal state 🦆",
        start_time.elapsed()?
    );
    Ok(())
}

/// 🛑 Wire interrupt + terminate to the cancellation token.
///
/// 🧠 Knowledge graph: the token is observed in three places — the poll
/// loop's sleep, the poll loop's enqueue, and the top of each cycle. The
/// workers never see it: they get Retire pills through the queue instead,
/// so in-flight batches always finish whole.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("💀 could not install the interrupt handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("💀 could not install the terminate handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!("🛑 interrupt received — beginning graceful shutdown"),
            _ = terminate => info!("🛑 terminate received — beginning graceful shutdown"),
        }
        shutdown.cancel();
    });
}

/// 📊 Everything the status tool renders, in one read.
#[derive(Debug)]
pub struct StatusSnapshot {
    pub domains: Vec<DomainStatus>,
    pub users: Vec<UserStatus>,
    pub latest_completion: Option<String>,
}

/// 📊 Read the ledger's rollups without disturbing a running pipeline.
///
/// Read-only connection, snapshot-consistent under WAL — writers never
/// notice we were here. Safe to run while the daemon is mid-import.
pub fn status(app_config: &AppConfig) -> Result<StatusSnapshot> {
    let ledger = ledger::Ledger::open_read_only(&app_config.paths.sqlite_path)?;
    Ok(StatusSnapshot {
        domains: ledger.domain_counts()?,
        users: ledger.user_counts()?,
        latest_completion: ledger.latest_completion()?,
    })
}
