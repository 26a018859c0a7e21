//! 🎬 *[a channel fills with batches. somewhere, a worker waits.]*
//! *[the clock on the wall reads 2:47am.]*
//! *[nobody asked for this mail archive. and yet, here we are.]*
//!
//! 📥 The ImportWorker module — one batch in, fifty fates out.
//!
//! It dequeues a `(domain, files)` batch, parses every file, fires ONE bulk
//! import at the vector store, commits ONE ledger transaction with every
//! verdict, and only then touches the filesystem: successes are deleted,
//! failures move to `buggy/`.
//!
//! 🧠 Knowledge graph: the ordering is the crash-safety story —
//! ```text
//!   parse → import → ledger commit → filesystem terminal actions
//! ```
//! A crash before the commit leaves files in `run/` (recovered at next
//! startup, rows overwritten). A crash after the commit but before the
//! deletes ALSO leaves files in `run/` — same recovery, rows overwritten
//! again, the import is idempotent because object ids are deterministic.
//! There is no window where a file is gone but its row says pending.
//!
//! ⚠️ When the singularity occurs, the ImportWorker will still be dequeuing
//! batches. It will not notice. It does not notice things. It only parses,
//! imports, commits, and moves files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{WorkOrder, Worker};
use crate::common::{Batch, Message, peek_mail_id};
use crate::ledger::Ledger;
use crate::sinks::{SinkBackend, VectorObject, VectorSink};
use crate::stager::Stager;

/// 📥 The ImportWorker: dequeue → process → repeat, until retirement.
///
/// Owns all of its resources — its receiver end, its vector-sink client,
/// its ledger connection, its stager handle. Nothing here is shared with a
/// peer, so no worker ever blocks another. Lifetime of everything equals
/// the lifetime of the worker; it all drops when the task returns.
#[derive(Debug)]
pub(crate) struct ImportWorker {
    id: usize,
    rx: Receiver<WorkOrder>,
    sink: SinkBackend,
    ledger: Ledger,
    stager: Stager,
}

/// 📄 A staged file that made it through parsing, ready for the sink.
struct ParsedFile {
    path: PathBuf,
    mail_id: String,
    object: VectorObject,
}

/// 💀 A staged file that did not.
struct FailedFile {
    path: PathBuf,
    mail_id: Option<String>,
    reason: String,
}

impl ImportWorker {
    pub(crate) fn new(
        id: usize,
        rx: Receiver<WorkOrder>,
        sink: SinkBackend,
        ledger: Ledger,
        stager: Stager,
    ) -> Self {
        Self {
            id,
            rx,
            sink,
            ledger,
            stager,
        }
    }

    /// 📦 The per-batch state machine. See the module docs for the ordering
    /// law; see the error table for why nothing in here retries.
    async fn process_batch(&mut self, batch: &Batch) -> Result<()> {
        debug!(
            "📥 worker {} took a batch: {} file(s) for tenant '{}'",
            self.id,
            batch.len(),
            batch.domain
        );

        // 📄 Phase 1: parse. Parse failures are terminal for the file but
        // not for the batch — the survivors still get imported.
        let mut parsed: Vec<ParsedFile> = Vec::with_capacity(batch.len());
        let mut failed: Vec<FailedFile> = Vec::new();
        for path in &batch.paths {
            let raw = match tokio::fs::read_to_string(path).await {
                Ok(raw) => raw,
                Err(e) => {
                    failed.push(FailedFile {
                        path: path.clone(),
                        mail_id: None,
                        reason: format!("unreadable staged file: {e}"),
                    });
                    continue;
                }
            };
            match Message::parse(&raw).and_then(|message| {
                let object = VectorObject {
                    uuid: message.vector_uuid(),
                    mail_id: message.mail_id.clone(),
                    properties: message.to_properties()?,
                };
                Ok((message.mail_id, object))
            }) {
                Ok((mail_id, object)) => parsed.push(ParsedFile {
                    path: path.clone(),
                    mail_id,
                    object,
                }),
                Err(e) => failed.push(FailedFile {
                    path: path.clone(),
                    // 🕵️ The file flunked, but maybe its mail_id didn't.
                    mail_id: peek_mail_id(&raw),
                    reason: format!("parse failure: {e:#}"),
                }),
            }
        }

        // 📡 Phase 2: one tenant check, one bulk import. A connection-level
        // error on either counts against EVERY parsed file — nobody
        // confirmed their arrival, so nobody gets a success row.
        let mut successes: Vec<(PathBuf, String)> = Vec::new();
        if !parsed.is_empty() {
            let import_result = match self.sink.ensure_tenant(&batch.domain).await {
                Ok(()) => {
                    let objects = parsed.iter().map(|file| file.object.clone()).collect();
                    self.sink.import_batch(&batch.domain, objects).await
                }
                Err(e) => Err(e),
            };
            match import_result {
                Ok(import_failures) => {
                    let mut doomed: std::collections::BTreeMap<String, String> = import_failures
                        .into_iter()
                        .map(|failure| (failure.mail_id, failure.message))
                        .collect();
                    for file in parsed {
                        match doomed.remove(&file.mail_id) {
                            Some(reason) => failed.push(FailedFile {
                                path: file.path,
                                mail_id: Some(file.mail_id),
                                reason: format!("import failure: {reason}"),
                            }),
                            None => successes.push((file.path, file.mail_id)),
                        }
                    }
                }
                Err(e) => {
                    // 🔌 Transport-level death. The whole batch rides down with it.
                    warn!(
                        "🔌 worker {} lost the vector store mid-batch for '{}': {e:#}",
                        self.id, batch.domain
                    );
                    let reason = format!("bulk import transport failure: {e:#}");
                    for file in parsed {
                        failed.push(FailedFile {
                            path: file.path,
                            mail_id: Some(file.mail_id),
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }

        // 🗄️ Phase 3: ONE ledger transaction with every verdict. This commit
        // happens BEFORE any file is deleted or moved — that ordering is the
        // whole crash-safety contract, do not reorder it to "feel faster".
        let success_ids: Vec<String> = successes.iter().map(|(_, mail_id)| mail_id.clone()).collect();
        let failure_rows: Vec<(String, String)> = failed
            .iter()
            .filter_map(|file| {
                file.mail_id
                    .as_ref()
                    .map(|mail_id| (mail_id.clone(), file.reason.clone()))
            })
            .collect();
        self.ledger
            .finalize_batch(&success_ids, &failure_rows)
            .context("💀 The batch finalization did not commit. No file gets touched; run/ keeps them for recovery.")?;

        // 📂 Phase 4: filesystem terminal actions. Per-file failures here are
        // logged and left in place — the next startup's recovery sweep deals
        // with stragglers, and the ledger already told the truth.
        for (path, mail_id) in &successes {
            if let Err(e) = self.stager.delete(path).await {
                warn!("🚧 worker {} could not delete '{mail_id}' after success: {e:#}", self.id);
            }
        }
        for file in &failed {
            if let Err(e) = self.stager.move_to_buggy(&file.path).await {
                warn!(
                    "🚧 worker {} could not move '{}' to buggy/: {e:#}",
                    self.id,
                    file.path.display()
                );
            }
        }

        debug!(
            "🏁 worker {} finished '{}': {} imported, {} routed to buggy/",
            self.id,
            batch.domain,
            successes.len(),
            failed.len()
        );
        Ok(())
    }
}

impl Worker for ImportWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 ImportWorker {} started — dequeue → process → repeat, let's go", self.id);
            loop {
                match self.rx.recv().await {
                    Ok(WorkOrder::Batch(batch)) => {
                        // ⚠️ A failed batch must NOT kill the worker. Its files
                        // are still in run/, the next startup recovers them,
                        // and there are more batches behind this one.
                        if let Err(e) = self.process_batch(&batch).await {
                            error!(
                                "💀 worker {} abandoned a batch for '{}': {e:#} — files remain in run/ for recovery",
                                self.id, batch.domain
                            );
                        }
                    }
                    Ok(WorkOrder::Retire) | Err(_) => {
                        // ☠️ One pill per worker, or the channel closed under us.
                        // Either way: clock out cleanly.
                        break;
                    }
                }
            }
            debug!("🏁 ImportWorker {} retired. Goodnight. 💤", self.id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::PathsConfig;
    use crate::sinks::InMemorySink;
    use tempfile::TempDir;

    struct Rig {
        _temp: TempDir,
        stager: Stager,
        sink: InMemorySink,
        tx: async_channel::Sender<WorkOrder>,
        handle: JoinHandle<Result<()>>,
        ledger_path: PathBuf,
    }

    /// 🧪 One worker, one channel, one tempdir. The whole stage, miniature.
    async fn rig() -> Rig {
        let temp = TempDir::new().unwrap();
        let paths = PathsConfig {
            wait_dir: temp.path().join("wait"),
            run_dir: temp.path().join("run"),
            buggy_dir: temp.path().join("buggy"),
            sqlite_path: temp.path().join("ledger.db"),
        };
        let stager = Stager::new(&paths).await.unwrap();
        let sink = InMemorySink::new();
        let (tx, rx) = async_channel::bounded(4);
        let worker = ImportWorker::new(
            0,
            rx,
            SinkBackend::InMemory(sink.clone()),
            Ledger::open(&paths.sqlite_path).unwrap(),
            stager.clone(),
        );
        let handle = worker.start();
        Rig {
            _temp: temp,
            stager,
            sink,
            tx,
            handle,
            ledger_path: paths.sqlite_path,
        }
    }

    async fn stage(rig: &Rig, name: &str, body: &str) -> PathBuf {
        tokio::fs::write(rig.stager.wait_path(name), body).await.unwrap();
        rig.stager.move_to_run(name).await.unwrap()
    }

    fn mail(mail_id: &str) -> String {
        format!(
            r#"{{"mail_id":"{mail_id}","user_id":"kevin@ex.com","received_time":"2026-03-14T09:00:00"}}"#
        )
    }

    #[tokio::test]
    async fn the_one_where_a_clean_batch_sails_through() {
        let rig = rig().await;
        let paths = vec![
            stage(&rig, "a.json", &mail("m1")).await,
            stage(&rig, "b.json", &mail("m2")).await,
        ];
        rig.tx
            .send(WorkOrder::Batch(Batch::new("ex.com".into(), paths.clone())))
            .await
            .unwrap();
        rig.tx.send(WorkOrder::Retire).await.unwrap();
        rig.handle.await.unwrap().unwrap();

        // 📡 One import, right tenant, both ids.
        let imports = rig.sink.imports.lock().await;
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].domain, "ex.com");
        assert_eq!(imports[0].mail_ids, vec!["m1", "m2"]);
        assert!(rig.sink.tenants.lock().await.contains("ex.com"));

        // 🗄️ Ledger says success; 📂 files are gone from everywhere.
        let ledger = Ledger::open(&rig.ledger_path).unwrap();
        for mail_id in ["m1", "m2"] {
            assert!(ledger.get(mail_id).unwrap().unwrap().is_success);
        }
        for path in paths {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn the_one_where_one_bad_apple_does_not_spoil_the_batch() {
        let rig = rig().await;
        let good = stage(&rig, "good.json", &mail("m1")).await;
        // 💀 Valid JSON, but no user_id and no received_time — a parse
        // failure whose mail_id is still sniffable for the ledger.
        let bad = stage(&rig, "bad.json", r#"{"mail_id":"m2"}"#).await;
        rig.tx
            .send(WorkOrder::Batch(Batch::new("ex.com".into(), vec![good.clone(), bad.clone()])))
            .await
            .unwrap();
        rig.tx.send(WorkOrder::Retire).await.unwrap();
        rig.handle.await.unwrap().unwrap();

        // 📡 The import carried only the survivor.
        let imports = rig.sink.imports.lock().await;
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].mail_ids, vec!["m1"]);

        let ledger = Ledger::open(&rig.ledger_path).unwrap();
        assert!(ledger.get("m1").unwrap().unwrap().is_success);
        // 💀 The bad apple flunked parsing but its mail_id was sniffable.
        let bad_row = ledger.get("m2").unwrap().unwrap();
        assert!(bad_row.is_completed && !bad_row.is_success);
        assert!(bad_row.error_message.unwrap().contains("parse failure"));
        assert!(!good.exists());
        assert!(!bad.exists());
        assert!(rig._temp.path().join("buggy/bad.json").exists());
    }

    #[tokio::test]
    async fn the_one_where_the_sink_dooms_a_specific_mail() {
        let rig = rig().await;
        rig.sink.doom_mail("m2").await;
        let p1 = stage(&rig, "a.json", &mail("m1")).await;
        let p2 = stage(&rig, "b.json", &mail("m2")).await;
        rig.tx
            .send(WorkOrder::Batch(Batch::new("ex.com".into(), vec![p1, p2.clone()])))
            .await
            .unwrap();
        rig.tx.send(WorkOrder::Retire).await.unwrap();
        rig.handle.await.unwrap().unwrap();

        let ledger = Ledger::open(&rig.ledger_path).unwrap();
        assert!(ledger.get("m1").unwrap().unwrap().is_success);
        let doomed = ledger.get("m2").unwrap().unwrap();
        assert!(doomed.is_completed && !doomed.is_success);
        assert!(doomed.error_message.unwrap().contains("import failure"));
        assert!(!p2.exists());
        assert!(rig._temp.path().join("buggy/b.json").exists());
    }

    #[tokio::test]
    async fn the_one_where_the_transport_takes_everyone_down_with_it() {
        let rig = rig().await;
        rig.sink.set_transport_down(true);
        let p1 = stage(&rig, "a.json", &mail("m1")).await;
        let p2 = stage(&rig, "b.json", &mail("m2")).await;
        rig.tx
            .send(WorkOrder::Batch(Batch::new("ex.com".into(), vec![p1, p2])))
            .await
            .unwrap();
        rig.tx.send(WorkOrder::Retire).await.unwrap();
        rig.handle.await.unwrap().unwrap();

        let ledger = Ledger::open(&rig.ledger_path).unwrap();
        for mail_id in ["m1", "m2"] {
            let row = ledger.get(mail_id).unwrap().unwrap();
            assert!(row.is_completed && !row.is_success);
            assert!(row.error_message.unwrap().contains("transport"));
        }
        assert!(rig._temp.path().join("buggy/a.json").exists());
        assert!(rig._temp.path().join("buggy/b.json").exists());
    }

    #[tokio::test]
    async fn the_one_where_retirement_is_honored_promptly() {
        let rig = rig().await;
        rig.tx.send(WorkOrder::Retire).await.unwrap();
        // ☠️ No work sent. The worker must exit on the pill alone.
        rig.handle.await.unwrap().unwrap();
    }
}
