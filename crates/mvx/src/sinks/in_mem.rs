//! 🧪 The in-memory sink — a vector store that never leaves the building.
//!
//! 📦 A sink that never forgets. It records every collection check, every
//! tenant, every import, and hands it all back to the test that asked.
//! It can also be told to fail — per object, or wholesale at the transport
//! level — because the interesting half of this pipeline is what happens
//! when the vector store has a bad day.
//!
//! 🧠 Knowledge graph: this is the evidence locker behind the pipeline
//! tests. Clone-able because tests need to peek inside after handing `self`
//! off to a worker. The `Arc` means everyone shares the same ledgers-of-
//! what-happened. Communist data, but in a good way.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::sinks::{CollectionSpec, ImportFailure, VectorObject, VectorSink};

/// 📼 One recorded `import_batch` call: the tenant and the mail ids, in the
/// order they were sent.
#[derive(Debug, Clone)]
pub(crate) struct RecordedImport {
    pub domain: String,
    pub mail_ids: Vec<String>,
}

/// 🧪 The sink that exists to be interrogated later.
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemorySink {
    /// 🧱 Every collection name ensure_collection was asked about.
    pub(crate) collections: Arc<Mutex<Vec<String>>>,
    /// 🏠 Every tenant ever ensured. A set — idempotency is the contract.
    pub(crate) tenants: Arc<Mutex<BTreeSet<String>>>,
    /// 📼 Every import call, verbatim.
    pub(crate) imports: Arc<Mutex<Vec<RecordedImport>>>,
    /// 💣 mail_ids that should come back as per-object failures.
    pub(crate) fail_mail_ids: Arc<Mutex<BTreeSet<String>>>,
    /// 🔌 Flip this and every import dies at the transport level.
    pub(crate) transport_down: Arc<AtomicBool>,
}

impl InMemorySink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 💣 Arrange for one specific mail to fail its import.
    pub(crate) async fn doom_mail(&self, mail_id: &str) {
        self.fail_mail_ids.lock().await.insert(mail_id.to_string());
    }

    /// 🔌 Pull the network cable. Or plug it back in.
    pub(crate) fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorSink for InMemorySink {
    /// 🧱 Records the ask. The collection "exists" the moment you mention it.
    async fn ensure_collection(&mut self, spec: &CollectionSpec) -> Result<()> {
        self.collections.lock().await.push(spec.name.clone());
        Ok(())
    }

    async fn ensure_tenant(&mut self, domain: &str) -> Result<()> {
        self.tenants.lock().await.insert(domain.to_string());
        Ok(())
    }

    /// 📼 Lock, record, report. Like a fax machine but for verdicts. 🦆
    async fn import_batch(
        &mut self,
        domain: &str,
        objects: Vec<VectorObject>,
    ) -> Result<Vec<ImportFailure>> {
        if self.transport_down.load(Ordering::SeqCst) {
            // 🔌 The test asked for chaos. The test receives chaos.
            anyhow::bail!("transport is down (connection refused, as requested)");
        }

        let mail_ids: Vec<String> = objects.iter().map(|object| object.mail_id.clone()).collect();
        self.imports.lock().await.push(RecordedImport {
            domain: domain.to_string(),
            mail_ids,
        });

        let doomed = self.fail_mail_ids.lock().await;
        Ok(objects
            .iter()
            .filter(|object| doomed.contains(&object.mail_id))
            .map(|object| ImportFailure {
                mail_id: object.mail_id.clone(),
                message: "import refused (doomed by test fixture)".to_string(),
            })
            .collect())
    }
}
