//! 🔌 Sinks — where the vectors actually go.
//!
//! 🚰 The pipeline parses mail; the sink gets it indexed. And in between,
//! we panic! (kidding, we use anyhow)
//!
//! 🎭 This module is the casting agency. Need a multi-tenant Weaviate
//! cluster? A memory-backed stand-in that records everything for test
//! assertions? We've got a sink for that.
//!
//! 🧠 Knowledge graph: trait → concrete impls (WeaviateSink, InMemorySink) →
//! SinkBackend enum, dispatch via match. Every worker owns exactly one
//! backend; the orchestrator owns one more for the startup collection check.
//! Nothing is shared, nothing is locked, nobody waits on a peer.
//!
//! 🦆 The duck is here because every module must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::app_config::WeaviateConfig;

pub(crate) mod in_mem;
pub(crate) mod weaviate;

pub(crate) use in_mem::InMemorySink;
pub(crate) use weaviate::WeaviateSink;

/// 📦 One mail, sink-ready: the deterministic object id, the ledger key,
/// and the already-rendered property map.
#[derive(Debug, Clone)]
pub(crate) struct VectorObject {
    pub uuid: Uuid,
    pub mail_id: String,
    pub properties: serde_json::Value,
}

/// 💀 One object the sink could not place, with the reason on the record.
/// This is the currency the worker converts into ledger failure rows.
#[derive(Debug, Clone)]
pub(crate) struct ImportFailure {
    pub mail_id: String,
    pub message: String,
}

/// 🧱 Everything `ensure_collection` needs to conjure the collection:
/// the name, the `filter_*` extras beyond the fixed mapping, and the
/// embedding module wiring.
#[derive(Debug, Clone)]
pub(crate) struct CollectionSpec {
    pub name: String,
    pub extra_filter_fields: Vec<String>,
    pub vectorizer_module: String,
    pub model: String,
    pub vector_dimensions: usize,
}

impl CollectionSpec {
    pub(crate) fn from_weaviate_config(config: &WeaviateConfig) -> Self {
        Self {
            name: config.collection_name.clone(),
            extra_filter_fields: config.extra_filter_fields.clone(),
            vectorizer_module: config.embedding.provider.vectorizer_module().to_string(),
            model: config.embedding.model.clone(),
            vector_dimensions: config.embedding.vector_dimensions,
        }
    }
}

/// 🕳️ A sink that places mail into a multi-tenant vector store.
///
/// # Contract 📜
/// - `ensure_collection` is idempotent and called ONCE at startup, by the
///   orchestrator's backend only. Workers assume the collection exists.
/// - `ensure_tenant` is idempotent and cheap to repeat — workers call it
///   once per batch, implementations may cache.
/// - `import_batch` is ONE bulk operation. Per-object failures come back in
///   the `Vec`; a returned `Err` means the transport/connection level failed
///   and the caller must treat EVERY object as failed. The sink never
///   retries. Retries are nobody's problem, because there are none — one
///   attempt per batch is the whole durability story, the ledger records
///   the rest.
#[async_trait]
pub(crate) trait VectorSink: std::fmt::Debug {
    /// 🧱 Create the collection if it's missing. Existing collections are
    /// left exactly as found — schema migration is a manual affair.
    async fn ensure_collection(&mut self, spec: &CollectionSpec) -> Result<()>;
    /// 🏠 Make sure the tenant exists before importing into it.
    async fn ensure_tenant(&mut self, domain: &str) -> Result<()>;
    /// 📡 One bulk import. `Ok(failures)` = the call landed, these objects
    /// didn't. `Err` = the call itself died; everything is failed.
    async fn import_batch(
        &mut self,
        domain: &str,
        objects: Vec<VectorObject>,
    ) -> Result<Vec<ImportFailure>>;
}

/// 🎭 The many faces of a sink — a polymorphic casting call for vector
/// destinations. The enum dispatches to the inner concrete type, keeping the
/// workers blissfully ignorant of where vectors actually land. Ignorance is
/// a feature. It's called "abstraction."
#[derive(Debug)]
pub(crate) enum SinkBackend {
    Weaviate(WeaviateSink),
    InMemory(InMemorySink),
}

#[async_trait]
impl VectorSink for SinkBackend {
    async fn ensure_collection(&mut self, spec: &CollectionSpec) -> Result<()> {
        match self {
            SinkBackend::Weaviate(sink) => sink.ensure_collection(spec).await,
            SinkBackend::InMemory(sink) => sink.ensure_collection(spec).await,
        }
    }

    async fn ensure_tenant(&mut self, domain: &str) -> Result<()> {
        match self {
            SinkBackend::Weaviate(sink) => sink.ensure_tenant(domain).await,
            SinkBackend::InMemory(sink) => sink.ensure_tenant(domain).await,
        }
    }

    async fn import_batch(
        &mut self,
        domain: &str,
        objects: Vec<VectorObject>,
    ) -> Result<Vec<ImportFailure>> {
        match self {
            SinkBackend::Weaviate(sink) => sink.import_batch(domain, objects).await,
            SinkBackend::InMemory(sink) => sink.import_batch(domain, objects).await,
        }
    }
}
