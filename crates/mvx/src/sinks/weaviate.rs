//! # 📡 THE WEAVIATE SINK
//!
//! *Previously, on mailvex...*
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. One engineer, alone,
//! stares into the abyss of a vector cluster mid-compaction. The abyss
//! stares back and offers a 503. Their coffee has gone cold. Somewhere in
//! the distance, a PagerDuty alert fires for something completely
//! unrelated, and yet: it hurts.
//!
//! "I'll just re-import it," they whispered. "Embeddings are cheap," someone
//! lied, once, at a conference.
//!
//! 🚀 This module sends your precious mail into the vector void, one tenant
//! at a time. It is equal parts HTTP client, batch API whisperer, and coping
//! mechanism. It does not retry. It does not judge. It reports per-object
//! verdicts and moves on. We should all be so lucky.
//!
//! ⚠️ NOTE: If you are reading this at 3am during an incident, take a
//! breath. The files are still in `run/`. The ledger knows everything.
//! You are fine. Debatable, but fine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::app_config::WeaviateConfig;
use crate::sinks::{CollectionSpec, ImportFailure, VectorObject, VectorSink};

/// 📡 The sink side of the Weaviate backend — pure I/O, zero buffering.
///
/// Accepts fully rendered property maps and POSTs them to the batch API.
/// No internal buffer, no transform logic: the worker upstream already
/// parsed, validated, and serialized everything. We just fire it into the
/// vector void and read the per-object verdicts that come back.
///
/// Internally holds:
/// - `client`: the HTTP muscle 💪 — reused across requests
/// - `config`: host, auth, collection targeting
/// - `known_tenants`: tenants we've already ensured, so a hot domain costs
///   one HTTP round-trip ever instead of one per batch
#[derive(Debug)]
pub(crate) struct WeaviateSink {
    client: reqwest::Client,
    config: WeaviateConfig,
    known_tenants: HashSet<String>,
}

/// 📬 One entry of the batch response: the object id plus the verdict.
#[derive(Debug, Deserialize)]
struct BatchResponseItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    result: Option<BatchResultVerdict>,
}

#[derive(Debug, Deserialize)]
struct BatchResultVerdict {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Option<BatchErrors>,
}

#[derive(Debug, Deserialize)]
struct BatchErrors {
    #[serde(default)]
    error: Vec<BatchErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct BatchErrorMessage {
    #[serde(default)]
    message: String,
}

impl WeaviateSink {
    /// 🚀 Stand up a new `WeaviateSink`, fully wired and ready to import.
    ///
    /// This constructor does two things:
    /// 1. Builds the `reqwest::Client` with sane timeouts (10s connect, 30s
    ///    request). Like a polite person — we will wait, but not forever.
    /// 2. Pings `/v1/.well-known/ready` to confirm the cluster is alive and
    ///    talking to us. A handshake. A hello. A "are you even there?"
    ///    If this fails, we fail loudly HERE, at startup, rather than
    ///    quietly 10,000 documents later.
    pub(crate) async fn new(config: WeaviateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL. Either way: tragic.")?;

        let sink = Self {
            client,
            config,
            known_tenants: HashSet::new(),
        };

        // 📡 Readiness ping — "Hello? Is this thing on?" — a developer,
        // gesturing at a cluster.
        let response = sink
            .authorize(sink.client.get(sink.endpoint("/.well-known/ready")))
            .send()
            .await
            .context("💀 The readiness ping never reached Weaviate. Check the host, check the port, check that the cluster exists outside your imagination.")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "💀 Weaviate answered the readiness ping with '{}'. Alive, but not in the mood. We refuse to start a pipeline against a cluster that isn't ready.",
                response.status()
            );
        }
        debug!("✅ Weaviate is up and answering — the welcome mat is out");

        Ok(sink)
    }

    /// 📡 Build a full `/v1`-prefixed endpoint URL.
    /// trim_end_matches('/') — the "/" hygiene you didn't know you needed.
    /// One slash of difference. Infinite suffering of difference.
    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1{}", self.config.host.trim_end_matches('/'), path)
    }

    /// 🔒 Apply bearer auth when an API key is configured. Local dev
    /// clusters run doors-open; production gets the velvet rope.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(api_key) => request.header("Authorization", format!("Bearer {api_key}")),
            None => request,
        }
    }

    /// 🧱 Render the class definition for collection creation.
    ///
    /// The property list is the fixed mapping plus the configured extras.
    /// `filter_*` and `mail_id` properties skip vectorization — they exist
    /// to be filtered on, not embedded; only the two `search_*` texts feed
    /// the embedding model.
    fn class_definition(&self, spec: &CollectionSpec) -> serde_json::Value {
        let module = spec.vectorizer_module.as_str();
        let skip_vector = |name: &str, data_type: &str| {
            json!({
                "name": name,
                "dataType": [data_type],
                "indexFilterable": true,
                "moduleConfig": { module: { "skip": true } },
            })
        };

        let mut properties = vec![
            skip_vector("mail_id", "text"),
            skip_vector("filter_user_id", "text"),
            skip_vector("filter_year", "int"),
            skip_vector("filter_month", "int"),
            skip_vector("filter_day", "int"),
            skip_vector("filter_mailbox", "text"),
            skip_vector("filter_folder", "text"),
            json!({ "name": "search_mail_header", "dataType": ["text"] }),
            json!({ "name": "search_mail_content", "dataType": ["text"] }),
        ];
        for extra in &spec.extra_filter_fields {
            properties.push(skip_vector(extra, "text"));
        }

        json!({
            "class": spec.name,
            "multiTenancyConfig": { "enabled": true },
            "vectorizer": module,
            "moduleConfig": {
                module: {
                    "model": spec.model,
                    "dimensions": spec.vector_dimensions,
                }
            },
            "properties": properties,
        })
    }
}

#[async_trait]
impl VectorSink for WeaviateSink {
    /// 🧱 GET the schema; on 404, POST the class definition.
    ///
    /// An existing collection is left untouched no matter what it looks
    /// like — if the schema drifted from this binary's mapping, the fix is
    /// the documented manual one (drop, recreate, re-import). Online
    /// migration of a live multi-tenant collection is a project, not a
    /// startup step.
    async fn ensure_collection(&mut self, spec: &CollectionSpec) -> Result<()> {
        let schema_url = self.endpoint(&format!("/schema/{}", spec.name));
        let response = self
            .authorize(self.client.get(&schema_url))
            .send()
            .await
            .context("💀 Reached out to check if the collection exists. Got ghosted. The network is giving us the silent treatment.")?;

        if response.status().is_success() {
            debug!(
                "✅ Collection '{}' already exists — leaving it exactly as found",
                spec.name
            );
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!(
                "💀 Asked Weaviate about collection '{}' and got '{}'. Not a yes, not a clean no — we refuse to guess.",
                spec.name,
                response.status()
            );
        }

        debug!("🧱 Collection '{}' is missing — creating it", spec.name);
        let response = self
            .authorize(self.client.post(self.endpoint("/schema")))
            .json(&self.class_definition(spec))
            .send()
            .await
            .context("💀 The collection creation request never made it to Weaviate.")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "💀 Weaviate looked at our class definition and said '{status}'. The body of the response read: '{body}'. We have no one to blame but ourselves, and possibly whoever edited the embedding config.",
            );
        }
        debug!("✅ Collection '{}' created with multi-tenancy on", spec.name);
        Ok(())
    }

    /// 🏠 Create the tenant if we haven't met it yet.
    ///
    /// "Already exists" answers count as success — idempotency over pride.
    /// Known tenants are cached so the once-per-batch call is usually free.
    async fn ensure_tenant(&mut self, domain: &str) -> Result<()> {
        if self.known_tenants.contains(domain) {
            trace!("🏠 tenant '{domain}' already vouched for — skipping the HTTP trip");
            return Ok(());
        }

        let tenants_url = self.endpoint(&format!("/schema/{}/tenants", self.config.collection_name));
        let response = self
            .authorize(self.client.post(&tenants_url))
            .json(&json!([{ "name": domain }]))
            .send()
            .await
            .context(format!(
                "💀 The tenant creation request for '{domain}' vanished into the network."
            ))?;

        let status = response.status();
        if status.is_success() {
            debug!("🏠 tenant '{domain}' is ready for mail");
            self.known_tenants.insert(domain.to_string());
            return Ok(());
        }

        // 🔄 Unprocessable-entity with an "already exists" story = someone
        // (another worker, a previous run) beat us to it. That's a win.
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY && body.contains("already exists") {
            debug!("🏠 tenant '{domain}' existed all along — adopting it");
            self.known_tenants.insert(domain.to_string());
            return Ok(());
        }
        anyhow::bail!(
            "💀 Weaviate refused tenant '{domain}' with '{status}'. The body read: '{body}'."
        )
    }

    /// 📡 One POST to the batch API, per-object verdicts out.
    ///
    /// 🔄 This function does not retry. A transport-level error or a non-2xx
    /// response returns `Err`, and the worker upstream turns that into
    /// "every object in this batch failed" — which is exactly what the
    /// ledger should say about a batch nobody confirmed.
    async fn import_batch(
        &mut self,
        domain: &str,
        objects: Vec<VectorObject>,
    ) -> Result<Vec<ImportFailure>> {
        // 🪪 uuid → mail_id, so verdicts can be translated back into the
        // currency the ledger speaks.
        let mail_ids_by_uuid: HashMap<String, String> = objects
            .iter()
            .map(|object| (object.uuid.to_string(), object.mail_id.clone()))
            .collect();

        let payload: Vec<serde_json::Value> = objects
            .iter()
            .map(|object| {
                json!({
                    "class": self.config.collection_name,
                    "id": object.uuid.to_string(),
                    "tenant": domain,
                    "properties": object.properties,
                })
            })
            .collect();

        debug!(
            "📡 importing {} object(s) into tenant '{domain}' — the payload has left the building, Elvis-style",
            payload.len()
        );
        let response = self
            .authorize(self.client.post(self.endpoint("/batch/objects")))
            .json(&json!({ "objects": payload }))
            .send()
            .await
            .context("💀 The batch import never made it to Weaviate. We launched the payload into the network and the network responded with what can only be described as 'not vibing with it.'")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "💀 The batch import arrived, but Weaviate said '{status}'. The body read: '{body}'."
            );
        }

        let verdicts: Vec<BatchResponseItem> = response
            .json()
            .await
            .context("💀 Weaviate's batch response wasn't the JSON we were promised. The import may or may not have landed; we report it as not.")?;

        let mut failures = Vec::new();
        for verdict in verdicts {
            let failed = verdict
                .result
                .as_ref()
                .and_then(|result| result.status.as_deref())
                .map(|status| !status.eq_ignore_ascii_case("SUCCESS"))
                .unwrap_or(false);
            if !failed {
                continue;
            }
            let Some(mail_id) = verdict
                .id
                .as_ref()
                .and_then(|id| mail_ids_by_uuid.get(id))
            else {
                // 🤷 A failure verdict for an id we never sent. Log-worthy,
                // not ledger-worthy — we can't attribute it to a file.
                debug!("🤷 batch verdict for unknown object id {:?} — ignoring", verdict.id);
                continue;
            };
            let message = verdict
                .result
                .and_then(|result| result.errors)
                .map(|errors| {
                    errors
                        .error
                        .into_iter()
                        .map(|error| error.message)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| "import failed with no stated reason".to_string());
            failures.push(ImportFailure {
                mail_id: mail_id.clone(),
                message,
            });
        }

        trace!(
            "🚀 batch import landed — {} object(s), {} casualty(ies)",
            mail_ids_by_uuid.len(),
            failures.len()
        );
        Ok(failures)
    }
}
