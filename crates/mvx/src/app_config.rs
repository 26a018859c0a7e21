//! 🔧 App Configuration — the sacred YAML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the
//! fridge. In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Knowledge graph: the config tree mirrors the deployment's moving parts —
//! `paths` (the three staging directories + the ledger file), `weaviate`
//! (where the vectors go and how they get embedded), `queue`/`worker` (the
//! backpressure and parallelism knobs), `logging` (how loud we are about it).
//! Everything with a sane default HAS a default; everything without one is
//! genuinely deployment-specific and fails loudly when absent.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;
use tracing::info;

// ============================================================
// 📂 PathsConfig — where the files live and die
// ============================================================

/// 📂 The four filesystem anchors. All required — there is no sensible
/// default location for someone else's mail archive.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// 📥 Producers drop fresh message files here.
    pub wait_dir: PathBuf,
    /// 🏃 Files being processed. Presence here = crash-safe pending marker.
    pub run_dir: PathBuf,
    /// 🚑 Terminal home of the unparseable and the unimportable.
    pub buggy_dir: PathBuf,
    /// 🗄️ The status ledger file.
    pub sqlite_path: PathBuf,
}

// ============================================================
// 📡 WeaviateConfig — the vector store and its embedding habits
// ============================================================

/// 🧮 Which embedding service vectorizes the mail text.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    Ollama,
}

impl EmbeddingProvider {
    /// 📡 The Weaviate vectorizer module each provider maps to.
    pub fn vectorizer_module(self) -> &'static str {
        match self {
            EmbeddingProvider::OpenAi => "text2vec-openai",
            EmbeddingProvider::Ollama => "text2vec-ollama",
        }
    }
}

/// 🧮 The embedding knobs that flow into the collection definition.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub vector_dimensions: usize,
}

/// 📡 Where to send the vectors. The collection is the externally visible
/// schema endpoint; renaming it or touching `extra_filter_fields` on a live
/// deployment is a schema change (drop-and-recreate, by hand, on purpose).
#[derive(Debug, Deserialize, Clone)]
pub struct WeaviateConfig {
    /// 📡 Base URL, e.g. `http://localhost:8080`.
    pub host: String,
    /// 🔒 Bearer token — optional because local dev clusters run doors-open.
    #[serde(default)]
    pub api_key: Option<String>,
    pub collection_name: String,
    pub embedding: EmbeddingConfig,
    /// 🧳 Additional `filter_*` property names beyond the fixed mapping.
    /// Each entry must also be present in the producers' message extras for
    /// anything useful to land in it.
    #[serde(default)]
    pub extra_filter_fields: Vec<String>,
}

// ============================================================
// ⚙️ QueueConfig / WorkerConfig — the knobs we admit in public
// ============================================================

/// 📬 Bounded work-queue sizing. The queue holds batches, not feelings,
/// though both can become backpressure if ignored. 🦆
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_maxsize")]
    pub maxsize: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            maxsize: default_queue_maxsize(),
        }
    }
}

// 🔢 100 batches ≈ 5,000 in-flight files tops. Bounded memory is the point.
fn default_queue_maxsize() -> usize {
    100
}

/// 🧵 How many import workers run in parallel, and how often the
/// orchestrator wakes up to look at `wait/`.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_threads")]
    pub threads: usize,
    /// ⏰ Seconds between poll cycles. Fractions welcome.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            poll_interval: default_poll_interval(),
        }
    }
}

// 🧵 Four lanes by default: enough parallelism to keep a vector store fed,
// few enough that debugging doesn't require a conspiracy board.
fn default_worker_threads() -> usize {
    4
}

fn default_poll_interval() -> f64 {
    2.0
}

/// 🔔 How loud. Feeds the tracing EnvFilter; RUST_LOG still outranks it.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================
// 📦 AppConfig — one struct to rule them all
// ============================================================

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub weaviate: WeaviateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 🚀 Load the config — from a YAML file, from env vars, or from the sheer
/// power of hoping.
///
/// 🔧 Merges environment variables (MVX_*) with an optional YAML file.
///
/// 📐 DESIGN NOTE (tribal knowledge, now written down):
///   - If `config_file_name` is None  → env vars only. No file. No assumptions.
///   - If `config_file_name` is Some  → env vars + YAML file, merged. YAML
///     wins on conflicts.
///
/// 💀 Returns an error if the config is unparseable or missing required
/// sections. The error message names the file. You're welcome, 3am-self.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    // 🏗️ Env vars as the base layer — like a good sourdough starter.
    let config = Figment::new().merge(Env::prefixed("MVX_"));

    // 🎯 Conditionally layer in YAML only if a file was actually provided.
    let config = match config_file_name {
        Some(file_name) => config.merge(Yaml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (MVX_*). \
             The file exists in our hearts, but apparently not in a valid state on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (MVX_*). \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
