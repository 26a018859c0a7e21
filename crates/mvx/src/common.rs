//! 📦 Common data structures — the building blocks of mailvex
//!
//! ---
//!
//! 🎬 COLD OPEN — INT. MAIL ARCHIVE — 3:47 AM
//!
//! 🌩️  Somewhere, a producer process drops one more JSON file into `wait/`.
//! It does not ask permission. It has never asked permission. The directory
//! listing grows by one. The pipeline does not flinch.
//!
//! ✅ And then — a `Message` is parsed. Quietly. Carrying its required fields
//! like a responsible adult carrying groceries in one trip (ALL of them, no
//! second trips, this is a point of honor). It knows its `mail_id`. It knows
//! its `user_id`. It may or may not know its `domain`. Relatable.
//!
//! 🦆
//!
//! This module defines the humble yet load-bearing structs that ferry mail
//! from the staging directory to the vector store. They don't ask questions.
//! They carry the data. They are the postal workers of this codebase.
//! Please tip your postal workers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, NaiveDateTime};
use serde::Deserialize;
use uuid::Uuid;

/// 🎯 A singular `Message` — one mail, one destiny, three required fields.
///
/// This is the atomic unit of ingestion. A single mail document, deserialized
/// from its staging file and hurled through the pipeline toward a tenant in
/// the vector store.
///
/// # Field law 📜
/// - `mail_id`, `user_id`, `received_time` are REQUIRED. A file missing any
///   of them is a parse failure and goes to `buggy/`. No appeals court.
/// - `subject`/`mail_header` and `content`/`mail_content` are the same field
///   wearing two different name tags. Producers disagree on naming. We accept
///   both and judge neither.
/// - `extras` hoovers up every unrecognized key via `#[serde(flatten)]`.
///   Only `filter_*`-prefixed extras make it into the vector properties —
///   the rest ride along and are politely ignored at serialization time.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Message {
    /// The document's identity. NOT an `Option`. Identity is non-negotiable here.
    pub mail_id: String,
    /// 📧 Email-like address. Also the fallback source of the tenant domain —
    /// everything after the `@` belongs to somebody.
    pub user_id: String,
    /// ⏰ ISO-8601, zoned or naive. Kept as the raw string; parsed on demand.
    pub received_time: String,
    /// 🏠 The tenant domain, if the producer bothered to spell it out.
    #[serde(default)]
    pub domain: Option<String>,
    /// ✉️ The subject line. `mail_header` is its stage name.
    #[serde(default, alias = "mail_header")]
    pub subject: Option<String>,
    /// 📄 The body. `mail_content` is its stage name.
    #[serde(default, alias = "mail_content")]
    pub content: Option<String>,
    #[serde(default)]
    pub mailbox: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    /// 🧳 Everything else the producer packed. `filter_*` keys flow through
    /// to the vector properties verbatim; the rest stay in the suitcase.
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl Message {
    /// 🏗️ Parse a raw staging file body into a `Message`, with standards.
    ///
    /// serde handles the shape; we handle the dignity: empty `mail_id` or
    /// `user_id` strings are rejected (an empty identity is no identity),
    /// and `received_time` must actually parse as a timestamp — catching it
    /// here means the failure is a clean parse failure with a reason, not a
    /// surprise seventeen layers deeper during property serialization.
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(raw)
            .context("💀 The file claimed to be JSON. The file lied. Or at least stretched the truth past what serde was willing to tolerate.")?;

        if message.mail_id.trim().is_empty() {
            bail!("mail_id is empty — a message with no identity cannot be ledgered");
        }
        if message.user_id.trim().is_empty() {
            bail!("user_id is empty — no user, no domain, no tenant, no deal");
        }
        // ⏰ Validate the timestamp NOW so bad dates die as parse failures.
        message.received_at().context(format!(
            "💀 received_time '{}' refused to be a timestamp",
            message.received_time
        ))?;

        Ok(message)
    }

    /// ⏰ Parse `received_time` — RFC 3339 first, then the naive ISO-8601
    /// shapes producers actually emit (T-separated, space-separated, with or
    /// without fractional seconds).
    pub(crate) fn received_at(&self) -> Result<NaiveDateTime> {
        let raw = self.received_time.trim();
        if let Ok(zoned) = DateTime::parse_from_rfc3339(raw) {
            return Ok(zoned.naive_local());
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(naive);
            }
        }
        bail!("'{raw}' is not RFC 3339 and not naive ISO-8601 either");
    }

    /// 📅 Derive `(year, month, day)` from `received_time` — the filterable
    /// date triple the vector schema wants.
    pub(crate) fn ymd(&self) -> Result<(i32, u32, u32)> {
        let at = self.received_at()?;
        Ok((at.year(), at.month(), at.day()))
    }

    /// 🏠 Resolve the tenant domain: the explicit `domain` field wins; else
    /// whatever follows the `@` in `user_id`. `None` means nobody knows where
    /// this mail lives, which upstream treats as a routing failure.
    pub(crate) fn domain(&self) -> Option<String> {
        if let Some(domain) = &self.domain {
            if !domain.trim().is_empty() {
                return Some(domain.trim().to_string());
            }
        }
        let host = self.user_id.rsplit_once('@')?.1.trim();
        if host.is_empty() {
            None
        } else {
            Some(host.to_string())
        }
    }

    /// 🪪 The vector object id: a UUIDv5 derived from `mail_id`.
    ///
    /// The vector store insists on UUID identifiers; the ledger insists on
    /// `mail_id`. UUIDv5 is the peace treaty — deterministic, so re-importing
    /// the same mail lands on the same object instead of minting a twin.
    pub(crate) fn vector_uuid(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.mail_id.as_bytes())
    }

    /// 🗺️ Render the fixed property mapping for the vector store.
    ///
    /// The mapping is a contract (`filter_user_id`, the date triple,
    /// `mail_id`, the two `search_*` texts, the optional mailbox/folder,
    /// plus configured `filter_*` extras). Changing it is a schema change,
    /// which is a drop-and-recreate affair — see the sink module.
    pub(crate) fn to_properties(&self) -> Result<serde_json::Value> {
        let (year, month, day) = self.ymd()?;
        let mut properties = serde_json::Map::new();
        properties.insert("filter_user_id".into(), self.user_id.clone().into());
        properties.insert("filter_year".into(), i64::from(year).into());
        properties.insert("filter_month".into(), u64::from(month).into());
        properties.insert("filter_day".into(), u64::from(day).into());
        properties.insert("mail_id".into(), self.mail_id.clone().into());
        properties.insert(
            "search_mail_content".into(),
            self.content.clone().unwrap_or_default().into(),
        );
        properties.insert(
            "search_mail_header".into(),
            self.subject.clone().unwrap_or_default().into(),
        );
        if let Some(mailbox) = &self.mailbox {
            properties.insert("filter_mailbox".into(), mailbox.clone().into());
        }
        if let Some(folder) = &self.folder {
            properties.insert("filter_folder".into(), folder.clone().into());
        }
        // 🧳 Schema-driven extras: only the filter_* keys flow through.
        // Everything else in the flattened map stays behind. Verbatim values —
        // the schema owner decided what these mean, not us.
        for (key, value) in &self.extras {
            if key.starts_with("filter_") {
                properties.insert(key.clone(), value.clone());
            }
        }
        Ok(serde_json::Value::Object(properties))
    }
}

/// 🕵️ Best-effort `mail_id` sniff from a file that failed full parsing.
///
/// A file can flunk `Message::parse` (missing user_id, cursed timestamp) and
/// still carry a perfectly good `mail_id`. The ledger wants a failure row when
/// the id is knowable, so we take one more, much lazier look before giving up.
pub(crate) fn peek_mail_id(raw: &str) -> Option<String> {
    peek_identity(raw).map(|identity| identity.0)
}

/// 🕵️ Best-effort identity triple `(mail_id, user_id, received_time)` via a
/// loose JSON read — no required-field law, no timestamp validation.
///
/// The orchestrator uses this at enqueue time to write the pending ledger
/// row: the row must exist while the file sits in `run/`, but full parsing
/// (and full judgment) is the worker's job. `mail_id` is the one hard
/// requirement — without it there is no row to write.
pub(crate) fn peek_identity(raw: &str) -> Option<(String, String, String)> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let field = |name: &str| {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let mail_id = field("mail_id");
    if mail_id.is_empty() {
        return None;
    }
    Some((mail_id, field("user_id"), field("received_time")))
}

/// 📦 A `Batch` — up to `BATCH_MAX` staged files, one domain, one destiny.
///
/// The unit of work. One batch = one tenant = one bulk import call = one
/// ledger transaction. It travels the channel whole and is processed whole.
/// Think of it as a shopping cart, except everything in the cart is mail,
/// the cart has no wheels, and the checkout is a vector database.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    /// 🏠 The tenant every file in this batch belongs to.
    pub domain: String,
    /// 📂 Paths into `run/` — minted once, owned by exactly one batch.
    pub paths: Vec<PathBuf>,
}

impl Batch {
    pub(crate) fn new(domain: String, paths: Vec<PathBuf>) -> Self {
        Self { domain, paths }
    }

    pub(crate) fn len(&self) -> usize {
        self.paths.len()
    }
}
