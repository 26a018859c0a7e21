//! 🧮 The Batcher — turns a pile of filenames into a plan of attack.
//!
//! 🎬 COLD OPEN — INT. WAIT DIRECTORY — ONE THOUSAND FILES, ZERO ORDER
//!
//! Every poll cycle the orchestrator scoops up to a thousand filenames and
//! asks one question: "who goes where, and who goes first?" This module is
//! the answer. Resolve each file's tenant domain, group by domain, chunk to
//! batch size, then spend the queue's remaining capacity on the biggest
//! chunks first — a full batch amortizes the vector-import round-trip, a
//! dribble of three-file batches does not.
//!
//! 🧠 Knowledge graph: domain resolution is a three-step descent —
//! 1. filename hint `domain=<value>` (cheapest, a SIMD substring hunt)
//! 2. filename `@<value>` token (cheap, still no I/O)
//! 3. open the JSON and ask the message itself (the expensive last resort)
//! A file that flunks all three never enters `run/` — it is rejected here
//! and routed straight to `buggy/` by the orchestrator.
//!
//! The selection core is pure functions over owned data. No I/O, no clock,
//! no async. That's what makes it benchable and, more importantly, testable
//! without a filesystem in the room.

use std::collections::BTreeMap;

use memchr::memmem;

use crate::common::{Message, peek_mail_id};
use crate::stager::Stager;

/// 📏 Max files per batch — one bulk import call's worth of mail.
pub const BATCH_MAX: usize = 50;

/// 📦 A batch-to-be: a domain and the wait/ filenames picked for it.
/// Becomes a real `common::Batch` once the orchestrator moves the files
/// into `run/` and owns their new paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub domain: String,
    pub names: Vec<String>,
}

/// 🚑 A file the batcher gave up on: no domain by any of the three steps.
/// Carries whatever identity fragments were recoverable so the orchestrator
/// can still write an honest ledger failure row.
#[derive(Debug, Clone)]
pub(crate) struct Reject {
    pub file_name: String,
    pub mail_id: Option<String>,
    pub user_id: Option<String>,
    pub received_time: Option<String>,
    pub reason: String,
}

/// 🗺️ The whole plan for one poll cycle.
#[derive(Debug)]
pub(crate) struct BatchPlan {
    pub batches: Vec<PlannedBatch>,
    pub rejects: Vec<Reject>,
}

/// 🔍 Steps 1 and 2 of domain resolution — filename only, zero I/O.
///
/// The preferred convention is `*__domain=<domain>__*.json`; the tolerated
/// fallback is `*@<domain>*.json`. In both cases the value runs until the
/// next `_`, with a trailing `.json` (and any trailing dot) shaved off —
/// domains contain dots, filenames end in one extension, and the two facts
/// must not be allowed to fight.
pub fn domain_from_file_name(name: &str) -> Option<String> {
    // 🔍 memmem for the `domain=` hunt. The marker must sit at the start of
    // a delimited token (`_` or `.` before it), or "freedomain=x" would match.
    for pos in memmem::find_iter(name.as_bytes(), b"domain=") {
        let delimited = pos == 0 || matches!(name.as_bytes()[pos - 1], b'_' | b'.');
        if !delimited {
            continue;
        }
        if let Some(domain) = clean_domain_token(&name[pos + "domain=".len()..]) {
            return Some(domain);
        }
    }
    if let Some((_, after_at)) = name.split_once('@') {
        return clean_domain_token(after_at);
    }
    None
}

/// 🧹 Cut a raw domain value out of the rest of a filename.
fn clean_domain_token(value: &str) -> Option<String> {
    let value = value.split('_').next().unwrap_or_default();
    let value = value.strip_suffix(".json").unwrap_or(value);
    let value = value.trim_matches('.');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// 🎯 The greedy selection core: chunk each domain's files into runs of at
/// most [`BATCH_MAX`], then pick chunks by descending size until `capacity`
/// chunks are chosen or none remain.
///
/// Ties are broken by domain name, then by chunk index — arbitrary but
/// DETERMINISTIC, so two runs over the same directory produce the same plan
/// and the tests get to assert instead of shrug. Under-filled chunks lose
/// every tie against full ones by construction of the size-first ordering.
pub fn select_chunks(groups: &BTreeMap<String, Vec<String>>, capacity: usize) -> Vec<PlannedBatch> {
    let mut chunks: Vec<(usize, &String, usize, Vec<String>)> = Vec::new();
    for (domain, names) in groups {
        // 🧹 Sort within the domain so chunk boundaries don't depend on
        // directory-iteration moods.
        let mut names = names.clone();
        names.sort();
        for (index, chunk) in names.chunks(BATCH_MAX).enumerate() {
            chunks.push((chunk.len(), domain, index, chunk.to_vec()));
        }
    }

    // 📐 Largest first; domain name then chunk index settle the ties.
    chunks.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)).then_with(|| a.2.cmp(&b.2)));

    chunks
        .into_iter()
        .take(capacity)
        .map(|(_, domain, _, names)| PlannedBatch {
            domain: domain.clone(),
            names,
        })
        .collect()
}

/// 🗺️ Build the full plan for one poll cycle: resolve every name, group,
/// chunk, select. Step 3 (the JSON fallback) is the only I/O in here, and it
/// only fires for files whose names kept their secrets.
pub(crate) async fn plan(stager: &Stager, names: Vec<String>, capacity: usize) -> BatchPlan {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut rejects = Vec::new();

    for name in names {
        if let Some(domain) = domain_from_file_name(&name) {
            groups.entry(domain).or_default().push(name);
            continue;
        }
        match resolve_from_json(stager, &name).await {
            Ok(domain) => groups.entry(domain).or_default().push(name),
            Err(reject) => rejects.push(reject),
        }
    }

    BatchPlan {
        batches: select_chunks(&groups, capacity),
        rejects,
    }
}

/// 📖 Step 3: open the file and ask the message where it lives.
async fn resolve_from_json(stager: &Stager, name: &str) -> Result<String, Reject> {
    let raw = match tokio::fs::read_to_string(stager.wait_path(name)).await {
        Ok(raw) => raw,
        Err(e) => {
            return Err(Reject {
                file_name: name.to_string(),
                mail_id: None,
                user_id: None,
                received_time: None,
                reason: format!("unreadable staging file: {e}"),
            });
        }
    };

    match Message::parse(&raw) {
        Ok(message) => match message.domain() {
            Some(domain) => Ok(domain),
            // 💀 Parsed fine, but no domain field and no @ in user_id.
            // The mail is an orphan; the ledger still gets its full identity.
            None => Err(Reject {
                file_name: name.to_string(),
                mail_id: Some(message.mail_id.clone()),
                user_id: Some(message.user_id.clone()),
                received_time: Some(message.received_time.clone()),
                reason: "domain not resolvable from filename or message body".to_string(),
            }),
        },
        Err(e) => Err(Reject {
            file_name: name.to_string(),
            // 🕵️ One lazier look for a mail_id before we give up on identity.
            mail_id: peek_mail_id(&raw),
            user_id: None,
            received_time: None,
            reason: format!("message body failed to parse: {e:#}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::PathsConfig;
    use tempfile::TempDir;

    #[test]
    fn the_one_where_the_filename_spills_its_domain() {
        // 🔍 Preferred convention.
        assert_eq!(
            domain_from_file_name("m001__domain=ex.com__0001.json").as_deref(),
            Some("ex.com")
        );
        // 🔍 Marker at a dot boundary, value cut at the extension.
        assert_eq!(
            domain_from_file_name("batch7.domain=mail.example.org.json").as_deref(),
            Some("mail.example.org")
        );
        // 📧 The @ fallback.
        assert_eq!(
            domain_from_file_name("report@ex.com_0001.json").as_deref(),
            Some("ex.com")
        );
        assert_eq!(domain_from_file_name("kevin@b.com.json").as_deref(), Some("b.com"));
    }

    #[test]
    fn the_one_where_imposter_markers_are_shown_the_door() {
        // 💀 "freedomain=" is not "domain=". Token boundaries are the law.
        assert_eq!(domain_from_file_name("freedomain=x.json"), None);
        // 💀 Nothing to find at all.
        assert_eq!(domain_from_file_name("m001.json"), None);
        // 💀 Empty values don't count.
        assert_eq!(domain_from_file_name("m__domain=__x.json"), None);
        assert_eq!(domain_from_file_name("m@.json"), None);
    }

    fn group(entries: &[(&str, usize)]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(domain, n)| {
                (
                    domain.to_string(),
                    (0..*n).map(|i| format!("{domain}-{i:04}.json")).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn the_one_where_fifty_one_files_become_fifty_plus_one() {
        let groups = group(&[("a.com", 51)]);
        let batches = select_chunks(&groups, usize::MAX);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].names.len(), 50);
        assert_eq!(batches[1].names.len(), 1);
    }

    #[test]
    fn the_one_where_the_big_chunks_cut_in_line() {
        // 🎯 Two domains, 60 files each → chunks of 50, 50, 10, 10.
        // Capacity 2 → the two full chunks win; the dribbles wait their turn.
        let groups = group(&[("a.com", 60), ("b.com", 60)]);
        let batches = select_chunks(&groups, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].domain, "a.com");
        assert_eq!(batches[0].names.len(), 50);
        assert_eq!(batches[1].domain, "b.com");
        assert_eq!(batches[1].names.len(), 50);

        // 🎯 Capacity 4 → now the 10s come along, ties again by domain name.
        let batches = select_chunks(&groups, 4);
        assert_eq!(batches[2].names.len(), 10);
        assert_eq!(batches[2].domain, "a.com");
        assert_eq!(batches[3].names.len(), 10);
        assert_eq!(batches[3].domain, "b.com");
    }

    #[test]
    fn the_one_where_zero_capacity_buys_zero_batches() {
        let groups = group(&[("a.com", 10)]);
        assert!(select_chunks(&groups, 0).is_empty());
    }

    #[test]
    fn the_one_where_determinism_is_not_negotiable() {
        let groups = group(&[("c.com", 30), ("a.com", 30), ("b.com", 30)]);
        let first = select_chunks(&groups, 3);
        let second = select_chunks(&groups, 3);
        assert_eq!(first, second);
        // 📐 Equal sizes → alphabetical domains.
        let order: Vec<&str> = first.iter().map(|b| b.domain.as_str()).collect();
        assert_eq!(order, vec!["a.com", "b.com", "c.com"]);
    }

    async fn stager_in(temp: &TempDir) -> Stager {
        let paths = PathsConfig {
            wait_dir: temp.path().join("wait"),
            run_dir: temp.path().join("run"),
            buggy_dir: temp.path().join("buggy"),
            sqlite_path: temp.path().join("ledger.db"),
        };
        Stager::new(&paths).await.unwrap()
    }

    #[tokio::test]
    async fn the_one_where_the_json_fallback_earns_its_keep() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        tokio::fs::write(
            stager.wait_path("anonymous.json"),
            r#"{"mail_id":"m1","user_id":"kevin@ex.com","received_time":"2026-01-01T00:00:00"}"#,
        )
        .await
        .unwrap();

        let plan = plan(&stager, vec!["anonymous.json".into()], 10).await;
        assert!(plan.rejects.is_empty());
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].domain, "ex.com");
    }

    #[tokio::test]
    async fn the_one_where_the_hopeless_get_rejected_with_dignity() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        // 💀 Valid JSON, known mail_id, but domain is underivable.
        tokio::fs::write(
            stager.wait_path("orphan.json"),
            r#"{"mail_id":"m1","user_id":"postmaster","received_time":"2026-01-01T00:00:00"}"#,
        )
        .await
        .unwrap();
        // 💀 Not JSON at all.
        tokio::fs::write(stager.wait_path("garbage.json"), "}{").await.unwrap();

        let plan = plan(
            &stager,
            vec!["orphan.json".into(), "garbage.json".into()],
            10,
        )
        .await;
        assert!(plan.batches.is_empty());
        assert_eq!(plan.rejects.len(), 2);

        let orphan = plan.rejects.iter().find(|r| r.file_name == "orphan.json").unwrap();
        assert_eq!(orphan.mail_id.as_deref(), Some("m1"));
        assert_eq!(orphan.user_id.as_deref(), Some("postmaster"));

        let garbage = plan.rejects.iter().find(|r| r.file_name == "garbage.json").unwrap();
        assert_eq!(garbage.mail_id, None);
    }
}
