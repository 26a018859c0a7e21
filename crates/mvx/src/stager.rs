//! 📂 The Stager — landlord of the three directories.
//!
//! 🎬 COLD OPEN — INT. FILESYSTEM — DIRECTORY LISTING SCROLLS FOREVER
//!
//! Three directories. Three phases of a file's life. `wait/` is the lobby,
//! `run/` is the operating theater, `buggy/` is where the unfixable go to be
//! studied later. Files move between them by rename — atomic on the same
//! filesystem, which is the whole point.
//!
//! 🧠 Knowledge graph: the stager is pure filesystem mechanics. It does not
//! parse, it does not judge, it does not touch the ledger. It scans, it
//! renames, it deletes. The presence of a file in `run/` IS the crash-safe
//! pending indicator — no sidecar state, no lock files, no folklore.
//!
//! ⚠️ Invariant the whole pipeline leans on: a filename is minted once by the
//! producer and appears in exactly one in-flight batch, so no two tasks ever
//! fight over the same name. The stager gets to be simple because the
//! orchestrator keeps that promise.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::app_config::PathsConfig;

/// 📂 The Stager: owns the `wait/` → `run/` → terminal lifecycle mechanics.
///
/// Clone-able because every worker carries one — it's three `PathBuf`s in a
/// trench coat, cloning is practically free and nobody shares mutable state.
#[derive(Debug, Clone)]
pub(crate) struct Stager {
    wait_dir: PathBuf,
    run_dir: PathBuf,
    buggy_dir: PathBuf,
}

impl Stager {
    /// 🏗️ Build the stager and make sure all three directories exist.
    ///
    /// `create_dir_all` is idempotent, so restarts walk through here without
    /// drama. A directory we cannot create is a startup-fatal condition —
    /// better to die in the constructor than to scan a void forever.
    pub(crate) async fn new(paths: &PathsConfig) -> Result<Self> {
        for dir in [&paths.wait_dir, &paths.run_dir, &paths.buggy_dir] {
            fs::create_dir_all(dir).await.context(format!(
                "💀 Could not create staging directory '{}'. We asked the filesystem nicely. The filesystem declined. Check permissions, check the mount, check your assumptions.",
                dir.display()
            ))?;
        }
        Ok(Self {
            wait_dir: paths.wait_dir.clone(),
            run_dir: paths.run_dir.clone(),
            buggy_dir: paths.buggy_dir.clone(),
        })
    }

    /// 📋 Scan `wait/` for up to `limit` pending `.json` filenames.
    ///
    /// Order is whatever the directory iterator feels like — the batcher
    /// re-sorts everything anyway. Dot-prefixed names are skipped because
    /// producers write temp files as `.foo.json` before renaming them into
    /// place, and half-written JSON is nobody's idea of a good time.
    pub(crate) async fn list_pending(&self, limit: usize) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.wait_dir).await.context(format!(
            "💀 Could not list '{}'. The wait directory was here a minute ago.",
            self.wait_dir.display()
        ))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if names.len() >= limit {
                break;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // 🗑️ Non-UTF-8 filename. We did not mint it, we will not chase it.
                Err(_) => continue,
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// 📍 Absolute path of a pending file still sitting in `wait/`.
    pub(crate) fn wait_path(&self, name: &str) -> PathBuf {
        self.wait_dir.join(name)
    }

    /// 🚚 `wait/` → `run/`. Returns the new path — that path is what travels
    /// in the batch, so workers never reconstruct locations from guesswork.
    pub(crate) async fn move_to_run(&self, name: &str) -> Result<PathBuf> {
        let destination = self.run_dir.join(name);
        relocate(&self.wait_dir.join(name), &destination).await?;
        Ok(destination)
    }

    /// 🚑 Anywhere → `buggy/`. Terminal state for the unfortunate.
    ///
    /// If the destination name already exists, the rename overwrites it —
    /// last writer wins, deliberately: content is addressed by `mail_id` in
    /// the ledger, so the newest file body is the one worth keeping.
    pub(crate) async fn move_to_buggy(&self, path: &Path) -> Result<()> {
        let name = file_name_of(path)?;
        relocate(path, &self.buggy_dir.join(name)).await
    }

    /// 🔙 `run/` → `wait/`. The recovery direction. Used at startup only.
    pub(crate) async fn move_run_back_to_wait(&self, name: &str) -> Result<()> {
        relocate(&self.run_dir.join(name), &self.wait_dir.join(name)).await
    }

    /// 🩹 Startup recovery sweep: every file found in `run/` goes back to
    /// `wait/` to be re-ingested. Idempotent by construction — the sweep
    /// empties `run/`, and an empty `run/` sweeps for free.
    ///
    /// 🧠 Knowledge graph: this is the crash-recovery half of the lifecycle
    /// invariant. A crash can strand files in `run/` with or without ledger
    /// rows; the rows are stale-but-harmless because the next enqueue
    /// overwrites them as pending again.
    pub(crate) async fn recover_run_files(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.run_dir).await.context(format!(
            "💀 Could not list '{}' during recovery. Recovery is not optional.",
            self.run_dir.display()
        ))?;

        let mut recovered = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            self.move_run_back_to_wait(&name).await.context(format!(
                "💀 Recovery could not move '{name}' back to wait/. Startup refuses to continue with stranded files."
            ))?;
            recovered += 1;
        }
        if recovered > 0 {
            debug!("🩹 recovery moved {recovered} stranded file(s) from run/ back to wait/");
        }
        Ok(recovered)
    }

    /// 🗑️ Unlink a file. Idempotent: a file that is already gone counts as
    /// deleted — success and deletion are indistinguishable from here.
    pub(crate) async fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // ✅ Already gone. Somebody did our job for us. Thanks, somebody.
                Ok(())
            }
            Err(e) => Err(e).context(format!(
                "💀 Could not delete '{}'. It exists, it just won't leave.",
                path.display()
            )),
        }
    }
}

/// 🚚 Rename with a cross-filesystem fallback.
///
/// Rename is the atomic, durable move we want. When source and destination sit
/// on different filesystems the kernel says `EXDEV` and we fall back to
/// copy-then-delete — no longer atomic, but the caller treats any partial
/// failure as fatal for that file, and the orchestrator's next cycle (or next
/// startup) picks up whatever got left behind.
async fn relocate(source: &Path, destination: &Path) -> Result<()> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            warn!(
                "🚧 '{}' and '{}' live on different filesystems — falling back to copy+delete",
                source.display(),
                destination.display()
            );
            fs::copy(source, destination).await.context(format!(
                "💀 Cross-filesystem copy of '{}' failed mid-fallback. The file stays put; this move is dead.",
                source.display()
            ))?;
            fs::remove_file(source).await.context(format!(
                "💀 Copied '{}' but could not remove the original. Two copies now exist. Surfacing loudly instead of pretending.",
                source.display()
            ))?;
            Ok(())
        }
        Err(e) => Err(e).context(format!(
            "💀 Could not move '{}' to '{}'. The rename was refused.",
            source.display(),
            destination.display()
        )),
    }
}

fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .context(format!(
            "💀 '{}' has no usable filename. We move files, not abstractions.",
            path.display()
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::PathsConfig;
    use tempfile::TempDir;

    async fn stager_in(temp: &TempDir) -> Stager {
        let paths = PathsConfig {
            wait_dir: temp.path().join("wait"),
            run_dir: temp.path().join("run"),
            buggy_dir: temp.path().join("buggy"),
            sqlite_path: temp.path().join("ledger.db"),
        };
        Stager::new(&paths)
            .await
            .expect("💀 Stager construction should succeed in a tempdir.")
    }

    async fn seed(stager: &Stager, name: &str) {
        fs::write(stager.wait_path(name), b"{}")
            .await
            .expect("💀 Failed to seed a test file.");
    }

    #[tokio::test]
    async fn the_one_where_only_real_json_files_get_listed() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        seed(&stager, "a.json").await;
        seed(&stager, "b.json").await;
        seed(&stager, ".hidden.json").await; // 🫥 producer temp file — invisible
        seed(&stager, "notes.txt").await; // 📄 wrong extension — invisible

        let mut names = stager.list_pending(1000).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[tokio::test]
    async fn the_one_where_the_scan_respects_its_limit() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        for i in 0..10 {
            seed(&stager, &format!("f{i}.json")).await;
        }
        assert_eq!(stager.list_pending(3).await.unwrap().len(), 3);
        assert_eq!(stager.list_pending(1000).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn the_one_where_a_file_tours_all_three_directories() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        seed(&stager, "m.json").await;

        let run_path = stager.move_to_run("m.json").await.unwrap();
        assert!(run_path.exists());
        assert!(!stager.wait_path("m.json").exists());

        stager.move_to_buggy(&run_path).await.unwrap();
        assert!(!run_path.exists());
        assert!(temp.path().join("buggy/m.json").exists());
    }

    #[tokio::test]
    async fn the_one_where_recovery_empties_the_operating_theater() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        // 🩹 Simulate a crash: files sitting in run/ with nobody processing them.
        for name in ["r1.json", "r2.json", "r3.json"] {
            fs::write(temp.path().join("run").join(name), b"{}").await.unwrap();
        }

        let recovered = stager.recover_run_files().await.unwrap();
        assert_eq!(recovered, 3);
        assert_eq!(stager.list_pending(1000).await.unwrap().len(), 3);
        // ✅ Sweep twice — recovery must be idempotent.
        assert_eq!(stager.recover_run_files().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn the_one_where_deleting_nothing_is_fine_actually() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        seed(&stager, "m.json").await;
        let path = stager.wait_path("m.json");

        stager.delete(&path).await.unwrap();
        assert!(!path.exists());
        // 🗑️ Deleting the already-deleted: success. Idempotency is the contract.
        stager.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn the_one_where_the_last_writer_wins_in_buggy() {
        let temp = TempDir::new().unwrap();
        let stager = stager_in(&temp).await;
        fs::write(temp.path().join("buggy/m.json"), b"old body").await.unwrap();
        seed(&stager, "m.json").await;
        let run_path = stager.move_to_run("m.json").await.unwrap();

        // 🚑 Same name already in buggy/ — the newer body overwrites it.
        stager.move_to_buggy(&run_path).await.unwrap();
        let body = fs::read(temp.path().join("buggy/m.json")).await.unwrap();
        assert_eq!(body, b"{}");
    }
}
