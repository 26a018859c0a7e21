//! 🗄️ The Status Ledger — one row per mail, one file, zero amnesia.
//!
//! 🎬 COLD OPEN — INT. OPS CHANNEL — SOMEONE TYPES "how far along is the import"
//!
//! The pipeline could shrug. The pipeline could say "it's running." Instead
//! the pipeline keeps a ledger: a single SQLite file where every `mail_id`
//! that ever got enqueued has exactly one row, flipped from pending to
//! terminal as its fate resolves. Progress queries read the ledger. Nobody
//! greps logs. Nobody greps logs. (Written twice because it matters twice.)
//!
//! 🧠 Knowledge graph: one `Ledger` per task — the orchestrator has one, each
//! worker has one, the status tool opens a read-only one. Connections are
//! never shared across tasks; SQLite's own transactional isolation is the
//! coordination layer. WAL mode means readers never block writers, which is
//! how the status tool stays polite.
//!
//! ⚠️ Contention is expected (N workers commit batches into one file). The
//! 5-second busy_timeout IS the bounded retry-with-backoff: SQLite itself
//! re-attempts the lock until the deadline, then we surface the failure.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, params};

/// ⏳ How long a writer politely waits for the lock before declaring defeat.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 📝 What the orchestrator knows about a mail at enqueue time.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow {
    pub mail_id: String,
    pub user_id: String,
    pub domain: String,
    pub received_time: String,
}

/// 📖 A full ledger row, read back out. Mostly a test and status-tool shape.
#[derive(Debug, Clone)]
pub(crate) struct LedgerRow {
    pub mail_id: String,
    pub user_id: String,
    pub domain: String,
    pub is_completed: bool,
    pub is_success: bool,
    pub received_time: String,
    pub error_message: Option<String>,
}

/// 📊 Per-domain progress rollup for the status tool.
#[derive(Debug, Clone)]
pub struct DomainStatus {
    pub domain: String,
    pub total: u64,
    pub completed: u64,
    pub succeeded: u64,
}

/// 📊 Per-user progress rollup for the status tool.
#[derive(Debug, Clone)]
pub struct UserStatus {
    pub user_id: String,
    pub total: u64,
    pub completed: u64,
    pub succeeded: u64,
}

/// 🗄️ The Ledger: a wrapped `rusqlite::Connection` with the mail-status
/// vocabulary bolted on. Owned, never shared — clone the path, not the handle.
#[derive(Debug)]
pub(crate) struct Ledger {
    conn: Connection,
}

impl Ledger {
    /// 🏗️ Open (and migrate) the ledger for writing.
    ///
    /// Creates parent directories, flips on WAL, arms the busy timeout, and
    /// runs the idempotent migration. Every task calls this for itself —
    /// `CREATE TABLE IF NOT EXISTS` makes the race between first-openers a
    /// non-event.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "💀 Could not create the ledger's parent directory '{}'.",
                parent.display()
            ))?;
        }
        let conn = Connection::open(path).context(format!(
            "💀 Could not open the ledger at '{}'. No ledger, no pipeline — this is startup-fatal by design.",
            path.display()
        ))?;
        // 📜 WAL so status reads snapshot without blocking writers;
        // NORMAL sync is the WAL-appropriate durability/throughput trade.
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("💀 Could not switch the ledger to WAL mode.")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("💀 Could not set synchronous=NORMAL on the ledger.")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("💀 Could not arm the ledger's busy timeout.")?;

        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    /// 👓 Open the ledger read-only — the status tool's entrance.
    ///
    /// No migration, no writes, snapshot-consistent reads under WAL. If the
    /// file doesn't exist yet, that's an error worth telling the operator
    /// about (run the pipeline first).
    pub(crate) fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context(format!(
            "💀 Could not open the ledger at '{}' read-only. Has the pipeline ever run against this config?",
            path.display()
        ))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// 🧱 The schema. Three composite indexes matching the three query shapes
    /// the status tool actually runs: by domain, by user, by recency.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS mail_status (
                    mail_id        TEXT PRIMARY KEY,
                    user_id        TEXT NOT NULL DEFAULT '',
                    domain         TEXT NOT NULL DEFAULT '',
                    is_completed   INTEGER NOT NULL DEFAULT 0,
                    is_success     INTEGER NOT NULL DEFAULT 0,
                    received_time  TEXT NOT NULL DEFAULT '',
                    error_message  TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_mail_status_domain
                    ON mail_status (domain, is_completed, is_success);
                CREATE INDEX IF NOT EXISTS idx_mail_status_user
                    ON mail_status (user_id, is_completed, is_success);
                CREATE INDEX IF NOT EXISTS idx_mail_status_received
                    ON mail_status (received_time, is_completed);",
            )
            .context("💀 Ledger migration failed. The table refused to exist.")
    }

    /// 📝 Insert-or-replace a row as pending. Called at enqueue time.
    ///
    /// Replace (not update) on conflict: a stale row from a crashed previous
    /// attempt gets fully overwritten, which is exactly the recovery contract.
    pub(crate) fn upsert_pending(&self, row: &PendingRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO mail_status
                    (mail_id, user_id, domain, is_completed, is_success, received_time, error_message)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, NULL)",
                params![row.mail_id, row.user_id, row.domain, row.received_time],
            )
            .context("💀 Could not upsert a pending ledger row.")?;
        Ok(())
    }

    /// 📝 The batched sibling: all pending rows for one batch, one transaction.
    pub(crate) fn upsert_pending_batch(&mut self, rows: &[PendingRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO mail_status
                    (mail_id, user_id, domain, is_completed, is_success, received_time, error_message)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, NULL)",
            )?;
            for row in rows {
                stmt.execute(params![row.mail_id, row.user_id, row.domain, row.received_time])?;
            }
        }
        tx.commit()
            .context("💀 Could not commit a batch of pending rows. The batch does not get enqueued without its rows.")
    }

    /// ✅ Terminal success. Update-or-insert: normally the pending row exists,
    /// but a row conjured from nothing (empty user/domain) still records the
    /// outcome — the ledger never hides a completion.
    pub(crate) fn mark_success(&self, mail_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO mail_status (mail_id, is_completed, is_success)
                 VALUES (?1, 1, 1)
                 ON CONFLICT(mail_id) DO UPDATE SET
                    is_completed = 1, is_success = 1, error_message = NULL",
                params![mail_id],
            )
            .context("💀 Could not mark a ledger row as succeeded.")?;
        Ok(())
    }

    /// ❌ Terminal failure, with the reason on the record.
    pub(crate) fn mark_failure(&self, mail_id: &str, error_message: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO mail_status (mail_id, is_completed, is_success, error_message)
                 VALUES (?1, 1, 0, ?2)
                 ON CONFLICT(mail_id) DO UPDATE SET
                    is_completed = 1, is_success = 0, error_message = excluded.error_message",
                params![mail_id, error_message],
            )
            .context("💀 Could not mark a ledger row as failed.")?;
        Ok(())
    }

    /// 🏁 Finalize a whole batch in one transaction: successes flip to
    /// success, failures flip to failure with their reasons.
    ///
    /// ⚠️ Ordering law (the crash-safety one): callers commit THIS before
    /// touching the filesystem. A crash after the commit but before the
    /// deletes/moves leaves files in `run/`, and `run/` is the authoritative
    /// pending indicator — next startup re-runs them and overwrites these rows.
    pub(crate) fn finalize_batch(
        &mut self,
        successes: &[String],
        failures: &[(String, String)],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut ok_stmt = tx.prepare_cached(
                "INSERT INTO mail_status (mail_id, is_completed, is_success)
                 VALUES (?1, 1, 1)
                 ON CONFLICT(mail_id) DO UPDATE SET
                    is_completed = 1, is_success = 1, error_message = NULL",
            )?;
            for mail_id in successes {
                ok_stmt.execute(params![mail_id])?;
            }
            let mut fail_stmt = tx.prepare_cached(
                "INSERT INTO mail_status (mail_id, is_completed, is_success, error_message)
                 VALUES (?1, 1, 0, ?2)
                 ON CONFLICT(mail_id) DO UPDATE SET
                    is_completed = 1, is_success = 0, error_message = excluded.error_message",
            )?;
            for (mail_id, error_message) in failures {
                fail_stmt.execute(params![mail_id, error_message])?;
            }
        }
        tx.commit()
            .context("💀 Could not commit a batch finalization. No row flipped; the files stay in run/ for recovery.")
    }

    /// 🚑 Record rejects that never got enqueued: full known identity, one
    /// transaction, straight to terminal failure. This is the
    /// "domain unresolvable" path — the file goes to `buggy/` without ever
    /// seeing `run/`, and the ledger says so with whatever identity the
    /// batcher managed to recover.
    pub(crate) fn record_failed_batch(&mut self, rows: &[(PendingRow, String)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO mail_status
                    (mail_id, user_id, domain, is_completed, is_success, received_time, error_message)
                 VALUES (?1, ?2, ?3, 1, 0, ?4, ?5)",
            )?;
            for (row, error_message) in rows {
                stmt.execute(params![
                    row.mail_id,
                    row.user_id,
                    row.domain,
                    row.received_time,
                    error_message
                ])?;
            }
        }
        tx.commit()
            .context("💀 Could not commit the reject rows. The files still go to buggy/; the ledger just missed the memo.")
    }

    /// 📖 Read one row back. Test and spot-check surface.
    pub(crate) fn get(&self, mail_id: &str) -> Result<Option<LedgerRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT mail_id, user_id, domain, is_completed, is_success, received_time, error_message
             FROM mail_status WHERE mail_id = ?1",
        )?;
        let mut rows = stmt.query(params![mail_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(LedgerRow {
                mail_id: row.get(0)?,
                user_id: row.get(1)?,
                domain: row.get(2)?,
                is_completed: row.get::<_, i64>(3)? != 0,
                is_success: row.get::<_, i64>(4)? != 0,
                received_time: row.get(5)?,
                error_message: row.get(6)?,
            })),
            None => Ok(None),
        }
    }

    /// 📊 Per-domain rollup, alphabetical. Rides `idx_mail_status_domain`.
    pub(crate) fn domain_counts(&self) -> Result<Vec<DomainStatus>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT domain,
                    COUNT(*),
                    SUM(is_completed),
                    SUM(CASE WHEN is_completed = 1 AND is_success = 1 THEN 1 ELSE 0 END)
             FROM mail_status
             GROUP BY domain
             ORDER BY domain",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainStatus {
                domain: row.get(0)?,
                total: row.get::<_, i64>(1)? as u64,
                completed: row.get::<_, i64>(2)? as u64,
                succeeded: row.get::<_, i64>(3)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("💀 Could not roll up domain counts.")
    }

    /// 📊 Per-user rollup, alphabetical. Rides `idx_mail_status_user`.
    pub(crate) fn user_counts(&self) -> Result<Vec<UserStatus>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT user_id,
                    COUNT(*),
                    SUM(is_completed),
                    SUM(CASE WHEN is_completed = 1 AND is_success = 1 THEN 1 ELSE 0 END)
             FROM mail_status
             GROUP BY user_id
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UserStatus {
                user_id: row.get(0)?,
                total: row.get::<_, i64>(1)? as u64,
                completed: row.get::<_, i64>(2)? as u64,
                succeeded: row.get::<_, i64>(3)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("💀 Could not roll up user counts.")
    }

    /// ⏰ The newest `received_time` among completed rows — "how fresh is the
    /// ingested data". Rides `idx_mail_status_received`.
    pub(crate) fn latest_completion(&self) -> Result<Option<String>> {
        let latest: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(received_time) FROM mail_status WHERE is_completed = 1",
                [],
                |row| row.get(0),
            )
            .context("💀 Could not read the latest completion time.")?;
        // 🧹 MAX over zero rows is NULL; MAX over empty-string defaults is ''.
        // Both mean "nothing real to report".
        Ok(latest.filter(|time| !time.is_empty()))
    }
}
