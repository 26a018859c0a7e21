//! 🧵 Workers: the backbone of mailvex, the unsung heroes, the ones who
//! actually move the mail while the Supervisor takes all the credit in the
//! sprint retro.
//!
//! 🚀 This module is like a factory floor, except instead of hard hats
//! we wear `#[derive(Debug)]` and instead of OSHA violations
//! we have borrow checker violations. 🦆
//!
//! ⚠️ "If you're reading this, the code review went poorly."

// 🎉 anyhowwwww.... it's useful! Like duct tape for error handling.
use anyhow::Result;
use tokio::task::JoinHandle;

use crate::common::Batch;

mod import_worker;
pub(crate) use import_worker::ImportWorker;

/// 📬 What travels on the work queue: real work, or the instruction to stop.
///
/// 🧠 Knowledge graph: `Retire` is the poison pill. The supervisor sends
/// exactly one per worker at shutdown; each worker consumes exactly one and
/// exits, so the count always balances. No shared flag, no polling — the
/// queue itself carries the goodbye.
#[derive(Debug)]
pub(crate) enum WorkOrder {
    /// 📦 One domain's worth of staged files. Process it whole.
    Batch(Batch),
    /// ☠️ Clock out. Leave the channel. Do not take more work.
    Retire,
}

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Start the worker.
    fn start(self) -> JoinHandle<Result<()>>;
}
