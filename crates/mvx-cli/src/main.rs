//! 🚀 mvx-cli — the front door, the bouncer, the maitre d' of mailvex.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that parses arguments,
//! loads config, sets up logging, and then lets the real code do the heavy
//! lifting. Like a manager. 🦆
//!
//! Two jobs, two subcommands:
//! - `run`    — the long-running ingestion daemon (also the default)
//! - `status` — a read-only peek at the ledger's progress rollups

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📬 mailvex — batch mail ingestion into a multi-tenant vector store.
#[derive(Debug, Parser)]
#[command(name = "mvx", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 🚀 Run the ingestion pipeline until interrupted or terminated.
    Run {
        /// Path to the YAML config file.
        #[arg(default_value = "mvx.yaml")]
        config: PathBuf,
    },
    /// 📊 Render the ledger's progress rollups and leave quietly.
    Status {
        /// Path to the YAML config file.
        #[arg(default_value = "mvx.yaml")]
        config: PathBuf,
    },
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
/// The "I pressed Enter and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Parse args (clap does the arguing for us)
/// 2. Load config (the moment of truth)
/// 3. Init tracing (seeded by logging.level; RUST_LOG still outranks it)
/// 4. Run the thing (send it and pray 🙏)
/// 5. Handle errors (cry, but structured)
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        config: PathBuf::from("mvx.yaml"), // 🔧 default: the ol' reliable
    });

    let config_path = match &command {
        Command::Run { config } | Command::Status { config } => config.clone(),
    };

    // 🔒 Validate the config file exists before we get too emotionally attached.
    let config_file = validated_config_path(&config_path)?;
    let app_config = mvx::app_config::load_config(config_file)
        .context("💀 Couldn't load the config file. Take a look at it, make sure the YAML is valid and every required section is present. Make sure you didn't forget something obvious, dumas")?;

    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts.
    // RUST_LOG wins when set; the config's logging.level is the default.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&app_config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match command {
        // 🚀 SEND IT. No take-backs. Runs until a signal says otherwise.
        Command::Run { .. } => mvx::run(app_config).await,
        Command::Status { .. } => mvx::status(&app_config).map(render_status),
    };

    // 💀 Error handling: the part where we find out what went wrong
    // and print it in a way that's helpful at 3am.
    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            // -- 🕵️ sniff the cause like a truffle pig hunting for connection problems
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        // -- 📡 if it smells like a connection problem, it's probably a connection problem
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like a service isn't reachable. \
                Double-check that Weaviate is actually running at the configured host. \
                If you're using Docker, try: `docker ps` to see what's up, or \
                `docker compose up -d` to resurrect it. \
                Even vector stores need a nudge sometimes. ☕"
            );
        }

        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }

    // ✅ If we got here, everything worked. Pop the champagne. 🍾
    Ok(())
}

/// 🔒 Check the config file exists; `None` means "env vars only", which is a
/// legitimate lifestyle for containerized deployments.
fn validated_config_path(config_file: &Path) -> Result<Option<&Path>> {
    let exists = config_file.try_exists().context(format!(
        "💀 Configuration file may not exist, couldn't even check. Maybe it's an issue with pwd/cwd and relative paths — use an absolute path, to be absolutely certain. Was checking here: '{}'",
        config_file.display()
    ))?;
    Ok(if exists { Some(config_file) } else { None })
}

/// 📊 Print the status snapshot as tables a human can actually read.
/// Read-only, point-in-time, and gone before the pipeline notices.
fn render_status(snapshot: mvx::StatusSnapshot) {
    let mut domain_table = Table::new();
    domain_table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["DOMAIN", "TOTAL", "COMPLETED", "SUCCEEDED", "FAILED"]);
    for domain in &snapshot.domains {
        domain_table.add_row(vec![
            Cell::new(&domain.domain),
            Cell::new(domain.total).set_alignment(CellAlignment::Right),
            Cell::new(domain.completed).set_alignment(CellAlignment::Right),
            Cell::new(domain.succeeded).set_alignment(CellAlignment::Right),
            Cell::new(domain.completed - domain.succeeded).set_alignment(CellAlignment::Right),
        ]);
    }

    let mut user_table = Table::new();
    user_table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["USER", "TOTAL", "COMPLETED", "SUCCEEDED", "FAILED"]);
    for user in &snapshot.users {
        user_table.add_row(vec![
            Cell::new(&user.user_id),
            Cell::new(user.total).set_alignment(CellAlignment::Right),
            Cell::new(user.completed).set_alignment(CellAlignment::Right),
            Cell::new(user.succeeded).set_alignment(CellAlignment::Right),
            Cell::new(user.completed - user.succeeded).set_alignment(CellAlignment::Right),
        ]);
    }

    // 🖨️ println!, not tracing — this is the OUTPUT of the status tool,
    // not diagnostics about it.
    println!("📊 per-domain ingestion status\n{domain_table}\n");
    println!("👤 per-user ingestion status\n{user_table}\n");
    match &snapshot.latest_completion {
        Some(latest) => println!("⏰ newest ingested mail was received at: {latest}"),
        None => println!("⏰ nothing has completed yet — the ledger is all potential"),
    }
}
