//! keel operator CLI — offline auditing over the journals.
//!
//! Strict reads live here: production replay tolerates a torn line, the
//! audit path does not.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keel_execution::{Outbox, OutboxStatus};
use keel_fills::FillsLedger;
use keel_journal::Journal;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Order execution safety layer CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Journal audit utilities
    Journal {
        #[command(subcommand)]
        cmd: JournalCmd,
    },

    /// Outbox state queries
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },

    /// Fills ledger reports
    Fills {
        #[command(subcommand)]
        cmd: FillsCmd,
    },
}

#[derive(Subcommand)]
enum JournalCmd {
    /// Strict integrity audit: parse every line, recompute every entry id.
    Verify {
        /// Path to the JSONL journal
        #[arg(long)]
        path: String,
    },

    /// Print entries as JSON lines (strict read).
    Dump {
        #[arg(long)]
        path: String,

        /// Only entries of this type (e.g. outbox, fill)
        #[arg(long = "entry-type")]
        entry_type: Option<String>,
    },
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Latest state per id, or one id in full.
    Status {
        /// Path to the outbox journal
        #[arg(long)]
        journal: String,

        /// Show the full entry for one client_order_id
        #[arg(long)]
        id: Option<String>,
    },

    /// Entries still in flight (PREPARED / COMMITTED / UNKNOWN).
    Pending {
        #[arg(long)]
        journal: String,
    },

    /// Quarantined entries awaiting reconciliation. Listed separately from
    /// FAILED so the operator routes them to reconcile, not resubmission.
    Unknown {
        #[arg(long)]
        journal: String,
    },
}

#[derive(Subcommand)]
enum FillsCmd {
    /// Counts, quantities, VWAP, and commission totals.
    Summary {
        /// Path to the fills journal
        #[arg(long)]
        journal: String,

        /// Restrict to one client_order_id
        #[arg(long)]
        order: Option<String>,

        /// Restrict to one symbol
        #[arg(long)]
        symbol: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Journal { cmd } => match cmd {
            JournalCmd::Verify { path } => journal_verify(&path),
            JournalCmd::Dump { path, entry_type } => journal_dump(&path, entry_type.as_deref()),
        },
        Commands::Outbox { cmd } => match cmd {
            OutboxCmd::Status { journal, id } => outbox_status(&journal, id.as_deref()),
            OutboxCmd::Pending { journal } => outbox_listing(&journal, Listing::Pending),
            OutboxCmd::Unknown { journal } => outbox_listing(&journal, Listing::Unknown),
        },
        Commands::Fills { cmd } => match cmd {
            FillsCmd::Summary {
                journal,
                order,
                symbol,
            } => fills_summary(&journal, order.as_deref(), symbol.as_deref()),
        },
    }
}

// ---------------------------------------------------------------------------
// journal
// ---------------------------------------------------------------------------

fn journal_verify(path: &str) -> Result<()> {
    let journal = Journal::open(path).with_context(|| format!("open journal {path}"))?;

    // Strict parse first so a corrupt line is reported with its location.
    let entries = journal
        .read_all()
        .with_context(|| format!("strict read of {path}"))?;

    for entry in &entries {
        if !entry.id_is_consistent() {
            bail!(
                "entry id mismatch at sequence {}: stored {}, content disagrees",
                entry.sequence,
                entry.entry_id
            );
        }
    }

    println!("OK: {} entries, all ids consistent", entries.len());
    Ok(())
}

fn journal_dump(path: &str, entry_type: Option<&str>) -> Result<()> {
    let journal = Journal::open(path).with_context(|| format!("open journal {path}"))?;
    for entry in journal.read_all()? {
        if let Some(t) = entry_type {
            if entry.entry_type != t {
                continue;
            }
        }
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// outbox
// ---------------------------------------------------------------------------

enum Listing {
    Pending,
    Unknown,
}

fn outbox_status(journal: &str, id: Option<&str>) -> Result<()> {
    let outbox = Outbox::open(journal).with_context(|| format!("open outbox {journal}"))?;

    match id {
        Some(id) => {
            let entry = outbox
                .get(id)
                .with_context(|| format!("no outbox entry for {id}"))?;
            println!("{}", serde_json::to_string_pretty(entry)?);
        }
        None => {
            for status in [
                OutboxStatus::Prepared,
                OutboxStatus::Committed,
                OutboxStatus::Acked,
                OutboxStatus::Unknown,
                OutboxStatus::Reconciled,
                OutboxStatus::Filled,
                OutboxStatus::Failed,
            ] {
                let entries = outbox.get_by_status(status);
                if entries.is_empty() {
                    continue;
                }
                println!("{status} ({}):", entries.len());
                for e in entries {
                    println!(
                        "  {}  {} {} {:.8}",
                        e.client_order_id, e.intent.symbol, e.intent.side, e.intent.quantity
                    );
                }
            }
        }
    }
    Ok(())
}

fn outbox_listing(journal: &str, listing: Listing) -> Result<()> {
    let outbox = Outbox::open(journal).with_context(|| format!("open outbox {journal}"))?;
    let entries = match listing {
        Listing::Pending => outbox.get_pending(),
        Listing::Unknown => outbox.get_unknown(),
    };

    if entries.is_empty() {
        println!("none");
        return Ok(());
    }
    for e in entries {
        println!(
            "{}  {}  {} {} {:.8}  {}",
            e.status,
            e.client_order_id,
            e.intent.symbol,
            e.intent.side,
            e.intent.quantity,
            e.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// fills
// ---------------------------------------------------------------------------

fn fills_summary(journal: &str, order: Option<&str>, symbol: Option<&str>) -> Result<()> {
    let ledger = FillsLedger::open(journal).with_context(|| format!("open fills {journal}"))?;

    if let Some(order) = order {
        let fills = ledger.get_fills_for_order(order);
        println!("order {order}: {} fills", fills.len());
        println!("  total qty : {:.8}", ledger.total_filled_qty(order));
        match ledger.avg_fill_price(order) {
            Some(vwap) => println!("  vwap      : {vwap:.8}"),
            None => println!("  vwap      : n/a"),
        }
        return Ok(());
    }

    if let Some(symbol) = symbol {
        let fills = ledger.get_fills_for_symbol(symbol);
        let qty: f64 = fills.iter().map(|f| f.qty).sum();
        println!("symbol {symbol}: {} fills, total qty {qty:.8}", fills.len());
        return Ok(());
    }

    println!("fills           : {}", ledger.fill_count());
    println!("total commission: {:.8}", ledger.total_commission(None));
    Ok(())
}
