//! Tank ledger admin CLI
//!
//! Offline maintenance against a ledger data directory: rebuild entries
//! from the event log, reconcile tanks, inspect compositions and history.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tank_ledger::{
    CancelFlag, Config, InMemoryCatalog, Ledger, RebuildOptions, TankId, TenantId,
};

#[derive(Parser, Debug)]
#[command(name = "tank-ledger-admin")]
#[command(author, version, about = "Maintenance tool for the tank composition ledger", long_about = None)]
struct Cli {
    /// Ledger config file (TOML); environment variables otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tank and batch catalog (TOML)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay recorded events into ledger entries
    Rebuild {
        /// Only this tenant
        #[arg(long)]
        tenant: Option<TenantId>,

        /// Do the work, commit nothing
        #[arg(long)]
        dry_run: bool,

        /// Delete existing entries first
        #[arg(long)]
        clear: bool,
    },

    /// Reconcile ledger totals against tank volumes
    Integrity {
        #[arg(long)]
        tenant: TenantId,
    },

    /// Composition of one tank
    Composition {
        #[arg(long)]
        tank: TankId,

        /// RFC 3339 instant, inclusive
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },

    /// Compositions of every active tank holding wine
    Compositions {
        #[arg(long)]
        tenant: TenantId,
    },

    /// A tank's entries, newest first
    History {
        #[arg(long)]
        tank: TankId,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Entry counts for a tenant
    Stats {
        #[arg(long)]
        tenant: TenantId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("loading config from environment")?,
    };
    let catalog = match &cli.catalog {
        Some(path) => InMemoryCatalog::from_file(path)
            .with_context(|| format!("loading catalog from {}", path.display()))?,
        None => InMemoryCatalog::new(),
    };

    let ledger = Ledger::open(config, Arc::new(catalog))
        .await
        .context("opening ledger")?;

    let outcome = run(&ledger, cli.command, cli.json).await;
    ledger.shutdown().await?;
    outcome
}

async fn run(ledger: &Ledger, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Rebuild {
            tenant,
            dry_run,
            clear,
        } => {
            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling rebuild");
                    on_signal.cancel();
                }
            });

            let summary = ledger
                .rebuild(RebuildOptions {
                    tenant,
                    dry_run,
                    clear_existing: clear,
                    cancel,
                })
                .await?;

            if json {
                print_json(&summary)?;
            } else {
                let prefix = if summary.dry_run { "[dry run] " } else { "" };
                println!(
                    "{}{} tenants, {} events processed, {} skipped, {} entries created, {} cleared",
                    prefix,
                    summary.tenants,
                    summary.events_processed,
                    summary.events_skipped,
                    summary.entries_created,
                    summary.entries_cleared
                );
            }
        }

        Commands::Integrity { tenant } => {
            let report = ledger.integrity_report(tenant)?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} of {} tanks flagged (tolerance {} L)",
                    report.tanks_with_issues, report.total_tanks, report.tolerance
                );
                for issue in &report.issues {
                    println!(
                        "  {:<8} ledger {:>10} L  tank {:>10} L  diff {:>8}  unknown {}%{}",
                        issue.tank_code,
                        issue.ledger_volume,
                        issue.tank_volume,
                        issue.difference,
                        issue.unknown_percentage,
                        if issue.has_negative_composition {
                            "  NEGATIVE"
                        } else {
                            ""
                        }
                    );
                }
            }
        }

        Commands::Composition { tank, as_of } => {
            let snapshot = ledger.composition(tank, as_of)?;
            if json {
                print_json(&snapshot)?;
            } else {
                print_composition(&snapshot);
            }
        }

        Commands::Compositions { tenant } => {
            let snapshots = ledger.all_compositions(tenant)?;
            if json {
                print_json(&snapshots)?;
            } else {
                for snapshot in &snapshots {
                    print_composition(snapshot);
                }
            }
        }

        Commands::History { tank, limit } => {
            let entries = ledger.entry_history(tank, limit)?;
            if json {
                print_json(&entries)?;
            } else {
                for entry in &entries {
                    println!("{}", entry);
                }
            }
        }

        Commands::Stats { tenant } => {
            let stats = ledger.stats(tenant)?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "{} entries ({} explicit, {} inherited, {} unknown) across {} tanks, {} with unknown volume",
                    stats.total_entries,
                    stats.explicit,
                    stats.inherited,
                    stats.unknown,
                    stats.tanks_with_data,
                    stats.tanks_with_unknown
                );
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_composition(snapshot: &tank_ledger::CompositionSnapshot) {
    println!(
        "Tank {}: {} L, unknown {} L ({}%){}",
        snapshot.tank,
        snapshot.total_volume,
        snapshot.unknown_volume,
        snapshot.unknown_percentage,
        if snapshot.has_integrity_issues {
            "  [integrity issues]"
        } else {
            ""
        }
    );
    for batch in &snapshot.by_batch {
        println!("  batch   {:<16} {:>10} L {:>7}%", batch.label, batch.volume, batch.percentage);
    }
    for lot in &snapshot.by_wine_lot {
        println!("  lot     {:<16} {:>10} L {:>7}%", lot.label, lot.volume, lot.percentage);
    }
    for variety in &snapshot.by_variety {
        println!(
            "  variety {:<16} {:>10} L {:>7}%",
            variety.variety, variety.volume, variety.percentage
        );
    }
    for block in &snapshot.by_vineyard {
        println!(
            "  block   {:<16} {:>10} L {:>7}%  ({})",
            block.vineyard, block.volume, block.percentage, block.grower
        );
    }
}
