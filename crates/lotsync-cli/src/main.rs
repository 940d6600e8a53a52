use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lotsync_core::SyncResult;
use lotsync_sync::{SyncConfig, SyncPipeline, VendorRegistry};

#[derive(Debug, Parser)]
#[command(name = "lotsync-cli")]
#[command(about = "LotSync dealer inventory reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one vendor's feed, or every enabled vendor.
    Sync {
        #[arg(long)]
        vendor: Option<String>,
    },
    /// Print a digest of the most recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// List configured vendors.
    Vendors,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn print_result(result: &SyncResult) {
    println!(
        "{}: status={:?} found={} new={} updated={} unlisted={} removed={} skipped={} images_triggered={}",
        result.vendor_id,
        result.status,
        result.vehicles_found,
        result.new_vehicles,
        result.updated_vehicles,
        result.unlisted_vehicles,
        result.removed_vehicles,
        result.skipped_records,
        result.image_processing_triggered,
    );
    if let Some(msg) = &result.error_message {
        println!("  error: {msg}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { vendor: None }) {
        Commands::Sync { vendor } => {
            let pipeline = SyncPipeline::new(config)?;
            match vendor {
                Some(vendor_id) => {
                    let result = pipeline.run_vendor(&vendor_id).await?;
                    print_result(&result);
                }
                None => {
                    let summary = pipeline.run_once().await?;
                    for result in &summary.results {
                        print_result(result);
                    }
                    println!(
                        "sync complete: vendors={} reports={}",
                        summary.synced_vendors, summary.reports_dir
                    );
                }
            }
        }
        Commands::Report { runs } => {
            let digest = lotsync_sync::report_recent_runs(runs, &config.reports_dir)?;
            println!("{digest}");
        }
        Commands::Vendors => {
            let registry = VendorRegistry::load(config.workspace_root.join("vendors.yaml")).await?;
            for vendor in &registry.vendors {
                println!(
                    "{}\t{}\t{}",
                    vendor.vendor_id,
                    vendor.display_name,
                    if vendor.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            match pipeline.maybe_build_scheduler().await? {
                Some(sched) => {
                    sched.start().await?;
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set LOTSYNC_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
