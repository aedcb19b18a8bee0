use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sic_core::UNCLASSIFIED;
use sic_sync::{
    run_extract_once, run_sync_once, ExtractConfig, ExtractRunSummary, StoreBackend, SyncConfig,
    SyncRunSummary, SyncStatus,
};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "sic-cli")]
#[command(about = "Extract UK SIC codes and sync them into a remote table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the SIC code table, classify every code by section and write the CSV
    Extract {
        /// Page to read the SIC table from
        #[arg(long)]
        url: Option<String>,
        /// Output CSV path
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Upsert the CSV into the remote table in fixed-size batches
    Sync {
        /// Input CSV path
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Destination table
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Pause between batches in milliseconds
        #[arg(long)]
        pause_ms: Option<u64>,
        #[arg(long, default_value_t = StoreBackend::Postgrest)]
        backend: StoreBackend,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // .env may carry RUST_LOG, so it is loaded before the subscriber.
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract { url, csv } => {
            let mut config = ExtractConfig::from_env()?;
            if let Some(url) = url {
                config.source_url = url;
            }
            if let Some(csv) = csv {
                config.csv_path = csv;
            }

            println!("Fetching SIC codes from {} ...", config.source_url);
            let summary = run_extract_once(&config).await?;
            print_extract_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            csv,
            table,
            batch_size,
            pause_ms,
            backend,
        } => {
            let mut config = SyncConfig::from_env(backend)?;
            if let Some(csv) = csv {
                config.csv_path = csv;
            }
            if let Some(table) = table {
                config.table = table;
            }
            if let Some(batch_size) = batch_size {
                anyhow::ensure!(batch_size > 0, "--batch-size must be at least 1");
                config.batch_size = batch_size;
            }
            if let Some(pause_ms) = pause_ms {
                config.batch_pause = Duration::from_millis(pause_ms);
            }

            let summary = run_sync_once(&config).await?;
            print_sync_summary(&summary);
            Ok(match summary.status() {
                SyncStatus::Completed => ExitCode::SUCCESS,
                SyncStatus::CompletedWithFailures => ExitCode::FAILURE,
            })
        }
    }
}

fn print_extract_summary(summary: &ExtractRunSummary) {
    println!("\nSIC codes by section:");
    for (section, count) in summary.tally.iter() {
        println!("{section}: {count} codes");
    }
    let unclassified = summary.tally.count(UNCLASSIFIED);
    if unclassified > 0 {
        println!("({unclassified} codes could not be placed in a section)");
    }
    println!(
        "\nSuccessfully scraped {} SIC codes and saved to {} (run_id={})",
        summary.records, summary.csv_path, summary.run_id
    );
}

fn print_sync_summary(summary: &SyncRunSummary) {
    println!("\nUpload summary:");
    println!("Total records: {}", summary.total_records);
    println!("Total batches: {}", summary.total_batches);
    println!("Successful batches: {}", summary.successful_batches);
    println!("Failed batches: {}", summary.failed_batches);
    match summary.status() {
        SyncStatus::Completed => println!("\nUpload completed successfully!"),
        SyncStatus::CompletedWithFailures => println!(
            "\nUpload completed with {} failed batches.",
            summary.failed_batches
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::parse_from([
            "sic-cli", "sync", "--csv", "out.csv", "--batch-size", "20", "--pause-ms", "0", "--backend", "postgres",
        ]);
        match cli.command {
            Commands::Sync {
                csv,
                batch_size,
                pause_ms,
                backend,
                table,
            } => {
                assert_eq!(csv, Some(PathBuf::from("out.csv")));
                assert_eq!(batch_size, Some(20));
                assert_eq!(pause_ms, Some(0));
                assert_eq!(backend, StoreBackend::Postgres);
                assert_eq!(table, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
