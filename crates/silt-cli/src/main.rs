use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use silt_core::WriteDisposition;
use silt_load::{
    load_registry, ClickHouseDestination, Destination, MemoryDestination, Pipeline,
    PipelineConfig, RunSummary,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "silt-cli")]
#[command(about = "Load external sources into the analytics warehouse")]
struct Cli {
    /// Source registry file.
    #[arg(long, default_value = "sources.yaml")]
    registry: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List registered sources.
    List,
    /// Run one source, or every registered source in order.
    Run {
        source: Option<String>,
        /// Override the row-count ceiling for this run.
        #[arg(long)]
        limit: Option<u64>,
        /// Load into an in-memory destination instead of the warehouse.
        #[arg(long)]
        dry_run: bool,
    },
    /// Download a remote file to its fixed staging path.
    Stage {
        /// Staging-relative path, e.g. auto-mpg/mpg.csv.
        path: String,
        url: String,
    },
}

fn disposition_label(disposition: &WriteDisposition) -> String {
    match disposition {
        WriteDisposition::Append => "append".to_string(),
        WriteDisposition::Replace => "replace".to_string(),
        WriteDisposition::Merge { key_fields } => {
            format!("merge on {}", key_fields.join(", "))
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run complete: source={} run_id={} rows_read={} rows_loaded={} rows_skipped={} chunks={}",
        summary.source,
        summary.run_id,
        summary.rows_read,
        summary.rows_loaded,
        summary.rows_skipped,
        summary.chunks
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = load_registry(&cli.registry)?;

    match cli.command.unwrap_or(Commands::List) {
        Commands::List => {
            for source in &registry.sources {
                println!(
                    "{}  ->  {}.{}  [{}]",
                    source.name,
                    source.dataset,
                    source.table,
                    disposition_label(&source.disposition)
                );
            }
        }
        Commands::Run {
            source,
            limit,
            dry_run,
        } => {
            let mut registry = registry;
            if let Some(limit) = limit {
                for descriptor in &mut registry.sources {
                    descriptor.row_limit = Some(limit);
                }
            }

            let config = PipelineConfig::from_env();
            let destination: Box<dyn Destination> = if dry_run {
                Box::new(MemoryDestination::new())
            } else {
                Box::new(ClickHouseDestination::new(&config.clickhouse))
            };
            let mut pipeline = Pipeline::new(config, destination);

            let summaries = match source {
                Some(name) => {
                    let descriptor = registry
                        .source(&name)
                        .with_context(|| format!("no source named {name} in the registry"))?;
                    vec![pipeline.run_source(descriptor).await?]
                }
                None => pipeline.run_all(&registry).await?,
            };
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Stage { path, url } => {
            let config = PipelineConfig::from_env();
            let staged = silt_load::stage_remote_file(&config, &path, &url).await?;
            println!(
                "staged {} -> {} ({} bytes{})",
                url,
                staged.absolute_path.display(),
                staged.byte_size,
                if staged.deduplicated {
                    ", unchanged"
                } else {
                    ""
                }
            );
        }
    }

    Ok(())
}
