use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pce_enrich::{EnrichConfig, Enricher, EnrichmentKind, GeminiEnricher, TemplateEnricher};
use pce_ingest::{export_csv, IngestConfig, IngestPipeline};
use pce_store::{CatalogStore, FailClosedStore, SqliteCatalogStore, StoreHealth};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pce")]
#[command(about = "Product catalog batch enrichment utility")]
struct Cli {
    /// SQLite catalog path (defaults to $PCE_DB_PATH, then ./catalog.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a spreadsheet: dedup against the store, enrich, commit.
    Ingest {
        file: PathBuf,
        /// Cap on candidates for this run (0 = no cap).
        #[arg(long)]
        limit: Option<usize>,
        /// Artifacts to generate: image, short, long.
        #[arg(long, value_delimiter = ',')]
        generate: Vec<String>,
        /// Input column holding the deduplication key.
        #[arg(long)]
        identifier_column: Option<String>,
        /// Use the deterministic template enricher instead of the hosted model.
        #[arg(long)]
        offline: bool,
    },
    /// Export the full store contents as a CSV snapshot.
    Export { out: PathBuf },
    /// Show record count and store health.
    Status,
    /// Delete one record by exact identifier.
    Delete { identifier: String },
    /// Column operations, applied to every stored record.
    #[command(subcommand)]
    Column(ColumnCommand),
}

#[derive(Debug, Subcommand)]
enum ColumnCommand {
    /// Remove a field from all records.
    Drop { name: String },
    /// Rename a field on all records that have it.
    Rename { old: String, new: String },
}

fn db_path(cli_db: Option<PathBuf>) -> PathBuf {
    cli_db
        .or_else(|| std::env::var("PCE_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("catalog.db"))
}

fn parse_kinds(raw: &[String]) -> Result<Vec<EnrichmentKind>> {
    raw.iter()
        .map(|kind| kind.parse::<EnrichmentKind>().map_err(anyhow::Error::msg))
        .collect()
}

fn build_enricher(offline: bool) -> Box<dyn Enricher> {
    if offline {
        return Box::new(TemplateEnricher);
    }
    match GeminiEnricher::new(EnrichConfig::from_env()) {
        Ok(enricher) => Box::new(enricher),
        Err(err) => {
            warn!(error = %err, "hosted enricher unavailable; falling back to templates");
            Box::new(TemplateEnricher)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = db_path(cli.db);

    match cli.command {
        Commands::Ingest {
            file,
            limit,
            generate,
            identifier_column,
            offline,
        } => {
            let mut config = IngestConfig::from_env();
            if let Some(limit) = limit {
                config.batch_limit = limit;
            }
            if let Some(column) = identifier_column {
                config.identifier_column = column;
            }
            if !generate.is_empty() {
                config.kinds = parse_kinds(&generate)?;
            }

            let store = FailClosedStore::open(&db);
            let mut pipeline =
                IngestPipeline::new(Box::new(store), build_enricher(offline), config);
            let summary = pipeline.run(&file).await?;
            println!(
                "ingest complete: run_id={} parsed={} duplicates={} failed={} inserted={} rejected={}{}",
                summary.run_id,
                summary.rows_parsed,
                summary.duplicates_at_filter,
                summary.enrichment_failures,
                summary.inserted,
                summary.rejected_at_commit,
                if summary.store_degraded {
                    " (store degraded)"
                } else {
                    ""
                },
            );
        }
        Commands::Export { out } => {
            let store = FailClosedStore::open(&db);
            let report = export_csv(&store, &IngestConfig::from_env().identifier_column, &out)?;
            println!(
                "export complete: rows={} bytes={} sha256={}{}",
                report.rows,
                report.bytes,
                report.sha256,
                if report.store_degraded {
                    " (store degraded)"
                } else {
                    ""
                },
            );
        }
        Commands::Status => {
            let store = FailClosedStore::open(&db);
            let health = match store.health() {
                StoreHealth::Available => "available".to_string(),
                StoreHealth::Unavailable { reason } => format!("unavailable ({reason})"),
            };
            println!(
                "store={} records={} health={}",
                db.display(),
                store.count()?,
                health
            );
        }
        Commands::Delete { identifier } => {
            let mut store = SqliteCatalogStore::open(&db)
                .with_context(|| format!("opening {}", db.display()))?;
            store.delete(&identifier)?;
            println!("deleted `{identifier}` (no-op if absent)");
        }
        Commands::Column(command) => {
            let mut store = SqliteCatalogStore::open(&db)
                .with_context(|| format!("opening {}", db.display()))?;
            match command {
                ColumnCommand::Drop { name } => {
                    store.delete_field(&name)?;
                    println!("dropped column `{name}` from all records");
                }
                ColumnCommand::Rename { old, new } => {
                    store.rename_field(&old, &new)?;
                    println!("renamed column `{old}` -> `{new}`");
                }
            }
        }
    }

    Ok(())
}
