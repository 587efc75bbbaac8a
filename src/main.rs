use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dl_datalake::config::apply_config_defaults;
use dl_datalake::manifest::Manifest;
use dl_datalake::market_client::RestMarketClient;
use dl_datalake::orchestrator::{ClientFactory, DataKind, DownloadOrchestrator, DownloadRequest};
use dl_datalake::reader::PartitionReader;
use dl_datalake::verify::{orphans, ghosts, verify_integrity};
use dl_datalake::writer::PartitionWriter;
use dl_datalake::{AuditArgs, ExportArgs, IngestArgs, VerifyArgs};

#[derive(Parser, Debug)]
#[command(version, about = "Crypto market-data lake: ingestion, storage, and integrity tooling")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit one download to the orchestrator and block on completion.
    Ingest(IngestArgs),
    /// Run the integrity verifier and print the report.
    Verify(VerifyArgs),
    /// Range-read a series and export it as CSV.
    Export(ExportArgs),
    /// Report orphan files and ghost manifest entries.
    Audit(AuditArgs),
}

struct RestClientFactory {
    base_url: String,
}

impl ClientFactory<RestMarketClient> for RestClientFactory {
    fn build(&self, _exchange: &str, _market: &str) -> Arc<RestMarketClient> {
        Arc::new(RestMarketClient::new(self.base_url.clone()).expect("build reqwest client"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Ingest(ingest_args) => run_ingest(ingest_args).await,
        Command::Verify(verify_args) => run_verify(verify_args),
        Command::Export(export_args) => run_export(export_args),
        Command::Audit(audit_args) => run_audit(audit_args),
    }
}

async fn run_ingest(args: IngestArgs) -> Result<()> {
    let config = apply_config_defaults(args.config);
    std::fs::create_dir_all(&config.data_root).context("create data root")?;

    let manifest = Manifest::open(&config.manifest_path).context("open manifest")?;
    let writer = Arc::new(PartitionWriter::new(config.data_root.clone()));
    let factory: Arc<dyn ClientFactory<RestMarketClient>> = Arc::new(RestClientFactory {
        base_url: args.base_url.clone(),
    });
    let orchestrator = DownloadOrchestrator::new(
        manifest,
        writer,
        factory,
        config.per_exchange_concurrency,
    );

    let data_kind = if args.with_funding.unwrap_or(false) {
        DataKind::Both
    } else {
        DataKind::Raw
    };

    orchestrator
        .submit(DownloadRequest {
            exchange: args.exchange.clone(),
            market: args.market.clone(),
            symbol: args.symbol.clone(),
            timeframe: args.timeframe.clone(),
            data_kind,
            start_date: args.start_date.clone(),
            full_history: args.full_history.unwrap_or(false),
        })
        .await;

    loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Some(task) = orchestrator
            .status(&args.exchange, &args.market, &args.symbol, data_kind)
            .await
        {
            tracing::info!(status = ?task.status, message = %task.message, "ingest task");
            if matches!(
                task.status,
                dl_datalake::orchestrator::TaskStatus::Completed
                    | dl_datalake::orchestrator::TaskStatus::Failed
            ) {
                break;
            }
        }
    }

    Ok(())
}

fn run_verify(args: VerifyArgs) -> Result<()> {
    let config = apply_config_defaults(args.config);
    let manifest = Manifest::open(&config.manifest_path).context("open manifest")?;

    let report = verify_integrity(
        &manifest,
        &args.exchange,
        &args.symbol,
        args.market.as_deref(),
        &args.timeframe,
    )?;

    println!(
        "status={:?} rows={} gaps={} overlaps={} interval_ms={:?} message={}",
        report.status, report.row_count, report.gap_count, report.overlap_count, report.interval_ms, report.message
    );
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let config = apply_config_defaults(args.config);
    let reader = PartitionReader::new(config.data_root.clone());

    let df = reader.read_range(&args.exchange, &args.symbol, &args.data_type, &args.start, &args.end)?;
    if df.height() == 0 {
        bail!("no rows found for the requested range");
    }

    let path = reader.export_csv(&df, &args.exchange, &args.market, &args.symbol, &args.out)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run_audit(args: AuditArgs) -> Result<()> {
    let config = apply_config_defaults(args.config);
    let manifest = Manifest::open(&config.manifest_path).context("open manifest")?;

    let orphan_paths = orphans(&manifest, &config.data_root)?;
    let ghost_paths = ghosts(&manifest, &config.data_root)?;

    println!("orphans ({}):", orphan_paths.len());
    for p in &orphan_paths {
        println!("  {p}");
    }
    println!("ghosts ({}):", ghost_paths.len());
    for p in &ghost_paths {
        println!("  {p}");
    }
    Ok(())
}
