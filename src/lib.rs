pub mod config;
pub mod error;
pub mod features;
pub mod ingestor;
pub mod manifest;
pub mod market_client;
pub mod orchestrator;
pub mod reader;
pub mod verify;
pub mod writer;

use clap::Parser;
use std::path::PathBuf;

pub use config::{ConfigArgs, LakeConfig, apply_config_defaults};
pub use error::{LakeError, Result};

/// Pull OHLCV candles (and optionally funding-rate history) for one
/// `(exchange, market, symbol)` into the lake.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct IngestArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Exchange id, e.g. "binance".
    #[arg(long)]
    pub exchange: String,

    /// Market type, e.g. "spot" or "future".
    #[arg(long)]
    pub market: String,

    /// Instrument symbol, e.g. "BTCUSDT".
    #[arg(long)]
    pub symbol: String,

    /// Candle timeframe, e.g. "1m", "15m", "1h".
    #[arg(long, default_value = "1m")]
    pub timeframe: String,

    /// Base URL of the REST venue to fetch from.
    #[arg(long)]
    pub base_url: String,

    /// ISO-8601 start date override (ignored if resuming from manifest).
    #[arg(long)]
    pub start_date: Option<String>,

    /// Force a full-history probe rather than resuming/using --start-date.
    #[arg(long)]
    pub full_history: Option<bool>,

    /// Also fetch funding-rate history (derivative markets only).
    #[arg(long)]
    pub with_funding: Option<bool>,
}

/// Run the integrity verifier for a series already in the lake and print
/// its report.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long)]
    pub exchange: String,

    #[arg(long)]
    pub market: Option<String>,

    #[arg(long)]
    pub symbol: String,

    #[arg(long, default_value = "1m")]
    pub timeframe: String,
}

/// Range-read a series and export it as CSV (§6.5).
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ExportArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long)]
    pub exchange: String,

    #[arg(long)]
    pub market: String,

    #[arg(long)]
    pub symbol: String,

    #[arg(long, default_value = "raw")]
    pub data_type: String,

    #[arg(long)]
    pub start: String,

    #[arg(long)]
    pub end: String,

    #[arg(long)]
    pub out: PathBuf,
}

/// Report orphan files (on disk, not in manifest) and ghost entries
/// (in manifest, missing on disk).
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct AuditArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}
