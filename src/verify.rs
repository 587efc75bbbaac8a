//! Integrity verifier: gap/overlap detection over a manifest-listed
//! series, plus orphan/ghost filesystem-vs-manifest audits (§4.6).

use std::collections::HashSet;
use std::path::Path;

use polars::prelude::*;

use crate::error::Result;
use crate::manifest::{EntryFilter, Manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub status: VerifyStatus,
    pub message: String,
    pub row_count: usize,
    pub gap_count: usize,
    pub overlap_count: usize,
    pub interval_ms: Option<i64>,
}

/// §4.6 — replay every manifest-listed `raw` file for `(exchange, symbol,
/// market?, timeframe)`, sorted by `ts`, and report gaps/overlaps against
/// the modal interval. Never throws: always returns a status record.
pub fn verify_integrity(
    manifest: &Manifest,
    exchange: &str,
    symbol: &str,
    market: Option<&str>,
    timeframe: &str,
) -> Result<VerifyReport> {
    let filter = EntryFilter {
        symbol: Some(symbol.to_string()),
        data_type: Some("raw".to_string()),
        exchange: Some(exchange.to_string()),
        market: market.map(str::to_string),
    };

    let entries: Vec<_> = manifest
        .list_entries(&filter)?
        .into_iter()
        .filter(|e| {
            e.metadata_json
                .as_deref()
                .map(|m| m.contains(&format!("\"timeframe\":\"{timeframe}\"")))
                .unwrap_or(false)
        })
        .filter(|e| Path::new(&e.path).exists())
        .collect();

    if entries.is_empty() {
        return Ok(VerifyReport {
            status: VerifyStatus::Error,
            message: "no files found to verify".to_string(),
            row_count: 0,
            gap_count: 0,
            overlap_count: 0,
            interval_ms: None,
        });
    }

    let frames: Vec<LazyFrame> = entries
        .iter()
        .map(|e| LazyFrame::scan_parquet(&e.path, ScanArgsParquet::default()))
        .collect::<PolarsResult<Vec<_>>>()?;
    let combined = concat(
        frames,
        UnionArgs {
            diagonal: true,
            ..Default::default()
        },
    )?
    .sort(["ts"], SortMultipleOptions::default())
    .collect()?;

    let row_count = combined.height();
    if row_count < 2 {
        return Ok(VerifyReport {
            status: VerifyStatus::Success,
            message: "not enough data".to_string(),
            row_count,
            gap_count: 0,
            overlap_count: 0,
            interval_ms: None,
        });
    }

    let ts = combined.column("ts")?.i64()?;
    let values: Vec<i64> = ts.into_iter().flatten().collect();
    let diffs: Vec<i64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    let mode_diff = mode_of(&diffs);
    let Some(mode_diff) = mode_diff else {
        return Ok(VerifyReport {
            status: VerifyStatus::Error,
            message: "could not determine modal interval".to_string(),
            row_count,
            gap_count: 0,
            overlap_count: 0,
            interval_ms: None,
        });
    };

    let gap_count = diffs.iter().filter(|&&d| d > mode_diff).count();
    let overlap_count = diffs.iter().filter(|&&d| d <= 0).count();

    let status = if gap_count == 0 && overlap_count == 0 {
        VerifyStatus::Success
    } else {
        VerifyStatus::Warning
    };
    let message = match status {
        VerifyStatus::Success => format!("{row_count} rows, no gaps or overlaps"),
        _ => format!("{gap_count} gap(s), {overlap_count} overlap(s) across {row_count} rows"),

    };

    Ok(VerifyReport {
        status,
        message,
        row_count,
        gap_count,
        overlap_count,
        interval_ms: Some(mode_diff),
    })
}

fn mode_of(values: &[i64]) -> Option<i64> {
    let mut counts: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    for &v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts.into_iter().max_by_key(|(_, c)| *c).map(|(v, _)| v)
}

/// Files physically present under `data_root` with no manifest entry.
pub fn orphans(manifest: &Manifest, data_root: &Path) -> Result<HashSet<String>> {
    let on_disk = files_on_disk(data_root);
    let registered: HashSet<String> = manifest.all_paths()?.into_iter().collect();
    Ok(on_disk.difference(&registered).cloned().collect())
}

/// Manifest entries whose file no longer exists on disk.
pub fn ghosts(manifest: &Manifest, data_root: &Path) -> Result<HashSet<String>> {
    let on_disk = files_on_disk(data_root);
    let registered: HashSet<String> = manifest.all_paths()?.into_iter().collect();
    Ok(registered.difference(&on_disk).cloned().collect())
}

fn files_on_disk(data_root: &Path) -> HashSet<String> {
    let pattern = data_root.join("**").join("*.parquet");
    glob::glob(&pattern.to_string_lossy())
        .into_iter()
        .flatten()
        .filter_map(|r| r.ok())
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::NewEntry;
    use crate::writer::PartitionWriter;
    use tempfile::TempDir;

    fn register_ohlc(manifest: &Manifest, writer: &PartitionWriter, rows: &[(i64, f64)]) {
        let ts: Vec<i64> = rows.iter().map(|r| r.0).collect();
        let val: Vec<f64> = rows.iter().map(|r| r.1).collect();
        let df = df!("ts" => ts, "val" => val).unwrap();
        let result = writer
            .write_table(df, "binance", "spot", "BTC", "raw", "1m", 2023, 1, "ts")
            .unwrap();
        manifest
            .add_entry(NewEntry {
                exchange: "binance".into(),
                market: "spot".into(),
                symbol: "BTC".into(),
                path: result.path.to_string_lossy().into_owned(),
                data_type: "raw".into(),
                time_from: Some(result.t_min),
                time_to: Some(result.t_max),
                metadata_json: Some("{\"timeframe\":\"1m\"}".to_string()),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn verify_integrity_reports_warning_on_missing_timestamp_t9() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::open_in_memory().unwrap();
        let writer = PartitionWriter::new(dir.path());

        // cadence 60_000ms, one intentional gap (skips the 180_000 tick)
        register_ohlc(
            &manifest,
            &writer,
            &[(1672531200000, 1.0), (1672531260000, 2.0), (1672531380000, 3.0)],
        );

        let report = verify_integrity(&manifest, "binance", "BTC", Some("spot"), "1m").unwrap();
        assert_eq!(report.status, VerifyStatus::Warning);
        assert_eq!(report.gap_count, 1);
        assert_eq!(report.interval_ms, Some(60_000));
    }

    #[test]
    fn verify_integrity_no_files_is_error_status() {
        let manifest = Manifest::open_in_memory().unwrap();
        let report = verify_integrity(&manifest, "binance", "BTC", Some("spot"), "1m").unwrap();
        assert_eq!(report.status, VerifyStatus::Error);
        assert_eq!(report.message, "no files found to verify");
    }

    #[test]
    fn orphans_and_ghosts_detect_divergence() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::open_in_memory().unwrap();
        let writer = PartitionWriter::new(dir.path());

        let df = df!("ts" => [1672531200000i64], "val" => [1.0f64]).unwrap();
        let result = writer
            .write_table(df, "binance", "spot", "BTC", "raw", "1m", 2023, 1, "ts")
            .unwrap();

        // orphan: another file exists on disk but is never registered.
        let orphan_path = dir.path().join("ORPHAN").join("x.parquet");
        std::fs::create_dir_all(orphan_path.parent().unwrap()).unwrap();
        std::fs::write(&orphan_path, b"not a real parquet, existence is what matters for this test").unwrap();

        manifest
            .add_entry(NewEntry {
                exchange: "binance".into(),
                market: "spot".into(),
                symbol: "BTC".into(),
                path: result.path.to_string_lossy().into_owned(),
                data_type: "raw".into(),
                time_from: Some(result.t_min),
                time_to: Some(result.t_max),
                ..Default::default()
            })
            .unwrap();

        // ghost: registered but file removed afterwards.
        manifest
            .add_entry(NewEntry {
                exchange: "binance".into(),
                market: "spot".into(),
                symbol: "ETH".into(),
                path: dir.path().join("GHOST.parquet").to_string_lossy().into_owned(),
                data_type: "raw".into(),
                ..Default::default()
            })
            .unwrap();

        let found_orphans = orphans(&manifest, dir.path()).unwrap();
        assert!(found_orphans.iter().any(|p| p.contains("ORPHAN")));

        let found_ghosts = ghosts(&manifest, dir.path()).unwrap();
        assert!(found_ghosts.iter().any(|p| p.contains("GHOST")));
    }
}
