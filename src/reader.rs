//! Range reads across manifest-known partition files, plus CSV export
//! (§4.3, §6.5). Reads never consult the manifest — they trust the
//! on-disk layout, decoupling read availability from manifest freshness.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use polars::prelude::*;

use crate::error::{LakeError, Result};

pub struct PartitionReader {
    data_root: PathBuf,
}

fn sanitize_segment(s: &str) -> String {
    s.trim().to_uppercase().replace(['/', ':'], "_")
}

fn parse_iso_to_ms(iso: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(iso, "%Y-%m-%d") {
        let dt = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        return Ok(dt.timestamp_millis());
    }
    Err(LakeError::ParseError {
        field: "iso_timestamp",
        value: iso.to_string(),
    })
}

impl PartitionReader {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// `base/EXCHANGE/*/SYMBOL/data_type/**/*.parquet`. `symbol` is
    /// uppercased and path-sanitized before it ever touches the glob
    /// string (T8): there is no string interpolation of caller-controlled
    /// content into anything resembling a query.
    fn glob_pattern(&self, exchange: &str, symbol: &str, data_type: &str) -> String {
        let exchange = sanitize_segment(exchange);
        let symbol = sanitize_segment(symbol);
        let data_type = data_type.trim().to_lowercase();
        self.data_root
            .join(exchange)
            .join("*")
            .join(symbol)
            .join(data_type)
            .join("**")
            .join("*.parquet")
            .to_string_lossy()
            .into_owned()
    }

    /// Range read across all partitions matching `(exchange, symbol,
    /// data_type)`, filtered to `[start_iso, end_iso]` inclusive. The
    /// timestamp bounds are applied as a `polars` filter expression, not
    /// interpolated into any textual query (T8).
    pub fn read_range(
        &self,
        exchange: &str,
        symbol: &str,
        data_type: &str,
        start_iso: &str,
        end_iso: &str,
    ) -> Result<DataFrame> {
        let start_ms = parse_iso_to_ms(start_iso)?;
        let end_ms = parse_iso_to_ms(end_iso)?;
        let ts_col = if data_type.eq_ignore_ascii_case("alt") {
            "timestamp"
        } else {
            "ts"
        };

        let pattern = self.glob_pattern(exchange, symbol, data_type);
        let files = glob::glob(&pattern)
            .map_err(|e| LakeError::ParseError {
                field: "glob_pattern",
                value: e.to_string(),
            })?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        if files.is_empty() {
            return Ok(DataFrame::empty());
        }

        let frames: Vec<LazyFrame> = files
            .into_iter()
            .map(|p| LazyFrame::scan_parquet(p, ScanArgsParquet::default()))
            .collect::<PolarsResult<Vec<_>>>()?;

        let combined = concat(
            frames,
            UnionArgs {
                diagonal: true,
                ..Default::default()
            },
        )?;

        let filtered = combined
            .filter(
                col(ts_col)
                    .gt_eq(lit(start_ms))
                    .and(col(ts_col).lt_eq(lit(end_ms))),
            )
            .sort([ts_col], SortMultipleOptions::default());

        filtered.collect().map_err(Into::into)
    }

    /// Distinct symbol directory names under `exchange` (any market, any
    /// data type) — for discovery UIs.
    pub fn list_symbols(&self, exchange: &str) -> Result<Vec<String>> {
        let exchange = sanitize_segment(exchange);
        let exchange_dir = self.data_root.join(&exchange);
        if !exchange_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut symbols = std::collections::BTreeSet::new();
        for market_entry in fs::read_dir(&exchange_dir)? {
            let market_path = market_entry?.path();
            if !market_path.is_dir() {
                continue;
            }
            for symbol_entry in fs::read_dir(&market_path)? {
                let symbol_path = symbol_entry?.path();
                if symbol_path.is_dir() {
                    if let Some(name) = symbol_path.file_name() {
                        symbols.insert(name.to_string_lossy().into_owned());
                    }
                }
            }
        }
        Ok(symbols.into_iter().collect())
    }

    /// Write `<TICKER>,<PER>,<DATE>,<TIME>,<OPEN>,<HIGH>,<LOW>,<CLOSE>,<VOL>`
    /// rows for `df` (expects `ts/open/high/low/close/volume`) to
    /// `dl_<SYMBOL>_<EXCHANGE>_<MARKET>.csv.txt` under `out_dir`, using the
    /// same write-to-temp-then-rename idiom the writer uses for partitions.
    pub fn export_csv(
        &self,
        df: &DataFrame,
        exchange: &str,
        market: &str,
        symbol: &str,
        out_dir: &std::path::Path,
    ) -> Result<PathBuf> {
        fs::create_dir_all(out_dir)?;
        let filename = format!(
            "dl_{}_{}_{}.csv.txt",
            sanitize_segment(symbol),
            sanitize_segment(exchange),
            sanitize_segment(market)
        );
        let final_path = out_dir.join(filename);

        let ts = df.column("ts")?.i64()?;
        let open = df.column("open")?.f64()?;
        let high = df.column("high")?.f64()?;
        let low = df.column("low")?.f64()?;
        let close = df.column("close")?.f64()?;
        let volume = df.column("volume")?.f64()?;

        let tmp = tempfile::NamedTempFile::new_in(out_dir)?;
        {
            let mut wtr = csv::Writer::from_writer(&tmp);
            for i in 0..df.height() {
                let t = ts.get(i).unwrap_or_default();
                let dt = DateTime::from_timestamp_millis(t).unwrap_or_default();
                wtr.write_record(&[
                    sanitize_segment(symbol),
                    "1".to_string(),
                    dt.format("%Y%m%d").to_string(),
                    dt.format("%H%M%S").to_string(),
                    open.get(i).unwrap_or_default().to_string(),
                    high.get(i).unwrap_or_default().to_string(),
                    low.get(i).unwrap_or_default().to_string(),
                    close.get(i).unwrap_or_default().to_string(),
                    volume.get(i).unwrap_or_default().to_string(),
                ])?;
            }
            wtr.flush()?;
        }
        tmp.persist(&final_path)
            .map_err(|e| LakeError::Io(e.error))?;
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::PartitionWriter;
    use tempfile::TempDir;

    #[test]
    fn read_range_returns_rows_within_bounds() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let df = df!(
            "ts" => [1672531200000i64, 1672531260000, 1672531320000],
            "open" => [1.0f64, 2.0, 3.0],
        )
        .unwrap();
        writer
            .write_table(df, "binance", "spot", "BTC", "raw", "1m", 2023, 1, "ts")
            .unwrap();

        let reader = PartitionReader::new(dir.path());
        let got = reader
            .read_range("binance", "BTC", "raw", "2023-01-01T00:00:00Z", "2023-01-01T00:01:00Z")
            .unwrap();
        assert_eq!(got.height(), 2);
    }

    #[test]
    fn read_range_with_malicious_symbol_is_empty_and_safe() {
        let dir = TempDir::new().unwrap();
        let reader = PartitionReader::new(dir.path());
        let got = reader
            .read_range(
                "binance",
                "TEST'; DROP TABLE--",
                "raw",
                "2023-01-01",
                "2023-02-01",
            )
            .unwrap();
        assert_eq!(got.height(), 0);
    }

    #[test]
    fn list_symbols_walks_market_directories() {
        let dir = TempDir::new().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let df = df!("ts" => [1672531200000i64], "open" => [1.0f64]).unwrap();
        writer
            .write_table(df, "binance", "spot", "BTC", "raw", "1m", 2023, 1, "ts")
            .unwrap();

        let reader = PartitionReader::new(dir.path());
        let symbols = reader.list_symbols("binance").unwrap();
        assert_eq!(symbols, vec!["BTC".to_string()]);
    }
}
