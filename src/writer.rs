//! Atomic, idempotent monthly partition writes (§4.1).

use std::fs;
use std::path::{Path, PathBuf};

use polars::prelude::*;

use crate::error::{LakeError, Result};

/// Outcome of a single monthly-partition write: where it landed and the
/// inclusive timestamp bounds of its content after merge.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub path: PathBuf,
    pub t_min: i64,
    pub t_max: i64,
    pub row_count: usize,
}

fn sanitize_segment(s: &str) -> String {
    s.trim().to_uppercase().replace(['/', ':'], "_")
}

/// Writes merged, deduplicated, sorted partition files under a fixed
/// hierarchical layout (§6.2), publishing each one atomically.
pub struct PartitionWriter {
    data_root: PathBuf,
}

impl PartitionWriter {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// `<data-root>/<EXCHANGE>/<MARKET>/<SYMBOL>/<type>/<period>/<YYYY>/<MM>/<SYMBOL>_<period>_<YYYYMM>.parquet`
    fn partition_path(
        &self,
        exchange: &str,
        market: &str,
        symbol: &str,
        data_type: &str,
        period: &str,
        year: i32,
        month: u32,
    ) -> PathBuf {
        let exchange = sanitize_segment(exchange);
        let market = sanitize_segment(market);
        let symbol = sanitize_segment(symbol);
        let data_type = data_type.trim().to_lowercase();
        let period = period.trim().to_lowercase();
        let filename = format!("{symbol}_{period}_{year:04}{month:02}.parquet");
        self.data_root
            .join(exchange)
            .join(market)
            .join(symbol)
            .join(data_type)
            .join(&period)
            .join(format!("{year:04}"))
            .join(format!("{month:02}"))
            .join(filename)
    }

    /// Merge `df` into whatever partition file already exists at the target
    /// tuple, deduplicating by `ts_col` (keeping the last occurrence),
    /// sorting ascending, then publishing atomically (§4.1 steps 1-6).
    pub fn write_table(
        &self,
        df: DataFrame,
        exchange: &str,
        market: &str,
        symbol: &str,
        data_type: &str,
        period: &str,
        year: i32,
        month: u32,
        ts_col: &str,
    ) -> Result<WriteResult> {
        let path = self.partition_path(exchange, market, symbol, data_type, period, year, month);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let merged = if path.exists() {
            let mut existing_file = std::fs::File::open(&path)?;
            let existing = ParquetReader::new(&mut existing_file).finish()?;
            let combined = concat(
                [existing.lazy(), df.lazy()],
                UnionArgs {
                    diagonal: true,
                    ..Default::default()
                },
            )?;
            combined.collect()?
        } else {
            df
        };

        let mut merged = merged
            .lazy()
            .sort(
                [ts_col],
                SortMultipleOptions::default().with_maintain_order(true),
            )
            .unique_stable(Some(vec![ts_col.to_string()]), UniqueKeepStrategy::Last)
            .sort([ts_col], SortMultipleOptions::default())
            .collect()?;

        let row_count = merged.height();
        let ts = merged.column(ts_col)?.i64()?;
        let t_min = ts.min().ok_or_else(|| LakeError::WriteIntegrity {
            path: path.clone(),
            reason: "empty frame after merge".to_string(),
        })?;
        let t_max = ts.max().ok_or_else(|| LakeError::WriteIntegrity {
            path: path.clone(),
            reason: "empty frame after merge".to_string(),
        })?;

        let tmp_path = path.with_extension("parquet.tmp");
        {
            let mut tmp_file = std::fs::File::create(&tmp_path)?;
            ParquetWriter::new(&mut tmp_file).finish(&mut merged)?;
        }
        fs::rename(&tmp_path, &path)?;

        self.verify_write(&path, row_count, ts_col)?;

        Ok(WriteResult {
            path,
            t_min,
            t_max,
            row_count,
        })
    }

    /// Re-open the just-published file and confirm row count and sort
    /// order (§4.1 step 6, P1/P3). A failure here is fatal: the caller
    /// must not register the write in the manifest.
    fn verify_write(&self, path: &Path, expected_rows: usize, ts_col: &str) -> Result<()> {
        let mut file = std::fs::File::open(path)?;
        let written = ParquetReader::new(&mut file).finish()?;
        if written.height() != expected_rows {
            return Err(LakeError::WriteIntegrity {
                path: path.to_path_buf(),
                reason: format!(
                    "row count mismatch: wrote {expected_rows}, read back {}",
                    written.height()
                ),
            });
        }
        let ts = written.column(ts_col)?.i64()?;
        let is_sorted = ts
            .into_iter()
            .flatten()
            .is_sorted_by(|a, b| a <= b);
        if !is_sorted {
            return Err(LakeError::WriteIntegrity {
                path: path.to_path_buf(),
                reason: format!("{ts_col} column is not sorted ascending"),
            });
        }
        Ok(())
    }

    /// Partition an OHLC frame (must contain `ts`) by calendar month and
    /// write each month's partition. Months with no rows are not emitted.
    pub fn write_ohlc(
        &self,
        df: DataFrame,
        exchange: &str,
        market: &str,
        symbol: &str,
        period: &str,
    ) -> Result<Vec<WriteResult>> {
        if df.column("ts").is_err() {
            return Err(LakeError::ParseError {
                field: "ts",
                value: "missing required column".to_string(),
            });
        }
        self.write_partitioned_by_month(df, exchange, market, symbol, "raw", period, "ts")
    }

    /// Same as [`Self::write_ohlc`] but for tick data (`type="ticks"`,
    /// `period="tick"`).
    pub fn write_ticks(
        &self,
        df: DataFrame,
        exchange: &str,
        market: &str,
        symbol: &str,
    ) -> Result<Vec<WriteResult>> {
        if df.column("ts").is_err() {
            return Err(LakeError::ParseError {
                field: "ts",
                value: "missing required column".to_string(),
            });
        }
        self.write_partitioned_by_month(df, exchange, market, symbol, "ticks", "tick", "ts")
    }

    fn write_partitioned_by_month(
        &self,
        df: DataFrame,
        exchange: &str,
        market: &str,
        symbol: &str,
        data_type: &str,
        period: &str,
        ts_col: &str,
    ) -> Result<Vec<WriteResult>> {
        let months: Vec<(i32, u32)> = {
            let ts = df.column(ts_col)?.i64()?;
            let mut set = std::collections::BTreeSet::new();
            for v in ts.into_iter().flatten() {
                let (y, m) = month_of_ms(v);
                set.insert((y, m));
            }
            set.into_iter().collect()
        };

        let mut results = Vec::with_capacity(months.len());
        for (year, month) in months {
            let (lo, hi) = month_bounds_ms(year, month);
            let month_df = df
                .clone()
                .lazy()
                .filter(col(ts_col).gt_eq(lit(lo)).and(col(ts_col).lt(lit(hi))))
                .collect()?;
            if month_df.height() == 0 {
                continue;
            }
            let result = self.write_table(
                month_df, exchange, market, symbol, data_type, period, year, month, ts_col,
            )?;
            results.push(result);
        }
        Ok(results)
    }
}

fn month_of_ms(ms: i64) -> (i32, u32) {
    let dt = chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default();
    (dt.format("%Y").to_string().parse().unwrap_or(1970), dt.format("%m").to_string().parse().unwrap_or(1))
}

fn month_bounds_ms(year: i32, month: u32) -> (i64, i64) {
    use chrono::{NaiveDate, TimeZone, Utc};
    let start = Utc
        .from_utc_datetime(&NaiveDate::from_ymd_opt(year, month, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let end = Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    );
    (start.timestamp_millis(), end.timestamp_millis())
}
