//! Persistent catalog of every partition file written to the lake.
//!
//! Backed by a local SQLite database (`rusqlite`, bundled) opened in
//! WAL mode with a generous busy-timeout so concurrent ingestion workers
//! can upsert entries without tripping over each other (§5).

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

/// One row of the manifest: identity, provenance, and time coverage of
/// a single partition file.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub id: i64,
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub path: String,
    pub data_type: String,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub version: String,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata_json: Option<String>,
}

/// Fields accepted by [`Manifest::add_entry`]. `path` is the upsert key.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub path: String,
    pub data_type: String,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub version: Option<String>,
    pub checksum: Option<String>,
    pub metadata_json: Option<String>,
}

/// Filters for [`Manifest::list_entries`] / [`Manifest::delete_entries`].
/// Absent filters are ignored; present ones are AND-combined.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub symbol: Option<String>,
    pub data_type: Option<String>,
    pub exchange: Option<String>,
    pub market: Option<String>,
}

fn normalize_upper(s: &str) -> String {
    s.trim().to_uppercase()
}

/// The data catalog. Cheap to clone: internally an `Arc<Mutex<Connection>>`,
/// matching the single-shared-state discipline of §5 (never held across I/O
/// other than the SQLite call itself).
#[derive(Clone)]
pub struct Manifest {
    conn: Arc<Mutex<Connection>>,
}

impl Manifest {
    /// Open (or create) the manifest database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS manifest (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange      TEXT NOT NULL,
                market        TEXT NOT NULL,
                symbol        TEXT NOT NULL,
                path          TEXT NOT NULL UNIQUE,
                type          TEXT NOT NULL,
                time_from     INTEGER,
                time_to       INTEGER,
                version       TEXT NOT NULL DEFAULT '1',
                checksum      TEXT,
                created_at    TEXT NOT NULL,
                metadata_json TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory manifest, handy for tests and one-shot tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Insert a new entry, or update the existing row if `path` already
    /// exists (§3.1 I1). Returns the row id either way.
    pub fn add_entry(&self, mut entry: NewEntry) -> Result<i64> {
        entry.exchange = normalize_upper(&entry.exchange);
        entry.market = normalize_upper(&entry.market);
        entry.symbol = normalize_upper(&entry.symbol);
        let version = entry.version.unwrap_or_else(|| "1".to_string());

        let conn = self.conn.lock().expect("manifest mutex poisoned");

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM manifest WHERE path = ?1",
                params![entry.path],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE manifest SET exchange=?1, market=?2, symbol=?3, type=?4,
                 time_from=?5, time_to=?6, version=?7, checksum=?8, metadata_json=?9
                 WHERE id=?10",
                params![
                    entry.exchange,
                    entry.market,
                    entry.symbol,
                    entry.data_type,
                    entry.time_from,
                    entry.time_to,
                    version,
                    entry.checksum,
                    entry.metadata_json,
                    id,
                ],
            )?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO manifest
                (exchange, market, symbol, path, type, time_from, time_to, version, checksum, created_at, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.exchange,
                entry.market,
                entry.symbol,
                entry.path,
                entry.data_type,
                entry.time_from,
                entry.time_to,
                version,
                entry.checksum,
                Utc::now().to_rfc3339(),
                entry.metadata_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List entries matching `filter`, in insertion (ascending id) order.
    pub fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<ManifestEntry>> {
        let conn = self.conn.lock().expect("manifest mutex poisoned");

        let mut sql = String::from(
            "SELECT id, exchange, market, symbol, path, type, time_from, time_to,
                    version, checksum, created_at, metadata_json
             FROM manifest WHERE 1=1",
        );
        let mut bound: Vec<String> = Vec::new();
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND symbol = ?");
            bound.push(normalize_upper(symbol));
        }
        if let Some(data_type) = &filter.data_type {
            sql.push_str(" AND type = ?");
            bound.push(data_type.clone());
        }
        if let Some(exchange) = &filter.exchange {
            sql.push_str(" AND exchange = ?");
            bound.push(normalize_upper(exchange));
        }
        if let Some(market) = &filter.market {
            sql.push_str(" AND market = ?");
            bound.push(normalize_upper(market));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Delete entries matching `symbol` (required) plus optional filters.
    /// Returns the file paths of the removed rows; does not touch disk.
    pub fn delete_entries(
        &self,
        symbol: &str,
        exchange: Option<&str>,
        market: Option<&str>,
        data_type: Option<&str>,
    ) -> Result<Vec<String>> {
        let filter = EntryFilter {
            symbol: Some(symbol.to_string()),
            data_type: data_type.map(str::to_string),
            exchange: exchange.map(str::to_string),
            market: market.map(str::to_string),
        };
        let victims = self.list_entries(&filter)?;
        if victims.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().expect("manifest mutex poisoned");
        let ids: Vec<i64> = victims.iter().map(|e| e.id).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM manifest WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
        conn.execute(&sql, params.as_slice())?;

        Ok(victims.into_iter().map(|e| e.path).collect())
    }

    /// Highest numeric `version` recorded for `(exchange, symbol, feature_set)`,
    /// or `0` if none. Non-numeric versions sort to `0` (§9 "Version comparison").
    pub fn get_latest_version(&self, exchange: &str, symbol: &str, feature_set: &str) -> Result<i64> {
        let filter = EntryFilter {
            symbol: Some(symbol.to_string()),
            data_type: Some(feature_set.to_string()),
            exchange: Some(exchange.to_string()),
            market: None,
        };
        let best = self
            .list_entries(&filter)?
            .into_iter()
            .filter_map(|e| e.version.parse::<i64>().ok())
            .max()
            .unwrap_or(0);
        Ok(best)
    }

    /// All distinct file paths currently recorded, for orphan/ghost audits.
    pub fn all_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("manifest mutex poisoned");
        let mut stmt = conn.prepare("SELECT path FROM manifest")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManifestEntry> {
    let created_raw: String = row.get(10)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(ManifestEntry {
        id: row.get(0)?,
        exchange: row.get(1)?,
        market: row.get(2)?,
        symbol: row.get(3)?,
        path: row.get(4)?,
        data_type: row.get(5)?,
        time_from: row.get(6)?,
        time_to: row.get(7)?,
        version: row.get(8)?,
        checksum: row.get(9)?,
        created_at,
        metadata_json: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> NewEntry {
        NewEntry {
            exchange: "binance".into(),
            market: "futures".into(),
            symbol: "btcusdt".into(),
            path: path.into(),
            data_type: "raw".into(),
            time_from: Some(1_000_000),
            time_to: Some(2_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn add_entry_normalizes_case_and_is_retrievable() {
        let m = Manifest::open_in_memory().unwrap();
        m.add_entry(entry("/data/test.parquet")).unwrap();

        let got = m
            .list_entries(&EntryFilter {
                exchange: Some("BINANCE".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].exchange, "BINANCE");
        assert_eq!(got[0].symbol, "BTCUSDT");
    }

    #[test]
    fn add_entry_upserts_on_duplicate_path() {
        let m = Manifest::open_in_memory().unwrap();
        let id1 = m.add_entry(entry("/data/test.parquet")).unwrap();

        let mut second = entry("/data/test.parquet");
        second.time_to = Some(3_000_000);
        let id2 = m.add_entry(second).unwrap();

        assert_eq!(id1, id2);
        let rows = m.list_entries(&EntryFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_to, Some(3_000_000));
    }

    #[test]
    fn list_entries_preserves_insertion_order() {
        let m = Manifest::open_in_memory().unwrap();
        let id1 = m.add_entry(entry("/data/a.parquet")).unwrap();
        let id2 = m.add_entry(entry("/data/b.parquet")).unwrap();

        let rows = m.list_entries(&EntryFilter::default()).unwrap();
        assert_eq!(rows[0].id, id1);
        assert_eq!(rows[1].id, id2);
    }

    #[test]
    fn delete_entries_returns_paths_without_touching_disk() {
        let m = Manifest::open_in_memory().unwrap();
        m.add_entry(entry("/data/test.parquet")).unwrap();

        let deleted = m.delete_entries("BTCUSDT", None, None, None).unwrap();
        assert_eq!(deleted, vec!["/data/test.parquet".to_string()]);
        assert!(m.list_entries(&EntryFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn get_latest_version_ignores_non_numeric_versions() {
        let m = Manifest::open_in_memory().unwrap();
        let mut e1 = entry("/data/talib/1/feat.parquet");
        e1.data_type = "talib".into();
        e1.version = Some("1".into());
        m.add_entry(e1).unwrap();

        let mut e2 = entry("/data/talib/bogus/feat.parquet");
        e2.data_type = "talib".into();
        e2.version = Some("not-a-number".into());
        m.add_entry(e2).unwrap();

        let v = m.get_latest_version("BINANCE", "BTCUSDT", "talib").unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn get_latest_version_with_no_entries_is_zero() {
        let m = Manifest::open_in_memory().unwrap();
        assert_eq!(m.get_latest_version("BINANCE", "ETH", "talib").unwrap(), 0);
    }
}
