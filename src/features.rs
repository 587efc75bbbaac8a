//! Minimal feature-set store (§6.3): register an externally computed
//! file under a versioned path and catalog it in the manifest. The HTTP
//! upload/download façade around this is out of scope; this is just the
//! storage primitive Testable Scenario E3 exercises directly.

use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::{LakeError, Result};
use crate::manifest::{Manifest, NewEntry};

pub struct FeatureStore {
    data_root: PathBuf,
    manifest: Manifest,
}

impl FeatureStore {
    pub fn new(data_root: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self {
            data_root: data_root.into(),
            manifest,
        }
    }

    /// `<data-root>/features/<feature_set>/<version>/<file>`.
    fn feature_path(&self, feature_set: &str, version: &str, file_name: &str) -> PathBuf {
        self.data_root
            .join("features")
            .join(feature_set)
            .join(version)
            .join(file_name)
    }

    /// Copy `source` into its versioned location, SHA-256 it, and upsert
    /// a manifest entry with `type = feature_set`.
    pub fn upload_feature(
        &self,
        source: &std::path::Path,
        exchange: &str,
        symbol: &str,
        feature_set: &str,
        version: &str,
    ) -> Result<PathBuf> {
        if !source.exists() {
            return Err(LakeError::MissingSource(source.to_path_buf()));
        }
        let file_name = source
            .file_name()
            .ok_or_else(|| LakeError::MissingSource(source.to_path_buf()))?;

        let dest = self.feature_path(feature_set, version, &file_name.to_string_lossy());
        fs::create_dir_all(dest.parent().expect("feature path always has a parent"))?;
        fs::copy(source, &dest)?;

        let checksum = sha256_hex(&dest)?;

        self.manifest.add_entry(NewEntry {
            exchange: exchange.to_string(),
            market: "FEATURE".to_string(),
            symbol: symbol.to_string(),
            path: dest.to_string_lossy().into_owned(),
            data_type: feature_set.to_string(),
            version: Some(version.to_string()),
            checksum: Some(checksum),
            ..Default::default()
        })?;

        Ok(dest)
    }
}

fn sha256_hex(path: &std::path::Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn upload_feature_versions_independently_e3() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::open_in_memory().unwrap();
        let store = FeatureStore::new(dir.path(), manifest.clone());

        let src_dir = TempDir::new().unwrap();
        let src_file = src_dir.path().join("feat.parquet");
        fs::write(&src_file, b"v1-bytes").unwrap();

        store
            .upload_feature(&src_file, "binance", "BTC", "talib", "1")
            .unwrap();

        fs::write(&src_file, b"v2-bytes-different").unwrap();
        store
            .upload_feature(&src_file, "binance", "BTC", "talib", "2")
            .unwrap();

        let latest = manifest.get_latest_version("BINANCE", "BTC", "talib").unwrap();
        assert_eq!(latest, 2);

        assert!(dir.path().join("features/talib/1/feat.parquet").exists());
        assert!(dir.path().join("features/talib/2/feat.parquet").exists());
    }

    #[test]
    fn upload_feature_missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::open_in_memory().unwrap();
        let store = FeatureStore::new(dir.path(), manifest);

        let err = store
            .upload_feature(std::path::Path::new("/does/not/exist.parquet"), "binance", "BTC", "talib", "1")
            .unwrap_err();
        assert!(matches!(err, LakeError::MissingSource(_)));
    }
}
