//! Runtime configuration: CLI flags layered over `.env` fallbacks, following
//! the teacher's `Option<T>`-field-plus-`apply_defaults` pattern.

use std::path::PathBuf;

/// Resolved configuration used by every component that needs to know
/// where the lake lives and how much to parallelize.
#[derive(Debug, Clone)]
pub struct LakeConfig {
    pub data_root: PathBuf,
    pub manifest_path: PathBuf,
    /// Total worker pool size for the orchestrator (§4.5, default 20).
    pub workers: usize,
    /// Per-exchange concurrency cap (§4.5, default 5).
    pub per_exchange_concurrency: usize,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            manifest_path: PathBuf::from("./data/manifest.db"),
            workers: 20,
            per_exchange_concurrency: 5,
        }
    }
}

/// Raw CLI-facing fields, all optional so callers can layer `.env` and
/// built-in defaults on top of whatever the user actually passed. Mirrors
/// the teacher's `OhlcArgs`/`StrategyArgs` shape in spirit.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Root directory for partitioned columnar files.
    #[arg(long, env = "DL_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Path to the manifest catalog database.
    #[arg(long, env = "DL_MANIFEST_PATH")]
    pub manifest_path: Option<PathBuf>,

    /// Total orchestrator worker pool size.
    #[arg(long, env = "DL_WORKERS")]
    pub workers: Option<usize>,

    /// Per-exchange concurrency cap.
    #[arg(long, env = "DL_PER_EXCHANGE_CONCURRENCY")]
    pub per_exchange_concurrency: Option<usize>,
}

/// Fill in unset fields of `args` with the built-in defaults, matching the
/// teacher's `apply_ohlc_defaults` style: explicit, no hidden magic.
pub fn apply_config_defaults(args: ConfigArgs) -> LakeConfig {
    let defaults = LakeConfig::default();
    let data_root = args.data_root.unwrap_or(defaults.data_root);
    let manifest_path = args.manifest_path.unwrap_or_else(|| data_root.join("manifest.db"));
    LakeConfig {
        data_root,
        manifest_path,
        workers: args.workers.unwrap_or(defaults.workers),
        per_exchange_concurrency: args
            .per_exchange_concurrency
            .unwrap_or(defaults.per_exchange_concurrency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_args_are_empty() {
        let cfg = apply_config_defaults(ConfigArgs::default());
        assert_eq!(cfg.workers, 20);
        assert_eq!(cfg.per_exchange_concurrency, 5);
        assert_eq!(cfg.manifest_path, PathBuf::from("./data/manifest.db"));
    }

    #[test]
    fn manifest_path_derives_from_custom_data_root() {
        let args = ConfigArgs {
            data_root: Some(PathBuf::from("/tmp/lake")),
            ..Default::default()
        };
        let cfg = apply_config_defaults(args);
        assert_eq!(cfg.manifest_path, PathBuf::from("/tmp/lake/manifest.db"));
    }
}
