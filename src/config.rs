use std::path::PathBuf;

/// Runtime settings, read from `TABLEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// When set, bookings live in PostgreSQL instead of the embedded engine.
    pub database_url: Option<String>,
    pub pool_size: usize,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_url: None,
            pool_size: 16,
            metrics_port: None,
            compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("TABLEBOOK_{name}"));
        let defaults = Self::default();

        Self {
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            database_url: var("DATABASE_URL").filter(|url| !url.is_empty()),
            pool_size: var("POOL_SIZE")
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.pool_size),
            metrics_port: var("METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: var("COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tablebook.wal")
    }
}
