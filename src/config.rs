use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "archive-ingest";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path segment marking the root of the artifact storage tree.
pub const DEFAULT_STORAGE_ANCHOR: &str = "storage";

/// Mid priority. Lower value = more urgent.
pub const DEFAULT_PRIORITY: i64 = 5;

pub fn default_log_filter() -> String {
    "archive_ingest=info".to_string()
}

/// Get the application data directory (platform data dir + app name).
/// Falls back to the working directory when the platform has none.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the archive database.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("archive.db")
}

/// Explicit configuration for one deployment host.
///
/// Built once by the entry point and passed down; nothing in the library
/// reads configuration from ambient state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Application root on this host. The storage tree lives under it.
    pub root_dir: PathBuf,
    /// Name of the storage directory under `root_dir`.
    pub storage_anchor: String,
    /// Records claimed per scheduler call.
    pub batch_size: usize,
    /// Failures at or beyond this attempt count become terminal.
    pub max_attempts: u32,
    /// Treat a missing source file as retryable (it may appear later).
    pub retry_missing_artifact: bool,
    /// In-flight claims older than this are released back to the queue.
    pub stale_claim_secs: u64,
    /// Sleep between background worker passes.
    pub poll_interval_secs: u64,
    /// Reject resolved artifacts that fall outside the storage root.
    pub confine_to_storage: bool,
    pub log_filter: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            root_dir: PathBuf::from("."),
            storage_anchor: DEFAULT_STORAGE_ANCHOR.to_string(),
            batch_size: 50,
            max_attempts: 5,
            retry_missing_artifact: true,
            stale_claim_secs: 3600,
            poll_interval_secs: 30,
            confine_to_storage: true,
            log_filter: default_log_filter(),
        }
    }
}

impl IngestConfig {
    pub fn stale_claim_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_claim_secs as i64)
    }
}
