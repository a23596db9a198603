//! Compression and pruning of aged raw logs.
//!
//! Raw files older than `compress_after_days` (in whole UTC days, judged by
//! the day key in the file name, not by wall-clock age) are compressed with
//! zstd; the raw original is deleted only after the compressed artifact is
//! written. Compressed files older than `keep_days` are deleted. An error on
//! one file never aborts the scan of the others.

use crate::config::{parse_day_key, Config};
use crate::errors::Result;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix appended to a raw file name once compressed.
pub const COMPRESSED_SUFFIX: &str = ".zst";

/// Compression level; the cheapest level is enough for line-oriented JSON.
const COMPRESS_LEVEL: i32 = 1;

pub struct RetentionManager {
    log_dir: PathBuf,
    raw_prefix: String,
    compress_after_days: i64,
    keep_days: i64,
}

/// What a single scan did, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub compressed: usize,
    pub deleted_raw: usize,
    pub deleted_compressed: usize,
    pub errors: usize,
}

impl RetentionReport {
    pub fn is_noop(&self) -> bool {
        *self == RetentionReport::default()
    }
}

impl RetentionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            raw_prefix: config.raw_prefix.clone(),
            compress_after_days: config.compress_after_days,
            keep_days: config.keep_days,
        }
    }

    /// Scan the log directory once, compressing and pruning by age.
    pub async fn run_once(&self, today: NaiveDate) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        let mut entries = tokio::fs::read_dir(&self.log_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if let Some(day) = self.raw_day_key(name) {
                let age = age_in_days(day, today);
                if age >= self.compress_after_days {
                    if let Err(e) = self.compress_and_remove(&entry.path(), &mut report).await {
                        warn!("retention failed for {}: {}", name, e);
                        report.errors += 1;
                    }
                }
            } else if let Some(day) = self.compressed_day_key(name) {
                let age = age_in_days(day, today);
                if age > self.keep_days {
                    match tokio::fs::remove_file(entry.path()).await {
                        Ok(()) => {
                            info!("deleted expired log {}", name);
                            report.deleted_compressed += 1;
                        }
                        Err(e) => {
                            warn!("failed to delete {}: {}", name, e);
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Day key of a raw log file name, if it matches `<prefix>YYYYMMDD.jsonl`.
    fn raw_day_key(&self, name: &str) -> Option<NaiveDate> {
        let rest = name.strip_prefix(self.raw_prefix.as_str())?;
        let key = rest.strip_suffix(".jsonl")?;
        parse_day_key(key)
    }

    /// Day key of a compressed file name (`<prefix>YYYYMMDD.jsonl.zst`).
    fn compressed_day_key(&self, name: &str) -> Option<NaiveDate> {
        let rest = name.strip_prefix(self.raw_prefix.as_str())?;
        let key = rest
            .strip_suffix(COMPRESSED_SUFFIX)
            .and_then(|k| k.strip_suffix(".jsonl"))?;
        parse_day_key(key)
    }

    /// Compress one raw file, then delete the original.
    ///
    /// An already-present compressed counterpart is kept as-is (the overlap
    /// converges by deleting the raw side), so re-running after a partial
    /// pass is safe.
    async fn compress_and_remove(
        &self,
        raw_path: &Path,
        report: &mut RetentionReport,
    ) -> Result<()> {
        let compressed_path = compressed_path_for(raw_path);

        if !tokio::fs::try_exists(&compressed_path).await.unwrap_or(false) {
            let raw = tokio::fs::read(raw_path).await?;
            let compressed = zstd::encode_all(raw.as_slice(), COMPRESS_LEVEL)?;
            tokio::fs::write(&compressed_path, &compressed).await?;
            debug!(
                "compressed {} ({} -> {} bytes)",
                raw_path.display(),
                raw.len(),
                compressed.len()
            );
            report.compressed += 1;
        }

        // the raw original goes only once the compressed artifact exists
        tokio::fs::remove_file(raw_path).await?;
        report.deleted_raw += 1;
        Ok(())
    }
}

fn compressed_path_for(raw_path: &Path) -> PathBuf {
    let mut name = raw_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(COMPRESSED_SUFFIX);
    raw_path.with_file_name(name)
}

/// Whole UTC days between a file's day key and the current UTC day.
///
/// Purely calendar arithmetic: a file becomes one day older exactly at each
/// UTC midnight, regardless of the time of day it was written.
pub fn age_in_days(file_day: NaiveDate, today: NaiveDate) -> i64 {
    (today - file_day).num_days()
}
