//! Normalized record model shared by the reader, the cache, and aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Cache fingerprint of one metadata file. Any change to `size` or the
/// modification time yields a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified_secs: i64,
    pub modified_nanos: u32,
}

impl FileIdentity {
    pub fn from_metadata(path: &Path, meta: &Metadata) -> Self {
        let (modified_secs, modified_nanos) = match meta.modified() {
            Ok(modified) => match modified.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
                // pre-epoch mtimes show up on some restored backups
                Err(err) => {
                    let d = err.duration();
                    (-(d.as_secs() as i64), d.subsec_nanos())
                }
            },
            Err(_) => (0, 0),
        };
        Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified_secs,
            modified_nanos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Valid,
    /// Well-formed fields carrying implausible values.
    Malformed,
    /// Nothing was captured: no audio and no text.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub identity: FileIdentity,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub character_count: u64,
    pub estimated_word_count: u64,
    pub speaking_rate_wpm: f64,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub processing_time_ms: Option<f64>,
    pub status: RecordStatus,
}

impl NormalizedRecord {
    pub fn is_valid(&self) -> bool {
        self.status == RecordStatus::Valid
    }

    pub fn duration_minutes(&self) -> f64 {
        self.duration_seconds / 60.0
    }
}

/// Words per minute, `0` when there is no duration to divide by.
pub fn words_per_minute(words: u64, duration_seconds: f64) -> f64 {
    if duration_seconds <= 0.0 {
        return 0.0;
    }
    (words as f64) / (duration_seconds / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn words_per_minute_guards_zero_duration() {
        assert_eq!(words_per_minute(120, 0.0), 0.0);
        assert_eq!(words_per_minute(120, 60.0), 120.0);
        assert_eq!(words_per_minute(0, 30.0), 0.0);
    }

    #[test]
    fn identity_changes_with_size() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("meta.json");
        fs::write(&path, "{}").expect("write");
        let before = FileIdentity::from_metadata(&path, &fs::metadata(&path).expect("stat"));
        fs::write(&path, "{\"a\":1}").expect("rewrite");
        let after = FileIdentity::from_metadata(&path, &fs::metadata(&path).expect("stat"));
        assert_eq!(before.size, 2);
        assert_eq!(after.size, 7);
        assert_ne!(before, after);
        assert_eq!(before.path, after.path);
    }
}
