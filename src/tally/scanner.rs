//! Walks the recordings root and classifies each metadata file by how ready
//! it is to be read. Cloud-synced folders leave placeholders behind for files
//! that have not been downloaded yet; those surface as `Pending` instead of
//! being read as empty or corrupt recordings.

use crate::error::ScanError;
use crate::tally::record::FileIdentity;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, FilterEntry, WalkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Ready,
    Pending,
    Inaccessible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub state: ProbeState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    pub metadata_file_name: String,
    pub max_depth: usize,
    pub placeholder_suffixes: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            metadata_file_name: "meta.json".to_string(),
            max_depth: 2,
            placeholder_suffixes: vec![".icloud".to_string()],
        }
    }
}

/// How a "not yet synced" file is recognized and how long it is waited on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub empty_file_is_pending: bool,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 200,
            max_backoff_ms: 2_000,
            empty_file_is_pending: true,
        }
    }
}

impl ProbePolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms.max(self.backoff_ms))
    }
}

#[derive(Debug, Clone)]
pub struct SyncAwareFileScanner {
    root: PathBuf,
    settings: ScanSettings,
    policy: ProbePolicy,
}

type VisibleWalk = FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>;

/// One pass over the recordings root. Lazy; call [`SyncAwareFileScanner::scan`]
/// again to restart from the top.
pub struct Scan<'a> {
    scanner: &'a SyncAwareFileScanner,
    walker: VisibleWalk,
}

fn is_visible_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return true;
    }
    !entry.file_name().to_string_lossy().starts_with('.')
}

impl SyncAwareFileScanner {
    pub fn new(root: impl Into<PathBuf>, settings: ScanSettings, policy: ProbePolicy) -> Self {
        Self {
            root: root.into(),
            settings,
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &ProbePolicy {
        &self.policy
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn check_root(&self) -> Result<(), ScanError> {
        let root = self.root.clone();
        let meta = match fs::metadata(&self.root) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ScanError::NotFound { root });
            }
            Err(source) => return Err(ScanError::Unreadable { root, source }),
        };
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory { root });
        }
        fs::read_dir(&self.root).map_err(|source| ScanError::Unreadable { root, source })?;
        Ok(())
    }

    pub fn scan(&self) -> Result<Scan<'_>, ScanError> {
        self.check_root()?;
        let filter: fn(&DirEntry) -> bool = is_visible_dir;
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(self.settings.max_depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(filter);
        Ok(Scan {
            scanner: self,
            walker,
        })
    }

    /// Placeholder file that stands in for `path` while it is still syncing.
    pub fn placeholder_for(&self, path: &Path) -> Option<PathBuf> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_string_lossy();
        self.settings
            .placeholder_suffixes
            .iter()
            .map(|suffix| parent.join(format!(".{name}{suffix}")))
            .find(|candidate| candidate.exists())
    }

    /// Inverse of [`Self::placeholder_for`]: the file a placeholder will become.
    fn materialized_path(&self, placeholder: &Path) -> Option<PathBuf> {
        let name = placeholder.file_name()?.to_string_lossy();
        let hidden = name.strip_prefix('.')?;
        self.settings.placeholder_suffixes.iter().find_map(|suffix| {
            let stem = hidden.strip_suffix(suffix.as_str())?;
            (stem == self.settings.metadata_file_name).then(|| placeholder.with_file_name(stem))
        })
    }

    pub fn probe(&self, path: &Path) -> ProbeState {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if self.placeholder_for(path).is_some() {
                    return ProbeState::Pending;
                }
                return ProbeState::Inaccessible;
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "metadata probe failed");
                return ProbeState::Inaccessible;
            }
        };
        if !meta.is_file() {
            return ProbeState::Inaccessible;
        }
        if let Err(err) = File::open(path) {
            debug!(path = %path.display(), error = %err, "open probe failed");
            return match err.kind() {
                ErrorKind::PermissionDenied => ProbeState::Inaccessible,
                _ => ProbeState::Pending,
            };
        }
        if meta.len() == 0 && self.policy.empty_file_is_pending {
            return ProbeState::Pending;
        }
        ProbeState::Ready
    }

    pub fn identity(&self, path: &Path) -> std::io::Result<FileIdentity> {
        let meta = fs::metadata(path)?;
        Ok(FileIdentity::from_metadata(path, &meta))
    }
}

impl Iterator for Scan<'_> {
    type Item = ScanCandidate;

    fn next(&mut self) -> Option<ScanCandidate> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.scanner.root.clone());
                    warn!(path = %path.display(), error = %err, "directory walk failed");
                    return Some(ScanCandidate {
                        path,
                        state: ProbeState::Inaccessible,
                    });
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }

            let is_metadata =
                entry.file_name() == OsStr::new(&self.scanner.settings.metadata_file_name);
            if is_metadata {
                let path = entry.into_path();
                let state = self.scanner.probe(&path);
                return Some(ScanCandidate { path, state });
            }

            let Some(materialized) = self.scanner.materialized_path(entry.path()) else {
                continue;
            };
            // the real file, once present, is yielded on its own
            if materialized.exists() {
                continue;
            }
            return Some(ScanCandidate {
                path: materialized,
                state: ProbeState::Pending,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scanner(root: &Path) -> SyncAwareFileScanner {
        SyncAwareFileScanner::new(root, ScanSettings::default(), ProbePolicy::default())
    }

    fn write_recording(root: &Path, folder: &str, body: &str) -> PathBuf {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("meta.json");
        fs::write(&path, body).expect("write meta");
        path
    }

    #[test]
    fn classifies_ready_pending_and_placeholder_files() {
        let tmp = tempdir().expect("tempdir");
        let root = tmp.path();
        let ready = write_recording(root, "1700000001", "{\"ok\":true}");
        let empty = write_recording(root, "1700000002", "");
        let syncing = root.join("1700000003");
        fs::create_dir_all(&syncing).expect("mkdir");
        fs::write(syncing.join(".meta.json.icloud"), "bplist").expect("placeholder");
        fs::write(root.join("1700000001").join("output.wav"), "RIFF").expect("audio");

        let found: Vec<ScanCandidate> = scanner(root).scan().expect("scan").collect();
        assert_eq!(
            found,
            vec![
                ScanCandidate {
                    path: ready,
                    state: ProbeState::Ready
                },
                ScanCandidate {
                    path: empty,
                    state: ProbeState::Pending
                },
                ScanCandidate {
                    path: syncing.join("meta.json"),
                    state: ProbeState::Pending
                },
            ]
        );
    }

    #[test]
    fn empty_files_are_ready_when_heuristic_disabled() {
        let tmp = tempdir().expect("tempdir");
        let empty = write_recording(tmp.path(), "a", "");
        let policy = ProbePolicy {
            empty_file_is_pending: false,
            ..ProbePolicy::default()
        };
        let scanner = SyncAwareFileScanner::new(tmp.path(), ScanSettings::default(), policy);
        assert_eq!(scanner.probe(&empty), ProbeState::Ready);
    }

    #[test]
    fn vanished_file_without_placeholder_is_inaccessible() {
        let tmp = tempdir().expect("tempdir");
        let s = scanner(tmp.path());
        assert_eq!(
            s.probe(&tmp.path().join("gone").join("meta.json")),
            ProbeState::Inaccessible
        );
    }

    #[test]
    fn placeholder_is_not_reported_once_materialized() {
        let tmp = tempdir().expect("tempdir");
        let path = write_recording(tmp.path(), "a", "{}");
        fs::write(tmp.path().join("a").join(".meta.json.icloud"), "x").expect("placeholder");
        let found: Vec<ScanCandidate> = scanner(tmp.path()).scan().expect("scan").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, path);
    }

    #[test]
    fn hidden_directories_are_skipped_and_scan_restarts() {
        let tmp = tempdir().expect("tempdir");
        write_recording(tmp.path(), ".Trash", "{}");
        write_recording(tmp.path(), "visible", "{}");
        let s = scanner(tmp.path());
        assert_eq!(s.scan().expect("first").count(), 1);
        assert_eq!(s.scan().expect("second").count(), 1);
    }

    #[test]
    fn missing_or_file_root_is_a_scan_error() {
        let tmp = tempdir().expect("tempdir");
        let missing = scanner(&tmp.path().join("nope"));
        assert!(matches!(missing.scan().err(), Some(ScanError::NotFound { .. })));

        let file = tmp.path().join("file");
        fs::write(&file, "x").expect("write");
        assert!(matches!(
            scanner(&file).scan().err(),
            Some(ScanError::NotADirectory { .. })
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ProbePolicy {
            attempts: 5,
            backoff_ms: 100,
            max_backoff_ms: 350,
            empty_file_is_pending: true,
        };
        assert_eq!(policy.backoff_for(1), 100);
        assert_eq!(policy.backoff_for(2), 200);
        assert_eq!(policy.backoff_for(3), 350);
        assert_eq!(policy.backoff_for(9), 350);
    }
}
