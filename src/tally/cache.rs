//! Durable fingerprint → parsed-record store.
//!
//! The whole map lives in memory and is written back as one JSON document on
//! [`RecordCache::flush`]. A store that cannot be loaded is treated as empty:
//! the cache only saves work, it never decides what the statistics say.

use crate::error::{CacheError, ParseFailure};
use crate::tally::reader::ReaderSettings;
use crate::tally::record::{FileIdentity, NormalizedRecord};
use crate::tally::util::now_utc;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum CachedOutcome {
    Record(NormalizedRecord),
    Failed(ParseFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: FileIdentity,
    pub outcome: CachedOutcome,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    schema_version: u32,
    /// [`ReaderSettings::fingerprint`] the entries were derived under.
    #[serde(default)]
    reader_settings: String,
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLoadStatus {
    /// No store on disk yet.
    Fresh,
    Loaded { entries: usize },
    /// The store was unreadable and has been replaced by an empty cache.
    Reset { reason: String },
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Clean,
    Written { entries: usize },
    InMemory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub records: usize,
    pub failures: usize,
    pub upserts_since_flush: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<PathBuf, CacheEntry>,
    dirty: bool,
    upserts_since_flush: usize,
}

#[derive(Debug)]
pub struct RecordCache {
    path: Option<PathBuf>,
    reader_settings: String,
    state: Mutex<CacheState>,
}

fn lock_path(store: &Path) -> PathBuf {
    let mut name = store
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store.with_file_name(name)
}

fn read_document(
    path: &Path,
    reader_settings: &str,
) -> Result<Option<CacheDocument>, CacheError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(CacheError::Load {
                path: path.to_path_buf(),
                detail: err.to_string(),
            });
        }
    };
    let doc: CacheDocument = serde_json::from_slice(&raw).map_err(|err| CacheError::Load {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    if doc.schema_version != CACHE_SCHEMA_VERSION {
        return Err(CacheError::Load {
            path: path.to_path_buf(),
            detail: format!(
                "unsupported schema version {} (expected {CACHE_SCHEMA_VERSION})",
                doc.schema_version
            ),
        });
    }
    if doc.reader_settings != reader_settings {
        return Err(CacheError::SettingsChanged {
            path: path.to_path_buf(),
            stored: doc.reader_settings,
            current: reader_settings.to_string(),
        });
    }
    Ok(Some(doc))
}

impl RecordCache {
    /// Load the store at `path`, degrading to an empty cache on any load error
    /// or when its records were derived under other `reader` settings.
    pub fn open(path: impl Into<PathBuf>, reader: &ReaderSettings) -> (Self, CacheLoadStatus) {
        let path = path.into();
        let reader_settings = reader.fingerprint();
        let (entries, status) = match read_document(&path, &reader_settings) {
            Ok(None) => (BTreeMap::new(), CacheLoadStatus::Fresh),
            Ok(Some(doc)) => {
                let entries = doc
                    .entries
                    .into_iter()
                    .map(|entry| (entry.identity.path.clone(), entry))
                    .collect::<BTreeMap<_, _>>();
                let count = entries.len();
                (entries, CacheLoadStatus::Loaded { entries: count })
            }
            Err(err) => {
                warn!(error = %err, "record cache unreadable; starting from an empty cache");
                (
                    BTreeMap::new(),
                    CacheLoadStatus::Reset {
                        reason: err.to_string(),
                    },
                )
            }
        };
        let cache = Self {
            path: Some(path),
            reader_settings,
            state: Mutex::new(CacheState {
                entries,
                dirty: false,
                upserts_since_flush: 0,
            }),
        };
        (cache, status)
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            reader_settings: String::new(),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cached record for an exact fingerprint match. Cached parse failures read as absent.
    pub fn lookup(&self, identity: &FileIdentity) -> Option<NormalizedRecord> {
        match self.lookup_outcome(identity)? {
            CachedOutcome::Record(record) => Some(record),
            CachedOutcome::Failed(_) => None,
        }
    }

    pub fn lookup_outcome(&self, identity: &FileIdentity) -> Option<CachedOutcome> {
        let state = self.state.lock();
        let entry = state.entries.get(&identity.path)?;
        (entry.identity == *identity).then(|| entry.outcome.clone())
    }

    /// Insert or supersede the entry for `identity.path`. Returns whether the
    /// cache changed; re-storing an identical entry is a no-op.
    pub fn upsert(&self, identity: FileIdentity, outcome: CachedOutcome) -> bool {
        let key = identity.path.clone();
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&key)
            && existing.identity == identity
            && existing.outcome == outcome
        {
            return false;
        }
        state.entries.insert(
            key,
            CacheEntry {
                identity,
                outcome,
                cached_at: now_utc(),
            },
        );
        state.dirty = true;
        state.upserts_since_flush += 1;
        true
    }

    pub fn remove(&mut self, path: &Path) -> bool {
        let state = self.state.get_mut();
        let removed = state.entries.remove(path).is_some();
        state.dirty |= removed;
        removed
    }

    /// Drop every entry whose path is not in `keep`. Maintenance only.
    pub fn retain_paths(&mut self, keep: &BTreeSet<PathBuf>) -> usize {
        let state = self.state.get_mut();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| keep.contains(&entry.identity.path));
        let removed = before.saturating_sub(state.entries.len());
        state.dirty |= removed > 0;
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let records = state
            .entries
            .values()
            .filter(|e| matches!(e.outcome, CachedOutcome::Record(_)))
            .count();
        CacheStats {
            entries: state.entries.len(),
            records,
            failures: state.entries.len() - records,
            upserts_since_flush: state.upserts_since_flush,
        }
    }

    /// Persist the full map. Requires `&mut self`, so it cannot overlap an
    /// ingestion pass that holds the cache by shared reference.
    pub fn flush(&mut self) -> Result<FlushOutcome, CacheError> {
        let Some(path) = self.path.clone() else {
            return Ok(FlushOutcome::InMemory);
        };
        let state = self.state.get_mut();
        if !state.dirty {
            return Ok(FlushOutcome::Clean);
        }

        let doc = CacheDocument {
            schema_version: CACHE_SCHEMA_VERSION,
            reader_settings: self.reader_settings.clone(),
            entries: state.entries.values().cloned().collect(),
        };
        let data = serde_json::to_vec(&doc).map_err(|source| CacheError::Encode {
            path: path.clone(),
            source,
        })?;
        write_atomically(&path, &data)?;

        state.dirty = false;
        state.upserts_since_flush = 0;
        debug!(path = %path.display(), entries = doc.entries.len(), "record cache flushed");
        Ok(FlushOutcome::Written {
            entries: doc.entries.len(),
        })
    }
}

/// Replace `path` with `data` via a sibling temp file and rename, holding an
/// exclusive lock so two processes never interleave their writes.
fn write_atomically(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let flush_err = |source: std::io::Error| CacheError::Flush {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(flush_err)?;

    let lock_file = lock_path(path);
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_file)
        .map_err(flush_err)?;
    if lock.try_lock_exclusive().is_err() {
        return Err(CacheError::Locked { path: lock_file });
    }

    let result = replace_file(&parent, path, data);
    let _ = FileExt::unlock(&lock);
    result.map_err(flush_err)
}

fn replace_file(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
