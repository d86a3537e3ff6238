//! Parallel ingestion: scan, resolve still-syncing files, reuse cached
//! results, and parse the rest in bounded batches on a rayon pool.

use crate::error::{ParseFailure, ScanError, SkipReason};
use crate::tally::cache::{CachedOutcome, FlushOutcome, RecordCache};
use crate::tally::reader::RecordMetadataReader;
use crate::tally::record::{FileIdentity, NormalizedRecord, RecordStatus};
use crate::tally::scanner::{ProbePolicy, ProbeState, SyncAwareFileScanner};
use crate::tally::util::{elapsed_ms, millis};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub workers: usize,
    pub batch_size: usize,
    /// Flush the cache after this many fresh parses. `0` disables checkpoints.
    pub checkpoint_every: usize,
    pub probe: ProbePolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 256,
            checkpoint_every: 2_000,
            probe: ProbePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub total_candidates: usize,
    pub cache_hits: usize,
    pub freshly_parsed: usize,
    pub cache_upserts: usize,
    pub cache_writes: usize,
    pub cache_flush_warnings: usize,
    pub skipped: Vec<SkippedFile>,
    pub skip_counts: BTreeMap<SkipReason, usize>,
    pub elapsed_ms: u64,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            status: RunStatus::Complete,
            total_candidates: 0,
            cache_hits: 0,
            freshly_parsed: 0,
            cache_upserts: 0,
            cache_writes: 0,
            cache_flush_warnings: 0,
            skipped: Vec::new(),
            skip_counts: BTreeMap::new(),
            elapsed_ms: 0,
        }
    }
}

impl RunReport {
    fn skip(&mut self, path: PathBuf, reason: SkipReason, detail: Option<String>) {
        debug!(path = %path.display(), reason = reason.as_str(), "candidate skipped");
        *self.skip_counts.entry(reason).or_default() += 1;
        self.skipped.push(SkippedFile {
            path,
            reason,
            detail,
        });
    }

    pub fn skipped_with(&self, reason: SkipReason) -> usize {
        self.skip_counts.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestProgress {
    pub batches_completed: usize,
    pub batches_total: usize,
    pub freshly_parsed: usize,
    pub cache_hits: usize,
}

/// Receives one notification after each parse batch.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &IngestProgress);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _progress: &IngestProgress) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn on_progress(&self, p: &IngestProgress) {
        debug!(
            batch = p.batches_completed,
            batches = p.batches_total,
            parsed = p.freshly_parsed,
            hits = p.cache_hits,
            "ingest batch complete"
        );
    }
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub records: Vec<NormalizedRecord>,
    pub report: RunReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingResolution {
    Ready,
    TimedOut { attempts: u32 },
    Inaccessible,
}

enum FreshResult {
    Parsed { record: NormalizedRecord, upserted: bool },
    Failed { path: PathBuf, failure: ParseFailure, upserted: bool },
    ReadFailed { path: PathBuf, detail: String },
}

pub struct IngestionEngine {
    settings: IngestSettings,
    reader: RecordMetadataReader,
    observer: Box<dyn ProgressObserver>,
}

fn build_pool(workers: usize) -> Option<rayon::ThreadPool> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "worker pool unavailable; ingesting sequentially");
            None
        }
    }
}

fn run_parallel<T, R, F>(pool: Option<&rayon::ThreadPool>, items: &[T], work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    match pool {
        Some(pool) => pool.install(|| items.par_iter().map(&work).collect()),
        None => items.iter().map(work).collect(),
    }
}

fn skip_reason_for(status: RecordStatus) -> Option<SkipReason> {
    match status {
        RecordStatus::Valid => None,
        RecordStatus::Malformed => Some(SkipReason::Malformed),
        RecordStatus::Skipped => Some(SkipReason::EmptyRecording),
    }
}

impl IngestionEngine {
    pub fn new(settings: IngestSettings, reader: RecordMetadataReader) -> Self {
        Self {
            settings,
            reader,
            observer: Box::new(NoProgress),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Run one ingestion pass. Only an unreadable root is an error; every
    /// other per-file problem lands in the report with a reason code.
    pub fn ingest(
        &self,
        scanner: &SyncAwareFileScanner,
        cache: &mut RecordCache,
        cancel: &CancelToken,
    ) -> Result<IngestOutcome, ScanError> {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut records = Vec::new();

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        for candidate in scanner.scan()? {
            report.total_candidates += 1;
            match candidate.state {
                ProbeState::Ready => ready.push(candidate.path),
                ProbeState::Pending => pending.push(candidate.path),
                ProbeState::Inaccessible => {
                    report.skip(candidate.path, SkipReason::Inaccessible, None);
                }
            }
        }

        let pool = build_pool(self.settings.workers);

        if !pending.is_empty() {
            debug!(count = pending.len(), "waiting on files still syncing");
            let policy = &self.settings.probe;
            let resolved = run_parallel(pool.as_ref(), &pending, |path| {
                resolve_pending(scanner, path, policy)
            });
            for (path, resolution) in pending.into_iter().zip(resolved) {
                match resolution {
                    PendingResolution::Ready => ready.push(path),
                    PendingResolution::TimedOut { attempts } => report.skip(
                        path,
                        SkipReason::ProbeTimeout,
                        Some(format!("still syncing after {attempts} probes")),
                    ),
                    PendingResolution::Inaccessible => {
                        report.skip(path, SkipReason::Inaccessible, None)
                    }
                }
            }
        }

        let mut misses: Vec<FileIdentity> = Vec::new();
        for path in ready {
            let identity = match scanner.identity(&path) {
                Ok(identity) => identity,
                Err(err) => {
                    report.skip(path, SkipReason::Inaccessible, Some(err.to_string()));
                    continue;
                }
            };
            match cache.lookup_outcome(&identity) {
                Some(CachedOutcome::Record(record)) => {
                    report.cache_hits += 1;
                    if let Some(reason) = skip_reason_for(record.status) {
                        report.skip(record.identity.path.clone(), reason, None);
                    }
                    records.push(record);
                }
                Some(CachedOutcome::Failed(failure)) => {
                    report.cache_hits += 1;
                    report.skip(
                        identity.path,
                        SkipReason::ParseFailure,
                        Some(failure.to_string()),
                    );
                }
                None => misses.push(identity),
            }
        }

        let batch_size = self.settings.batch_size.max(1);
        let batches_total = misses.len().div_ceil(batch_size);
        let mut since_checkpoint = 0usize;
        for (index, batch) in misses.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                info!(
                    completed = index,
                    remaining = batches_total - index,
                    "ingestion cancelled between batches"
                );
                report.status = RunStatus::Partial;
                break;
            }

            let shared: &RecordCache = cache;
            let results = run_parallel(pool.as_ref(), batch, |identity| {
                self.parse_one(identity, shared)
            });
            for result in results {
                match result {
                    FreshResult::Parsed { record, upserted } => {
                        report.freshly_parsed += 1;
                        report.cache_upserts += usize::from(upserted);
                        if let Some(reason) = skip_reason_for(record.status) {
                            report.skip(record.identity.path.clone(), reason, None);
                        }
                        records.push(record);
                    }
                    FreshResult::Failed {
                        path,
                        failure,
                        upserted,
                    } => {
                        report.freshly_parsed += 1;
                        report.cache_upserts += usize::from(upserted);
                        report.skip(path, SkipReason::ParseFailure, Some(failure.to_string()));
                    }
                    FreshResult::ReadFailed { path, detail } => {
                        report.skip(path, SkipReason::ReadFailed, Some(detail));
                    }
                }
            }
            since_checkpoint += batch.len();

            self.observer.on_progress(&IngestProgress {
                batches_completed: index + 1,
                batches_total,
                freshly_parsed: report.freshly_parsed,
                cache_hits: report.cache_hits,
            });

            let more = index + 1 < batches_total;
            if more
                && self.settings.checkpoint_every > 0
                && since_checkpoint >= self.settings.checkpoint_every
            {
                since_checkpoint = 0;
                flush_into_report(cache, &mut report, "checkpoint");
            }
        }

        flush_into_report(cache, &mut report, "final");

        records.sort_by(|a, b| a.identity.path.cmp(&b.identity.path));
        report.elapsed_ms = elapsed_ms(started);
        info!(
            status = report.status.as_str(),
            candidates = report.total_candidates,
            hits = report.cache_hits,
            parsed = report.freshly_parsed,
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "ingestion finished"
        );
        Ok(IngestOutcome { records, report })
    }

    fn parse_one(&self, identity: &FileIdentity, cache: &RecordCache) -> FreshResult {
        let raw = match fs::read(&identity.path) {
            Ok(raw) => raw,
            Err(err) => {
                return FreshResult::ReadFailed {
                    path: identity.path.clone(),
                    detail: err.to_string(),
                };
            }
        };
        match self.reader.parse(identity.clone(), &raw) {
            Ok(record) => {
                let upserted =
                    cache.upsert(identity.clone(), CachedOutcome::Record(record.clone()));
                FreshResult::Parsed { record, upserted }
            }
            Err(failure) => {
                let upserted =
                    cache.upsert(identity.clone(), CachedOutcome::Failed(failure.clone()));
                FreshResult::Failed {
                    path: identity.path.clone(),
                    failure,
                    upserted,
                }
            }
        }
    }
}

fn flush_into_report(cache: &mut RecordCache, report: &mut RunReport, stage: &str) {
    match cache.flush() {
        Ok(FlushOutcome::Written { entries }) => {
            report.cache_writes += 1;
            debug!(stage, entries, "record cache written");
        }
        Ok(FlushOutcome::Clean | FlushOutcome::InMemory) => {}
        Err(err) => {
            report.cache_flush_warnings += 1;
            warn!(stage, error = %err, "record cache flush failed; results kept in memory");
        }
    }
}

fn resolve_pending(
    scanner: &SyncAwareFileScanner,
    path: &Path,
    policy: &ProbePolicy,
) -> PendingResolution {
    for attempt in 1..=policy.attempts {
        thread::sleep(millis(policy.backoff_for(attempt)));
        match scanner.probe(path) {
            ProbeState::Ready => return PendingResolution::Ready,
            ProbeState::Inaccessible => return PendingResolution::Inaccessible,
            ProbeState::Pending => {}
        }
    }
    PendingResolution::TimedOut {
        attempts: policy.attempts,
    }
}
