use anyhow::{Context, Result};
use std::path::PathBuf;
use voxtally::tally::cache::{CacheLoadStatus, RecordCache};
use voxtally::tally::config::TallyConfig;
use voxtally::tally::ingest::{
    CancelToken, IngestOutcome, IngestProgress, IngestionEngine, ProgressObserver,
    TracingProgress,
};
use voxtally::tally::paths::TallyPaths;
use voxtally::tally::reader::RecordMetadataReader;
use voxtally::tally::scanner::SyncAwareFileScanner;
use voxtally::tally::util::truncate_with_ellipsis;
use voxtally::tally::warn::{self, WarnEvent};

use crate::cli::IngestArgs;
use crate::commands::{CommandReport, Overrides, resolve_config};

const MAX_DETAIL_CHARS: usize = 200;

/// Logs each batch and cancels the run once `limit` batches have completed.
struct BatchLimit {
    token: CancelToken,
    limit: Option<usize>,
}

impl ProgressObserver for BatchLimit {
    fn on_progress(&self, progress: &IngestProgress) {
        TracingProgress.on_progress(progress);
        if let Some(limit) = self.limit
            && progress.batches_completed >= limit
        {
            self.token.cancel();
        }
    }
}

pub struct IngestRun {
    pub outcome: IngestOutcome,
    pub cache_status: CacheLoadStatus,
    pub cache_path: Option<PathBuf>,
    pub cache_entries: usize,
}

pub fn overrides(args: &IngestArgs) -> Overrides {
    Overrides {
        root: args.root.clone(),
        cache: args.cache.clone(),
        workers: args.workers,
        batch_size: args.batch_size,
    }
}

fn cache_status_label(status: &CacheLoadStatus) -> &'static str {
    match status {
        CacheLoadStatus::Fresh => "fresh",
        CacheLoadStatus::Loaded { .. } => "loaded",
        CacheLoadStatus::Reset { .. } => "reset",
        CacheLoadStatus::InMemory => "in_memory",
    }
}

pub fn execute(cfg: &TallyConfig, paths: &TallyPaths, args: &IngestArgs) -> Result<IngestRun> {
    let scanner = SyncAwareFileScanner::new(
        &paths.recordings_root,
        cfg.scan_settings(),
        cfg.probe_policy(),
    );
    let token = CancelToken::new();
    let engine = IngestionEngine::new(
        cfg.ingest_settings(),
        RecordMetadataReader::new(cfg.reader_settings()),
    )
    .with_observer(Box::new(BatchLimit {
        token: token.clone(),
        limit: args.limit_batches,
    }));

    let (mut cache, cache_status) = if args.no_cache {
        (RecordCache::in_memory(), CacheLoadStatus::InMemory)
    } else {
        RecordCache::open(&paths.cache_file, &cfg.reader_settings())
    };
    if let CacheLoadStatus::Reset { reason } = &cache_status {
        warn::emit(WarnEvent {
            code: "CACHE_RESET",
            stage: "cache-load",
            path: &paths.cache_file.display().to_string(),
            reason: "store_discarded",
            err: reason,
        });
    }

    let outcome = engine
        .ingest(&scanner, &mut cache, &token)
        .with_context(|| format!("failed to ingest {}", paths.recordings_root.display()))?;

    if outcome.report.cache_flush_warnings > 0 {
        warn::emit(WarnEvent {
            code: "CACHE_FLUSH_FAILED",
            stage: "cache-flush",
            path: &paths.cache_file.display().to_string(),
            reason: "results_kept_in_memory",
            err: &format!("{} flush(es) failed", outcome.report.cache_flush_warnings),
        });
    }

    Ok(IngestRun {
        cache_entries: cache.len(),
        cache_path: cache.path().map(PathBuf::from),
        outcome,
        cache_status,
    })
}

/// Append the run report as `key=value` lines.
pub fn describe(run: &IngestRun, report: &mut CommandReport) {
    let r = &run.outcome.report;
    report.detail(format!("status={}", r.status.as_str()));
    match &run.cache_path {
        Some(path) => report.detail(format!("cache_file={}", path.display())),
        None => report.detail("cache_file=none"),
    }
    report.detail(format!("cache_load={}", cache_status_label(&run.cache_status)));
    report.detail(format!("cache_entries={}", run.cache_entries));
    report.detail(format!("total_candidates={}", r.total_candidates));
    report.detail(format!("cache_hits={}", r.cache_hits));
    report.detail(format!("freshly_parsed={}", r.freshly_parsed));
    report.detail(format!("cache_upserts={}", r.cache_upserts));
    report.detail(format!("cache_writes={}", r.cache_writes));
    report.detail(format!("cache_flush_warnings={}", r.cache_flush_warnings));
    report.detail(format!("records={}", run.outcome.records.len()));
    report.detail(format!("skipped={}", r.skipped.len()));
    for (reason, count) in &r.skip_counts {
        report.detail(format!("skipped.{reason}={count}"));
    }
    for skip in &r.skipped {
        match &skip.detail {
            Some(detail) => report.detail(format!(
                "skip reason={} path={} detail={}",
                skip.reason,
                skip.path.display(),
                truncate_with_ellipsis(detail, MAX_DETAIL_CHARS)
            )),
            None => report.detail(format!(
                "skip reason={} path={}",
                skip.reason,
                skip.path.display()
            )),
        }
    }
    report.detail(format!("elapsed_ms={}", r.elapsed_ms));
}

pub fn run(args: &IngestArgs) -> Result<CommandReport> {
    let (cfg, paths) = resolve_config(&overrides(args))?;
    let mut report = CommandReport::new("ingest");
    report.detail(format!("recordings_root={}", paths.recordings_root.display()));

    let run = execute(&cfg, &paths, args)?;
    describe(&run, &mut report);
    report.data = Some(serde_json::to_value(&run.outcome.report)?);
    Ok(report)
}
