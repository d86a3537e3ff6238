use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use voxtally::tally::cache::{CacheLoadStatus, FlushOutcome, RecordCache};
use voxtally::tally::scanner::SyncAwareFileScanner;

use crate::cli::CachePruneArgs;
use crate::commands::{CommandReport, Overrides, resolve_config};

pub fn run(args: &CachePruneArgs) -> Result<CommandReport> {
    let (cfg, paths) = resolve_config(&Overrides {
        root: args.root.clone(),
        cache: args.cache.clone(),
        ..Overrides::default()
    })?;
    let mut report = CommandReport::new("cache-prune");
    report.detail(format!("recordings_root={}", paths.recordings_root.display()));
    report.detail(format!("cache_file={}", paths.cache_file.display()));

    let (mut cache, status) = RecordCache::open(&paths.cache_file, &cfg.reader_settings());
    match &status {
        CacheLoadStatus::Fresh => {
            report.detail("cache store absent; nothing to prune");
            return Ok(report);
        }
        CacheLoadStatus::Reset { reason } => {
            report.issue(format!("cache store discarded: {reason}"));
            return Ok(report);
        }
        CacheLoadStatus::Loaded { .. } | CacheLoadStatus::InMemory => {}
    }

    // every candidate counts as present, including files still syncing
    let scanner = SyncAwareFileScanner::new(
        &paths.recordings_root,
        cfg.scan_settings(),
        cfg.probe_policy(),
    );
    let present: BTreeSet<PathBuf> = scanner
        .scan()
        .with_context(|| format!("failed to scan {}", paths.recordings_root.display()))?
        .map(|candidate| candidate.path)
        .collect();

    let before = cache.len();
    let removed = cache.retain_paths(&present);
    report.detail(format!("entries_before={before}"));
    report.detail(format!("removed={removed}"));
    report.detail(format!("entries_after={}", cache.len()));

    if args.dry_run {
        report.detail("dry-run: cache store left unchanged");
        return Ok(report);
    }
    match cache.flush() {
        Ok(FlushOutcome::Written { entries }) => {
            report.detail(format!("cache rewritten with {entries} entries"))
        }
        Ok(FlushOutcome::Clean | FlushOutcome::InMemory) => {
            report.detail("cache unchanged")
        }
        Err(err) => report.issue(format!("cache flush failed: {err}")),
    }
    Ok(report)
}
