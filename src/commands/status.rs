use anyhow::Result;
use voxtally::tally::cache::{CacheLoadStatus, RecordCache};
use voxtally::tally::config;
use voxtally::tally::warn::{self, WarnEvent};

use crate::commands::{CommandReport, Overrides, resolve_config};

pub fn run() -> Result<CommandReport> {
    let (cfg, paths) = resolve_config(&Overrides::default())?;
    let mut report = CommandReport::new("status");

    report.detail(format!("version={}", env!("CARGO_PKG_VERSION")));
    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("voxtally_home={}", paths.home.display()));
    report.detail(format!("config_file={}", paths.config_file.display()));
    report.detail(format!("config_file_present={}", paths.config_file.is_file()));
    report.detail(format!("recordings_root={}", paths.recordings_root.display()));
    report.detail(format!("cache_file={}", paths.cache_file.display()));
    report.detail(format!("workers={}", cfg.ingest.workers));
    report.detail(format!("batch_size={}", cfg.ingest.batch_size));
    report.detail(format!("checkpoint_every={}", cfg.ingest.checkpoint_every));
    report.detail(format!(
        "probe_attempts={} probe_backoff_ms={} probe_max_backoff_ms={}",
        cfg.probe.attempts, cfg.probe.backoff_ms, cfg.probe.max_backoff_ms
    ));
    report.detail(format!("timezone={}", cfg.aggregate.timezone));
    report.detail(format!("week_start={}", cfg.aggregate.week_start));
    report.detail(format!(
        "recent_window_days={}",
        cfg.aggregate.recent_window_days
    ));
    for model in cfg.typing_models() {
        report.detail(format!("typing_speed.{}={}", model.label, model.wpm));
    }

    let (cache, status) = RecordCache::open(&paths.cache_file, &cfg.reader_settings());
    match status {
        CacheLoadStatus::Fresh => report.detail("cache_state=absent"),
        CacheLoadStatus::Loaded { .. } | CacheLoadStatus::InMemory => {
            let stats = cache.stats();
            report.detail(format!(
                "cache_state=loaded cache_entries={} cache_records={} cache_failures={}",
                stats.entries, stats.records, stats.failures
            ));
        }
        CacheLoadStatus::Reset { reason } => {
            report.detail(format!("cache_state=discarded reason={reason}"))
        }
    }

    for key in config::unknown_env_keys() {
        warn::emit(WarnEvent {
            code: "UNKNOWN_ENV_KEY",
            stage: "status",
            path: "na",
            reason: "not_read_by_this_build",
            err: &key,
        });
        report.detail(format!("unknown_env_key={key}"));
    }

    if !paths.recordings_root.is_dir() {
        report.issue(format!(
            "recordings root missing: {}",
            paths.recordings_root.display()
        ));
    }

    Ok(report)
}
