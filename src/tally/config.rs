use crate::tally::aggregate::{AggregationSettings, TypingModel};
use crate::tally::ingest::IngestSettings;
use crate::tally::paths;
use crate::tally::reader::ReaderSettings;
use crate::tally::scanner::{ProbePolicy, ScanSettings};
use anyhow::{Context, Result, anyhow};
use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

include!(concat!(env!("OUT_DIR"), "/voxtally_env_allowlist.rs"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Defaults to `~/Documents/superwhisper/recordings` when unset.
    pub recordings_root: Option<String>,
    pub metadata_file_name: String,
    pub max_depth: u64,
    pub placeholder_suffixes: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let defaults = ScanSettings::default();
        Self {
            recordings_root: None,
            metadata_file_name: defaults.metadata_file_name,
            max_depth: defaults.max_depth as u64,
            placeholder_suffixes: defaults.placeholder_suffixes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub attempts: u64,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub empty_file_is_pending: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 200,
            max_backoff_ms: 2_000,
            empty_file_is_pending: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub workers: u64,
    pub batch_size: u64,
    pub checkpoint_every: u64,
    /// Defaults to `<cache dir>/voxtally/records_cache.json` when unset.
    pub cache_file: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 256,
            checkpoint_every: 2_000,
            cache_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub timezone: String,
    pub week_start: String,
    pub recent_window_days: u64,
    pub average_chars_per_word: f64,
    pub max_plausible_wpm: f64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            week_start: "monday".to_string(),
            recent_window_days: 30,
            average_chars_per_word: 5.0,
            max_plausible_wpm: 1_000.0,
        }
    }
}

fn default_typing_speeds() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("casual".to_string(), 35.0),
        ("professional".to_string(), 60.0),
        ("fast".to_string(), 80.0),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    pub scan: ScanConfig,
    pub probe: ProbeConfig,
    pub ingest: IngestConfig,
    pub aggregate: AggregateConfig,
    pub typing_speeds: BTreeMap<String, f64>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            probe: ProbeConfig::default(),
            ingest: IngestConfig::default(),
            aggregate: AggregateConfig::default(),
            typing_speeds: default_typing_speeds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTallyConfig {
    scan: Option<ScanConfig>,
    probe: Option<ProbeConfig>,
    ingest: Option<IngestConfig>,
    aggregate: Option<AggregateConfig>,
    typing_speeds: Option<BTreeMap<String, f64>>,
}

impl TallyConfig {
    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            metadata_file_name: self.scan.metadata_file_name.clone(),
            max_depth: usize::try_from(self.scan.max_depth).unwrap_or(usize::MAX),
            placeholder_suffixes: self.scan.placeholder_suffixes.clone(),
        }
    }

    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            attempts: u32::try_from(self.probe.attempts).unwrap_or(u32::MAX),
            backoff_ms: self.probe.backoff_ms,
            max_backoff_ms: self.probe.max_backoff_ms,
            empty_file_is_pending: self.probe.empty_file_is_pending,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            workers: self.ingest.workers as usize,
            batch_size: self.ingest.batch_size as usize,
            checkpoint_every: self.ingest.checkpoint_every as usize,
            probe: self.probe_policy(),
        }
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            average_chars_per_word: self.aggregate.average_chars_per_word,
            max_plausible_wpm: self.aggregate.max_plausible_wpm,
        }
    }

    /// Typing models ordered slowest first.
    pub fn typing_models(&self) -> Vec<TypingModel> {
        let mut models: Vec<TypingModel> = self
            .typing_speeds
            .iter()
            .map(|(label, wpm)| TypingModel::new(label.clone(), *wpm))
            .collect();
        models.sort_by(|a, b| a.wpm.total_cmp(&b.wpm).then_with(|| a.label.cmp(&b.label)));
        models
    }

    pub fn timezone(&self) -> Result<Tz> {
        let raw = self.aggregate.timezone.trim();
        raw.parse::<Tz>()
            .map_err(|err| anyhow!("invalid aggregate timezone `{raw}`: {err}"))
    }

    pub fn week_start(&self) -> Result<Weekday> {
        let raw = self.aggregate.week_start.trim();
        raw.parse::<Weekday>()
            .map_err(|_| anyhow!("invalid aggregate week start `{raw}`: use a weekday name"))
    }

    pub fn aggregation_settings(&self) -> Result<AggregationSettings> {
        Ok(AggregationSettings {
            timezone: self.timezone()?,
            week_start: self.week_start()?,
            recent_window_days: u32::try_from(self.aggregate.recent_window_days)
                .context("recent window is too large")?,
            typing_models: self.typing_models(),
        })
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = parse_csv(&v);
            if out.is_empty() { fallback.to_vec() } else { out }
        }
        Err(_) => fallback.to_vec(),
    }
}

/// `casual=35,fast=80` style list. Malformed pairs fail the whole value.
pub fn parse_typing_speeds(raw: &str) -> Result<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for pair in parse_csv(raw) {
        let (label, wpm) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid typing speed `{pair}`: expected label=wpm"))?;
        let wpm = wpm
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid typing speed `{pair}`"))?;
        out.insert(label.trim().to_string(), wpm);
    }
    Ok(out)
}

pub fn validate(cfg: &TallyConfig) -> Result<()> {
    if cfg.scan.metadata_file_name.trim().is_empty() {
        return Err(anyhow!("invalid scan metadata file name: cannot be empty"));
    }
    if cfg.scan.max_depth == 0 {
        return Err(anyhow!("invalid scan max depth: must be >= 1"));
    }
    if cfg.ingest.workers == 0 {
        return Err(anyhow!("invalid ingest workers: must be >= 1"));
    }
    if cfg.ingest.batch_size == 0 {
        return Err(anyhow!("invalid ingest batch size: must be >= 1"));
    }
    if cfg.probe.max_backoff_ms < cfg.probe.backoff_ms {
        return Err(anyhow!(
            "invalid probe backoff: require backoff_ms <= max_backoff_ms"
        ));
    }
    if cfg.aggregate.recent_window_days == 0 {
        return Err(anyhow!("invalid recent window: must be >= 1 day"));
    }
    let avg = cfg.aggregate.average_chars_per_word;
    if !(avg.is_finite() && avg > 0.0) {
        return Err(anyhow!("invalid average chars per word: must be > 0"));
    }
    if !(cfg.aggregate.max_plausible_wpm > 0.0) {
        return Err(anyhow!("invalid max plausible wpm: must be > 0"));
    }
    if cfg.typing_speeds.is_empty() {
        return Err(anyhow!("invalid typing speeds: at least one model is required"));
    }
    for (label, wpm) in &cfg.typing_speeds {
        if label.trim().is_empty() {
            return Err(anyhow!("invalid typing speed label: cannot be empty"));
        }
        if !(wpm.is_finite() && *wpm > 0.0) {
            return Err(anyhow!("invalid typing speed `{label}`: wpm must be > 0"));
        }
    }
    cfg.timezone()?;
    cfg.week_start()?;
    Ok(())
}

pub fn merge_file_config(base: &mut TallyConfig, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: PartialTallyConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse voxtally config {}: {err}", path.display()))?;
    if let Some(scan) = parsed.scan {
        base.scan = scan;
    }
    if let Some(probe) = parsed.probe {
        base.probe = probe;
    }
    if let Some(ingest) = parsed.ingest {
        base.ingest = ingest;
    }
    if let Some(aggregate) = parsed.aggregate {
        base.aggregate = aggregate;
    }
    if let Some(typing_speeds) = parsed.typing_speeds {
        base.typing_speeds = typing_speeds;
    }
    Ok(())
}

pub fn apply_env_overrides(cfg: &mut TallyConfig) -> Result<()> {
    cfg.scan.recordings_root =
        env_or_optional_string("VOXTALLY_RECORDINGS_ROOT", cfg.scan.recordings_root.take());
    cfg.scan.metadata_file_name =
        env_or_string("VOXTALLY_METADATA_FILE_NAME", &cfg.scan.metadata_file_name);
    cfg.scan.max_depth = env_or_u64("VOXTALLY_MAX_DEPTH", cfg.scan.max_depth);
    cfg.scan.placeholder_suffixes =
        env_or_csv("VOXTALLY_PLACEHOLDER_SUFFIXES", &cfg.scan.placeholder_suffixes);

    cfg.probe.attempts = env_or_u64("VOXTALLY_PROBE_ATTEMPTS", cfg.probe.attempts);
    cfg.probe.backoff_ms = env_or_u64("VOXTALLY_PROBE_BACKOFF_MS", cfg.probe.backoff_ms);
    cfg.probe.max_backoff_ms =
        env_or_u64("VOXTALLY_PROBE_MAX_BACKOFF_MS", cfg.probe.max_backoff_ms);
    cfg.probe.empty_file_is_pending = env_or_bool(
        "VOXTALLY_EMPTY_FILE_IS_PENDING",
        cfg.probe.empty_file_is_pending,
    );

    cfg.ingest.workers = env_or_u64("VOXTALLY_WORKERS", cfg.ingest.workers);
    cfg.ingest.batch_size = env_or_u64("VOXTALLY_BATCH_SIZE", cfg.ingest.batch_size);
    cfg.ingest.checkpoint_every =
        env_or_u64("VOXTALLY_CHECKPOINT_EVERY", cfg.ingest.checkpoint_every);
    cfg.ingest.cache_file =
        env_or_optional_string("VOXTALLY_CACHE_FILE", cfg.ingest.cache_file.take());

    cfg.aggregate.timezone = env_or_string("VOXTALLY_TIMEZONE", &cfg.aggregate.timezone);
    cfg.aggregate.week_start = env_or_string("VOXTALLY_WEEK_START", &cfg.aggregate.week_start);
    cfg.aggregate.recent_window_days = env_or_u64(
        "VOXTALLY_RECENT_WINDOW_DAYS",
        cfg.aggregate.recent_window_days,
    );
    cfg.aggregate.average_chars_per_word = env_or_f64(
        "VOXTALLY_CHARS_PER_WORD",
        cfg.aggregate.average_chars_per_word,
    );
    cfg.aggregate.max_plausible_wpm =
        env_or_f64("VOXTALLY_MAX_PLAUSIBLE_WPM", cfg.aggregate.max_plausible_wpm);

    if let Ok(raw) = env::var("VOXTALLY_TYPING_SPEEDS")
        && !raw.trim().is_empty()
    {
        cfg.typing_speeds = parse_typing_speeds(&raw)?;
    }
    Ok(())
}

/// Defaults, then the TOML file, then `VOXTALLY_*` overrides. Callers that
/// layer CLI flags on top should call [`validate`] again afterwards.
pub fn load_config() -> Result<TallyConfig> {
    let mut cfg = TallyConfig::default();
    merge_file_config(&mut cfg, &paths::config_file()?)?;
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// `VOXTALLY_*` variables that are set but never read by this build.
pub fn unknown_env_keys() -> Vec<String> {
    let mut unknown: Vec<String> = env::vars_os()
        .filter_map(|(key, _)| key.into_string().ok())
        .filter(|key| key.starts_with("VOXTALLY_"))
        .filter(|key| !GENERATED_VOXTALLY_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect();
    unknown.sort();
    unknown
}
