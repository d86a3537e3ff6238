use crate::tally::config::TallyConfig;
use anyhow::{Result, anyhow};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TallyPaths {
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub recordings_root: PathBuf,
    pub cache_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| anyhow!("HOME directory could not be resolved"))
}

pub fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

pub fn voxtally_home() -> Result<PathBuf> {
    Ok(env_or_default_path(
        "VOXTALLY_HOME",
        required_home_dir()?.join(".voxtally"),
    ))
}

pub fn config_file() -> Result<PathBuf> {
    let base = match dirs::config_dir() {
        Some(dir) => dir,
        None => required_home_dir()?.join(".config"),
    };
    Ok(env_or_default_path(
        "VOXTALLY_CONFIG_PATH",
        base.join("voxtally").join("voxtally.toml"),
    ))
}

pub fn default_recordings_root() -> Result<PathBuf> {
    Ok(required_home_dir()?
        .join("Documents")
        .join("superwhisper")
        .join("recordings"))
}

pub fn default_cache_file() -> Result<PathBuf> {
    let base = match dirs::cache_dir() {
        Some(dir) => dir,
        None => required_home_dir()?.join(".cache"),
    };
    Ok(base.join("voxtally").join("records_cache.json"))
}

/// Concrete locations for a loaded config, filling in platform defaults for
/// anything the config leaves unset.
pub fn resolve_paths(cfg: &TallyConfig) -> Result<TallyPaths> {
    let recordings_root = match cfg.scan.recordings_root.as_deref() {
        Some(raw) => expand_home(raw),
        None => default_recordings_root()?,
    };
    let cache_file = match cfg.ingest.cache_file.as_deref() {
        Some(raw) => expand_home(raw),
        None => default_cache_file()?,
    };
    Ok(TallyPaths {
        home: voxtally_home()?,
        config_file: config_file()?,
        recordings_root,
        cache_file,
    })
}
