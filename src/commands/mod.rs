pub mod cache_prune;
pub mod ingest;
pub mod report;
pub mod status;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use voxtally::tally::config::{self, TallyConfig};
use voxtally::tally::paths::{self, TallyPaths};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Command-line overrides layered over the loaded config.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub cache: Option<PathBuf>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
}

pub fn resolve_config(overrides: &Overrides) -> Result<(TallyConfig, TallyPaths)> {
    let mut cfg = config::load_config()?;
    if let Some(root) = &overrides.root {
        cfg.scan.recordings_root = Some(root.display().to_string());
    }
    if let Some(cache) = &overrides.cache {
        cfg.ingest.cache_file = Some(cache.display().to_string());
    }
    if let Some(workers) = overrides.workers {
        cfg.ingest.workers = workers as u64;
    }
    if let Some(batch_size) = overrides.batch_size {
        cfg.ingest.batch_size = batch_size as u64;
    }
    config::validate(&cfg)?;
    let paths = paths::resolve_paths(&cfg)?;
    Ok((cfg, paths))
}
