use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failure to enumerate the recordings root. The only error that aborts a run.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("recordings root does not exist: {}", .root.display())]
    NotFound { root: PathBuf },
    #[error("recordings root is not a directory: {}", .root.display())]
    NotADirectory { root: PathBuf },
    #[error("recordings root is unreadable: {}: {source}", .root.display())]
    Unreadable {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a metadata file could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseFailure {
    #[error("invalid json: {detail}")]
    InvalidJson { detail: String },
    #[error("metadata is not a json object")]
    NotAnObject,
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("invalid field `{field}`: {detail}")]
    InvalidField { field: String, detail: String },
}

impl ParseFailure {
    pub fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }

    pub fn invalid(field: &str, detail: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store {} could not be loaded: {detail}", .path.display())]
    Load { path: PathBuf, detail: String },
    #[error("cache store {} could not be written: {source}", .path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache store {} could not be serialized: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache lock {} is held by another process", .path.display())]
    Locked { path: PathBuf },
    #[error(
        "cache store {} was built with different reader settings ({stored}; now {current})",
        .path.display()
    )]
    SettingsChanged {
        path: PathBuf,
        stored: String,
        current: String,
    },
}

/// Reason code attached to every candidate that did not yield a valid record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    ProbeTimeout,
    Inaccessible,
    ReadFailed,
    ParseFailure,
    Malformed,
    EmptyRecording,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProbeTimeout => "PROBE_TIMEOUT",
            Self::Inaccessible => "INACCESSIBLE",
            Self::ReadFailed => "READ_FAILED",
            Self::ParseFailure => "PARSE_FAILURE",
            Self::Malformed => "MALFORMED",
            Self::EmptyRecording => "EMPTY_RECORDING",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failure_codes_are_stable() {
        assert_eq!(ParseFailure::missing("datetime").code(), "missing_field");
        assert_eq!(
            ParseFailure::invalid("duration", "negative").to_string(),
            "invalid field `duration`: negative"
        );
    }

    #[test]
    fn parse_failure_survives_cache_serialization() {
        let failure = ParseFailure::invalid("datetime", "not a timestamp");
        let raw = serde_json::to_string(&failure).expect("encode");
        assert!(raw.contains("\"kind\":\"invalid_field\""));
        let back: ParseFailure = serde_json::from_str(&raw).expect("decode");
        assert_eq!(back, failure);
    }
}
