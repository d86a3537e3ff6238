//! Parses one raw `meta.json` into a [`NormalizedRecord`].
//!
//! Parsing is pure: the same bytes and identity always produce the same
//! record, with no clock or environment reads.

use crate::error::ParseFailure;
use crate::tally::record::{FileIdentity, NormalizedRecord, RecordStatus, words_per_minute};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

const FIELD_TIMESTAMP: &str = "datetime";
const FIELD_DURATION_MS: &str = "duration";
const FIELD_TEXT: &str = "result";
const FIELD_WORD_COUNT: &str = "wordCount";
const FIELD_MODEL: &str = "modelName";
const FIELD_APP_VERSION: &str = "appVersion";
const FIELD_PROCESSING_MS: &str = "processingTime";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaderSettings {
    pub average_chars_per_word: f64,
    pub max_plausible_wpm: f64,
}

impl ReaderSettings {
    /// Stable text form of every setting that feeds a derived record field.
    /// Cached records are only reusable under an equal fingerprint.
    pub fn fingerprint(&self) -> String {
        format!(
            "chars_per_word={};max_plausible_wpm={}",
            self.average_chars_per_word, self.max_plausible_wpm
        )
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            average_chars_per_word: 5.0,
            max_plausible_wpm: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordMetadataReader {
    settings: ReaderSettings,
}

impl RecordMetadataReader {
    pub fn new(settings: ReaderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> ReaderSettings {
        self.settings
    }

    pub fn parse(
        &self,
        identity: FileIdentity,
        raw: &[u8],
    ) -> Result<NormalizedRecord, ParseFailure> {
        let value: Value = serde_json::from_slice(raw).map_err(|err| ParseFailure::InvalidJson {
            detail: err.to_string(),
        })?;
        let Value::Object(entry) = value else {
            return Err(ParseFailure::NotAnObject);
        };

        let timestamp = required_timestamp(&entry)?;
        let duration_ms = required_non_negative(&entry, FIELD_DURATION_MS)?;
        let text = match entry.get(FIELD_TEXT) {
            None | Some(Value::Null) => return Err(ParseFailure::missing(FIELD_TEXT)),
            Some(Value::String(s)) => s,
            Some(_) => return Err(ParseFailure::invalid(FIELD_TEXT, "expected a string")),
        };

        let character_count = text.chars().count() as u64;
        let estimated_word_count = match explicit_word_count(&entry)? {
            Some(words) => words,
            None => self.estimate_words(character_count),
        };
        let duration_seconds = duration_ms / 1000.0;
        let speaking_rate_wpm = words_per_minute(estimated_word_count, duration_seconds);

        let status = self.classify(duration_seconds, character_count, speaking_rate_wpm);

        Ok(NormalizedRecord {
            identity,
            timestamp,
            duration_seconds,
            character_count,
            estimated_word_count,
            speaking_rate_wpm,
            model_name: optional_string(&entry, FIELD_MODEL),
            app_version: optional_string(&entry, FIELD_APP_VERSION),
            processing_time_ms: entry
                .get(FIELD_PROCESSING_MS)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite()),
            status,
        })
    }

    /// `floor(chars / avg)`, with any non-empty text counting as at least one word.
    pub fn estimate_words(&self, character_count: u64) -> u64 {
        if character_count == 0 {
            return 0;
        }
        let avg = self.settings.average_chars_per_word;
        if !(avg > 0.0) {
            return character_count;
        }
        ((character_count as f64 / avg).floor() as u64).max(1)
    }

    fn classify(&self, duration_seconds: f64, character_count: u64, wpm: f64) -> RecordStatus {
        if duration_seconds == 0.0 && character_count == 0 {
            return RecordStatus::Skipped;
        }
        if duration_seconds == 0.0 || wpm > self.settings.max_plausible_wpm {
            return RecordStatus::Malformed;
        }
        RecordStatus::Valid
    }
}

fn required_timestamp(entry: &Map<String, Value>) -> Result<DateTime<Utc>, ParseFailure> {
    let raw = match entry.get(FIELD_TIMESTAMP) {
        None | Some(Value::Null) => return Err(ParseFailure::missing(FIELD_TIMESTAMP)),
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(ParseFailure::invalid(FIELD_TIMESTAMP, "expected a string")),
    };
    if raw.is_empty() {
        return Err(ParseFailure::missing(FIELD_TIMESTAMP));
    }
    parse_timestamp(raw).ok_or_else(|| {
        ParseFailure::invalid(FIELD_TIMESTAMP, format!("unrecognized timestamp {raw:?}"))
    })
}

/// RFC 3339 with `Z` or an offset; offset-less ISO-8601 is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn required_non_negative(entry: &Map<String, Value>, field: &str) -> Result<f64, ParseFailure> {
    let value = match entry.get(field) {
        None | Some(Value::Null) => return Err(ParseFailure::missing(field)),
        Some(v) => v,
    };
    let Some(number) = value.as_f64() else {
        return Err(ParseFailure::invalid(field, "expected a number"));
    };
    if !number.is_finite() || number < 0.0 {
        return Err(ParseFailure::invalid(
            field,
            format!("expected a finite non-negative number, got {number}"),
        ));
    }
    Ok(number)
}

fn explicit_word_count(entry: &Map<String, Value>) -> Result<Option<u64>, ParseFailure> {
    match entry.get(FIELD_WORD_COUNT) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| {
                ParseFailure::invalid(FIELD_WORD_COUNT, "expected a non-negative integer")
            }),
    }
}

fn optional_string(entry: &Map<String, Value>, field: &str) -> Option<String> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn identity() -> FileIdentity {
        FileIdentity {
            path: PathBuf::from("/recordings/1700000000/meta.json"),
            size: 128,
            modified_secs: 1_700_000_000,
            modified_nanos: 0,
        }
    }

    fn reader() -> RecordMetadataReader {
        RecordMetadataReader::new(ReaderSettings::default())
    }

    #[test]
    fn parses_a_typical_recording() {
        let raw = br#"{
            "datetime": "2025-03-14T09:30:00Z",
            "duration": 60000,
            "result": "hello world, this is a short dictated note",
            "modelName": "Ultra",
            "appVersion": "1.44.0",
            "processingTime": 812
        }"#;
        let record = reader().parse(identity(), raw).expect("parse");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap()
        );
        assert_eq!(record.duration_seconds, 60.0);
        assert_eq!(record.character_count, 42);
        assert_eq!(record.estimated_word_count, 8);
        assert_eq!(record.speaking_rate_wpm, 8.0);
        assert_eq!(record.model_name.as_deref(), Some("Ultra"));
        assert_eq!(record.processing_time_ms, Some(812.0));
        assert_eq!(record.status, RecordStatus::Valid);
    }

    #[test]
    fn explicit_word_count_overrides_estimate() {
        let raw = br#"{"datetime":"2025-03-14T09:30:00Z","duration":120000,"result":"abc","wordCount":250}"#;
        let record = reader().parse(identity(), raw).expect("parse");
        assert_eq!(record.estimated_word_count, 250);
        assert_eq!(record.speaking_rate_wpm, 125.0);
    }

    #[test]
    fn offsets_and_naive_timestamps_normalize_to_utc() {
        let with_offset = br#"{"datetime":"2025-03-14T18:30:00+09:00","duration":1000,"result":"hi"}"#;
        let naive = br#"{"datetime":"2025-03-14T09:30:00.250","duration":1000,"result":"hi"}"#;
        let a = reader().parse(identity(), with_offset).expect("offset");
        let b = reader().parse(identity(), naive).expect("naive");
        assert_eq!(a.timestamp, Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap());
        assert_eq!(b.timestamp.timestamp(), a.timestamp.timestamp());
    }

    #[test]
    fn missing_required_fields_fail_instead_of_defaulting() {
        let cases = [
            (r#"{"duration":1000,"result":"x"}"#, "datetime"),
            (r#"{"datetime":"2025-03-14T09:30:00Z","result":"x"}"#, "duration"),
            (r#"{"datetime":"2025-03-14T09:30:00Z","duration":1000}"#, "result"),
            (r#"{"datetime":"","duration":1000,"result":"x"}"#, "datetime"),
        ];
        for (raw, field) in cases {
            let err = reader()
                .parse(identity(), raw.as_bytes())
                .expect_err("should fail");
            assert_eq!(err, ParseFailure::missing(field), "case {field}");
        }
    }

    #[test]
    fn wrongly_typed_fields_are_invalid() {
        let err = reader()
            .parse(
                identity(),
                br#"{"datetime":"yesterday","duration":1000,"result":"x"}"#,
            )
            .expect_err("bad timestamp");
        assert_eq!(err.code(), "invalid_field");

        let err = reader()
            .parse(
                identity(),
                br#"{"datetime":"2025-03-14T09:30:00Z","duration":-5,"result":"x"}"#,
            )
            .expect_err("negative duration");
        assert!(matches!(err, ParseFailure::InvalidField { ref field, .. } if field == "duration"));

        let err = reader()
            .parse(
                identity(),
                br#"{"datetime":"2025-03-14T09:30:00Z","duration":"long","result":"x"}"#,
            )
            .expect_err("string duration");
        assert_eq!(err.code(), "invalid_field");
    }

    #[test]
    fn truncated_bytes_are_invalid_json() {
        let err = reader()
            .parse(identity(), br#"{"datetime":"2025-03-14T09:30"#)
            .expect_err("truncated");
        assert_eq!(err.code(), "invalid_json");
        let err = reader().parse(identity(), b"[1,2,3]").expect_err("array");
        assert_eq!(err, ParseFailure::NotAnObject);
    }

    #[test]
    fn classifies_empty_and_implausible_recordings() {
        let empty = reader()
            .parse(
                identity(),
                br#"{"datetime":"2025-03-14T09:30:00Z","duration":0,"result":""}"#,
            )
            .expect("parse");
        assert_eq!(empty.status, RecordStatus::Skipped);
        assert_eq!(empty.speaking_rate_wpm, 0.0);

        let zero_duration = reader()
            .parse(
                identity(),
                br#"{"datetime":"2025-03-14T09:30:00Z","duration":0,"result":"some words here"}"#,
            )
            .expect("parse");
        assert_eq!(zero_duration.status, RecordStatus::Malformed);

        let too_fast = reader()
            .parse(
                identity(),
                br#"{"datetime":"2025-03-14T09:30:00Z","duration":1000,"result":"x","wordCount":5000}"#,
            )
            .expect("parse");
        assert_eq!(too_fast.status, RecordStatus::Malformed);
    }

    #[test]
    fn word_estimate_floors_and_keeps_one_word_minimum() {
        let r = reader();
        assert_eq!(r.estimate_words(0), 0);
        assert_eq!(r.estimate_words(3), 1);
        assert_eq!(r.estimate_words(14), 2);
        assert_eq!(r.estimate_words(500), 100);
    }

    #[test]
    fn parse_is_deterministic() {
        let raw = r#"{"datetime":"2025-03-14T09:30:00Z","duration":45500,"result":"déjà vu, encore une fois"}"#;
        let a = reader().parse(identity(), raw.as_bytes()).expect("a");
        let b = reader().parse(identity(), raw.as_bytes()).expect("b");
        assert_eq!(a, b);
        assert_eq!(a.character_count, 24);
    }
}
