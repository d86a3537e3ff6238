//! Sync-aware ingestion and aggregation of dictation recording metadata.
//!
//! [`tally::ingest::IngestionEngine`] turns a recordings tree into
//! [`tally::record::NormalizedRecord`]s, reusing [`tally::cache::RecordCache`]
//! entries for unchanged files. [`tally::aggregate::AggregationEngine`] rolls
//! those records up into calendar buckets and a trailing activity window.

pub mod error;
pub mod tally;
