pub mod aggregate;
pub mod cache;
pub mod config;
pub mod ingest;
pub mod paths;
pub mod reader;
pub mod record;
pub mod scanner;
pub mod util;
pub mod warn;
