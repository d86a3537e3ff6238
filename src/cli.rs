use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::logging;

#[derive(Debug, Parser)]
#[command(
    name = "voxtally",
    version,
    about = "Ingest dictation recording metadata and report usage rollups"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Debug-level logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan the recordings root and refresh the record cache.
    Ingest(IngestArgs),
    /// Ingest, then print daily/weekly/monthly rollups and the recent window.
    Report(ReportArgs),
    /// Drop cache entries for recordings no longer under the root.
    CachePrune(CachePruneArgs),
    /// Show resolved configuration and paths.
    Status,
}

#[derive(Debug, Clone, Default, Args)]
pub struct IngestArgs {
    /// Recordings root (overrides config and VOXTALLY_RECORDINGS_ROOT).
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Record cache file.
    #[arg(long)]
    pub cache: Option<PathBuf>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Keep the cache in memory only for this run.
    #[arg(long)]
    pub no_cache: bool,
    /// Cancel after this many parse batches.
    #[arg(long)]
    pub limit_batches: Option<usize>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub ingest: IngestArgs,
    /// IANA timezone for calendar buckets.
    #[arg(long)]
    pub timezone: Option<String>,
    #[arg(long)]
    pub week_start: Option<String>,
    #[arg(long)]
    pub window_days: Option<u32>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct CachePruneArgs {
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long)]
    pub cache: Option<PathBuf>,
    /// Report what would be removed without rewriting the cache.
    #[arg(long)]
    pub dry_run: bool,
}

fn render(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("command={} ok={}", report.command, report.ok);
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let report = match &cli.command {
        Command::Ingest(args) => commands::ingest::run(args)?,
        Command::Report(args) => commands::report::run(args)?,
        Command::CachePrune(args) => commands::cache_prune::run(args)?,
        Command::Status => commands::status::run()?,
    };
    render(&report, cli.json)?;

    if !report.ok {
        bail!(
            "{} finished with {} issue(s)",
            report.command,
            report.issues.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_accepts_ingest_flags() {
        let cli = Cli::try_parse_from([
            "voxtally",
            "report",
            "--root",
            "/data/rec",
            "--no-cache",
            "--timezone",
            "Asia/Tokyo",
            "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        match cli.command {
            Command::Report(args) => {
                assert_eq!(args.ingest.root, Some(PathBuf::from("/data/rec")));
                assert!(args.ingest.no_cache);
                assert_eq!(args.timezone.as_deref(), Some("Asia/Tokyo"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
