use anyhow::Result;
use serde_json::{Map, Value};
use voxtally::tally::aggregate::{AggregateBucket, AggregationEngine, Aggregates};
use voxtally::tally::config;
use voxtally::tally::util::round2;

use crate::cli::ReportArgs;
use crate::commands::ingest::{self, overrides};
use crate::commands::{CommandReport, resolve_config};

fn bucket_line(bucket: &AggregateBucket) -> String {
    format!(
        "{} label={} recordings={} minutes={} words={} characters={} wpm={}",
        bucket.granularity.as_str(),
        bucket.label,
        bucket.recording_count,
        round2(bucket.total_minutes()),
        bucket.total_words,
        bucket.total_characters,
        round2(bucket.mean_speaking_rate_wpm),
    )
}

fn describe(agg: &Aggregates, report: &mut CommandReport) {
    let o = &agg.overall;
    report.detail(format!("timezone={}", agg.timezone));
    report.detail(format!("valid_recordings={}", o.recording_count));
    report.detail(format!(
        "total_minutes={}",
        round2(o.total_duration_seconds / 60.0)
    ));
    report.detail(format!("total_words={}", o.total_words));
    report.detail(format!("total_characters={}", o.total_characters));
    report.detail(format!(
        "mean_speaking_rate_wpm={}",
        round2(o.mean_speaking_rate_wpm)
    ));
    report.detail(format!("active_days={}", o.active_days));
    report.detail(format!("avg_daily_minutes={}", round2(o.avg_daily_minutes)));
    if let Some(peak) = &o.peak_day {
        report.detail(format!(
            "peak_day={} peak_minutes={} peak_recordings={}",
            peak.date,
            round2(peak.minutes),
            peak.recordings
        ));
    }
    if let Some(hour) = o.busiest_hour {
        report.detail(format!("busiest_hour={hour:02}:00"));
    }
    if let Some(day) = o.busiest_weekday {
        report.detail(format!("busiest_weekday={day}"));
    }
    if let Some(longest) = &o.longest_recording {
        report.detail(format!(
            "longest_recording={} characters={} date={}",
            longest.path.display(),
            longest.characters,
            longest.date
        ));
    }
    if let Some(most) = &o.most_words_recording {
        report.detail(format!(
            "most_words_recording={} words={} date={}",
            most.path.display(),
            most.words,
            most.date
        ));
    }
    for (rank, day) in o.top_days.iter().enumerate() {
        report.detail(format!(
            "top_day rank={} date={} minutes={} recordings={}",
            rank + 1,
            day.date,
            round2(day.minutes),
            day.recordings
        ));
    }
    for p in &o.time_saved {
        report.detail(format!(
            "time_saved.{}_minutes={} efficiency_percent={}",
            p.label,
            round2(p.time_saved_minutes),
            round2(p.efficiency_percent)
        ));
    }

    let w = &agg.recent;
    report.detail(format!(
        "recent.days={} recent.recordings={} recent.minutes={} recent.active_days={} recent.daily_average_minutes={}",
        w.days,
        w.recording_count,
        round2(w.total_duration_seconds / 60.0),
        w.active_days,
        round2(w.daily_average_minutes)
    ));
    for p in &w.time_saved {
        report.detail(format!(
            "recent.time_saved.{}_minutes={}",
            p.label,
            round2(p.time_saved_minutes)
        ));
    }

    for bucket in agg.monthly.iter().chain(&agg.weekly).chain(&agg.daily) {
        report.detail(bucket_line(bucket));
    }
}

pub fn run(args: &ReportArgs) -> Result<CommandReport> {
    let (mut cfg, paths) = resolve_config(&overrides(&args.ingest))?;
    if let Some(tz) = &args.timezone {
        cfg.aggregate.timezone = tz.clone();
    }
    if let Some(week_start) = &args.week_start {
        cfg.aggregate.week_start = week_start.clone();
    }
    if let Some(days) = args.window_days {
        cfg.aggregate.recent_window_days = u64::from(days);
    }
    config::validate(&cfg)?;

    let mut report = CommandReport::new("report");
    report.detail(format!("recordings_root={}", paths.recordings_root.display()));

    let run = ingest::execute(&cfg, &paths, &args.ingest)?;
    let engine = AggregationEngine::new(cfg.aggregation_settings()?);
    let aggregates = engine.aggregate(&run.outcome.records);

    report.detail(format!("ingest_status={}", run.outcome.report.status.as_str()));
    report.detail(format!("skipped={}", run.outcome.report.skipped.len()));
    describe(&aggregates, &mut report);
    let mut data = Map::new();
    data.insert("run".into(), serde_json::to_value(&run.outcome.report)?);
    data.insert("aggregates".into(), serde_json::to_value(&aggregates)?);
    report.data = Some(Value::Object(data));
    Ok(report)
}
