//! Calendar rollups, the trailing activity window, and time-saved projections.
//!
//! Everything here is recomputed from the full record set on every call.
//! Records are put in `(timestamp, path)` order before accumulation so the
//! floating-point totals do not depend on the order records arrived in.

use crate::tally::record::{NormalizedRecord, words_per_minute};
use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingModel {
    pub label: String,
    pub wpm: f64,
}

impl TypingModel {
    pub fn new(label: impl Into<String>, wpm: f64) -> Self {
        Self {
            label: label.into(),
            wpm,
        }
    }
}

pub fn default_typing_models() -> Vec<TypingModel> {
    vec![
        TypingModel::new("casual", 35.0),
        TypingModel::new("professional", 60.0),
        TypingModel::new("fast", 80.0),
    ]
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub timezone: Tz,
    pub week_start: Weekday,
    pub recent_window_days: u32,
    pub typing_models: Vec<TypingModel>,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            week_start: Weekday::Mon,
            recent_window_days: 30,
            typing_models: default_typing_models(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSavedProjection {
    pub label: String,
    pub typing_wpm: f64,
    pub typing_minutes: f64,
    pub speaking_minutes: f64,
    pub time_saved_minutes: f64,
    pub efficiency_percent: f64,
    pub speed_multiplier: f64,
}

/// Time saved by speaking `words` over `duration_seconds` instead of typing
/// them at each model's speed.
pub fn project_time_saved(
    words: u64,
    duration_seconds: f64,
    models: &[TypingModel],
) -> Vec<TimeSavedProjection> {
    let speaking_minutes = duration_seconds / 60.0;
    let pooled_wpm = words_per_minute(words, duration_seconds);
    models
        .iter()
        .map(|model| {
            let typing_minutes = if model.wpm > 0.0 {
                words as f64 / model.wpm
            } else {
                0.0
            };
            let time_saved_minutes = typing_minutes - speaking_minutes;
            let efficiency_percent = if typing_minutes > 0.0 {
                time_saved_minutes / typing_minutes * 100.0
            } else {
                0.0
            };
            let speed_multiplier = if pooled_wpm > 0.0 && model.wpm > 0.0 {
                pooled_wpm / model.wpm
            } else {
                0.0
            };
            TimeSavedProjection {
                label: model.label.clone(),
                typing_wpm: model.wpm,
                typing_minutes,
                speaking_minutes,
                time_saved_minutes,
                efficiency_percent,
                speed_multiplier,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Totals {
    count: usize,
    duration_seconds: f64,
    words: u64,
    characters: u64,
    rate_sum: f64,
    rated: usize,
}

impl Totals {
    fn add(&mut self, record: &NormalizedRecord) {
        self.count += 1;
        self.duration_seconds += record.duration_seconds;
        self.words = self.words.saturating_add(record.estimated_word_count);
        self.characters = self.characters.saturating_add(record.character_count);
        if record.estimated_word_count > 0 && record.duration_seconds > 0.0 {
            self.rate_sum += record.speaking_rate_wpm;
            self.rated += 1;
        }
    }

    fn mean_rate(&self) -> f64 {
        if self.rated == 0 {
            0.0
        } else {
            self.rate_sum / self.rated as f64
        }
    }

    fn minutes(&self) -> f64 {
        self.duration_seconds / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub granularity: Granularity,
    pub label: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub recording_count: usize,
    pub total_duration_seconds: f64,
    pub total_words: u64,
    pub total_characters: u64,
    pub mean_speaking_rate_wpm: f64,
    pub time_saved: Vec<TimeSavedProjection>,
}

fn projection_fields(out: &mut BTreeMap<String, Value>, projections: &[TimeSavedProjection]) {
    for p in projections {
        out.insert(
            format!("typing_minutes_{}", p.label),
            json!(p.typing_minutes),
        );
        out.insert(
            format!("time_saved_minutes_{}", p.label),
            json!(p.time_saved_minutes),
        );
        out.insert(
            format!("efficiency_percent_{}", p.label),
            json!(p.efficiency_percent),
        );
    }
}

impl AggregateBucket {
    pub fn total_minutes(&self) -> f64 {
        self.total_duration_seconds / 60.0
    }

    /// Flat field map for CSV writers and chart renderers.
    pub fn to_fields(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        out.insert("granularity".into(), json!(self.granularity.as_str()));
        out.insert("label".into(), json!(self.label));
        out.insert("period_start".into(), json!(self.period_start.to_rfc3339()));
        out.insert("period_end".into(), json!(self.period_end.to_rfc3339()));
        out.insert("recording_count".into(), json!(self.recording_count));
        out.insert(
            "total_duration_seconds".into(),
            json!(self.total_duration_seconds),
        );
        out.insert("total_minutes".into(), json!(self.total_minutes()));
        out.insert("total_hours".into(), json!(self.total_minutes() / 60.0));
        out.insert("total_words".into(), json!(self.total_words));
        out.insert("total_characters".into(), json!(self.total_characters));
        out.insert(
            "mean_speaking_rate_wpm".into(),
            json!(self.mean_speaking_rate_wpm),
        );
        projection_fields(&mut out, &self.time_saved);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentActivityWindow {
    pub days: u32,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub recording_count: usize,
    pub total_duration_seconds: f64,
    pub total_words: u64,
    pub total_characters: u64,
    pub mean_speaking_rate_wpm: f64,
    pub active_days: usize,
    pub daily_average_minutes: f64,
    pub time_saved: Vec<TimeSavedProjection>,
}

impl RecentActivityWindow {
    pub fn to_fields(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        out.insert("days".into(), json!(self.days));
        out.insert(
            "period_start".into(),
            json!(self.period_start.map(|t| t.to_rfc3339())),
        );
        out.insert(
            "period_end".into(),
            json!(self.period_end.map(|t| t.to_rfc3339())),
        );
        out.insert("recording_count".into(), json!(self.recording_count));
        out.insert(
            "total_duration_seconds".into(),
            json!(self.total_duration_seconds),
        );
        out.insert(
            "total_minutes".into(),
            json!(self.total_duration_seconds / 60.0),
        );
        out.insert("total_words".into(), json!(self.total_words));
        out.insert("total_characters".into(), json!(self.total_characters));
        out.insert(
            "mean_speaking_rate_wpm".into(),
            json!(self.mean_speaking_rate_wpm),
        );
        out.insert("active_days".into(), json!(self.active_days));
        out.insert(
            "daily_average_minutes".into(),
            json!(self.daily_average_minutes),
        );
        projection_fields(&mut out, &self.time_saved);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakDay {
    pub date: NaiveDate,
    pub minutes: f64,
    pub recordings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongestRecording {
    pub path: PathBuf,
    pub characters: u64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MostWordsRecording {
    pub path: PathBuf,
    pub words: u64,
    pub date: NaiveDate,
}

/// How many entries [`OverallSummary::top_days`] keeps.
pub const TOP_DAYS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallSummary {
    pub recording_count: usize,
    pub total_duration_seconds: f64,
    pub total_words: u64,
    pub total_characters: u64,
    pub mean_speaking_rate_wpm: f64,
    /// Total words over total speaking time.
    pub pooled_speaking_rate_wpm: f64,
    pub active_days: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub avg_daily_recordings: f64,
    pub avg_daily_minutes: f64,
    pub peak_day: Option<PeakDay>,
    /// Most active days by minutes, earliest first on ties.
    pub top_days: Vec<PeakDay>,
    pub busiest_hour: Option<u32>,
    pub busiest_weekday: Option<Weekday>,
    pub longest_recording: Option<LongestRecording>,
    pub most_words_recording: Option<MostWordsRecording>,
    pub time_saved: Vec<TimeSavedProjection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregates {
    pub timezone: String,
    pub daily: Vec<AggregateBucket>,
    pub weekly: Vec<AggregateBucket>,
    pub monthly: Vec<AggregateBucket>,
    pub recent: RecentActivityWindow,
    pub overall: OverallSummary,
    /// Minutes recorded per local hour of day.
    pub hourly_minutes: [f64; 24],
    /// Minutes recorded per local weekday, Monday first.
    pub weekday_minutes: [f64; 7],
}

/// UTC instant of local midnight on `date`. A midnight skipped by a DST
/// transition resolves to the first local instant that exists that day.
pub fn local_midnight(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    for minutes in 0..=(24 * 60) {
        let local: NaiveDateTime = midnight + Duration::minutes(minutes);
        match tz.from_local_datetime(&local) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => continue,
        }
    }
    midnight.and_utc()
}

fn week_start_of(date: NaiveDate, week_start: Weekday) -> NaiveDate {
    let offset =
        (7 + date.weekday().num_days_from_monday() - week_start.num_days_from_monday()) % 7;
    date.checked_sub_days(Days::new(u64::from(offset)))
        .unwrap_or(date)
}

fn month_start_of(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_period(granularity: Granularity, start: NaiveDate) -> NaiveDate {
    let next = match granularity {
        Granularity::Day => start.checked_add_days(Days::new(1)),
        Granularity::Week => start.checked_add_days(Days::new(7)),
        Granularity::Month => start.checked_add_months(Months::new(1)),
    };
    next.unwrap_or(start)
}

fn label_for(granularity: Granularity, start: NaiveDate) -> String {
    match granularity {
        Granularity::Day | Granularity::Week => start.format("%Y-%m-%d").to_string(),
        Granularity::Month => start.format("%Y-%m").to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    settings: AggregationSettings,
}

impl AggregationEngine {
    pub fn new(settings: AggregationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    pub fn aggregate(&self, records: &[NormalizedRecord]) -> Aggregates {
        let tz = self.settings.timezone;
        let mut valid: Vec<&NormalizedRecord> = records.iter().filter(|r| r.is_valid()).collect();
        valid.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.identity.path.cmp(&b.identity.path))
        });

        let mut daily: BTreeMap<NaiveDate, Totals> = BTreeMap::new();
        let mut weekly: BTreeMap<NaiveDate, Totals> = BTreeMap::new();
        let mut monthly: BTreeMap<NaiveDate, Totals> = BTreeMap::new();
        let mut overall = Totals::default();
        let mut hourly_minutes = [0.0f64; 24];
        let mut weekday_minutes = [0.0f64; 7];
        let mut longest: Option<LongestRecording> = None;
        let mut most_words: Option<MostWordsRecording> = None;

        for record in &valid {
            let local = record.timestamp.with_timezone(&tz);
            let date = local.date_naive();
            daily.entry(date).or_default().add(record);
            weekly
                .entry(week_start_of(date, self.settings.week_start))
                .or_default()
                .add(record);
            monthly.entry(month_start_of(date)).or_default().add(record);
            overall.add(record);

            let minutes = record.duration_minutes();
            hourly_minutes[local.hour() as usize] += minutes;
            weekday_minutes[local.weekday().num_days_from_monday() as usize] += minutes;

            if longest
                .as_ref()
                .is_none_or(|l| record.character_count > l.characters)
            {
                longest = Some(LongestRecording {
                    path: record.identity.path.clone(),
                    characters: record.character_count,
                    date,
                });
            }
            if most_words
                .as_ref()
                .is_none_or(|m| record.estimated_word_count > m.words)
            {
                most_words = Some(MostWordsRecording {
                    path: record.identity.path.clone(),
                    words: record.estimated_word_count,
                    date,
                });
            }
        }

        let recent = self.recent_window(&valid);
        let overall = self.overall_summary(
            &overall,
            &daily,
            &valid,
            &hourly_minutes,
            &weekday_minutes,
            (longest, most_words),
        );

        Aggregates {
            timezone: tz.name().to_string(),
            daily: self.buckets(Granularity::Day, &daily),
            weekly: self.buckets(Granularity::Week, &weekly),
            monthly: self.buckets(Granularity::Month, &monthly),
            recent,
            overall,
            hourly_minutes,
            weekday_minutes,
        }
    }

    fn buckets(
        &self,
        granularity: Granularity,
        totals: &BTreeMap<NaiveDate, Totals>,
    ) -> Vec<AggregateBucket> {
        let tz = &self.settings.timezone;
        totals
            .iter()
            .map(|(start, t)| AggregateBucket {
                granularity,
                label: label_for(granularity, *start),
                period_start: local_midnight(tz, *start),
                period_end: local_midnight(tz, next_period(granularity, *start)),
                recording_count: t.count,
                total_duration_seconds: t.duration_seconds,
                total_words: t.words,
                total_characters: t.characters,
                mean_speaking_rate_wpm: t.mean_rate(),
                time_saved: project_time_saved(
                    t.words,
                    t.duration_seconds,
                    &self.settings.typing_models,
                ),
            })
            .collect()
    }

    /// Trailing window ending at the latest record, both ends inclusive.
    fn recent_window(&self, sorted_valid: &[&NormalizedRecord]) -> RecentActivityWindow {
        let days = self.settings.recent_window_days;
        let mut totals = Totals::default();
        let mut active = BTreeSet::new();
        let bounds = sorted_valid.last().map(|latest| {
            let end = latest.timestamp;
            let start = Duration::try_days(i64::from(days))
                .and_then(|span| end.checked_sub_signed(span))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            (start, end)
        });
        if let Some((start, end)) = bounds {
            for record in sorted_valid
                .iter()
                .filter(|r| r.timestamp >= start && r.timestamp <= end)
            {
                totals.add(record);
                let local = record.timestamp.with_timezone(&self.settings.timezone);
                active.insert(local.date_naive());
            }
        }
        let divisor = (days as usize).min(active.len()).max(1);
        RecentActivityWindow {
            days,
            period_start: bounds.map(|(start, _)| start),
            period_end: bounds.map(|(_, end)| end),
            recording_count: totals.count,
            total_duration_seconds: totals.duration_seconds,
            total_words: totals.words,
            total_characters: totals.characters,
            mean_speaking_rate_wpm: totals.mean_rate(),
            active_days: active.len(),
            daily_average_minutes: totals.minutes() / divisor as f64,
            time_saved: project_time_saved(
                totals.words,
                totals.duration_seconds,
                &self.settings.typing_models,
            ),
        }
    }

    fn overall_summary(
        &self,
        totals: &Totals,
        daily: &BTreeMap<NaiveDate, Totals>,
        sorted_valid: &[&NormalizedRecord],
        hourly_minutes: &[f64; 24],
        weekday_minutes: &[f64; 7],
        (longest_recording, most_words_recording): (
            Option<LongestRecording>,
            Option<MostWordsRecording>,
        ),
    ) -> OverallSummary {
        let active_days = daily.len();
        let (avg_daily_recordings, avg_daily_minutes) = if active_days == 0 {
            (0.0, 0.0)
        } else {
            (
                totals.count as f64 / active_days as f64,
                totals.minutes() / active_days as f64,
            )
        };

        let mut days: Vec<PeakDay> = daily
            .iter()
            .map(|(date, t)| PeakDay {
                date: *date,
                minutes: t.minutes(),
                recordings: t.count,
            })
            .collect();
        // stable sort keeps the earlier date ahead on equal minutes
        days.sort_by(|a, b| b.minutes.total_cmp(&a.minutes));
        days.truncate(TOP_DAYS);
        let peak_day = days.first().cloned();

        let has_data = totals.count > 0;
        OverallSummary {
            recording_count: totals.count,
            total_duration_seconds: totals.duration_seconds,
            total_words: totals.words,
            total_characters: totals.characters,
            mean_speaking_rate_wpm: totals.mean_rate(),
            pooled_speaking_rate_wpm: words_per_minute(totals.words, totals.duration_seconds),
            active_days,
            first_timestamp: sorted_valid.first().map(|r| r.timestamp),
            last_timestamp: sorted_valid.last().map(|r| r.timestamp),
            avg_daily_recordings,
            avg_daily_minutes,
            peak_day,
            top_days: days,
            busiest_hour: has_data.then(|| first_max(hourly_minutes) as u32),
            busiest_weekday: has_data.then(|| WEEKDAYS[first_max(weekday_minutes)]),
            longest_recording,
            most_words_recording,
            time_saved: project_time_saved(
                totals.words,
                totals.duration_seconds,
                &self.settings.typing_models,
            ),
        }
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Index of the largest slot, the earliest one on ties.
fn first_max(slots: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in slots.iter().enumerate() {
        if *v > slots[best] {
            best = i;
        }
    }
    best
}
