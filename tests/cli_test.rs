use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};

struct Sandbox {
    tmp: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("recordings")).expect("mkdir recordings");
        Self { tmp }
    }

    fn root(&self) -> PathBuf {
        self.tmp.path().join("recordings")
    }

    fn cache(&self) -> PathBuf {
        self.tmp.path().join("state").join("records_cache.json")
    }

    fn write_recording(&self, folder: &str, body: &str) -> PathBuf {
        let dir = self.root().join(folder);
        fs::create_dir_all(&dir).expect("mkdir recording");
        let path = dir.join("meta.json");
        fs::write(&path, body).expect("write meta");
        path
    }

    fn seed_same_day(&self) {
        self.write_recording("1741770000", &meta("2025-03-12T09:00:00Z", 60_000, 100));
        self.write_recording("1741784400", &meta("2025-03-12T13:00:00Z", 120_000, 250));
        self.write_recording("1741802400", &meta("2025-03-12T18:00:00Z", 30_000, 50));
    }

    fn cmd(&self) -> assert_cmd::Command {
        let home = self.tmp.path().join("home");
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("voxtally");
        cmd.current_dir(self.tmp.path())
            .env("HOME", &home)
            .env("VOXTALLY_HOME", home.join(".voxtally"))
            .env("VOXTALLY_CONFIG_PATH", self.tmp.path().join("absent.toml"))
            .env("VOXTALLY_PROBE_BACKOFF_MS", "1")
            .env("VOXTALLY_PROBE_MAX_BACKOFF_MS", "2")
            .env_remove("VOXTALLY_LOG")
            .env_remove("RUST_LOG");
        cmd
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let output = self
            .cmd()
            .args(args)
            .arg("--root")
            .arg(self.root())
            .arg("--cache")
            .arg(self.cache())
            .arg("--json")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).expect("json report")
    }
}

fn meta(datetime: &str, duration_ms: u64, words: u64) -> String {
    format!(
        r#"{{"datetime":"{datetime}","duration":{duration_ms},"result":"a transcript of the recording","wordCount":{words},"modelName":"Ultra"}}"#
    )
}

fn detail_lines(report: &Value) -> Vec<String> {
    report["details"]
        .as_array()
        .expect("details")
        .iter()
        .filter_map(|v| v.as_str().map(ToOwned::to_owned))
        .collect()
}

#[test]
fn second_ingest_is_served_from_cache() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();

    let first = sandbox.run_json(&["ingest"]);
    assert_eq!(first["ok"], true);
    assert_eq!(first["data"]["freshly_parsed"], 3);
    assert_eq!(first["data"]["cache_writes"], 1);
    assert!(sandbox.cache().is_file());

    let second = sandbox.run_json(&["ingest"]);
    assert_eq!(second["data"]["freshly_parsed"], 0);
    assert_eq!(second["data"]["cache_hits"], 3);
    assert_eq!(second["data"]["cache_upserts"], 0);
    assert_eq!(second["data"]["cache_writes"], 0);
}

#[test]
fn report_rolls_up_one_day() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();

    let report = sandbox.run_json(&["report"]);
    let daily = report["data"]["aggregates"]["daily"]
        .as_array()
        .expect("daily");
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0]["label"], "2025-03-12");
    assert_eq!(daily[0]["recording_count"], 3);
    assert_eq!(daily[0]["total_duration_seconds"], 210.0);
    assert_eq!(daily[0]["total_words"], 400);
    assert_eq!(report["data"]["aggregates"]["recent"]["recording_count"], 3);
}

#[test]
fn report_text_uses_requested_timezone() {
    let sandbox = Sandbox::new();
    sandbox.write_recording("late", &meta("2025-03-10T23:30:00Z", 60_000, 100));

    sandbox
        .cmd()
        .arg("report")
        .arg("--root")
        .arg(sandbox.root())
        .arg("--no-cache")
        .args(["--timezone", "Asia/Tokyo", "--week-start", "sunday"])
        .assert()
        .success()
        .stdout(predicate::str::contains("day label=2025-03-11 recordings=1"))
        .stdout(predicate::str::contains("week label=2025-03-09"))
        .stdout(predicate::str::contains("busiest_hour=08:00"));
}

#[test]
fn missing_root_fails_the_run() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("ingest")
        .arg("--root")
        .arg(sandbox.tmp.path().join("nowhere"))
        .arg("--no-cache")
        .assert()
        .failure()
        .stderr(predicate::str::contains("recordings root does not exist"));
}

#[test]
fn corrupt_cache_is_reported_and_replaced() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();
    let cache = sandbox.cache();
    fs::create_dir_all(cache.parent().expect("parent")).expect("mkdir state");
    fs::write(&cache, "{\"schema_version\":1,\"entr").expect("corrupt cache");

    sandbox
        .cmd()
        .arg("ingest")
        .arg("--root")
        .arg(sandbox.root())
        .arg("--cache")
        .arg(&cache)
        .assert()
        .success()
        .stdout(predicate::str::contains("cache_load=reset"))
        .stdout(predicate::str::contains("freshly_parsed=3"))
        .stderr(predicate::str::contains("VOXTALLY_WARN code=CACHE_RESET"));

    let raw = fs::read_to_string(&cache).expect("rewritten cache");
    let doc: Value = serde_json::from_str(&raw).expect("valid cache json");
    assert_eq!(doc["entries"].as_array().map(Vec::len), Some(3));
}

#[test]
fn batch_limit_yields_partial_run() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();

    let report = sandbox.run_json(&["ingest", "--batch-size", "1", "--limit-batches", "1"]);
    assert_eq!(report["data"]["status"], "partial");
    assert_eq!(report["data"]["freshly_parsed"], 1);

    let resumed = sandbox.run_json(&["ingest"]);
    assert_eq!(resumed["data"]["status"], "complete");
    assert_eq!(resumed["data"]["cache_hits"], 1);
    assert_eq!(resumed["data"]["freshly_parsed"], 2);
}

#[test]
fn syncing_and_broken_files_are_tallied() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();
    let syncing = sandbox.root().join("1741900000");
    fs::create_dir_all(&syncing).expect("mkdir syncing");
    fs::write(syncing.join(".meta.json.icloud"), "placeholder").expect("placeholder");
    sandbox.write_recording("1741900001", "{\"duration\": 1000, \"result\": \"hi\"}");

    let report = sandbox.run_json(&["ingest"]);
    assert_eq!(report["data"]["total_candidates"], 5);
    assert_eq!(report["data"]["skip_counts"]["PROBE_TIMEOUT"], 1);
    assert_eq!(report["data"]["skip_counts"]["PARSE_FAILURE"], 1);
    let lines = detail_lines(&report);
    assert!(lines.iter().any(|l| {
        l.starts_with("skip reason=PARSE_FAILURE")
            && l.contains("missing required field `datetime`")
    }));
}

#[test]
fn cache_prune_drops_deleted_recordings() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();
    sandbox.run_json(&["ingest"]);

    fs::remove_dir_all(sandbox.root().join("1741784400")).expect("delete recording");
    let pruned = sandbox.run_json(&["cache-prune"]);
    let lines = detail_lines(&pruned);
    assert!(lines.contains(&"removed=1".to_string()));
    assert!(lines.contains(&"entries_after=2".to_string()));

    let again = sandbox.run_json(&["ingest"]);
    assert_eq!(again["data"]["cache_hits"], 2);
}

#[test]
fn status_flags_unknown_env_keys() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("status")
        .env("VOXTALLY_RECORDINGS_ROOT", sandbox.root())
        .env("VOXTALLY_NOT_A_SETTING", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("unknown_env_key=VOXTALLY_NOT_A_SETTING"))
        .stdout(predicate::str::contains("typing_speed.casual=35"))
        .stderr(predicate::str::contains("VOXTALLY_WARN code=UNKNOWN_ENV_KEY"));
}

fn total_words(output: &[u8]) -> u64 {
    let report: Value = serde_json::from_slice(output).expect("json report");
    report["data"]["aggregates"]["overall"]["total_words"]
        .as_u64()
        .expect("total_words")
}

#[test]
fn changed_word_estimate_rebuilds_cached_records() {
    let sandbox = Sandbox::new();
    // 29 characters and no wordCount, so the estimate depends on chars per word
    sandbox.write_recording(
        "1741770000",
        r#"{"datetime":"2025-03-12T09:00:00Z","duration":60000,"result":"a transcript of the recording"}"#,
    );
    let report_with = |chars_per_word: &str, cached: bool| {
        let mut cmd = sandbox.cmd();
        cmd.arg("report")
            .arg("--root")
            .arg(sandbox.root())
            .arg("--json")
            .env("VOXTALLY_CHARS_PER_WORD", chars_per_word);
        if cached {
            cmd.arg("--cache").arg(sandbox.cache());
        } else {
            cmd.arg("--no-cache");
        }
        cmd.assert().success().get_output().clone()
    };

    assert_eq!(total_words(&report_with("5", true).stdout), 5);
    let rerun = report_with("1", true);
    assert_eq!(total_words(&rerun.stdout), 29);
    assert_eq!(total_words(&report_with("1", false).stdout), 29);
    let stderr = String::from_utf8_lossy(&rerun.stderr);
    assert!(stderr.contains("VOXTALLY_WARN code=CACHE_RESET"), "{stderr}");

    // the rebuilt store is reused as long as the setting stays put
    let again: Value = serde_json::from_slice(&report_with("1", true).stdout).expect("json");
    assert_eq!(again["data"]["run"]["cache_hits"], 1);
    assert_eq!(again["data"]["run"]["freshly_parsed"], 0);
}

#[test]
fn widest_recent_window_is_accepted() {
    let sandbox = Sandbox::new();
    sandbox.seed_same_day();
    sandbox
        .cmd()
        .arg("report")
        .arg("--root")
        .arg(sandbox.root())
        .arg("--no-cache")
        .args(["--window-days", "4294967295"])
        .assert()
        .success()
        .stdout(predicate::str::contains("recent.days=4294967295 recent.recordings=3"));
}
