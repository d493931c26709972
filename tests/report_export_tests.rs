//! Integration tests for the CSV and JSON report exports.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use swarmlet::exceptions::ExceptionRegistry;
use swarmlet::report::{distribution_csv, exceptions_csv, requests_csv, requests_json};
use swarmlet::runner::RunnerContext;
use swarmlet::scenario_file::ScenarioFile;
use swarmlet::standalone::StandaloneRunner;
use swarmlet::stats::{StatsEntry, StatsKey, StatsRegistry};
use tempfile::NamedTempFile;

const NOW: f64 = 1_700_000_100.0;

fn export(contents: &str) -> Vec<Vec<String>> {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();

    let written = fs::read_to_string(file.path()).unwrap();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(written.as_bytes());
    reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect()
}

fn registry() -> StatsRegistry {
    let stats = StatsRegistry::new();
    for ms in [10, 20, 30] {
        stats.record_at("GET", "/home", ms, true, 1000, NOW - 1.0);
    }
    stats.record_at("POST", "/login", 250, false, 0, NOW - 1.0);
    stats
}

#[test]
fn test_requests_csv_export() {
    let stats = registry();
    let csv = requests_csv(&stats.entries(), &stats.total(), NOW).unwrap();
    let rows = export(&csv);

    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].len(), 10);
    assert_eq!(rows[0][0], "Method");
    assert_eq!(rows[0][9], "Requests/s");

    assert_eq!(&rows[1][..4], &["GET", "/home", "3", "0"]);
    assert_eq!(rows[1][4], "20");
    assert_eq!(rows[1][6], "10");
    assert_eq!(rows[1][7], "30");
    assert_eq!(rows[1][8], "1000");

    assert_eq!(&rows[2][..4], &["POST", "/login", "1", "1"]);
    assert_eq!(rows[2][4], "250");

    let total = &rows[3];
    assert_eq!(total[0], "None");
    assert_eq!(total[1], "Total");
    assert_eq!(total[2], "4");
    assert_eq!(total[3], "1");
    // Per-entry medians weighted by request count: 3x20, 1x250.
    assert_eq!(total[4], "20");

    println!("✅ Requests CSV has one row per endpoint plus the total");
}

#[test]
fn test_distribution_csv_export() {
    let stats = registry();
    let mut entries = stats.entries();
    let idle = StatsEntry::new("GET", "/idle", NOW - 10.0);
    entries.insert(idle.key(), idle);

    let csv = distribution_csv(&entries, &stats.total()).unwrap();
    let rows = export(&csv);

    assert_eq!(rows[0][0], "Name");
    assert_eq!(rows[0][2], "50%");
    assert_eq!(rows[0][10], "100%");

    let home = rows.iter().find(|r| r[0] == "GET /home").unwrap();
    assert_eq!(home[1], "3");
    assert_eq!(home[2], "20");
    assert_eq!(home[10], "30");

    let idle = rows.iter().find(|r| r[0] == "GET /idle").unwrap();
    assert_eq!(idle[1], "0");
    assert!(idle[2..].iter().all(|cell| cell == "N/A"));

    let total = rows.last().unwrap();
    assert_eq!(total[0], "Total");
    assert_eq!(total[1], "4");
    assert_eq!(total[10], "250");

    println!("✅ Distribution CSV prints the percentile ladder and N/A for idle entries");
}

#[test]
fn test_exceptions_csv_export() {
    let errors = ExceptionRegistry::new();
    errors.record("HTTP 503", "POST /login", "worker-1");
    errors.record("HTTP 503", "POST /login", "worker-2");
    errors.record("timeout", "GET /home", "worker-1");

    let rows = export(&exceptions_csv(&errors.records()).unwrap());
    assert_eq!(rows[0], vec!["Count", "Message", "Traceback", "Nodes"]);
    assert_eq!(rows[1], vec!["2", "HTTP 503", "POST /login", "worker-1, worker-2"]);
    assert_eq!(rows[2], vec!["1", "timeout", "GET /home", "worker-1"]);

    println!("✅ Exceptions CSV sorted by count with origin nodes");
}

#[tokio::test]
async fn test_requests_json_of_idle_runner() {
    let yaml = r#"
scenarios:
  - name: idle
    actions:
      - name: /
"#;
    let scenarios = ScenarioFile::from_str(yaml).unwrap().to_definitions();
    let runner = StandaloneRunner::new(RunnerContext::new("local"), scenarios, None).unwrap();

    let body: serde_json::Value = serde_json::from_str(&requests_json(&runner).unwrap()).unwrap();
    assert_eq!(body["state"], "ready");
    assert_eq!(body["user_count"], 0);
    assert_eq!(body["worker_count"], 0);
    assert_eq!(body["fail_ratio"], 0.0);

    let stats = body["stats"].as_array().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0]["name"], "Total");
    assert_eq!(stats[0]["num_requests"], 0);
    assert!(body["errors"].as_array().unwrap().is_empty());

    println!("✅ Requests JSON of an idle runner holds only the total row");
}

#[test]
fn test_key_order_drives_row_order() {
    let mut entries = BTreeMap::new();
    for name in ["/b", "/a", "/c"] {
        let entry = StatsEntry::new("GET", name, NOW);
        entries.insert(StatsKey::new("GET", name), entry);
    }
    let rows = export(&requests_csv(&entries, &StatsEntry::new("", "Total", NOW), NOW).unwrap());
    let names: Vec<&str> = rows[1..4].iter().map(|r| r[1].as_str()).collect();
    assert_eq!(names, vec!["/a", "/b", "/c"]);

    println!("✅ Rows ordered by endpoint name");
}
