//! Report views over a runner: the requests table, the percentile
//! distribution and the exception report, as JSON, CSV and console text.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::ReportError;
use crate::exceptions::{ErrorKey, ExceptionRecord};
use crate::percentiles::{ladder_labels, median_from_histogram, ResponseTimeHistogram, PERCENTILE_LADDER};
use crate::runner::Runner;
use crate::scenario::TaskRatio;
use crate::state::RunnerState;
use crate::stats::{StatsEntry, StatsKey, TOTAL_NAME};
use crate::utils::unix_now_secs;

const TABLE_RULE_WIDTH: usize = 140;

/// One row of the requests report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRow {
    pub method: String,
    pub name: String,
    pub num_requests: u64,
    pub num_failures: u64,
    pub median_response_time: Option<u64>,
    pub avg_response_time: f64,
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    pub avg_content_length: f64,
    pub current_rps: u64,
}

impl RequestRow {
    pub fn from_entry(entry: &StatsEntry, now: f64) -> Self {
        Self {
            method: entry.method.clone(),
            name: entry.name.clone(),
            num_requests: entry.num_requests,
            num_failures: entry.num_failures,
            median_response_time: entry.median_response_time(),
            avg_response_time: entry.avg_response_time(),
            min_response_time: entry.min_response_time,
            max_response_time: entry.max_response_time,
            avg_content_length: entry.avg_content_length(),
            current_rps: entry.current_rps(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRow {
    pub count: u64,
    pub message: String,
    pub traceback: String,
    pub nodes: String,
}

impl ErrorRow {
    fn from_record(record: &ExceptionRecord) -> Self {
        Self {
            count: record.count,
            message: record.message.clone(),
            traceback: record.stack_summary.clone(),
            nodes: record
                .origin_node_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// JSON body of the requests view. The last `stats` row is the total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestsReport {
    pub stats: Vec<RequestRow>,
    pub errors: Vec<ErrorRow>,
    pub total_rps: f64,
    pub fail_ratio: f64,
    pub state: RunnerState,
    pub user_count: usize,
    pub worker_count: usize,
}

/// Median of the total row, weighting each entry's median by its request count.
pub fn total_median(entries: &BTreeMap<StatsKey, StatsEntry>) -> Option<u64> {
    let mut medians = ResponseTimeHistogram::new();
    let mut total = 0;
    for entry in entries.values() {
        if let Some(median) = entry.median_response_time() {
            *medians.entry(median).or_insert(0) += entry.num_requests;
            total += entry.num_requests;
        }
    }
    median_from_histogram(&medians, total)
}

pub fn requests_report(runner: &dyn Runner) -> RequestsReport {
    requests_report_at(runner, unix_now_secs())
}

pub fn requests_report_at(runner: &dyn Runner, now: f64) -> RequestsReport {
    let entries = runner.request_stats();
    let total = runner.total_stats();

    let mut stats: Vec<RequestRow> = entries
        .values()
        .map(|entry| RequestRow::from_entry(entry, now))
        .collect();
    let mut total_row = RequestRow::from_entry(&total, now);
    total_row.median_response_time = total_median(&entries);
    stats.push(total_row);

    RequestsReport {
        stats,
        errors: runner.errors().values().map(ErrorRow::from_record).collect(),
        total_rps: total.total_rps(now),
        fail_ratio: total.fail_ratio(),
        state: runner.state(),
        user_count: runner.user_count(),
        worker_count: runner.worker_count(),
    }
}

pub fn requests_json(runner: &dyn Runner) -> Result<String, ReportError> {
    Ok(serde_json::to_string(&requests_report(runner))?)
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new())
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<String, ReportError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn opt_ms(value: Option<u64>) -> String {
    value.unwrap_or(0).to_string()
}

fn requests_csv_row(method: &str, entry: &StatsEntry, median: Option<u64>, now: f64) -> Vec<String> {
    vec![
        method.to_string(),
        entry.name.clone(),
        entry.num_requests.to_string(),
        entry.num_failures.to_string(),
        opt_ms(median),
        format!("{:.0}", entry.avg_response_time()),
        opt_ms(entry.min_response_time),
        entry.max_response_time.to_string(),
        format!("{:.0}", entry.avg_content_length()),
        format!("{:.2}", entry.total_rps(now)),
    ]
}

/// Requests view as CSV: one row per endpoint plus the total.
pub fn requests_csv(
    entries: &BTreeMap<StatsKey, StatsEntry>,
    total: &StatsEntry,
    now: f64,
) -> Result<String, ReportError> {
    let mut writer = csv_writer();
    writer.write_record([
        "Method",
        "Name",
        "# requests",
        "# failures",
        "Median response time",
        "Average response time",
        "Min response time",
        "Max response time",
        "Average Content Size",
        "Requests/s",
    ])?;
    for entry in entries.values() {
        writer.write_record(requests_csv_row(
            &entry.method,
            entry,
            entry.median_response_time(),
            now,
        ))?;
    }
    writer.write_record(requests_csv_row("None", total, total_median(entries), now))?;
    finish_csv(writer)
}

fn distribution_row(label: String, entry: &StatsEntry) -> Vec<String> {
    let mut row = vec![label, entry.num_requests.to_string()];
    for percent in PERCENTILE_LADDER {
        row.push(match entry.percentile(percent) {
            Some(ms) if entry.num_requests > 0 => ms.to_string(),
            _ => "N/A".to_string(),
        });
    }
    row
}

/// Percentile ladder per endpoint plus the total. Entries with no requests
/// print `N/A`.
pub fn distribution_csv(
    entries: &BTreeMap<StatsKey, StatsEntry>,
    total: &StatsEntry,
) -> Result<String, ReportError> {
    let mut writer = csv_writer();
    let mut header = vec!["Name".to_string(), "# requests".to_string()];
    header.extend(ladder_labels());
    writer.write_record(&header)?;
    for entry in entries.values() {
        writer.write_record(distribution_row(
            format!("{} {}", entry.method, entry.name),
            entry,
        ))?;
    }
    writer.write_record(distribution_row(TOTAL_NAME.to_string(), total))?;
    finish_csv(writer)
}

pub fn exceptions_rows(errors: &BTreeMap<ErrorKey, ExceptionRecord>) -> Vec<ErrorRow> {
    let mut rows: Vec<ErrorRow> = errors.values().map(ErrorRow::from_record).collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    rows
}

pub fn exceptions_json(errors: &BTreeMap<ErrorKey, ExceptionRecord>) -> Result<String, ReportError> {
    #[derive(Serialize)]
    struct Body {
        exceptions: Vec<ErrorRow>,
    }
    Ok(serde_json::to_string(&Body {
        exceptions: exceptions_rows(errors),
    })?)
}

pub fn exceptions_csv(errors: &BTreeMap<ErrorKey, ExceptionRecord>) -> Result<String, ReportError> {
    let mut writer = csv_writer();
    writer.write_record(["Count", "Message", "Traceback", "Nodes"])?;
    for row in exceptions_rows(errors) {
        writer.write_record([
            row.count.to_string(),
            row.message,
            row.traceback,
            row.nodes,
        ])?;
    }
    finish_csv(writer)
}

// ── Console tables ────────────────────────────────────────────────────────────

fn rule() -> String {
    "-".repeat(TABLE_RULE_WIDTH)
}

fn stats_line(label: &str, entry: &StatsEntry, median: Option<u64>, now: f64) -> String {
    format!(
        " {:<50} {:>7} {:>12} {:>7} {:>7} {:>7}  | {:>7} {:>7.2}",
        truncate(label, 50),
        entry.num_requests,
        format!("{}({:.2}%)", entry.num_failures, entry.fail_ratio() * 100.0),
        format!("{:.0}", entry.avg_response_time()),
        opt_ms(entry.min_response_time),
        entry.max_response_time,
        opt_ms(median),
        entry.current_rps(now) as f64,
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

pub fn render_stats_table(
    entries: &BTreeMap<StatsKey, StatsEntry>,
    total: &StatsEntry,
    now: f64,
) -> String {
    let mut out = Vec::new();
    out.push(format!(
        " {:<50} {:>7} {:>12} {:>7} {:>7} {:>7}  | {:>7} {:>7}",
        "Name", "# reqs", "# fails", "Avg", "Min", "Max", "Median", "req/s"
    ));
    out.push(rule());
    for entry in entries.values() {
        let label = format!("{} {}", entry.method, entry.name);
        out.push(stats_line(&label, entry, entry.median_response_time(), now));
    }
    out.push(rule());
    out.push(stats_line(TOTAL_NAME, total, total_median(entries), now));
    out.join("\n")
}

pub fn render_percentile_table(entries: &BTreeMap<StatsKey, StatsEntry>, total: &StatsEntry) -> String {
    let mut out = vec!["Percentage of the requests completed within given times".to_string()];
    let mut header = format!(" {:<60} {:>8}", "Name", "# reqs");
    for label in ladder_labels() {
        header.push_str(&format!(" {:>6}", label));
    }
    out.push(header);
    out.push(rule());

    let line = |label: &str, entry: &StatsEntry| {
        let mut line = format!(" {:<60} {:>8}", truncate(label, 60), entry.num_requests);
        for percent in PERCENTILE_LADDER {
            let cell = match entry.percentile(percent) {
                Some(ms) if entry.num_requests > 0 => ms.to_string(),
                _ => "N/A".to_string(),
            };
            line.push_str(&format!(" {:>6}", cell));
        }
        line
    };
    for entry in entries.values() {
        out.push(line(&format!("{} {}", entry.method, entry.name), entry));
    }
    out.push(rule());
    out.push(line(TOTAL_NAME, total));
    out.join("\n")
}

pub fn render_error_report(errors: &BTreeMap<ErrorKey, ExceptionRecord>) -> String {
    let mut out = vec![
        "Error report".to_string(),
        format!(" {:<18} {}", "# occurrences", "Error"),
        rule(),
    ];
    for row in exceptions_rows(errors) {
        out.push(format!(" {:<18} {}: {}", row.count, row.message, row.traceback));
    }
    out.push(rule());
    out.join("\n")
}

pub fn print_stats(runner: &dyn Runner) {
    println!(
        "{}",
        render_stats_table(&runner.request_stats(), &runner.total_stats(), unix_now_secs())
    );
    println!();
}

pub fn print_percentile_stats(runner: &dyn Runner) {
    println!(
        "{}",
        render_percentile_table(&runner.request_stats(), &runner.total_stats())
    );
    println!();
}

pub fn print_error_report(runner: &dyn Runner) {
    println!("{}", render_error_report(&runner.errors()));
    println!();
}

pub fn render_task_ratio(ratios: &[TaskRatio]) -> String {
    let mut out = Vec::new();
    for scenario in ratios {
        out.push(format!("{:>7.1}% {}", scenario.ratio * 100.0, scenario.name));
        for action in &scenario.children {
            out.push(format!(
                "    {:>7.1}% {} ({:.1}% of total)",
                action.ratio * 100.0,
                action.name,
                action.total_ratio * 100.0
            ));
        }
    }
    out.join("\n")
}

pub fn task_ratio_json(ratios: &[TaskRatio]) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(ratios)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: f64 = 1_700_000_000.0;

    fn entries() -> (BTreeMap<StatsKey, StatsEntry>, StatsEntry) {
        let mut a = StatsEntry::new("GET", "/a", T0);
        for ms in [10, 10, 10] {
            a.log(ms, true, 100, T0 + 1.0);
        }
        let mut b = StatsEntry::new("POST", "/b", T0);
        b.log(110, false, 0, T0 + 1.0);

        let mut total = StatsEntry::new("", TOTAL_NAME, T0);
        total.extend(&a);
        total.extend(&b);

        let mut map = BTreeMap::new();
        map.insert(a.key(), a);
        map.insert(b.key(), b);
        (map, total)
    }

    #[test]
    fn total_median_weights_entry_medians() {
        let (map, _) = entries();
        assert_eq!(total_median(&map), Some(10));
    }

    #[test]
    fn requests_csv_layout() {
        let (map, total) = entries();
        let csv = requests_csv(&map, &total, T0 + 2.0).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "\"Method\",\"Name\",\"# requests\",\"# failures\",\"Median response time\",\"Average response time\",\"Min response time\",\"Max response time\",\"Average Content Size\",\"Requests/s\""
        );
        assert_eq!(lines[1], "\"GET\",\"/a\",3,0,10,10,10,10,100,1.50");
        assert_eq!(lines[2], "\"POST\",\"/b\",1,1,110,110,110,110,0,0.50");
        assert_eq!(lines[3], "\"None\",\"Total\",4,1,10,35,10,110,75,2.00");
    }

    #[test]
    fn distribution_marks_empty_entries() {
        let (mut map, total) = entries();
        let empty = StatsEntry::new("GET", "/never", T0);
        map.insert(empty.key(), empty);

        let csv = distribution_csv(&map, &total).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[0].starts_with("\"Name\",\"# requests\",\"50%\""));
        assert!(lines[0].ends_with("\"100%\""));
        assert_eq!(lines[1], "\"GET /a\",3,10,10,10,10,10,10,10,10,10");
        assert!(lines[3].starts_with("\"GET /never\",0,\"N/A\""));
        assert_eq!(lines[4], "\"Total\",4,10,10,10,110,110,110,110,110,110");
    }

    #[test]
    fn exceptions_csv_lists_nodes() {
        let registry = crate::exceptions::ExceptionRegistry::new();
        registry.record("timeout", "browse -> GET /", "w1");
        registry.record("timeout", "browse -> GET /", "w2");
        let csv = exceptions_csv(&registry.records()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "\"Count\",\"Message\",\"Traceback\",\"Nodes\"");
        assert_eq!(lines[1], "2,\"timeout\",\"browse -> GET /\",\"w1, w2\"");
    }

    #[test]
    fn console_table_has_total_row() {
        let (map, total) = entries();
        let table = render_stats_table(&map, &total, T0 + 2.0);
        assert!(table.contains("GET /a"));
        assert!(table.lines().last().unwrap().trim_start().starts_with("Total"));
    }

    #[test]
    fn percentile_table_prints_ladder() {
        let (map, total) = entries();
        let table = render_percentile_table(&map, &total);
        assert!(table.contains("99%"));
        assert!(table.contains("POST /b"));
    }
}
