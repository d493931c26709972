//! Per-endpoint request statistics.
//!
//! [`StatsRegistry`] ingests one sample per completed request from any number of
//! concurrently running user tasks. Each `(method, name)` pair gets a lazily
//! created [`StatsEntry`] holding running counters, a bucketed response-time
//! histogram and a short per-second request window for current RPS.
//!
//! Entries are plain serde values so a worker can ship them to the controller
//! as a snapshot and the controller can merge them with [`StatsEntry::extend`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::percentiles::{
    bucket_response_time, median_from_histogram, merge_histogram, percentile_from_histogram,
    ResponseTimeHistogram,
};
use crate::utils::unix_now_secs;

/// Seconds of per-second request counts kept for current RPS.
pub const RPS_WINDOW_SECS: u64 = 10;

/// Name of the aggregated row in reports.
pub const TOTAL_NAME: &str = "Total";

/// Identifies one logical endpoint.
///
/// Ordered by name first so reports list endpoints alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatsKey {
    pub name: String,
    pub method: String,
}

impl StatsKey {
    pub fn new(method: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.name)
    }
}

/// Aggregated metrics for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub method: String,
    pub name: String,

    /// Every recorded sample, successful or not.
    pub num_requests: u64,
    pub num_failures: u64,

    /// Sum of raw response times in milliseconds
    pub total_response_time: u64,
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    pub total_content_length: u64,

    /// Bucketed response time → count
    #[serde(with = "count_pairs")]
    pub response_times: ResponseTimeHistogram,

    /// Unix second → requests completed in that second
    #[serde(with = "count_pairs")]
    pub num_reqs_per_sec: BTreeMap<u64, u64>,

    /// Unix timestamp the entry started counting from
    pub start_time: f64,
    pub last_request_timestamp: f64,
}

impl StatsEntry {
    pub fn new(method: impl Into<String>, name: impl Into<String>, start_time: f64) -> Self {
        Self {
            method: method.into(),
            name: name.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: None,
            max_response_time: 0,
            total_content_length: 0,
            response_times: ResponseTimeHistogram::new(),
            num_reqs_per_sec: BTreeMap::new(),
            start_time,
            last_request_timestamp: start_time,
        }
    }

    pub fn key(&self) -> StatsKey {
        StatsKey::new(self.method.clone(), self.name.clone())
    }

    /// Records one completed request observed at unix time `now`.
    pub fn log(&mut self, elapsed_ms: u64, success: bool, content_length: u64, now: f64) {
        self.num_requests += 1;
        if !success {
            self.num_failures += 1;
        }
        self.total_response_time += elapsed_ms;
        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(elapsed_ms),
            None => elapsed_ms,
        });
        self.max_response_time = self.max_response_time.max(elapsed_ms);
        self.total_content_length += content_length;

        *self
            .response_times
            .entry(bucket_response_time(elapsed_ms))
            .or_insert(0) += 1;

        let second = now.max(0.0) as u64;
        *self.num_reqs_per_sec.entry(second).or_insert(0) += 1;
        self.prune_rps_window(second);

        if now > self.last_request_timestamp {
            self.last_request_timestamp = now;
        }
    }

    fn prune_rps_window(&mut self, newest_second: u64) {
        let oldest_kept = newest_second.saturating_sub(RPS_WINDOW_SECS);
        self.num_reqs_per_sec = self.num_reqs_per_sec.split_off(&oldest_kept);
    }

    /// Folds another entry's counters into this one.
    ///
    /// Used by the controller to merge worker snapshots and to build the
    /// aggregated total row.
    pub fn extend(&mut self, other: &StatsEntry) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.min_response_time = match (self.min_response_time, other.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        self.total_content_length += other.total_content_length;
        merge_histogram(&mut self.response_times, &other.response_times);
        for (second, count) in &other.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(*second).or_insert(0) += count;
        }
        if let Some(newest) = self.num_reqs_per_sec.keys().next_back().copied() {
            self.prune_rps_window(newest);
        }
        self.start_time = self.start_time.min(other.start_time);
        self.last_request_timestamp = self.last_request_timestamp.max(other.last_request_timestamp);
    }

    pub fn num_successes(&self) -> u64 {
        self.num_requests - self.num_failures
    }

    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_response_time as f64 / self.num_requests as f64
    }

    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_content_length as f64 / self.num_requests as f64
    }

    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.num_failures as f64 / self.num_requests as f64
    }

    pub fn median_response_time(&self) -> Option<u64> {
        median_from_histogram(&self.response_times, self.num_requests)
    }

    /// Response time bucket at the given percentile (0.0–1.0).
    pub fn percentile(&self, percent: f64) -> Option<u64> {
        percentile_from_histogram(&self.response_times, self.num_requests, percent)
    }

    /// Requests completed in the last full second before `now`.
    pub fn current_rps(&self, now: f64) -> u64 {
        let last_complete = (now.max(0.0) as u64).saturating_sub(1);
        self.num_reqs_per_sec
            .get(&last_complete)
            .copied()
            .unwrap_or(0)
    }

    /// Average throughput since the entry started counting.
    pub fn total_rps(&self, now: f64) -> f64 {
        let elapsed = now - self.start_time;
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.num_requests as f64 / elapsed
    }
}

/// `u64 → u64` maps travel as `[[key, count], ...]` so they survive the
/// internally tagged wire enums, which cannot read integer map keys back.
mod count_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<u64, u64>, s: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u64, u64>, D::Error> {
        let pairs = Vec::<(u64, u64)>::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}

struct StatsInner {
    entries: HashMap<StatsKey, StatsEntry>,
    total: StatsEntry,
}

impl StatsInner {
    fn new(start_time: f64) -> Self {
        Self {
            entries: HashMap::new(),
            total: StatsEntry::new("", TOTAL_NAME, start_time),
        }
    }
}

/// Concurrent-safe registry of request statistics.
///
/// `record` takes one short lock per sample; readers get cloned values so
/// reporting never holds the lock while formatting.
pub struct StatsRegistry {
    inner: Mutex<StatsInner>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner::new(unix_now_secs())),
        }
    }

    /// Records one completed request.
    pub fn record(
        &self,
        method: &str,
        name: &str,
        elapsed_ms: u64,
        success: bool,
        content_length: u64,
    ) {
        self.record_at(method, name, elapsed_ms, success, content_length, unix_now_secs());
    }

    /// Records one completed request observed at unix time `now`.
    pub fn record_at(
        &self,
        method: &str,
        name: &str,
        elapsed_ms: u64,
        success: bool,
        content_length: u64,
        now: f64,
    ) {
        let mut inner = self.inner.lock();
        let start_time = inner.total.start_time;
        let key = StatsKey::new(method, name);
        inner
            .entries
            .entry(key)
            .or_insert_with(|| StatsEntry::new(method, name, start_time))
            .log(elapsed_ms, success, content_length, now);
        inner.total.log(elapsed_ms, success, content_length, now);
    }

    /// Cloned view of every entry, ordered by key.
    pub fn entries(&self) -> BTreeMap<StatsKey, StatsEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn entry(&self, key: &StatsKey) -> Option<StatsEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Aggregated row across all endpoints.
    pub fn total(&self) -> StatsEntry {
        self.inner.lock().total.clone()
    }

    /// Total number of recorded samples.
    pub fn num_requests(&self) -> u64 {
        self.inner.lock().total.num_requests
    }

    pub fn num_failures(&self) -> u64 {
        self.inner.lock().total.num_failures
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries as a flat list, the unit a worker ships to the controller.
    pub fn snapshot(&self) -> Vec<StatsEntry> {
        self.entries().into_values().collect()
    }

    /// Clears every entry and restarts the throughput clock.
    pub fn reset(&self) {
        *self.inner.lock() = StatsInner::new(unix_now_secs());
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges entries from several snapshots, summing entries that share a key.
pub fn merge_entries<'a, I>(entries: I) -> BTreeMap<StatsKey, StatsEntry>
where
    I: IntoIterator<Item = &'a StatsEntry>,
{
    let mut merged: BTreeMap<StatsKey, StatsEntry> = BTreeMap::new();
    for entry in entries {
        match merged.get_mut(&entry.key()) {
            Some(existing) => existing.extend(entry),
            None => {
                merged.insert(entry.key(), entry.clone());
            }
        }
    }
    merged
}

/// Builds the aggregated total row from a set of entries.
///
/// With no entries the row starts counting at `start_time`.
pub fn aggregate_total<'a, I>(entries: I, start_time: f64) -> StatsEntry
where
    I: IntoIterator<Item = &'a StatsEntry>,
{
    let mut total: Option<StatsEntry> = None;
    for entry in entries {
        match total.as_mut() {
            Some(t) => t.extend(entry),
            None => {
                let mut first = entry.clone();
                first.method = String::new();
                first.name = TOTAL_NAME.to_string();
                total = Some(first);
            }
        }
    }
    total.unwrap_or_else(|| StatsEntry::new("", TOTAL_NAME, start_time))
}
