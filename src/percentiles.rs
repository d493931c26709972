//! Bucketed response-time histogram math.
//!
//! Response times are rounded into buckets before being counted so a histogram
//! stays bounded no matter how many samples it sees:
//! - below 100 ms: exact milliseconds
//! - 100 ms to 999 ms: nearest 10 ms
//! - 1000 ms and above: nearest 100 ms
//!
//! Percentiles walk the buckets in ascending order, which also makes merging
//! histograms from many nodes an O(buckets) operation.

use std::collections::BTreeMap;

/// Percentiles reported by the distribution table.
pub const PERCENTILE_LADDER: [f64; 9] = [0.50, 0.66, 0.75, 0.80, 0.90, 0.95, 0.98, 0.99, 1.0];

/// Histogram of bucketed response time (ms) → number of samples.
pub type ResponseTimeHistogram = BTreeMap<u64, u64>;

/// Maps a raw response time onto its histogram bucket.
pub fn bucket_response_time(elapsed_ms: u64) -> u64 {
    match elapsed_ms {
        0..=99 => elapsed_ms,
        100..=999 => round_to_nearest(elapsed_ms, 10),
        _ => round_to_nearest(elapsed_ms, 100),
    }
}

fn round_to_nearest(value: u64, step: u64) -> u64 {
    (value + step / 2) / step * step
}

/// Returns the bucket at which the running count first reaches
/// `ceil(percent * total)`.
///
/// `total` is the number of samples the histogram represents. Returns `None`
/// for an empty histogram.
pub fn percentile_from_histogram(
    histogram: &ResponseTimeHistogram,
    total: u64,
    percent: f64,
) -> Option<u64> {
    let wanted = (percent.clamp(0.0, 1.0) * total as f64).ceil() as u64;
    let mut running = 0u64;
    let mut last = None;
    for (bucket, count) in histogram {
        running += count;
        last = Some(*bucket);
        if running >= wanted {
            return last;
        }
    }
    last
}

/// Median of a bucket → count map holding `total` samples.
pub fn median_from_histogram(histogram: &ResponseTimeHistogram, total: u64) -> Option<u64> {
    percentile_from_histogram(histogram, total, 0.5)
}

/// Weighted median across several histograms.
///
/// Computed over the union of their bucket/count pairs instead of the raw
/// samples, so merging N nodes costs O(buckets).
pub fn weighted_median<'a, I>(histograms: I) -> Option<u64>
where
    I: IntoIterator<Item = &'a ResponseTimeHistogram>,
{
    let mut union = ResponseTimeHistogram::new();
    for histogram in histograms {
        merge_histogram(&mut union, histogram);
    }
    let total = union.values().sum();
    median_from_histogram(&union, total)
}

/// Adds every bucket of `other` into `into`.
pub fn merge_histogram(into: &mut ResponseTimeHistogram, other: &ResponseTimeHistogram) {
    for (bucket, count) in other {
        *into.entry(*bucket).or_insert(0) += count;
    }
}

/// Labels for the distribution table header, e.g. `"50%"`.
pub fn ladder_labels() -> Vec<String> {
    PERCENTILE_LADDER
        .iter()
        .map(|p| format!("{}%", (p * 100.0).round() as u32))
        .collect()
}
