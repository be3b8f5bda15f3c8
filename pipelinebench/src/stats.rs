//! Reduction of trial records into summary statistics.
//!
//! Counts cover every record, warmup included. Latency percentiles, averages and throughput are
//! computed over the *measured sample*: non-warmup trials that ended in
//! [`TrialOutcome::Success`](crate::trial::TrialOutcome::Success).
//!
//! Throughput is the sample size divided by the summed end-to-end latencies in seconds. This is
//! aggregate work time, not the wall-clock span of the run: with concurrency above one, the run
//! finishes faster than the sum suggests and true throughput is higher.

use serde::Serialize;

use crate::error::AggregationError;
use crate::trial::TrialRecord;

/// Summary of one run. A pure function of the records it was computed from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryStatistics {
    /// Label of the environment the run targeted.
    pub environment: String,
    /// Number of trial records, warmup included.
    pub total_tests: usize,
    /// Number of successful trials, warmup included.
    pub successful_tests: usize,
    /// Number of trials that timed out or failed.
    pub failed_tests: usize,
    /// Mean upload time of the measured sample.
    pub avg_upload_time_ms: f64,
    /// Mean end-to-end latency of the measured sample.
    pub avg_e2e_time_ms: f64,
    /// Mean reported processing time over the sample trials that reported one, `0` if none did.
    pub avg_processing_time_ms: f64,
    /// Median end-to-end latency.
    pub p50_e2e_ms: f64,
    /// 95th percentile end-to-end latency.
    pub p95_e2e_ms: f64,
    /// 99th percentile end-to-end latency.
    pub p99_e2e_ms: f64,
    /// Fastest end-to-end latency.
    pub min_e2e_ms: f64,
    /// Slowest end-to-end latency.
    pub max_e2e_ms: f64,
    /// Measured trials per second of summed end-to-end latency.
    pub throughput_files_per_sec: f64,
    /// Share of trials that did not succeed, in percent.
    pub error_rate_percent: f64,
    /// Number of warmup trials.
    pub cold_start_count: usize,
}

/// Summarizes `records` for `environment`.
///
/// Fails with [`AggregationError::NoSuccessfulTrials`] if no non-warmup trial succeeded, since
/// percentiles and throughput are undefined for an empty sample. The result does not depend on
/// the order of `records`.
pub fn summarize(
    environment: &str,
    records: &[TrialRecord],
) -> Result<SummaryStatistics, AggregationError> {
    let total_tests = records.len();
    let successful_tests = records.iter().filter(|r| r.is_success()).count();
    let cold_start_count = records.iter().filter(|r| r.is_warmup).count();

    let mut sample: Vec<&TrialRecord> = records
        .iter()
        .filter(|r| r.is_success() && !r.is_warmup)
        .collect();
    if sample.is_empty() {
        return Err(AggregationError::NoSuccessfulTrials { total: total_tests });
    }
    sample.sort_by(|a, b| a.end_to_end_latency_ms.total_cmp(&b.end_to_end_latency_ms));

    let e2e: Vec<f64> = sample.iter().map(|r| r.end_to_end_latency_ms).collect();
    let uploads: Vec<f64> = sample.iter().map(|r| r.upload_latency_ms).collect();
    let processing: Vec<f64> = sample
        .iter()
        .filter_map(|r| r.processing_latency_ms)
        .collect();

    let e2e_seconds = e2e.iter().sum::<f64>() / 1000.0;
    let throughput_files_per_sec = if e2e_seconds > 0.0 {
        e2e.len() as f64 / e2e_seconds
    } else {
        0.0
    };

    Ok(SummaryStatistics {
        environment: environment.to_owned(),
        total_tests,
        successful_tests,
        failed_tests: total_tests - successful_tests,
        avg_upload_time_ms: mean(&uploads),
        avg_e2e_time_ms: mean(&e2e),
        avg_processing_time_ms: mean(&processing),
        p50_e2e_ms: percentile(&e2e, 50.0),
        p95_e2e_ms: percentile(&e2e, 95.0),
        p99_e2e_ms: percentile(&e2e, 99.0),
        min_e2e_ms: e2e[0],
        max_e2e_ms: e2e[e2e.len() - 1],
        throughput_files_per_sec,
        error_rate_percent: (total_tests - successful_tests) as f64 / total_tests as f64 * 100.0,
        cold_start_count,
    })
}

/// Returns the `p`-th percentile of an ascending `sorted` sample.
///
/// Uses linear interpolation between closest ranks: the rank is `p / 100 * (n - 1)` and the value
/// is interpolated between the elements at the floor and ceiling of that rank. Returns `0` for an
/// empty sample.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };

    let rank = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
