//! Error types for the benchmark.
//!
//! Failures of individual trials are not errors at this level: they are recorded in the trial's
//! [`TrialOutcome`](crate::trial::TrialOutcome) and never abort a run. The types here cover what
//! can fail around the trials: configuration, summarizing and reporting.

use thiserror::Error;

/// Summary statistics cannot be computed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// No non-warmup trial succeeded, so latency percentiles and throughput are undefined.
    #[error("no successful test results to summarize ({total} trials recorded)")]
    NoSuccessfulTrials {
        /// Number of trial records that were available.
        total: usize,
    },
}

/// Error type for benchmark operations outside of individual trials.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Summarizing the run failed.
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Writing result files failed.
    #[error("failed to write report: {context}")]
    Report {
        /// The file being written.
        context: String,
        /// The underlying error.
        #[source]
        cause: ReportCause,
    },
}

/// Underlying cause of a [`BenchError::Report`].
#[derive(Debug, Error)]
pub enum ReportCause {
    /// Filesystem errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// CSV encoding errors.
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// JSON encoding errors.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for BenchError {
    fn from(err: figment::Error) -> Self {
        BenchError::Config(err.to_string())
    }
}

/// Result type for benchmark operations.
pub type BenchResult<T, E = BenchError> = Result<T, E>;
