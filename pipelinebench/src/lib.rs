//! End-to-end latency benchmark for an event-driven pipeline.
//!
//! Each *trial* uploads a synthetic log payload to an artifact store and then polls a completion
//! store until the downstream processor has recorded the artifact as handled. The time between
//! the two is the end-to-end latency of the pipeline.
//!
//! - [`workload`] generates the payloads.
//! - [`trial`] runs a single trial and classifies its outcome.
//! - [`orchestrator`] runs warmup and main phases with bounded concurrency.
//! - [`stats`] reduces trial records into percentiles, throughput and error rate.
//! - [`report`] writes CSV and JSON result files and prints the summary.
//!
//! The stores themselves live in the `pipelinebench-stores` crate.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
mod concurrency;
pub mod config;
pub mod error;
pub mod id;
pub mod observability;
pub mod orchestrator;
pub mod report;
pub mod stats;
pub mod trial;
pub mod workload;

pub use error::{AggregationError, BenchError, BenchResult};
pub use orchestrator::{Orchestrator, RunReport, RunSettings};
pub use stats::{SummaryStatistics, summarize};
pub use trial::{PollSettings, TrialConfig, TrialOutcome, TrialRecord, TrialRunner};
pub use workload::WorkloadGenerator;
