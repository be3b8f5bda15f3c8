//! Run-level scheduling of trials.
//!
//! A run always proceeds through three phases:
//!
//! 1. **Clear**: stale completion records from earlier runs are deleted. Failures are logged and
//!    the run continues.
//! 2. **Warmup**: `warmup_count` trials run strictly one after another with the first workload
//!    size, each followed by a fixed pause. They are recorded but excluded from latency
//!    statistics.
//! 3. **Main**: for every workload size in order, `tests_per_size` trials are dispatched with at
//!    most `concurrency` in flight. Records are collected in completion order, and all trials of a
//!    size are drained before the next size starts.
//!
//! Cancelling the run's token stops dispatch. Trials already in flight end as errors at their next
//! poll, are drained like any other, and the partial record set is returned.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use indicatif::ProgressBar;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::concurrency::ConcurrencyLimiter;
use crate::error::{BenchError, BenchResult};
use crate::trial::{TrialConfig, TrialRecord, TrialRunner};
use crate::workload::WorkloadGenerator;

/// Shape of a benchmark run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSettings {
    /// Workload sizes in log lines, processed in this order.
    pub sizes: Vec<NonZeroUsize>,
    /// Number of main-phase trials per workload size.
    pub tests_per_size: usize,
    /// Number of sequential warmup trials.
    pub warmup_count: usize,
    /// Maximum number of main-phase trials in flight.
    pub concurrency: usize,
    /// Pause after every warmup trial.
    pub warmup_pause: Duration,
}

impl RunSettings {
    /// Checks that the settings describe a runnable benchmark.
    pub fn validate(&self) -> BenchResult<()> {
        if self.concurrency == 0 {
            return Err(BenchError::Config("concurrency must be at least 1".to_owned()));
        }
        if self.warmup_count > 0 && self.sizes.is_empty() {
            return Err(BenchError::Config(
                "warmup trials need at least one workload size".to_owned(),
            ));
        }
        Ok(())
    }

    /// Number of trials a complete run records.
    pub fn total_trials(&self) -> usize {
        self.warmup_count + self.main_trials()
    }

    /// Number of main-phase trials.
    pub fn main_trials(&self) -> usize {
        self.sizes.len() * self.tests_per_size
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            sizes: [100, 500, 1000].into_iter().filter_map(NonZeroUsize::new).collect(),
            tests_per_size: 10,
            warmup_count: 2,
            concurrency: 10,
            warmup_pause: Duration::from_secs(1),
        }
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Records of all trials that ran, warmup first, main phase in completion order.
    pub records: Vec<TrialRecord>,
    /// Number of stale completion records deleted, `None` if clearing failed.
    pub cleared: Option<usize>,
    /// Highest number of main-phase trials in flight at the same time.
    pub peak_concurrency: usize,
    /// Wall-clock duration of the warmup and main phases.
    pub elapsed: Duration,
    /// Whether the run was cancelled before all trials were dispatched.
    pub cancelled: bool,
}

/// Drives a [`TrialRunner`] through the phases of a run.
pub struct Orchestrator {
    runner: Arc<TrialRunner>,
    settings: RunSettings,
    generator: WorkloadGenerator,
    progress: ProgressBar,
}

impl Orchestrator {
    /// Creates an orchestrator with a randomly seeded workload generator and no progress output.
    pub fn new(runner: TrialRunner, settings: RunSettings) -> Self {
        Self {
            runner: Arc::new(runner),
            settings,
            generator: WorkloadGenerator::new(),
            progress: ProgressBar::hidden(),
        }
    }

    /// Uses `generator` as the source of all trial payloads.
    pub fn with_generator(mut self, generator: WorkloadGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Reports main-phase progress on `bar`. Its length is set when the main phase starts.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = bar;
        self
    }

    /// Executes the run.
    ///
    /// Only invalid settings fail the run. Trial failures are part of the returned records.
    pub async fn run(mut self) -> BenchResult<RunReport> {
        self.settings.validate()?;

        let cleared = self.clear().await;
        let started = Instant::now();

        let mut records = Vec::with_capacity(self.settings.total_trials());
        self.warmup(&mut records).await;
        let peak_concurrency = self.main(&mut records).await;

        let cancelled = self.runner.cancel_token().is_cancelled();
        if cancelled {
            tracing::warn!(
                recorded = records.len(),
                planned = self.settings.total_trials(),
                "run cancelled, reporting partial results"
            );
        }

        Ok(RunReport {
            records,
            cleared,
            peak_concurrency,
            elapsed: started.elapsed(),
            cancelled,
        })
    }

    async fn clear(&self) -> Option<usize> {
        let store = self.runner.completions();
        tracing::info!(store = store.name(), "clearing stale completion records");

        match store.clear_all().await {
            Ok(deleted) => {
                tracing::info!(deleted, "cleared completion records");
                Some(deleted)
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn Error,
                    "failed to clear completion records, continuing"
                );
                None
            }
        }
    }

    async fn warmup(&mut self, records: &mut Vec<TrialRecord>) {
        let count = self.settings.warmup_count;
        let Some(&size) = self.settings.sizes.first() else {
            return;
        };
        if count == 0 {
            return;
        }

        let cancel = self.runner.cancel_token().clone();
        tracing::info!(count, lines = size.get(), "starting warmup");

        for sequence in 1..=count {
            if cancel.is_cancelled() {
                return;
            }

            let config = TrialConfig {
                workload_size: size,
                is_warmup: true,
                sequence,
            };
            let record = self.runner.run(config, self.generator.fork()).await;
            log_finished(&record, sequence, count);
            records.push(record);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.warmup_pause) => {}
            }
        }
    }

    async fn main(&mut self, records: &mut Vec<TrialRecord>) -> usize {
        let limiter = ConcurrencyLimiter::new(self.settings.concurrency);
        let cancel = self.runner.cancel_token().clone();
        let per_size = self.settings.tests_per_size;

        self.progress.set_length(self.settings.main_trials() as u64);
        self.progress.set_position(0);

        for &size in &self.settings.sizes {
            if cancel.is_cancelled() {
                break;
            }

            tracing::info!(
                lines = size.get(),
                trials = per_size,
                concurrency = self.settings.concurrency,
                "starting main phase for workload size"
            );
            self.progress.set_message(format!("{size} lines"));

            let mut tasks = JoinSet::new();
            let mut dispatched = HashMap::new();
            for sequence in 1..=per_size {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = limiter.acquire() => permit,
                };

                let runner = Arc::clone(&self.runner);
                let generator = self.generator.fork();
                let config = TrialConfig {
                    workload_size: size,
                    is_warmup: false,
                    sequence,
                };
                let handle = tasks.spawn(async move {
                    let _permit = permit;
                    let record = runner.run(config, generator).await;
                    (sequence, record)
                });
                dispatched.insert(handle.id(), config);
            }

            // Drain every trial of this size before moving on, in completion order.
            while let Some(joined) = tasks.join_next().await {
                let (sequence, record) = match joined {
                    Ok(finished) => finished,
                    Err(err) => {
                        tracing::error!(error = &err as &dyn Error, "trial task failed");
                        let Some(config) = dispatched.remove(&err.id()) else {
                            continue;
                        };
                        let detail = format!("trial task failed: {err}");
                        (config.sequence, self.runner.lost_record(config, detail))
                    }
                };

                log_finished(&record, sequence, per_size);
                self.progress.inc(1);
                records.push(record);
            }
        }

        self.progress.finish_and_clear();
        limiter.peak_permits()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runner", &self.runner)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn log_finished(record: &TrialRecord, sequence: usize, of: usize) {
    tracing::info!(
        trial = %record.trial_id,
        warmup = record.is_warmup,
        lines = record.workload_size,
        payload = %ByteSize::b(record.payload_bytes),
        outcome = %record.outcome,
        e2e_ms = record.end_to_end_latency_ms.round() as u64,
        processing_ms = record.processing_latency_ms.map(|ms| ms.round() as u64),
        "trial {sequence}/{of} finished"
    );
}
