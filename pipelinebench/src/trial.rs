//! Execution of a single trial.
//!
//! A trial moves through `Dispatched -> Uploading -> Polling` and ends in exactly one
//! [`TrialOutcome`]:
//!
//! - An upload failure ends the trial as [`TrialOutcome::Error`] without polling.
//! - Once uploaded, the completion store is polled at a fixed interval until a record appears
//!   ([`TrialOutcome::Success`]) or the deadline passes ([`TrialOutcome::Timeout`]).
//! - Lookup errors while polling are logged and polling continues; only the deadline (or a
//!   cancelled run) ends the loop.
//!
//! End-to-end latency is measured from just before the upload call until the terminal
//! transition. Payload generation happens before the clock starts.

use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipelinebench_stores::{ArtifactStore, CompletionRecord, CompletionStore, StoreError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::id::TrialId;
use crate::workload::WorkloadGenerator;

/// Error detail recorded for trials whose completion record never appeared.
pub const TIMEOUT_DETAIL: &str = "no result received within timeout";

/// Error detail recorded for trials interrupted by a cancelled run.
pub const CANCELLED_DETAIL: &str = "run cancelled";

/// Immutable description of a trial, created by the orchestrator before dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrialConfig {
    /// Number of log lines in the payload.
    pub workload_size: NonZeroUsize,
    /// Whether this is a warmup (cold) trial.
    pub is_warmup: bool,
    /// Position of the trial within its phase and workload size, starting at 1.
    pub sequence: usize,
}

/// Terminal state of a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrialOutcome {
    /// A completion record was found before the deadline.
    Success,
    /// No completion record appeared before the deadline.
    Timeout,
    /// The upload failed, or the run was cancelled while the trial was in flight.
    Error,
}

impl TrialOutcome {
    /// The lowercase label used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            TrialOutcome::Success => "success",
            TrialOutcome::Timeout => "timeout",
            TrialOutcome::Error => "error",
        }
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one trial. Created once by [`TrialRunner::run`] and never modified.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialRecord {
    /// Random id shared by the artifact key and the completion record.
    pub trial_id: TrialId,
    /// Label of the environment the trial ran against.
    pub environment: String,
    /// Wall-clock time the trial was started.
    pub created_at: DateTime<Utc>,
    /// Size of the uploaded payload.
    pub payload_bytes: u64,
    /// Number of log lines in the payload.
    pub workload_size: usize,
    /// Duration of the upload call.
    pub upload_latency_ms: f64,
    /// Time from just before the upload until the trial's terminal transition.
    pub end_to_end_latency_ms: f64,
    /// Processing time reported by the processor, if it reported one.
    pub processing_latency_ms: Option<f64>,
    /// How the trial ended.
    pub outcome: TrialOutcome,
    /// Reason for a non-successful outcome. Present iff `outcome` is not `Success`.
    pub error_detail: Option<String>,
    /// Whether the trial was part of the warmup phase.
    pub is_warmup: bool,
}

impl TrialRecord {
    /// Returns `true` if the trial succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome == TrialOutcome::Success
    }
}

/// Timing of the completion poll loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    /// How long to wait for a completion record after the upload finished.
    pub timeout: Duration,
    /// Pause between two lookups.
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_millis(250),
        }
    }
}

enum PollResult {
    Completed(CompletionRecord),
    TimedOut,
    Cancelled,
}

/// Executes trials end to end against a pair of stores.
///
/// The runner is shared by all workers. The stores are called concurrently without additional
/// locking.
#[derive(Debug)]
pub struct TrialRunner {
    environment: String,
    artifacts: Arc<dyn ArtifactStore>,
    completions: Arc<dyn CompletionStore>,
    poll: PollSettings,
    content_type: String,
    cancel: CancellationToken,
}

impl TrialRunner {
    /// Creates a runner with default poll settings and a JSON content type.
    pub fn new(
        environment: impl Into<String>,
        artifacts: Arc<dyn ArtifactStore>,
        completions: Arc<dyn CompletionStore>,
    ) -> Self {
        Self {
            environment: environment.into(),
            artifacts,
            completions,
            poll: PollSettings::default(),
            content_type: "application/json".to_owned(),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the poll timeout and interval.
    pub fn poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Overrides the content type sent with uploads.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Aborts in-flight polls once `cancel` fires.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn completions(&self) -> &dyn CompletionStore {
        self.completions.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record for a trial that never produced one of its own, e.g. because its task panicked.
    ///
    /// Carries a fresh id and zero latencies.
    pub(crate) fn lost_record(&self, config: TrialConfig, detail: String) -> TrialRecord {
        TrialRecord {
            trial_id: TrialId::random(),
            environment: self.environment.clone(),
            created_at: Utc::now(),
            payload_bytes: 0,
            workload_size: config.workload_size.get(),
            upload_latency_ms: 0.0,
            end_to_end_latency_ms: 0.0,
            processing_latency_ms: None,
            outcome: TrialOutcome::Error,
            error_detail: Some(detail),
            is_warmup: config.is_warmup,
        }
    }

    /// Runs one trial to completion and returns its record.
    ///
    /// This never fails: upload errors, timeouts and cancellation are all encoded in the
    /// record's [`TrialOutcome`].
    pub async fn run(&self, config: TrialConfig, mut generator: WorkloadGenerator) -> TrialRecord {
        let trial_id = TrialId::random();
        let created_at = Utc::now();
        let key = trial_id.artifact_key(u64::try_from(created_at.timestamp()).unwrap_or_default());

        tracing::debug!(
            trial = %trial_id,
            sequence = config.sequence,
            lines = config.workload_size.get(),
            warmup = config.is_warmup,
            "generating payload"
        );
        let payload = generator.generate(config.workload_size);
        let payload_bytes = payload.len() as u64;

        let finish = |upload: Duration,
                      end_to_end: Duration,
                      outcome: TrialOutcome,
                      processing_latency_ms: Option<f64>,
                      error_detail: Option<String>| TrialRecord {
            trial_id: trial_id.clone(),
            environment: self.environment.clone(),
            created_at,
            payload_bytes,
            workload_size: config.workload_size.get(),
            upload_latency_ms: as_millis(upload),
            end_to_end_latency_ms: as_millis(end_to_end),
            processing_latency_ms,
            outcome,
            error_detail,
            is_warmup: config.is_warmup,
        };

        tracing::debug!(trial = %trial_id, %key, bytes = payload_bytes, "uploading");
        let started = Instant::now();
        let uploaded = self
            .artifacts
            .put(key.as_str(), payload, &self.content_type)
            .await;
        let upload_latency = started.elapsed();

        if let Err(err) = uploaded {
            tracing::warn!(
                trial = %trial_id,
                error = &err as &dyn Error,
                "upload failed, not polling"
            );
            return finish(
                upload_latency,
                started.elapsed(),
                TrialOutcome::Error,
                None,
                Some(error_detail(err)),
            );
        }

        tracing::debug!(trial = %trial_id, "waiting for completion record");
        let polled = self.poll(&trial_id).await;
        let end_to_end = started.elapsed();

        match polled {
            PollResult::Completed(completion) => finish(
                upload_latency,
                end_to_end,
                TrialOutcome::Success,
                completion.processing_time_ms,
                None,
            ),
            PollResult::TimedOut => finish(
                upload_latency,
                end_to_end,
                TrialOutcome::Timeout,
                None,
                Some(TIMEOUT_DETAIL.to_owned()),
            ),
            PollResult::Cancelled => finish(
                upload_latency,
                end_to_end,
                TrialOutcome::Error,
                None,
                Some(CANCELLED_DETAIL.to_owned()),
            ),
        }
    }

    /// Polls for the trial's completion record until it appears or the deadline passes.
    ///
    /// Both the sleeps and the lookups are cut short at the deadline. A lookup that is already
    /// complete when the deadline passes still counts.
    async fn poll(&self, trial_id: &TrialId) -> PollResult {
        let deadline = Instant::now() + self.poll.timeout;

        loop {
            let lookup = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollResult::Cancelled,
                lookup = self.completions.get(trial_id.as_str()) => lookup,
                _ = tokio::time::sleep_until(deadline) => return PollResult::TimedOut,
            };

            match lookup {
                Ok(Some(completion)) => return PollResult::Completed(completion),
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    trial = %trial_id,
                    error = &err as &dyn Error,
                    "lookup failed, continuing to poll"
                ),
            }

            let now = Instant::now();
            if now >= deadline {
                return PollResult::TimedOut;
            }

            let wake = (now + self.poll.interval).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollResult::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Renders an error with all of its sources, e.g. `upload failed: s3://b/k: connection reset`.
fn error_detail(err: StoreError) -> String {
    format!("{:#}", anyhow::Error::new(err))
}
