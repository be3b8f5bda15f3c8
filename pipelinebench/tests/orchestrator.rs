//! Full runs against the in-memory stores with a simulated processor.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use pipelinebench::trial::{CANCELLED_DETAIL, TIMEOUT_DETAIL};
use pipelinebench::{
    AggregationError, Orchestrator, PollSettings, RunReport, RunSettings, TrialOutcome,
    TrialRunner, WorkloadGenerator, summarize,
};
use pipelinebench_stores::{
    ArtifactStore, CompletionRecord, InMemoryArtifactStore, InMemoryCompletionStore,
    SimulatedProcessor, StoreResult,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const ENV: &str = "local";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("pipelinebench=debug,pipelinebench_stores=debug"))
        .try_init();
}

struct Pipeline {
    artifacts: InMemoryArtifactStore,
    completions: InMemoryCompletionStore,
    cancel: CancellationToken,
    poll: PollSettings,
}

impl Pipeline {
    fn new(processor: impl FnOnce(InMemoryCompletionStore) -> SimulatedProcessor) -> Self {
        init_tracing();

        let completions = InMemoryCompletionStore::new();
        let artifacts = InMemoryArtifactStore::new().with_processor(processor(completions.clone()));

        Self {
            artifacts,
            completions,
            cancel: CancellationToken::new(),
            poll: PollSettings::default(),
        }
    }

    /// Every artifact completes after `delay`.
    fn completing_after(delay: Duration) -> Self {
        Self::new(|completions| SimulatedProcessor::new(completions, delay))
    }

    fn orchestrator(&self, settings: RunSettings) -> Orchestrator {
        let runner = TrialRunner::new(
            ENV,
            Arc::new(self.artifacts.clone()),
            Arc::new(self.completions.clone()),
        )
        .poll_settings(self.poll)
        .cancellation(self.cancel.clone());

        Orchestrator::new(runner, settings).with_generator(WorkloadGenerator::seeded(42))
    }

    async fn run(&self, settings: RunSettings) -> RunReport {
        self.orchestrator(settings).run().await.unwrap()
    }
}

fn settings(sizes: &[usize], tests_per_size: usize, warmup: usize, concurrency: usize) -> RunSettings {
    RunSettings {
        sizes: sizes.iter().filter_map(|&s| NonZeroUsize::new(s)).collect(),
        tests_per_size,
        warmup_count: warmup,
        concurrency,
        warmup_pause: Duration::from_secs(1),
    }
}

#[tokio::test(start_paused = true)]
async fn all_trials_succeed_with_tight_latencies() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(400));

    let report = pipeline.run(settings(&[100], 5, 0, 5)).await;
    let summary = summarize(ENV, &report.records).unwrap();

    assert_eq!(summary.total_tests, 5);
    assert_eq!(summary.successful_tests, 5);
    assert_eq!(summary.failed_tests, 0);
    assert_eq!(summary.cold_start_count, 0);
    assert_eq!(summary.error_rate_percent, 0.0);
    assert!(summary.p99_e2e_ms - summary.p50_e2e_ms <= 250.0);
    assert!(summary.p50_e2e_ms <= summary.p95_e2e_ms);
    assert!(summary.p95_e2e_ms <= summary.p99_e2e_ms);
    assert!(summary.p99_e2e_ms < 1_000.0);

    for record in &report.records {
        assert_eq!(record.workload_size, 100);
        assert_eq!(record.processing_latency_ms, Some(400.0));
        assert!(!record.is_warmup);
    }
    assert_eq!(pipeline.artifacts.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn missing_completion_times_out() {
    // The processor swallows every artifact.
    let pipeline = Pipeline::new(|completions| {
        SimulatedProcessor::new(completions, Duration::from_millis(10)).drop_every(1)
    });

    let report = pipeline.run(settings(&[100], 1, 0, 1)).await;

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.outcome, TrialOutcome::Timeout);
    assert_eq!(record.processing_latency_ms, None);
    assert_eq!(record.error_detail.as_deref(), Some(TIMEOUT_DETAIL));
    assert!(record.end_to_end_latency_ms >= 180_000.0);
    assert!(record.end_to_end_latency_ms <= 180_250.0);

    assert_eq!(
        summarize(ENV, &report.records),
        Err(AggregationError::NoSuccessfulTrials { total: 1 })
    );
}

#[tokio::test(start_paused = true)]
async fn warmup_is_recorded_but_not_measured() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(400));

    let report = pipeline.run(settings(&[100], 10, 2, 5)).await;
    let summary = summarize(ENV, &report.records).unwrap();

    assert_eq!(summary.total_tests, 12);
    assert_eq!(summary.successful_tests, 12);
    assert_eq!(summary.cold_start_count, 2);

    // Warmup runs first and alone.
    assert!(report.records[..2].iter().all(|r| r.is_warmup));
    assert!(report.records[2..].iter().all(|r| !r.is_warmup));

    let measured: Vec<_> = report.records[2..].to_vec();
    let main_only = summarize(ENV, &measured).unwrap();
    assert_eq!(summary.p50_e2e_ms, main_only.p50_e2e_ms);
    assert_eq!(summary.p95_e2e_ms, main_only.p95_e2e_ms);
    assert_eq!(summary.p99_e2e_ms, main_only.p99_e2e_ms);
    assert_eq!(summary.throughput_files_per_sec, main_only.throughput_files_per_sec);
}

#[tokio::test(start_paused = true)]
async fn stale_records_are_cleared_in_batches() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(100));
    for i in 0..57 {
        pipeline
            .completions
            .insert(CompletionRecord::new(format!("stale{i:03}")));
    }

    let report = pipeline.run(settings(&[10], 1, 0, 1)).await;

    assert_eq!(report.cleared, Some(57));
    assert_eq!(pipeline.completions.delete_batches(), vec![25, 25, 7]);
    for i in 0..57 {
        assert!(!pipeline.completions.contains(&format!("stale{i:03}")));
    }
    // The new trial's record is the only one left.
    assert_eq!(pipeline.completions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_clear_does_not_stop_the_run() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(100));
    pipeline.completions.fail_scans(true);

    let report = pipeline.run(settings(&[10], 3, 0, 2)).await;

    assert_eq!(report.cleared, None);
    assert_eq!(report.records.len(), 3);
    assert!(report.records.iter().all(|r| r.is_success()));
}

#[tokio::test(start_paused = true)]
async fn in_flight_trials_never_exceed_concurrency() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(700));

    let report = pipeline.run(settings(&[10, 20], 12, 0, 3)).await;

    assert_eq!(report.records.len(), 24);
    assert_eq!(report.peak_concurrency, 3);
    assert!(report.records.iter().all(|r| r.is_success()));

    // Sizes are processed in order and drained one after another.
    assert!(report.records[..12].iter().all(|r| r.workload_size == 10));
    assert!(report.records[12..].iter().all(|r| r.workload_size == 20));

    // Three at a time, each taking 750ms: eight rounds per size.
    assert!(report.elapsed >= Duration::from_millis(2 * 4 * 750));
}

#[tokio::test(start_paused = true)]
async fn each_trial_runs_exactly_once() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(50));

    let report = pipeline.run(settings(&[1, 2, 3], 4, 1, 10)).await;

    assert_eq!(report.records.len(), 13);
    assert_eq!(pipeline.artifacts.len(), 13);

    let mut ids: Vec<_> = report.records.iter().map(|r| r.trial_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 13);
}

#[tokio::test(start_paused = true)]
async fn upload_failures_are_recorded_without_polling() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(50));
    pipeline.artifacts.fail_uploads(true);

    let report = pipeline.run(settings(&[10], 4, 1, 2)).await;

    assert_eq!(report.records.len(), 5);
    for record in &report.records {
        assert_eq!(record.outcome, TrialOutcome::Error);
        assert!(record.error_detail.as_deref().unwrap().starts_with("upload failed"));
    }
    assert_eq!(pipeline.completions.lookup_count(), 0);
    assert_eq!(
        summarize(ENV, &report.records),
        Err(AggregationError::NoSuccessfulTrials { total: 5 })
    );
}

#[tokio::test(start_paused = true)]
async fn partial_failures_raise_the_error_rate() {
    let mut pipeline = Pipeline::new(|completions| {
        SimulatedProcessor::new(completions, Duration::from_millis(100)).drop_every(4)
    });
    pipeline.poll = PollSettings {
        timeout: Duration::from_secs(2),
        interval: Duration::from_millis(250),
    };

    let report = pipeline.run(settings(&[10], 8, 0, 1)).await;
    let summary = summarize(ENV, &report.records).unwrap();

    assert_eq!(summary.total_tests, 8);
    assert_eq!(summary.successful_tests, 6);
    assert_eq!(summary.failed_tests, 2);
    assert_eq!(summary.error_rate_percent, 25.0);
    // Timed out trials do not leak into the latency figures.
    assert!(summary.max_e2e_ms < 2_000.0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_drains_in_flight_trials() {
    let pipeline = Pipeline::new(|completions| {
        SimulatedProcessor::new(completions, Duration::from_millis(10)).drop_every(1)
    });

    let cancel = pipeline.cancel.clone();
    let canceller = async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    };

    let (report, ()) = tokio::join!(pipeline.run(settings(&[10, 20], 10, 0, 4)), canceller);

    assert!(report.cancelled);
    assert_eq!(report.records.len(), 4);
    for record in &report.records {
        assert_eq!(record.outcome, TrialOutcome::Error);
        assert_eq!(record.error_detail.as_deref(), Some(CANCELLED_DETAIL));
    }
    assert!(report.elapsed < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_warmup_skips_main_phase() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(100));

    let cancel = pipeline.cancel.clone();
    let canceller = async move {
        // After the first warmup trial, during its pause.
        tokio::time::sleep(Duration::from_millis(800)).await;
        cancel.cancel();
    };

    let (report, ()) = tokio::join!(pipeline.run(settings(&[10], 10, 3, 4)), canceller);

    assert!(report.cancelled);
    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].is_warmup);
    assert!(report.records[0].is_success());
}

/// Forwards uploads to an in-memory store, but panics on the `nth` one.
#[derive(Debug)]
struct PanicOnUpload {
    inner: InMemoryArtifactStore,
    nth: usize,
    uploads: AtomicUsize,
}

#[async_trait::async_trait]
impl ArtifactStore for PanicOnUpload {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StoreResult<()> {
        if self.uploads.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            panic!("upload {} exploded", self.nth);
        }
        self.inner.put(key, body, content_type).await
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_trial_is_recorded_as_error() {
    let pipeline = Pipeline::completing_after(Duration::from_millis(100));
    let artifacts = PanicOnUpload {
        inner: pipeline.artifacts.clone(),
        nth: 2,
        uploads: AtomicUsize::new(0),
    };
    let runner = TrialRunner::new(
        ENV,
        Arc::new(artifacts),
        Arc::new(pipeline.completions.clone()),
    );

    let report = Orchestrator::new(runner, settings(&[10], 4, 0, 2))
        .with_generator(WorkloadGenerator::seeded(42))
        .run()
        .await
        .unwrap();

    assert_eq!(report.records.len(), 4);
    let failed: Vec<_> = report.records.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].outcome, TrialOutcome::Error);
    assert_eq!(failed[0].workload_size, 10);
    assert!(failed[0].error_detail.as_deref().unwrap().starts_with("trial task failed"));

    let summary = summarize(ENV, &report.records).unwrap();
    assert_eq!(summary.successful_tests, 3);
    assert_eq!(summary.error_rate_percent, 25.0);
}
