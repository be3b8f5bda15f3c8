//! Command line entry point of the `pipelinebench` binary.

use std::error::Error;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::config::{Config, EnvironmentName};
use crate::orchestrator::{Orchestrator, RunSettings};
use crate::report::{FileSink, ResultSink, print_summary_table};
use crate::trial::TrialRunner;
use crate::workload::WorkloadGenerator;
use crate::{observability, stats};

/// Benchmark an event pipeline from artifact upload to completion record.
#[derive(Debug, FromArgs)]
struct Args {
    /// target environment, `local` or `aws`
    #[argh(option, short = 'e')]
    environment: EnvironmentName,

    /// number of trials per workload size
    #[argh(option, short = 'n', default = "10")]
    tests: usize,

    /// workload size in log lines, repeat for several sizes (default: 100, 500 and 1000)
    #[argh(option, short = 's')]
    sizes: Vec<NonZeroUsize>,

    /// directory for result files, a subdirectory per environment is created
    #[argh(option, short = 'o', default = "PathBuf::from(\"analysis/results\")")]
    output: PathBuf,

    /// number of sequential warmup trials
    #[argh(option, short = 'w', default = "2")]
    warmup: usize,

    /// maximum number of trials in flight
    #[argh(option, short = 'c', default = "10")]
    concurrency: usize,

    /// path to the YAML configuration file
    #[argh(option)]
    config: Option<PathBuf>,

    /// seed for reproducible payloads
    #[argh(option)]
    seed: Option<u64>,

    /// do not show a progress bar
    #[argh(switch, short = 'q')]
    quiet: bool,
}

impl Args {
    fn run_settings(&self, config: &Config) -> RunSettings {
        let defaults = RunSettings::default();
        RunSettings {
            sizes: if self.sizes.is_empty() {
                defaults.sizes
            } else {
                self.sizes.clone()
            },
            tests_per_size: self.tests,
            warmup_count: self.warmup,
            concurrency: self.concurrency,
            warmup_pause: config.trial.warmup_pause,
        }
    }
}

/// Bootstrap the runtime and run the benchmark.
///
/// Exits with a failure code if no summary could be computed. Individual failed or timed out
/// trials do not affect the exit code.
pub fn execute() -> Result<ExitCode> {
    let args: Args = argh::from_env();
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("pipelinebench")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: Config) -> Result<ExitCode> {
    let environment = args.environment;
    let settings = args.run_settings(&config);
    settings.validate()?;

    let stores = config
        .build_stores(environment)
        .await
        .context("failed to set up stores")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let runner = TrialRunner::new(environment.as_str(), stores.artifacts, stores.completions)
        .poll_settings(config.trial.poll_settings())
        .content_type(config.trial.content_type.clone())
        .cancellation(cancel);

    println!(
        "{} {} ({} trials, {} warmup, concurrency: {})",
        "## Running".bold(),
        environment.as_str().to_uppercase().bold().blue(),
        settings.main_trials().bold(),
        settings.warmup_count,
        settings.concurrency.bold()
    );

    let mut orchestrator =
        Orchestrator::new(runner, settings).with_progress(progress_bar(args.quiet)?);
    if let Some(seed) = args.seed {
        orchestrator = orchestrator.with_generator(WorkloadGenerator::seeded(seed));
    }

    let report = orchestrator.run().await?;
    let summary = stats::summarize(environment.as_str(), &report.records);

    let sink = FileSink::new(&args.output, environment.as_str());
    let paths = sink
        .write(&report.records, summary.as_ref().ok())
        .context("failed to write results")?;

    let summary = match summary {
        Ok(summary) => summary,
        Err(err) => {
            tracing::error!(error = &err as &dyn Error, "cannot summarize run");
            println!("{}", format!("NO SUMMARY: {err}").bold().red());
            return Ok(ExitCode::FAILURE);
        }
    };

    print_summary_table(&summary);
    println!(
        "  wall clock: {:.1?}; peak concurrency: {}",
        report.elapsed,
        report.peak_concurrency.bold()
    );
    if report.cancelled {
        println!("{}", "  run was cancelled, results are partial".yellow());
    }
    for path in [paths.results, paths.summary].into_iter().flatten() {
        println!("  wrote {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

fn progress_bar(quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }

    let bar = ProgressBar::new(0).with_style(ProgressStyle::with_template(
        "{msg} {wide_bar} {pos}/{len} {elapsed}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("received Ctrl-C, finishing in-flight trials");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["pipelinebench"], args).unwrap()
    }

    #[test]
    fn defaults_match_the_runner_script() {
        let args = parse(&["-e", "local"]);
        let settings = args.run_settings(&Config::default());

        assert_eq!(args.environment, EnvironmentName::Local);
        assert_eq!(args.output, PathBuf::from("analysis/results"));
        assert_eq!(settings, RunSettings::default());
    }

    #[test]
    fn sizes_can_be_repeated() {
        let args = parse(&["--environment", "aws", "-s", "10", "-s", "20", "-n", "3", "-c", "1"]);
        let settings = args.run_settings(&Config::default());

        let sizes: Vec<usize> = settings.sizes.iter().map(|s| s.get()).collect();
        assert_eq!(sizes, [10, 20]);
        assert_eq!(settings.tests_per_size, 3);
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn environment_is_required() {
        assert!(Args::from_args(&["pipelinebench"], &[]).is_err());
        assert!(Args::from_args(&["pipelinebench"], &["-e", "staging"]).is_err());
        assert!(Args::from_args(&["pipelinebench"], &["-e", "local", "-s", "0"]).is_err());
    }
}
