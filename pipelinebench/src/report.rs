//! Persisting and presenting run results.
//!
//! A [`ResultSink`] receives all trial records of a run plus the summary, if one could be
//! computed. [`FileSink`] writes them as CSV and JSON next to a `latest` copy, so dashboards can
//! always read the most recent run from a fixed path.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use yansi::Paint;

use crate::error::{BenchError, BenchResult, ReportCause};
use crate::stats::SummaryStatistics;
use crate::trial::TrialRecord;

const CSV_HEADER: [&str; 11] = [
    "test_id",
    "environment",
    "timestamp",
    "file_size_bytes",
    "line_count",
    "upload_time_ms",
    "end_to_end_time_ms",
    "processing_time_ms",
    "status",
    "error_message",
    "cold_start",
];

/// Files written by a [`ResultSink`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportPaths {
    /// Per-trial results of this run.
    pub results: Option<PathBuf>,
    /// Summary of this run, if one was computed.
    pub summary: Option<PathBuf>,
}

/// Destination for the results of a run.
pub trait ResultSink {
    /// Persists all `records` and, if present, the `summary`.
    ///
    /// Records must be written even without a summary, so that failed runs can be inspected.
    fn write(
        &self,
        records: &[TrialRecord],
        summary: Option<&SummaryStatistics>,
    ) -> BenchResult<ReportPaths>;
}

/// Writes CSV results and JSON summaries into a per-environment directory.
///
/// For environment `local` and output directory `out`, a run creates:
///
/// - `out/local/results_local_{YYYYmmdd_HHMMSS}.csv` and `out/local/results_local_latest.csv`
/// - `out/local/summary_local_{YYYYmmdd_HHMMSS}.json` and `out/local/summary_local_latest.json`
#[derive(Clone, Debug)]
pub struct FileSink {
    directory: PathBuf,
    environment: String,
    timestamp: DateTime<Utc>,
}

impl FileSink {
    /// Creates a sink below `output` for `environment`, stamped with the current time.
    pub fn new(output: impl AsRef<Path>, environment: impl Into<String>) -> Self {
        let environment = environment.into();
        Self {
            directory: output.as_ref().join(&environment),
            environment,
            timestamp: Utc::now(),
        }
    }

    /// Overrides the time used in file names.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn path(&self, kind: &str, suffix: &str, extension: &str) -> PathBuf {
        self.directory
            .join(format!("{kind}_{}_{suffix}.{extension}", self.environment))
    }

    fn write_results(&self, records: &[TrialRecord]) -> BenchResult<PathBuf> {
        let stamp = self.timestamp.format("%Y%m%d_%H%M%S").to_string();
        let path = self.path("results", &stamp, "csv");

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(|err| report_error(&path, err))?;

        writer
            .write_record(CSV_HEADER)
            .map_err(|err| report_error(&path, err))?;
        for record in records {
            writer
                .serialize(CsvRow::from(record))
                .map_err(|err| report_error(&path, err))?;
        }
        writer.flush().map_err(|err| report_error(&path, err))?;

        self.copy_latest(&path, self.path("results", "latest", "csv"))?;
        Ok(path)
    }

    fn write_summary(&self, summary: &SummaryStatistics) -> BenchResult<PathBuf> {
        let stamp = self.timestamp.format("%Y%m%d_%H%M%S").to_string();
        let path = self.path("summary", &stamp, "json");

        let json = serde_json::to_vec_pretty(summary).map_err(|err| report_error(&path, err))?;
        fs::write(&path, json).map_err(|err| report_error(&path, err))?;

        self.copy_latest(&path, self.path("summary", "latest", "json"))?;
        Ok(path)
    }

    fn copy_latest(&self, from: &Path, to: PathBuf) -> BenchResult<()> {
        fs::copy(from, &to).map_err(|err| report_error(&to, err))?;
        Ok(())
    }
}

impl ResultSink for FileSink {
    fn write(
        &self,
        records: &[TrialRecord],
        summary: Option<&SummaryStatistics>,
    ) -> BenchResult<ReportPaths> {
        fs::create_dir_all(&self.directory).map_err(|err| report_error(&self.directory, err))?;

        let results = self.write_results(records)?;
        tracing::info!(path = %results.display(), records = records.len(), "wrote results");

        let summary = match summary {
            Some(summary) => {
                let path = self.write_summary(summary)?;
                tracing::info!(path = %path.display(), "wrote summary");
                Some(path)
            }
            None => None,
        };

        Ok(ReportPaths {
            results: Some(results),
            summary,
        })
    }
}

fn report_error(path: &Path, cause: impl Into<ReportCause>) -> BenchError {
    BenchError::Report {
        context: path.display().to_string(),
        cause: cause.into(),
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    test_id: &'a str,
    environment: &'a str,
    timestamp: String,
    file_size_bytes: u64,
    line_count: usize,
    upload_time_ms: f64,
    end_to_end_time_ms: f64,
    processing_time_ms: Option<f64>,
    status: &'static str,
    error_message: Option<&'a str>,
    cold_start: bool,
}

impl<'a> From<&'a TrialRecord> for CsvRow<'a> {
    fn from(record: &'a TrialRecord) -> Self {
        Self {
            test_id: record.trial_id.as_str(),
            environment: &record.environment,
            timestamp: record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            file_size_bytes: record.payload_bytes,
            line_count: record.workload_size,
            upload_time_ms: record.upload_latency_ms,
            end_to_end_time_ms: record.end_to_end_latency_ms,
            processing_time_ms: record.processing_latency_ms,
            status: record.outcome.as_str(),
            error_message: record.error_detail.as_deref(),
            cold_start: record.is_warmup,
        }
    }
}

/// Prints `summary` as a table on stdout.
pub fn print_summary_table(summary: &SummaryStatistics) {
    let mut stdout = io::stdout().lock();
    // Write errors on stdout are ignored.
    let _ = write_summary_table(&mut stdout, summary);
}

/// Writes `summary` as a human readable table.
pub fn write_summary_table(out: &mut impl Write, summary: &SummaryStatistics) -> io::Result<()> {
    writeln!(out)?;
    writeln!(
        out,
        "{} {}",
        "## SUMMARY".bold(),
        summary.environment.as_str().bold().blue()
    )?;

    let failures = if summary.failed_tests > 0 {
        summary.failed_tests.red().bold()
    } else {
        summary.failed_tests.green().bold()
    };
    writeln!(
        out,
        "  tests: {} total, {} successful, {} failed ({:.1}% errors), {} cold starts",
        summary.total_tests.bold(),
        summary.successful_tests.green().bold(),
        failures,
        summary.error_rate_percent,
        summary.cold_start_count,
    )?;

    writeln!(out, "  {}", "end-to-end latency:".bold())?;
    let rows = [
        ("avg", summary.avg_e2e_time_ms),
        ("p50", summary.p50_e2e_ms),
        ("p95", summary.p95_e2e_ms),
        ("p99", summary.p99_e2e_ms),
        ("min", summary.min_e2e_ms),
        ("max", summary.max_e2e_ms),
    ];
    for (label, value) in rows {
        writeln!(out, "    {label:<4} {:>8.0} ms", value.bold())?;
    }

    writeln!(
        out,
        "  upload avg: {:.0} ms; processing avg: {:.0} ms",
        summary.avg_upload_time_ms.bold(),
        summary.avg_processing_time_ms.bold()
    )?;
    writeln!(
        out,
        "  throughput: {:.2} files/s",
        summary.throughput_files_per_sec.bold()
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::id::TrialId;
    use crate::stats::summarize;
    use crate::trial::{TIMEOUT_DETAIL, TrialOutcome};

    fn record(outcome: TrialOutcome, is_warmup: bool) -> TrialRecord {
        let success = outcome == TrialOutcome::Success;
        TrialRecord {
            trial_id: TrialId::random(),
            environment: "local".to_owned(),
            created_at: Utc::now(),
            payload_bytes: 2048,
            workload_size: 10,
            upload_latency_ms: 12.5,
            end_to_end_latency_ms: 640.0,
            processing_latency_ms: success.then_some(300.0),
            outcome,
            error_detail: (!success).then(|| TIMEOUT_DETAIL.to_owned()),
            is_warmup,
        }
    }

    fn sink(dir: &Path) -> FileSink {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        FileSink::new(dir, "local").with_timestamp(timestamp)
    }

    #[test]
    fn writes_results_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            record(TrialOutcome::Success, true),
            record(TrialOutcome::Success, false),
            record(TrialOutcome::Timeout, false),
        ];
        let summary = summarize("local", &records).unwrap();

        let paths = sink(dir.path()).write(&records, Some(&summary)).unwrap();

        let env_dir = dir.path().join("local");
        assert_eq!(
            paths.results,
            Some(env_dir.join("results_local_20240309_140507.csv"))
        );
        assert_eq!(
            paths.summary,
            Some(env_dir.join("summary_local_20240309_140507.json"))
        );
        assert!(env_dir.join("results_local_latest.csv").exists());
        assert!(env_dir.join("summary_local_latest.json").exists());

        let mut reader = csv::Reader::from_path(env_dir.join("results_local_latest.csv")).unwrap();
        let header: Vec<&str> = reader.headers().unwrap().iter().collect();
        assert_eq!(header, CSV_HEADER);

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], records[0].trial_id.as_str());
        assert_eq!(&rows[0][8], "success");
        assert_eq!(&rows[0][10], "true");
        assert_eq!(&rows[2][7], "");
        assert_eq!(&rows[2][8], "timeout");
        assert_eq!(&rows[2][9], TIMEOUT_DETAIL);

        let json = fs::read_to_string(env_dir.join("summary_local_latest.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["environment"], "local");
        assert_eq!(value["total_tests"], 3);
        assert_eq!(value["successful_tests"], 2);
        assert_eq!(value["failed_tests"], 1);
        assert_eq!(value["cold_start_count"], 1);
        assert!(value["p99_e2e_ms"].is_number());
        assert!(value["throughput_files_per_sec"].is_number());
    }

    #[test]
    fn writes_records_without_summary() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record(TrialOutcome::Error, false)];

        let paths = sink(dir.path()).write(&records, None).unwrap();

        assert!(paths.results.is_some_and(|p| p.exists()));
        assert_eq!(paths.summary, None);
        assert!(!dir.path().join("local/summary_local_latest.json").exists());
    }

    #[test]
    fn empty_run_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        sink(dir.path()).write(&[], None).unwrap();

        let csv = fs::read_to_string(dir.path().join("local/results_local_latest.csv")).unwrap();
        assert_eq!(csv.trim_end(), CSV_HEADER.join(","));
    }

    #[test]
    fn summary_table_lists_figures() {
        let records = vec![record(TrialOutcome::Success, false)];
        let summary = summarize("aws", &records).unwrap();

        let mut out = Vec::new();
        write_summary_table(&mut out, &summary).unwrap();
        let table = String::from_utf8(out).unwrap();

        assert!(table.contains("SUMMARY"));
        assert!(table.contains("aws"));
        assert!(table.contains("640"));
        assert!(table.contains("files/s"));
    }
}
