//! Configuration for the benchmark.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `PB__`)
//! 2. YAML configuration file (specified via the `--config` flag)
//! 3. Defaults
//!
//! The shape of a run (trial counts, workload sizes, concurrency) is given on the command line.
//! This file covers everything that stays the same between runs: which stores to talk to, how to
//! reach them in each environment, trial timing and logging.
//!
//! # Environment Variables
//!
//! Environment variables use `PB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `PB__ARTIFACT_STORE__BUCKET=pipeline-input` sets the upload bucket
//! - `PB__ENVIRONMENTS__LOCAL__ENDPOINT=http://localstack:4566` moves LocalStack
//! - `PB__TRIAL__TIMEOUT=5m` sets the per-trial poll timeout
//!
//! For compatibility with existing deployment scripts, the bucket and table names also fall back
//! to the plain `S3_BUCKET` and `DYNAMODB_TABLE` variables.
//!
//! # YAML Configuration File
//!
//! ```yaml
//! artifact_store:
//!   type: s3
//!   bucket: pipeline-input
//!
//! completion_store:
//!   type: dynamodb
//!   table: pipeline-jobs
//!
//! trial:
//!   timeout: 3m
//!   poll_interval: 250ms
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use pipelinebench_stores::dynamodb::{DEFAULT_KEY_ATTRIBUTE, DynamoCompletionStore};
use pipelinebench_stores::s3::S3ArtifactStore;
use pipelinebench_stores::{
    ArtifactStore, AwsOptions, CompletionStore, InMemoryArtifactStore, InMemoryCompletionStore,
    SimulatedProcessor,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{BenchError, BenchResult};
use crate::trial::PollSettings;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "PB__";

/// Fallback for [`ArtifactStoreConfig::S3::bucket`].
const BUCKET_FALLBACK_VAR: &str = "S3_BUCKET";

/// Fallback for [`CompletionStoreConfig::DynamoDb::table`].
const TABLE_FALLBACK_VAR: &str = "DYNAMODB_TABLE";

/// Deployment a run is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentName {
    /// LocalStack on the developer machine.
    Local,
    /// The real AWS deployment.
    Aws,
}

impl EnvironmentName {
    /// The label used in reports and file names.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentName::Local => "local",
            EnvironmentName::Aws => "aws",
        }
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("local") => Ok(EnvironmentName::Local),
            s if s.eq_ignore_ascii_case("aws") => Ok(EnvironmentName::Aws),
            s => Err(format!(
                r#"unknown environment "{s}": expected "local" or "aws""#
            )),
        }
    }
}

/// How to reach the stores in one environment.
///
/// Used in: [`Environments`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// AWS region of both stores.
    ///
    /// # Default
    ///
    /// `us-east-1`
    pub region: String,

    /// Endpoint override for both stores.
    ///
    /// When set, S3 is addressed path-style. Leave unset to use the regular AWS endpoints.
    ///
    /// # Default
    ///
    /// `http://localhost:4566` for `local`, unset for `aws`
    pub endpoint: Option<String>,

    /// Authenticate with LocalStack's static `test` credentials instead of the default AWS
    /// credential chain.
    ///
    /// # Default
    ///
    /// `true` for `local`, `false` for `aws`
    pub static_credentials: bool,
}

impl EnvironmentConfig {
    /// SDK options derived from this environment.
    pub fn aws_options(&self) -> AwsOptions {
        AwsOptions {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            static_credentials: self
                .static_credentials
                .then(|| ("test".to_owned(), "test".to_owned())),
        }
    }
}

/// Per-environment connection settings.
///
/// Used in: [`Config::environments`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Environments {
    /// Settings for `--environment local`.
    pub local: EnvironmentConfig,
    /// Settings for `--environment aws`.
    pub aws: EnvironmentConfig,
}

impl Environments {
    /// Returns the settings for `name`.
    pub fn get(&self, name: EnvironmentName) -> &EnvironmentConfig {
        match name {
            EnvironmentName::Local => &self.local,
            EnvironmentName::Aws => &self.aws,
        }
    }
}

impl Default for Environments {
    fn default() -> Self {
        Self {
            local: EnvironmentConfig {
                region: "us-east-1".to_owned(),
                endpoint: Some("http://localhost:4566".to_owned()),
                static_credentials: true,
            },
            aws: EnvironmentConfig {
                region: "us-east-1".to_owned(),
                endpoint: None,
                static_credentials: false,
            },
        }
    }
}

/// Where trial payloads are uploaded.
///
/// Used in: [`Config::artifact_store`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArtifactStoreConfig {
    /// S3 bucket (type `"s3"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// artifact_store:
    ///   type: s3
    ///   bucket: pipeline-input
    /// ```
    S3 {
        /// Name of the bucket. Falls back to `S3_BUCKET` when unset.
        bucket: Option<String>,
    },

    /// Process-local store with a simulated processor (type `"memory"`).
    ///
    /// Requires a `memory` completion store, which receives the simulated completion records.
    Memory {
        /// Time the simulated processor takes per artifact.
        #[serde(default = "default_processing_delay", with = "humantime_serde")]
        processing_delay: Duration,

        /// Artificial latency of every upload.
        #[serde(default, with = "humantime_serde")]
        upload_delay: Duration,
    },
}

fn default_processing_delay() -> Duration {
    Duration::from_millis(500)
}

/// Where the processor records completed artifacts.
///
/// Used in: [`Config::completion_store`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CompletionStoreConfig {
    /// DynamoDB table (type `"dynamodb"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// completion_store:
    ///   type: dynamodb
    ///   table: pipeline-jobs
    /// ```
    DynamoDb {
        /// Name of the table. Falls back to `DYNAMODB_TABLE` when unset.
        table: Option<String>,

        /// Partition key attribute holding the trial id.
        #[serde(default = "default_key_attribute")]
        key_attribute: String,
    },

    /// Process-local store (type `"memory"`).
    Memory,
}

fn default_key_attribute() -> String {
    DEFAULT_KEY_ATTRIBUTE.to_owned()
}

/// Timing of individual trials.
///
/// Used in: [`Config::trial`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TrialTiming {
    /// How long to wait for a completion record after the upload.
    ///
    /// # Default
    ///
    /// `3m`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Pause between two completion lookups of the same trial.
    ///
    /// # Default
    ///
    /// `250ms`
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Pause after every warmup trial.
    ///
    /// # Default
    ///
    /// `1s`
    #[serde(with = "humantime_serde")]
    pub warmup_pause: Duration,

    /// Content type sent with every upload.
    ///
    /// # Default
    ///
    /// `application/json`
    pub content_type: String,
}

impl TrialTiming {
    /// Poll settings for the trial runner.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            timeout: self.timeout,
            interval: self.poll_interval,
        }
    }
}

impl Default for TrialTiming {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            timeout: poll.timeout,
            poll_interval: poll.interval,
            warmup_pause: Duration::from_secs(1),
            content_type: "application/json".to_owned(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
///
/// Parsed case-insensitively, an empty value means `auto`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LogFormat {
    /// Pretty for TTY, otherwise simplified.
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  pipelinebench::orchestrator > starting warmup
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-03-09T14:05:07Z [pipelinebench::orchestrator] INFO: starting warmup
    /// ```
    Simplified,

    /// JSON lines.
    Json,
}

impl LogFormat {
    /// The lowercase name used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Auto => "auto",
            LogFormat::Pretty => "pretty",
            LogFormat::Simplified => "simplified",
            LogFormat::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A log format name that is not one of [`LogFormat`]'s variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownLogFormat(String);

impl fmt::Display for UnknownLogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"unknown log format "{}": use auto, pretty, simplified or json"#,
            self.0
        )
    }
}

impl std::error::Error for UnknownLogFormat {}

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(LogFormat::Auto),
            "pretty" => Ok(LogFormat::Pretty),
            "simplified" => Ok(LogFormat::Simplified),
            "json" => Ok(LogFormat::Json),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Logging {
    /// Minimum log level for the benchmark's own crates.
    ///
    /// `RUST_LOG` overrides this and allows per-module filters. Per-trial progress is logged at
    /// `DEBUG`.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`].
    ///
    /// # Default
    ///
    /// `auto`
    #[serde(with = "display_fromstr")]
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the benchmark.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Store receiving trial payloads.
    ///
    /// # Default
    ///
    /// S3, bucket from `S3_BUCKET`
    pub artifact_store: ArtifactStoreConfig,

    /// Store holding completion records.
    ///
    /// # Default
    ///
    /// DynamoDB, table from `DYNAMODB_TABLE`
    pub completion_store: CompletionStoreConfig,

    /// Connection settings per environment.
    pub environments: Environments,

    /// Trial timing.
    pub trial: TrialTiming,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifact_store: ArtifactStoreConfig::S3 { bucket: None },
            completion_store: CompletionStoreConfig::DynamoDb {
                table: None,
                key_attribute: default_key_attribute(),
            },
            environments: Environments::default(),
            trial: TrialTiming::default(),
            logging: Logging::default(),
        }
    }
}

/// The pair of store clients a run talks to.
#[derive(Clone, Debug)]
pub struct Stores {
    /// Upload destination.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Completion lookup.
    pub completions: Arc<dyn CompletionStore>,
}

impl Config {
    /// Loads configuration from an optional YAML file and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `PB__`)
    pub fn load(path: Option<&Path>) -> BenchResult<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Creates the store clients for `environment`.
    ///
    /// Fails if a bucket or table name is missing, or if only one of the two stores is in memory.
    pub async fn build_stores(&self, environment: EnvironmentName) -> BenchResult<Stores> {
        match (&self.artifact_store, &self.completion_store) {
            (
                ArtifactStoreConfig::Memory {
                    processing_delay,
                    upload_delay,
                },
                CompletionStoreConfig::Memory,
            ) => {
                let completions = InMemoryCompletionStore::new();
                let processor = SimulatedProcessor::new(completions.clone(), *processing_delay);
                let artifacts = InMemoryArtifactStore::new()
                    .with_upload_delay(*upload_delay)
                    .with_processor(processor);

                tracing::info!(%environment, "using in-memory stores");
                Ok(Stores {
                    artifacts: Arc::new(artifacts),
                    completions: Arc::new(completions),
                })
            }
            (
                ArtifactStoreConfig::S3 { bucket },
                CompletionStoreConfig::DynamoDb {
                    table,
                    key_attribute,
                },
            ) => {
                let bucket = with_fallback(bucket, BUCKET_FALLBACK_VAR, "artifact_store.bucket")?;
                let table = with_fallback(table, TABLE_FALLBACK_VAR, "completion_store.table")?;

                let settings = self.environments.get(environment);
                let options = settings.aws_options();
                tracing::info!(
                    %environment,
                    region = %options.region,
                    endpoint = options.endpoint.as_deref(),
                    %bucket,
                    %table,
                    "connecting to AWS stores"
                );

                let artifacts = S3ArtifactStore::new(&options, bucket).await;
                let completions = DynamoCompletionStore::new(&options, table)
                    .await
                    .with_key_attribute(key_attribute);

                Ok(Stores {
                    artifacts: Arc::new(artifacts),
                    completions: Arc::new(completions),
                })
            }
            _ => Err(BenchError::Config(
                "in-memory stores must be used for both artifacts and completions".to_owned(),
            )),
        }
    }
}

fn with_fallback(configured: &Option<String>, var: &str, field: &str) -> BenchResult<String> {
    configured
        .clone()
        .or_else(|| std::env::var(var).ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BenchError::Config(format!("{field} is not set and {var} is empty")))
}
