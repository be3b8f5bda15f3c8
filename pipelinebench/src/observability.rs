//! Logging setup for the binary.

use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::{LogFormat, Logging};

/// Crates whose events are filtered by the configured level. Everything else logs warnings only.
const OWN_CRATES: [&str; 2] = ["pipelinebench", "pipelinebench_stores"];

/// Installs the global tracing subscriber, writing to stderr.
pub fn init_tracing(logging: &Logging) {
    let rust_log = env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::new(filter_directives(rust_log.as_deref(), logging.level));

    let format = match logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Simplified => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty | LogFormat::Auto => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();
}

/// Builds the filter directives from `RUST_LOG` and the configured level.
///
/// If `RUST_LOG` is a plain level, it replaces the configured level for our crates. Otherwise it is
/// used literally, for users who know which overrides they want.
fn filter_directives(rust_log: Option<&str>, configured: LevelFilter) -> String {
    let level = match rust_log {
        Some(value) if !value.is_empty() => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return value.to_owned(),
        },
        _ => configured,
    };

    let level = level.to_string().to_ascii_lowercase();
    let mut directives = String::from("WARN");
    for krate in OWN_CRATES {
        directives.push_str(&format!(",{krate}={level}"));
    }
    directives
}
