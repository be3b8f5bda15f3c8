//! Synthetic log payloads uploaded by each trial.
//!
//! A payload is a block of newline-separated JSON log lines. The schema is fixed, the contents are
//! random: the severity [`Level`] follows a 70/15/10/5 weighting, and response times and status
//! codes are drawn conditioned on that level, so the processor sees a realistic mix of errors.

use std::num::NonZeroUsize;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;
use serde::Serialize;

/// Endpoints referenced by generated log lines.
const ENDPOINTS: [&str; 4] = ["/api/users", "/api/orders", "/api/products", "/health"];

/// Severity levels and their relative weights.
const LEVELS: [(Level, u32); 4] = [
    (Level::Info, 70),
    (Level::Warn, 15),
    (Level::Error, 10),
    (Level::Debug, 5),
];

/// Severity of a generated log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Regular traffic.
    Info,
    /// Client errors.
    Warn,
    /// Server errors with slow responses.
    Error,
    /// Verbose diagnostics.
    Debug,
}

impl Level {
    fn status_code(self) -> u16 {
        match self {
            Level::Info | Level::Debug => 200,
            Level::Warn => 400,
            Level::Error => 500,
        }
    }

    fn sample_response_time(self, rng: &mut impl Rng) -> u32 {
        match self {
            Level::Error => rng.random_range(500..=5000),
            _ => rng.random_range(5..=500),
        }
    }
}

#[derive(Debug, Serialize)]
struct LogLine {
    timestamp: String,
    level: Level,
    endpoint: &'static str,
    response_time_ms: u32,
    status_code: u16,
    user_id: String,
}

/// Produces randomized log payloads.
#[derive(Debug, Clone)]
pub struct WorkloadGenerator {
    rng: SmallRng,
    levels: WeightedIndex<u32>,
}

impl WorkloadGenerator {
    /// Creates a generator seeded from the thread-local RNG.
    pub fn new() -> Self {
        Self::seeded(rand::random())
    }

    /// Creates a generator with reproducible output.
    pub fn seeded(seed: u64) -> Self {
        let levels = WeightedIndex::new(LEVELS.iter().map(|(_, weight)| *weight))
            .expect("level weights are positive");

        Self {
            rng: SmallRng::seed_from_u64(seed),
            levels,
        }
    }

    /// Derives an independent generator, e.g. for a trial running on another task.
    ///
    /// Forks of a seeded generator are themselves reproducible.
    pub fn fork(&mut self) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(self.rng.next_u64()),
            levels: self.levels.clone(),
        }
    }

    /// Generates a payload of exactly `lines` log lines.
    pub fn generate(&mut self, lines: NonZeroUsize) -> Bytes {
        let mut buf = Vec::with_capacity(lines.get() * 160);

        for index in 0..lines.get() {
            if index > 0 {
                buf.push(b'\n');
            }

            let line = self.next_line();
            serde_json::to_writer(&mut buf, &line).expect("log lines always serialize");
        }

        buf.into()
    }

    fn next_line(&mut self) -> LogLine {
        let (level, _) = LEVELS[self.levels.sample(&mut self.rng)];

        LogLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level,
            endpoint: ENDPOINTS[self.rng.random_range(0..ENDPOINTS.len())],
            response_time_ms: level.sample_response_time(&mut self.rng),
            status_code: level.status_code(),
            user_id: format!("user_{}", self.rng.random_range(1..=100)),
        }
    }
}

impl Default for WorkloadGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn lines(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn parse(payload: &[u8]) -> Vec<Value> {
        std::str::from_utf8(payload)
            .unwrap()
            .split('\n')
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn generates_requested_line_count() {
        let mut generator = WorkloadGenerator::seeded(1);
        let payload = generator.generate(lines(100));

        assert_eq!(parse(&payload).len(), 100);
        assert!(!payload.ends_with(b"\n"));
    }

    #[test]
    fn single_line_payload() {
        let mut generator = WorkloadGenerator::seeded(2);
        let entries = parse(&generator.generate(lines(1)));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn fields_follow_level() {
        let mut generator = WorkloadGenerator::seeded(3);
        let entries = parse(&generator.generate(lines(500)));

        for entry in entries {
            let response_time = entry["response_time_ms"].as_u64().unwrap();
            let status = entry["status_code"].as_u64().unwrap();
            match entry["level"].as_str().unwrap() {
                "INFO" | "DEBUG" => {
                    assert_eq!(status, 200);
                    assert!((5..=500).contains(&response_time));
                }
                "WARN" => {
                    assert_eq!(status, 400);
                    assert!((5..=500).contains(&response_time));
                }
                "ERROR" => {
                    assert_eq!(status, 500);
                    assert!((500..=5000).contains(&response_time));
                }
                other => panic!("unexpected level {other}"),
            }

            assert!(ENDPOINTS.contains(&entry["endpoint"].as_str().unwrap()));
            assert!(entry["user_id"].as_str().unwrap().starts_with("user_"));
            assert!(entry["timestamp"].as_str().unwrap().ends_with('Z'));
        }
    }

    #[test]
    fn level_weights_are_respected() {
        let mut generator = WorkloadGenerator::seeded(4);
        let entries = parse(&generator.generate(lines(10_000)));

        let info = entries.iter().filter(|e| e["level"] == "INFO").count();
        let debug = entries.iter().filter(|e| e["level"] == "DEBUG").count();

        // 70% and 5% with generous tolerance.
        assert!((6_500..=7_500).contains(&info), "info = {info}");
        assert!((300..=700).contains(&debug), "debug = {debug}");
    }

    #[test]
    fn forks_of_seeded_generators_are_reproducible() {
        let mut a = WorkloadGenerator::seeded(5).fork();
        let mut b = WorkloadGenerator::seeded(5).fork();

        let levels = |payload: Bytes| -> Vec<String> {
            parse(&payload)
                .iter()
                .map(|e| e["level"].as_str().unwrap().to_owned())
                .collect()
        };

        assert_eq!(levels(a.generate(lines(50))), levels(b.generate(lines(50))));
    }
}
