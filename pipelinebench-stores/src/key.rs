//! Naming of uploaded artifacts.
//!
//! Keys have the shape `logs/test_{id}_{unix_seconds}.json`. The processor recovers the trial id
//! from the key and writes its completion record under that id, so both sides of the pipeline
//! must agree on this format.

use std::fmt;

const PREFIX: &str = "logs/test_";
const SUFFIX: &str = ".json";

/// Object key under which a trial's artifact is uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Builds the key for the trial `id`, uploaded at `unix_seconds`.
    ///
    /// `id` must not contain `_`, otherwise [`trial_id`](Self::trial_id) cannot recover it.
    pub fn new(id: &str, unix_seconds: u64) -> Self {
        Self(format!("{PREFIX}{id}_{unix_seconds}{SUFFIX}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the trial id from a raw object key.
    ///
    /// Returns `None` for keys that do not follow the benchmark's naming scheme.
    pub fn trial_id(key: &str) -> Option<&str> {
        let stem = key.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
        let (id, timestamp) = stem.split_once('_')?;
        if id.is_empty() || timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(id)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
