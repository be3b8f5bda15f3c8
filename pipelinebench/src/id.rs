//! Trial identifiers.

use std::fmt;

use pipelinebench_stores::ArtifactKey;
use rand::Rng;

const ID_LEN: usize = 8;
const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random token identifying one trial.
///
/// Eight characters from `[a-z0-9]`. Combined with the upload timestamp in the [`ArtifactKey`],
/// collisions are unlikely enough to ignore at benchmark scale, but uniqueness is not guaranteed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrialId(String);

impl TrialId {
    /// Draws a fresh id from the thread-local RNG.
    pub fn random() -> Self {
        Self::from_rng(&mut rand::rng())
    }

    /// Draws a fresh id from the given RNG.
    pub fn from_rng(rng: &mut impl Rng) -> Self {
        let id = (0..ID_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds the object key for uploading this trial's artifact at `unix_seconds`.
    pub fn artifact_key(&self, unix_seconds: u64) -> ArtifactKey {
        ArtifactKey::new(&self.0, unix_seconds)
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    #[test]
    fn ids_are_lowercase_alphanumeric() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            let id = TrialId::from_rng(&mut rng);
            assert_eq!(id.as_str().len(), ID_LEN);
            assert!(
                id.as_str()
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            );
        }
    }

    #[test]
    fn characters_are_uniform() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut digits = 0;
        let mut total = 0;
        for _ in 0..4_000 {
            let id = TrialId::from_rng(&mut rng);
            digits += id.as_str().bytes().filter(u8::is_ascii_digit).count();
            total += ID_LEN;
        }

        // 10 of 36 characters are digits.
        let share = digits as f64 / total as f64;
        assert!((0.25..0.31).contains(&share), "digit share = {share}");
    }

    #[test]
    fn key_round_trips_through_processor_parsing() {
        let id = TrialId::random();
        let key = id.artifact_key(1_700_000_000);
        assert_eq!(ArtifactKey::trial_id(key.as_str()), Some(id.as_str()));
    }
}
