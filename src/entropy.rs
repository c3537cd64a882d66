//! Entropy dataset and oracle.
//!
//! The dataset maps normalized attribute vectors to an empirically measured
//! distinctiveness score in `[0, 1]`. The oracle answers "how identifying is
//! this combination": exact match first, then the most specific known
//! sub-vector, then a configurable default for unknown combinations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attribute::{normalize_key, AttributeVector};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};

/// Column holding the vector string in the bundled CSV.
const CSV_VECTOR_COLUMN: usize = 0;
/// Column holding the normalized entropy in the bundled CSV.
const CSV_ENTROPY_COLUMN: usize = 2;

/// Immutable mapping of normalized vector key → score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntropyRecord {
    scores: HashMap<String, f64>,
}

impl EntropyRecord {
    /// An empty dataset. Every lookup degrades to the default score.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(vector, score)` pairs. Keys are normalized; scores are
    /// clamped to `[0, 1]` and non-finite scores are dropped.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut scores = HashMap::new();
        for (raw, score) in entries {
            let key = normalize_key(raw.as_ref());
            if key.is_empty() || !score.is_finite() {
                continue;
            }
            scores.insert(key, score.clamp(0.0, 1.0));
        }
        Self { scores }
    }

    /// Parse the bundled CSV: vector in column 0, entropy in column 2.
    ///
    /// Rows that do not carry a parseable score (headers, blank lines) are
    /// skipped. A blank file is unavailable; a file with no usable rows is
    /// malformed.
    pub fn from_csv(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(GuardError::DatasetUnavailable("dataset file is empty".into()));
        }
        let mut skipped = 0usize;
        let mut entries = Vec::new();

        for row in text.lines() {
            let columns: Vec<&str> = row.split(',').collect();
            let vector = columns.get(CSV_VECTOR_COLUMN).map(|c| c.trim()).unwrap_or("");
            let score = columns
                .get(CSV_ENTROPY_COLUMN)
                .and_then(|c| c.trim().parse::<f64>().ok());

            match score {
                Some(score) if !vector.is_empty() => entries.push((vector.to_string(), score)),
                _ => skipped += 1,
            }
        }

        if entries.is_empty() {
            return Err(GuardError::DatasetMalformed(format!(
                "no usable rows ({} skipped)",
                skipped
            )));
        }

        log::debug!(
            "Parsed entropy CSV: {} rows loaded, {} skipped",
            entries.len(),
            skipped
        );
        Ok(Self::from_entries(entries))
    }

    /// Parse a JSON object of `{ "vector": score }`.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, f64> = serde_json::from_str(text)
            .map_err(|e| GuardError::DatasetMalformed(e.to_string()))?;
        Ok(Self::from_entries(raw))
    }

    pub fn get(&self, normalized_key: &str) -> Option<f64> {
        self.scores.get(normalized_key).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.scores.iter()
    }
}

/// A dataset entry kept in search order for sub-vector matching.
#[derive(Debug, Clone)]
struct Candidate {
    vector: AttributeVector,
    key: String,
    score: f64,
}

/// Scores attribute vectors against an immutable dataset.
#[derive(Debug, Clone)]
pub struct EntropyOracle {
    record: EntropyRecord,
    /// Largest vectors first, ties broken by normalized key.
    candidates: Vec<Candidate>,
    default_score: f64,
    subvector_fallback: bool,
}

impl EntropyOracle {
    pub fn new(record: EntropyRecord, config: &GuardConfig) -> Self {
        let mut candidates: Vec<Candidate> = record
            .iter()
            .map(|(key, score)| Candidate {
                vector: AttributeVector::parse(key),
                key: key.clone(),
                score: *score,
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.vector
                .len()
                .cmp(&a.vector.len())
                .then_with(|| a.key.cmp(&b.key))
        });

        Self {
            record,
            candidates,
            default_score: config.default_score.clamp(0.0, 1.0),
            subvector_fallback: config.subvector_fallback,
        }
    }

    /// Oracle for a page whose dataset could not be loaded.
    pub fn unavailable(config: &GuardConfig) -> Self {
        log::warn!(
            "Entropy dataset unavailable, every vector scores {}",
            config.default_score
        );
        Self::new(EntropyRecord::empty(), config)
    }

    pub fn default_score(&self) -> f64 {
        self.default_score
    }

    pub fn dataset_len(&self) -> usize {
        self.record.len()
    }

    /// How identifying `vector` is. Never fails.
    ///
    /// Sub-vectors are searched in decreasing size, so the first hit is the
    /// most specific known combination. Scanning dataset entries that are
    /// subsets of the vector is equivalent to enumerating every sub-vector,
    /// without the exponential enumeration.
    pub fn score(&self, vector: &AttributeVector) -> f64 {
        if vector.is_empty() {
            return self.default_score;
        }

        let key = vector.normalized();
        if let Some(score) = self.record.get(&key) {
            return score;
        }

        if self.subvector_fallback {
            let hit = self
                .candidates
                .iter()
                .filter(|c| c.vector.len() < vector.len())
                .find(|c| c.vector.is_subset(vector));
            if let Some(candidate) = hit {
                log::debug!(
                    "No exact entropy for [{}], using sub-vector [{}] = {}",
                    key,
                    candidate.key,
                    candidate.score
                );
                return candidate.score;
            }
        }

        self.default_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_UNKNOWN_SCORE;

    fn oracle(entries: &[(&str, f64)]) -> EntropyOracle {
        EntropyOracle::new(
            EntropyRecord::from_entries(entries.iter().map(|(k, v)| (*k, *v))),
            &GuardConfig::default(),
        )
    }

    #[test]
    fn test_exact_match_is_order_independent() {
        let o = oracle(&[("navigator.platform|navigator.language", 0.9)]);
        let v1 = AttributeVector::parse("navigator.language|navigator.platform");
        let v2 = AttributeVector::parse("navigator.platform|navigator.language|navigator.platform");
        assert_eq!(o.score(&v1), 0.9);
        assert_eq!(o.score(&v1), o.score(&v2));
    }

    #[test]
    fn test_unknown_vector_gets_default() {
        let o = oracle(&[("screen.width", 0.2)]);
        let v = AttributeVector::parse("navigator.userAgent");
        assert_eq!(o.score(&v), DEFAULT_UNKNOWN_SCORE);
        assert_eq!(o.score(&AttributeVector::new()), DEFAULT_UNKNOWN_SCORE);
    }

    #[test]
    fn test_largest_subvector_wins() {
        let o = oracle(&[
            ("screen.width", 0.1),
            ("screen.height|screen.width", 0.4),
            ("navigator.language", 0.3),
        ]);
        let v = AttributeVector::parse("screen.width|screen.height|navigator.userAgent");
        assert_eq!(o.score(&v), 0.4);
    }

    #[test]
    fn test_same_size_ties_are_lexicographic() {
        let o = oracle(&[("screen.width", 0.6), ("navigator.language", 0.3)]);
        let v = AttributeVector::parse("screen.width|navigator.language|history.length");
        // "navigator.language" < "screen.width"
        assert_eq!(o.score(&v), 0.3);
    }

    #[test]
    fn test_fallback_can_be_disabled() {
        let cfg = GuardConfig {
            subvector_fallback: false,
            default_score: 0.83,
            ..Default::default()
        };
        let o = EntropyOracle::new(EntropyRecord::from_entries([("screen.width", 0.1)]), &cfg);
        let v = AttributeVector::parse("screen.width|screen.height");
        assert_eq!(o.score(&v), 0.83);
    }

    #[test]
    fn test_csv_loading() {
        let csv = "vector,count,entropy\n\
                   navigator.platform|navigator.language, 120, 0.9\n\
                   screen.width,88,0.25\n\
                   \n\
                   broken-row\n";
        let record = EntropyRecord::from_csv(csv).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("navigator.language|navigator.platform"), Some(0.9));
    }

    #[test]
    fn test_csv_without_rows_is_malformed() {
        assert!(matches!(
            EntropyRecord::from_csv("a,b\nc,d\n"),
            Err(GuardError::DatasetMalformed(_))
        ));
        assert!(matches!(
            EntropyRecord::from_csv("  \n"),
            Err(GuardError::DatasetUnavailable(_))
        ));
    }

    #[test]
    fn test_json_loading_clamps_scores() {
        let record = EntropyRecord::from_json(r#"{"screen.width": 1.7, "screen.height": -2}"#).unwrap();
        assert_eq!(record.get("screen.width"), Some(1.0));
        assert_eq!(record.get("screen.height"), Some(0.0));
    }

    #[test]
    fn test_unavailable_dataset_degrades() {
        let o = EntropyOracle::unavailable(&GuardConfig::default());
        assert_eq!(o.dataset_len(), 0);
        assert_eq!(
            o.score(&AttributeVector::parse("screen.width")),
            DEFAULT_UNKNOWN_SCORE
        );
    }
}
