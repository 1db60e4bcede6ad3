//! Confidence manager
//!
//! Scores candidate patches per error signature from historical success
//! rates, with a small seeded jitter to break ties. Scores gate retries and
//! rank stored patches for re-application.

use crate::signature::ErrorSignature;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SCORE_FLOOR: f64 = 0.1;
const JITTER_RANGE: f64 = 0.05;

/// Fixed reason strings, selected from the base rate.
const REASON_HIGH: &str = "matches a prior success for this error";
const REASON_MEDIUM: &str = "resembles patches that worked on similar errors";
const REASON_LOW: &str = "novel pattern, uncertain outcome";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    pub patch: String,
    pub score: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    passed: u32,
    total: u32,
}

pub struct ConfidenceManager {
    apply_threshold: f64,
    retry_threshold: f64,
    max_attempts: u32,
    records: HashMap<ErrorSignature, Vec<ConfidenceRecord>>,
    tallies: HashMap<ErrorSignature, Tally>,
    /// Patch attempts made this session, per signature.
    attempts: HashMap<ErrorSignature, u32>,
    rng: ChaCha8Rng,
}

impl ConfidenceManager {
    pub fn new(
        apply_threshold: f64,
        retry_threshold: f64,
        max_attempts: u32,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            apply_threshold,
            retry_threshold,
            max_attempts,
            records: HashMap::new(),
            tallies: HashMap::new(),
            attempts: HashMap::new(),
            rng,
        }
    }

    /// Seed historical tallies from the attempt ledgers.
    pub fn prime_history<I>(&mut self, tallies: I)
    where
        I: IntoIterator<Item = (ErrorSignature, (u32, u32))>,
    {
        for (sig, (passed, total)) in tallies {
            self.tallies.insert(sig, Tally { passed, total });
        }
    }

    /// Assign a score to a candidate patch and append the record. Scores
    /// clamp to [0.1, 1.0]; the reason comes from the fixed set.
    pub fn assign(&mut self, signature: &ErrorSignature, patch: &str) -> (f64, String) {
        let has_history = self
            .tallies
            .get(signature)
            .map(|t| t.total > 0)
            .unwrap_or(false);
        let base = self.historical_success_rate(signature);
        let jitter = self.rng.gen_range(-JITTER_RANGE..=JITTER_RANGE);
        let score = (base + jitter).clamp(SCORE_FLOOR, 1.0);
        let reason = if !has_history {
            REASON_LOW
        } else if base >= 0.75 {
            REASON_HIGH
        } else if base >= 0.5 {
            REASON_MEDIUM
        } else {
            REASON_LOW
        };
        self.records
            .entry(signature.clone())
            .or_default()
            .push(ConfidenceRecord {
                patch: patch.to_string(),
                score,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        (score, reason.to_string())
    }

    /// The highest-scoring recorded patch for a signature, iff its score
    /// meets the apply threshold (inclusive).
    pub fn best_high_confidence(&self, signature: &ErrorSignature) -> Option<&ConfidenceRecord> {
        let records = self.records.get(signature)?;
        let best = records
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))?;
        (best.score >= self.apply_threshold).then_some(best)
    }

    /// Whether another attempt on this signature is allowed at all.
    pub fn can_attempt(&self, signature: &ErrorSignature) -> bool {
        self.attempts.get(signature).copied().unwrap_or(0) < self.max_attempts
    }

    /// Count a patch attempt against the signature's budget.
    pub fn register_attempt(&mut self, signature: &ErrorSignature) {
        *self.attempts.entry(signature.clone()).or_insert(0) += 1;
    }

    pub fn attempts(&self, signature: &ErrorSignature) -> u32 {
        self.attempts.get(signature).copied().unwrap_or(0)
    }

    /// True iff the signature's current best score meets the retry
    /// threshold and the attempt budget is not exhausted.
    pub fn should_retry(&self, signature: &ErrorSignature) -> bool {
        if !self.can_attempt(signature) {
            return false;
        }
        let best = self
            .records
            .get(signature)
            .and_then(|records| {
                records
                    .iter()
                    .map(|r| r.score)
                    .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            })
            .unwrap_or(0.5);
        best >= self.retry_threshold
    }

    /// Feed an attempt outcome back into the historical base rate.
    pub fn note_outcome(&mut self, signature: &ErrorSignature, passed: bool) {
        let tally = self.tallies.entry(signature.clone()).or_default();
        tally.total += 1;
        if passed {
            tally.passed += 1;
        }
    }

    fn historical_success_rate(&self, signature: &ErrorSignature) -> f64 {
        match self.tallies.get(signature) {
            Some(tally) if tally.total > 0 => tally.passed as f64 / tally.total as f64,
            _ => 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(n: u32) -> ErrorSignature {
        ErrorSignature::compute(&format!("err {}", n), "ctx")
    }

    fn manager() -> ConfidenceManager {
        ConfidenceManager::new(0.75, 0.20, 3, Some(42))
    }

    #[test]
    fn test_no_history_defaults_to_midpoint() {
        let mut m = manager();
        let (score, reason) = m.assign(&sig(1), "patch");
        assert!(score >= 0.45 - f64::EPSILON && score <= 0.55 + f64::EPSILON);
        assert_eq!(reason, REASON_LOW);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let mut m = manager();
        // All failures drive the base rate to zero; the floor holds.
        for _ in 0..10 {
            m.note_outcome(&sig(1), false);
        }
        for _ in 0..20 {
            let (score, _) = m.assign(&sig(1), "p");
            assert!((0.1..=1.0).contains(&score));
        }
        // All passes drive it to one; the ceiling holds.
        for _ in 0..10 {
            m.note_outcome(&sig(2), true);
        }
        for _ in 0..20 {
            let (score, _) = m.assign(&sig(2), "p");
            assert!((0.1..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_seeded_jitter_is_deterministic() {
        let mut a = manager();
        let mut b = manager();
        for i in 0..5 {
            assert_eq!(a.assign(&sig(i), "p").0, b.assign(&sig(i), "p").0);
        }
    }

    #[test]
    fn test_reason_tracks_base_rate() {
        let mut m = manager();
        for _ in 0..10 {
            m.note_outcome(&sig(1), true);
        }
        let (_, reason) = m.assign(&sig(1), "p");
        assert_eq!(reason, REASON_HIGH);
    }

    #[test]
    fn test_best_high_confidence_is_inclusive_at_threshold() {
        let mut m = ConfidenceManager::new(0.75, 0.20, 3, Some(1));
        m.records.entry(sig(1)).or_default().push(ConfidenceRecord {
            patch: "exact".to_string(),
            score: 0.75,
            reason: "r".to_string(),
            timestamp: Utc::now(),
        });
        let best = m.best_high_confidence(&sig(1)).unwrap();
        assert_eq!(best.patch, "exact");
    }

    #[test]
    fn test_best_high_confidence_rejects_below_threshold() {
        let mut m = manager();
        m.records.entry(sig(1)).or_default().push(ConfidenceRecord {
            patch: "low".to_string(),
            score: 0.74,
            reason: "r".to_string(),
            timestamp: Utc::now(),
        });
        assert!(m.best_high_confidence(&sig(1)).is_none());
    }

    #[test]
    fn test_attempt_budget_gates_retry() {
        let mut m = manager();
        m.assign(&sig(1), "p");
        assert!(m.should_retry(&sig(1)));
        for _ in 0..3 {
            m.register_attempt(&sig(1));
        }
        assert!(!m.should_retry(&sig(1)));
        assert!(!m.can_attempt(&sig(1)));
    }

    #[test]
    fn test_zero_max_attempts_blocks_immediately() {
        let m = ConfidenceManager::new(0.75, 0.20, 0, Some(1));
        assert!(!m.can_attempt(&sig(1)));
        assert!(!m.should_retry(&sig(1)));
    }

    #[test]
    fn test_low_score_blocks_retry() {
        let mut m = ConfidenceManager::new(0.75, 0.20, 3, Some(7));
        for _ in 0..10 {
            m.note_outcome(&sig(1), false);
        }
        m.assign(&sig(1), "p");
        // Base rate 0.0 clamps to the floor 0.1, below the 0.20 retry gate.
        assert!(!m.should_retry(&sig(1)));
    }
}
