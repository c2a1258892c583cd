use practice_types::ScoreResult;
use tracing::debug;

use super::normalize;

/// Minimum similarity for an attempt to count as correct.
pub const SUCCESS_THRESHOLD: f64 = 0.6;

/// Levenshtein distance over characters (insert, delete, substitute all
/// cost 1), computed with the full `(|a|+1) x (|b|+1)` table.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let cols = b.len() + 1;
    let mut table = vec![0usize; (a.len() + 1) * cols];

    for i in 0..=a.len() {
        table[i * cols] = i;
    }
    for j in 0..=b.len() {
        table[j] = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let substitution = usize::from(a[i - 1] != b[j - 1]);
            let delete = table[(i - 1) * cols + j] + 1;
            let insert = table[i * cols + j - 1] + 1;
            let replace = table[(i - 1) * cols + j - 1] + substitution;
            table[i * cols + j] = delete.min(insert).min(replace);
        }
    }

    table[a.len() * cols + b.len()]
}

/// Similarity in `[0, 1]` between two already-normalized strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let longest = a.chars().count().max(b.chars().count());
    let distance = edit_distance(a, b);

    (1.0 - distance as f64 / longest as f64).clamp(0.0, 1.0)
}

/// Scores heard text against a target with a configurable success
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityScorer {
    threshold: f64,
}

impl SimilarityScorer {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Normalize both inputs and score them.
    pub fn evaluate(&self, target: &str, heard: &str) -> ScoreResult {
        let target = normalize(target);
        let heard = normalize(heard);
        let score = similarity(&target, &heard);

        debug!(
            "evaluate: '{}' vs '{}' -> {:.3} (threshold {:.2})",
            target, heard, score, self.threshold
        );

        ScoreResult {
            score,
            is_successful: score >= self.threshold,
        }
    }
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new(SUCCESS_THRESHOLD)
    }
}

/// Evaluate with the default threshold.
pub fn evaluate(target: &str, heard: &str) -> ScoreResult {
    SimilarityScorer::default().evaluate(target, heard)
}
