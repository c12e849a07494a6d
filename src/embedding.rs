// VecShelf — embedding.rs
// Vector normalization and similarity metrics.
// Author: d65v <https://github.com/d65v>

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ShelfError;

/// Supported similarity metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Cosine similarity (assumes pre-normalized vectors → dot product)
    Cosine,
    /// Euclidean (L2) distance (lower = closer)
    Euclidean,
    /// Raw inner product (higher = closer)
    DotProduct,
}

impl Metric {
    /// Wire name used in index params and search requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "COSINE",
            Metric::Euclidean => "L2",
            Metric::DotProduct => "IP",
        }
    }

    /// Whether stored vectors should be L2-normalized on insert.
    pub fn normalizes(&self) -> bool {
        matches!(self, Metric::Cosine)
    }

    /// Whether reported scores are distances, so smaller means closer.
    pub fn distance_ascending(&self) -> bool {
        matches!(self, Metric::Euclidean)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ShelfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "l2" | "euclidean" => Ok(Metric::Euclidean),
            "ip" | "dot" => Ok(Metric::DotProduct),
            other => Err(ShelfError::Config(format!("unknown metric '{}'", other))),
        }
    }
}

// ── Normalization ─────────────────────────────────────────────────────────────

/// L2-normalize a vector (in-place copy). Returns a unit vector.
/// If the vector is all-zero, it is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let mag = magnitude(v);
    if mag < 1e-10 {
        return v.to_vec();
    }
    v.iter().map(|x| x / mag).collect()
}

/// Compute the L2 (Euclidean) magnitude (norm) of a vector.
#[inline]
pub fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// ── Similarity / Distance ─────────────────────────────────────────────────────

/// Dot product of two equal-length vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity between two vectors.
/// Pre-normalize both for speed if calling many times.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let na = normalize(a);
    let nb = normalize(b);
    dot(&na, &nb).clamp(-1.0, 1.0)
}

/// Euclidean distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Generic score function: higher score = better match.
pub fn score(metric: Metric, query: &[f32], candidate: &[f32]) -> f32 {
    match metric {
        // both sides are unit vectors already
        Metric::Cosine => dot(query, candidate).clamp(-1.0, 1.0),
        Metric::DotProduct => dot(query, candidate),
        Metric::Euclidean => -euclidean_distance(query, candidate),
    }
}

/// Score as reported to callers. L2 is reported as a distance, not its negation.
pub fn reported_score(metric: Metric, raw: f32) -> f32 {
    match metric {
        Metric::Euclidean => -raw,
        _ => raw,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
