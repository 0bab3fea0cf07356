//! Distance kernels used by the brute-force search path.

use crate::collection::DistanceMetric;

/// Computes the cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; zero vectors score 0.
///
/// # Panics
///
/// Panics if the vectors have different dimensions.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let dot = inner_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Computes the squared Euclidean distance between two vectors.
///
/// # Panics
///
/// Panics if the vectors have different dimensions.
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Computes the inner product between two vectors.
///
/// # Panics
///
/// Panics if the vectors have different dimensions.
#[must_use]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

impl DistanceMetric {
    /// Scores `b` against `a` under this metric.
    ///
    /// # Panics
    ///
    /// Panics if the vectors have different dimensions.
    #[must_use]
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2 => squared_l2(a, b),
            Self::Ip => inner_product(a, b),
            Self::Cosine => cosine_similarity(a, b),
        }
    }
}
