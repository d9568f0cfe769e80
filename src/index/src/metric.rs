use serde::{Deserialize, Serialize};

/// Distance metric of a vector index. Cosine is normalize + inner product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    L2,
    InnerProduct,
    Cosine,
}

impl MetricType {
    /// Whether a smaller score means a closer match.
    pub fn smaller_is_closer(self) -> bool {
        matches!(self, MetricType::L2)
    }

    /// The raw score between two vectors: squared euclidean distance for L2,
    /// similarity for inner-product and cosine.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MetricType::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| {
                    let d = x - y;
                    d * d
                })
                .sum(),
            MetricType::InnerProduct => dot(a, b),
            MetricType::Cosine => {
                let norm = (norm2(a) * norm2(b)).sqrt();
                if norm == 0.0 {
                    0.0
                } else {
                    dot(a, b) / norm
                }
            }
        }
    }

    /// Ranks `a` against `b` with the closer score first.
    pub fn closer(self, a: f32, b: f32) -> std::cmp::Ordering {
        if self.smaller_is_closer() {
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum()
}
