//! Query embedding validation and pgvector encoding
//!
//! pgvector accepts vectors as text literals of the form `[v0,v1,...]`. Every
//! component is written with the shortest decimal representation that parses
//! back to the same `f32` bit pattern, so a literal decodes to exactly the
//! embedding that produced it and rankings computed by the database match the
//! ones computed in memory.

use crate::errors::{AppError, Result};
use std::cmp::Ordering;

/// An embedding that has passed dimension and finiteness checks
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Validate raw components against the deployment's dimensionality
    pub fn new(values: Vec<f32>, dimension: usize) -> Result<Self> {
        if values.is_empty() {
            return Err(AppError::InvalidEmbedding {
                message: "embedding is empty".to_string(),
            });
        }
        if values.len() != dimension {
            return Err(AppError::InvalidEmbedding {
                message: format!(
                    "expected {} dimensions, got {}",
                    dimension,
                    values.len()
                ),
            });
        }
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(AppError::InvalidEmbedding {
                message: format!("component {} is not a finite number", pos),
            });
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// pgvector text literal for this embedding
    pub fn to_literal(&self) -> String {
        encode_vector_literal(&self.0)
    }
}

/// Encode components as a pgvector literal without losing precision.
pub fn encode_vector_literal(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 12 + 2);
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // Display for f32 is the shortest round-trip representation
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Parse a pgvector text literal back into components.
pub fn decode_vector_literal(literal: &str) -> Result<Vec<f32>> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| AppError::InvalidEmbedding {
            message: "vector literal must be wrapped in brackets".to_string(),
        })?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|v| {
            v.trim().parse::<f32>().map_err(|e| AppError::InvalidEmbedding {
                message: format!("bad component {:?}: {}", v, e),
            })
        })
        .collect()
}

/// Cosine distance (`1 - cosine similarity`), matching pgvector's `<=>`.
///
/// Accumulates in f64 like pgvector does. A zero-norm operand yields NaN,
/// which callers rank after every finite distance.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let similarity = dot / (norm_a * norm_b).sqrt();
    // Rounding can push similarity just outside [-1, 1]
    1.0 - similarity.clamp(-1.0, 1.0)
}

/// Ascending order on distances with NaN after every number, as Postgres sorts.
pub fn compare_distance(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}
