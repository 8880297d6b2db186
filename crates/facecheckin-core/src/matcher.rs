//! Labeled face matching.
//!
//! Each employee contributes one or more reference descriptors under a label.
//! A query is scored against every label by mean cosine similarity; the best
//! label wins if it clears the threshold, otherwise the query is `unknown`.

use crate::types::Embedding;
use serde::Serialize;

/// Label reported for a face that matches no enrolled employee.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Reference descriptors for one employee.
#[derive(Debug, Clone)]
pub struct LabeledDescriptors {
    pub label: String,
    pub descriptors: Vec<Embedding>,
}

impl LabeledDescriptors {
    pub fn new(label: impl Into<String>, descriptors: Vec<Embedding>) -> Self {
        Self { label: label.into(), descriptors }
    }

    /// Mean cosine similarity of `query` against this label's descriptors.
    fn mean_similarity(&self, query: &Embedding) -> Option<f32> {
        if self.descriptors.is_empty() {
            return None;
        }
        let total: f32 = self.descriptors.iter().map(|d| query.similarity(d)).sum();
        Some(total / self.descriptors.len() as f32)
    }
}

/// Outcome of matching one query descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub label: String,
    /// Mean cosine similarity of the best label, even when it fell below the threshold.
    pub similarity: f32,
}

impl FaceMatch {
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

/// Nearest-label matcher over a fixed gallery.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    gallery: Vec<LabeledDescriptors>,
    threshold: f32,
}

impl FaceMatcher {
    pub fn new(gallery: Vec<LabeledDescriptors>, threshold: f32) -> Self {
        Self { gallery, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.gallery.iter().map(|l| l.label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    /// Resolve a query to the best-scoring label, or [`UNKNOWN_LABEL`].
    pub fn find_best_match(&self, query: &Embedding) -> FaceMatch {
        let best = self
            .gallery
            .iter()
            .filter_map(|l| l.mean_similarity(query).map(|s| (l, s)))
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((labeled, similarity)) if similarity >= self.threshold => FaceMatch {
                label: labeled.label.clone(),
                similarity,
            },
            Some((_, similarity)) => FaceMatch { label: UNKNOWN_LABEL.to_string(), similarity },
            None => FaceMatch { label: UNKNOWN_LABEL.to_string(), similarity: 0.0 },
        }
    }
}
