use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Key of an enrolled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An enrolled person. Name and email are bookkeeping only; the engines key on `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
}

/// One enrolled genuine sample, stored as the raw encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTemplate {
    pub id: i64,
    pub identity: IdentityId,
    pub image: Vec<u8>,
    pub enrolled_at: DateTime<Utc>,
}

/// Where an image comes from. Both variants resolve to the same tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    FromPath(PathBuf),
    FromBytes(Vec<u8>),
}

impl ImageSource {
    /// Human-readable origin used in error messages and logs.
    pub fn describe(&self) -> String {
        match self {
            ImageSource::FromPath(path) => path.display().to_string(),
            ImageSource::FromBytes(bytes) => format!("<{} bytes in memory>", bytes.len()),
        }
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::FromPath(path)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::FromBytes(bytes)
    }
}

/// Embedding vector produced by models that expose one instead of a pair score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding, when known.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Outcome of verifying one probe against one identity's gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyDecision {
    pub identity: IdentityId,
    /// Highest score across every decodable reference, in [0, 1].
    pub max_score: f32,
    /// `max_score > threshold`; equality rejects.
    pub accepted: bool,
    pub threshold: f32,
    /// Reference that produced `max_score` (earliest on ties).
    pub best_reference: i64,
    pub scored: usize,
    /// References skipped because they could not be decoded.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let b = Embedding { values: vec![-1.0, 0.0], model_version: None };
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0], model_version: None };
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_image_source_describe() {
        let path = ImageSource::from(PathBuf::from("/tmp/a.png"));
        assert_eq!(path.describe(), "/tmp/a.png");
        let bytes = ImageSource::from(vec![0u8; 12]);
        assert_eq!(bytes.describe(), "<12 bytes in memory>");
    }

    #[test]
    fn test_identity_id_serializes_transparently() {
        let json = serde_json::to_string(&IdentityId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
