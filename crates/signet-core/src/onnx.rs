//! ONNX Runtime adapters for trained signature models.
//!
//! Two model shapes are supported: a siamese pair model that takes both
//! tensors and returns a single similarity, and an embedding model whose
//! vectors are compared by cosine similarity through `EmbeddingScorer`.

use crate::preprocess::Tensor;
use crate::scorer::{Embedder, ScoreError, Scorer};
use crate::types::Embedding;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ONNX_INTRA_THREADS: usize = 2;

fn load_session(model_path: &str, kind: &str) -> Result<Session, ScoreError> {
    if !Path::new(model_path).exists() {
        return Err(ScoreError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(ONNX_INTRA_THREADS)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        kind,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded signature model"
    );

    Ok(session)
}

/// Two-input siamese model: `([1,H,W,3], [1,H,W,3]) -> [1,1]` similarity.
pub struct OnnxPairScorer {
    session: Session,
}

impl OnnxPairScorer {
    /// Load the pair model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ScoreError> {
        let session = load_session(model_path, "pair")?;
        let num_inputs = session.inputs().len();
        if num_inputs != 2 {
            return Err(ScoreError::Inference(format!(
                "pair model requires 2 inputs, got {num_inputs}"
            )));
        }
        Ok(Self { session })
    }
}

impl Scorer for OnnxPairScorer {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
        if a.shape() != b.shape() {
            return Err(ScoreError::InvalidInput(format!(
                "tensor shape mismatch: {:?} vs {:?}",
                a.shape(),
                b.shape()
            )));
        }

        let left = a.batched();
        let right = b.batched();
        let outputs = self.session.run(ort::inputs![
            TensorRef::from_array_view(left.view())?,
            TensorRef::from_array_view(right.view())?
        ])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ScoreError::Inference(format!("score extraction: {e}")))?;

        let score = raw
            .first()
            .copied()
            .ok_or_else(|| ScoreError::Inference("model returned an empty score tensor".into()))?;
        Ok(score)
    }
}

/// Single-input embedding model: `[1,H,W,3] -> [1,D]`.
pub struct OnnxEmbedder {
    session: Session,
    model_version: String,
}

impl OnnxEmbedder {
    /// Load the embedding model; the file stem becomes the model version tag.
    pub fn load(model_path: &str) -> Result<Self, ScoreError> {
        let session = load_session(model_path, "embedding")?;
        let model_version = Path::new(model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { session, model_version })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, input: &Tensor) -> Result<Embedding, ScoreError> {
        let batched = input.batched();
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(batched.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ScoreError::Inference(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.is_empty() {
            return Err(ScoreError::Inference("model returned an empty embedding".into()));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.model_version.clone()),
        })
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_pair_model() {
        let err = OnnxPairScorer::load("/nonexistent/pair.onnx").err().unwrap();
        match err {
            ScoreError::ModelNotFound(path) => assert_eq!(path, "/nonexistent/pair.onnx"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_embedding_model() {
        assert!(matches!(
            OnnxEmbedder::load("/nonexistent/embed.onnx"),
            Err(ScoreError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
