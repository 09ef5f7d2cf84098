//! Pairwise scoring seam.
//!
//! The verifier only sees [`Scorer`]. Models that emit embeddings instead of
//! a pair score plug in through [`Embedder`] + [`EmbeddingScorer`].

use crate::preprocess::Tensor;
use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid scorer input: {0}")]
    InvalidInput(String),
    /// A failure the collaborator reports as worth retrying.
    #[error("transient scorer failure: {0}")]
    Transient(String),
    #[error("scorer failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ScoreError>,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque similarity function: higher = more alike, expected in [0, 1].
pub trait Scorer {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError>;
}

impl<S: Scorer + ?Sized> Scorer for Box<S> {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
        (**self).score(a, b)
    }
}

impl<S: Scorer + ?Sized> Scorer for &mut S {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
        (**self).score(a, b)
    }
}

/// Model that maps one tensor to an embedding vector.
pub trait Embedder {
    fn embed(&mut self, input: &Tensor) -> Result<Embedding, ScoreError>;
}

/// Adapts an [`Embedder`] into a [`Scorer`].
///
/// Cosine similarity `c` in [-1, 1] is mapped to `(c + 1) / 2` so the score
/// lands in [0, 1] like a pair model's output.
pub struct EmbeddingScorer<E> {
    embedder: E,
}

impl<E: Embedder> EmbeddingScorer<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    pub fn into_inner(self) -> E {
        self.embedder
    }
}

impl<E: Embedder> Scorer for EmbeddingScorer<E> {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
        let ea = self.embedder.embed(a)?;
        let eb = self.embedder.embed(b)?;
        if ea.values.len() != eb.values.len() {
            return Err(ScoreError::InvalidInput(format!(
                "embedding length mismatch: {} vs {}",
                ea.values.len(),
                eb.values.len()
            )));
        }
        let cosine = ea.similarity(&eb);
        Ok(((cosine + 1.0) / 2.0).clamp(0.0, 1.0))
    }
}

/// Retries a wrapped scorer on [`ScoreError::Transient`].
///
/// Non-transient errors pass through untouched. When every attempt fails
/// transiently the caller sees a single [`ScoreError::RetriesExhausted`].
pub struct RetryingScorer<S> {
    inner: S,
    max_retries: u32,
}

impl<S: Scorer> RetryingScorer<S> {
    /// Retry once, the default policy.
    pub fn new(inner: S) -> Self {
        Self::with_retries(inner, 1)
    }

    pub fn with_retries(inner: S, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Scorer> Scorer for RetryingScorer<S> {
    fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.score(a, b) {
                Ok(score) => return Ok(score),
                Err(ScoreError::Transient(message)) if attempt <= self.max_retries => {
                    tracing::warn!(attempt, error = %message, "transient scorer failure; retrying");
                }
                Err(err @ ScoreError::Transient(_)) => {
                    return Err(ScoreError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
