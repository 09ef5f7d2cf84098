//! Gallery verification: score a probe against every enrolled reference of
//! one identity, keep the maximum, and threshold it.

use crate::gallery::{GalleryStore, StoreError};
use crate::preprocess::{PreprocessError, Preprocessor, Tensor};
use crate::scorer::{ScoreError, Scorer};
use crate::types::{IdentityId, ImageSource, VerifyDecision};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
    #[error("probe image: {0}")]
    Decode(#[from] PreprocessError),
    #[error("identity {0} has no enrolled references")]
    NoReferences(IdentityId),
    #[error("none of the {undecodable} references enrolled for identity {identity} could be decoded")]
    EmptyGallery { identity: IdentityId, undecodable: usize },
    #[error("scorer returned {score} for identity {identity}, reference {reference_id}; expected a value in [0, 1]")]
    InvalidScore {
        identity: IdentityId,
        reference_id: i64,
        score: f32,
    },
    #[error("verification of identity {identity} exceeded {budget:?} after scoring {scored} references")]
    Timeout {
        identity: IdentityId,
        scored: usize,
        budget: Duration,
    },
    #[error("scoring identity {identity}, reference {reference_id}: {source}")]
    Score {
        identity: IdentityId,
        reference_id: i64,
        #[source]
        source: ScoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Verification engine. Scorer and gallery are injected at construction.
pub struct Verifier<S, G> {
    preprocessor: Preprocessor,
    scorer: S,
    gallery: G,
    threshold: f32,
    timeout: Option<Duration>,
}

impl<S: Scorer, G: GalleryStore> Verifier<S, G> {
    pub fn new(scorer: S, gallery: G) -> Self {
        Self {
            preprocessor: Preprocessor::default(),
            scorer,
            gallery,
            threshold: DEFAULT_THRESHOLD,
            timeout: None,
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Threshold used by [`verify_default`](Self::verify_default).
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Bound the wall-clock time of one verification call.
    ///
    /// Checked after each scoring call; an in-flight call is not interrupted.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn gallery(&self) -> &G {
        &self.gallery
    }

    pub fn gallery_mut(&mut self) -> &mut G {
        &mut self.gallery
    }

    pub fn into_parts(self) -> (S, G) {
        (self.scorer, self.gallery)
    }

    /// Verify with the configured threshold.
    pub fn verify_default(
        &mut self,
        probe: &ImageSource,
        identity: IdentityId,
    ) -> Result<VerifyDecision, VerifyError> {
        let threshold = self.threshold;
        self.verify(probe, identity, threshold)
    }

    /// Score `probe` against every reference of `identity` and decide.
    ///
    /// Every decodable reference is scored; there is no early exit once the
    /// threshold is passed. `accepted` is `max_score > threshold`.
    ///
    /// An identity the gallery does not know resolves to no references and
    /// fails with [`VerifyError::NoReferences`], like one with none enrolled.
    pub fn verify(
        &mut self,
        probe: &ImageSource,
        identity: IdentityId,
        threshold: f32,
    ) -> Result<VerifyDecision, VerifyError> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(VerifyError::InvalidThreshold(threshold));
        }

        let started = Instant::now();
        let probe_tensor = self.preprocessor.preprocess(probe)?;

        let references = match self.gallery.list_references(identity) {
            Err(StoreError::UnknownIdentity(_)) => Vec::new(),
            other => other?,
        };
        if references.is_empty() {
            return Err(VerifyError::NoReferences(identity));
        }

        let mut decoded: Vec<(i64, Tensor)> = Vec::with_capacity(references.len());
        let mut skipped = 0usize;
        for reference in &references {
            match self.preprocessor.preprocess_bytes(&reference.image) {
                Ok(tensor) => decoded.push((reference.id, tensor)),
                Err(err) => {
                    skipped += 1;
                    tracing::warn!(
                        identity = %identity,
                        reference = reference.id,
                        error = %err,
                        "skipping undecodable reference"
                    );
                }
            }
        }

        if decoded.is_empty() {
            return Err(VerifyError::EmptyGallery {
                identity,
                undecodable: skipped,
            });
        }

        let mut best: Option<(i64, f32)> = None;
        for (scored, (reference_id, tensor)) in decoded.iter().enumerate() {
            let score = self
                .scorer
                .score(&probe_tensor, tensor)
                .map_err(|source| VerifyError::Score {
                    identity,
                    reference_id: *reference_id,
                    source,
                })?;

            if !(0.0..=1.0).contains(&score) {
                return Err(VerifyError::InvalidScore {
                    identity,
                    reference_id: *reference_id,
                    score,
                });
            }

            let is_better = match best {
                None => true,
                Some((_, prev)) => score > prev,
            };
            if is_better {
                best = Some((*reference_id, score));
            }

            if let Some(budget) = self.timeout {
                if started.elapsed() > budget && scored + 1 < decoded.len() {
                    return Err(VerifyError::Timeout {
                        identity,
                        scored: scored + 1,
                        budget,
                    });
                }
            }
        }

        let (best_reference, max_score) = best.ok_or(VerifyError::EmptyGallery {
            identity,
            undecodable: skipped,
        })?;
        let accepted = max_score > threshold;

        tracing::debug!(
            identity = %identity,
            scored = decoded.len(),
            skipped,
            max_score,
            threshold,
            accepted,
            "verify: gallery scored"
        );

        Ok(VerifyDecision {
            identity,
            max_score,
            accepted,
            threshold,
            best_reference,
            scored: decoded.len(),
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{AlwaysSkip, InMemoryGallery};
    use crate::preprocess::tests::gray_png;
    use std::collections::HashMap;

    /// Scores by looking up the reference's gray level in a table.
    ///
    /// References are uniform gray images, so any pixel identifies which
    /// reference is being scored.
    struct TableScorer {
        by_level: HashMap<u8, f32>,
        calls: usize,
    }

    impl TableScorer {
        fn new(entries: &[(u8, f32)]) -> Self {
            Self {
                by_level: entries.iter().copied().collect(),
                calls: 0,
            }
        }
    }

    impl Scorer for TableScorer {
        fn score(&mut self, _probe: &Tensor, reference: &Tensor) -> Result<f32, ScoreError> {
            self.calls += 1;
            let level = (reference.view()[[0, 0, 0]] * 255.0).round() as u8;
            self.by_level
                .get(&level)
                .copied()
                .ok_or_else(|| ScoreError::Inference(format!("no score for level {level}")))
        }
    }

    fn probe() -> ImageSource {
        ImageSource::FromBytes(gray_png(12, 12, 128))
    }

    fn gallery_with(levels: &[u8]) -> (InMemoryGallery, IdentityId) {
        let mut gallery = InMemoryGallery::new();
        let id = gallery.add_identity("Alice", "alice@example.com").unwrap();
        for &level in levels {
            gallery
                .add_reference(id, &gray_png(10, 10, level), &mut AlwaysSkip)
                .unwrap();
        }
        (gallery, id)
    }

    #[test]
    fn test_identity_seven_scenario() {
        let mut gallery = InMemoryGallery::new();
        let mut id = IdentityId(0);
        for n in 0..7 {
            id = gallery
                .add_identity(&format!("user{n}"), &format!("user{n}@example.com"))
                .unwrap();
        }
        assert_eq!(id, IdentityId(7));
        gallery.add_reference(id, &gray_png(10, 10, 20), &mut AlwaysSkip).unwrap();
        gallery.add_reference(id, &gray_png(10, 10, 40), &mut AlwaysSkip).unwrap();

        let scorer = TableScorer::new(&[(20, 0.3), (40, 0.8)]);
        let mut verifier = Verifier::new(scorer, gallery);
        let decision = verifier.verify(&probe(), IdentityId(7), 0.5).unwrap();

        assert!((decision.max_score - 0.8).abs() < 1e-6);
        assert!(decision.accepted);
        assert_eq!(decision.best_reference, 2);
        assert_eq!(decision.scored, 2);
    }

    #[test]
    fn test_max_matches_independent_max_and_scores_all() {
        let levels = [10u8, 60, 110, 160, 210];
        let scores = [0.2f32, 0.9, 0.4, 0.95, 0.1];
        let table: Vec<(u8, f32)> = levels.iter().copied().zip(scores).collect();
        let (gallery, id) = gallery_with(&levels);

        let mut verifier = Verifier::new(TableScorer::new(&table), gallery);
        let first = verifier.verify(&probe(), id, 0.5).unwrap();
        let second = verifier.verify(&probe(), id, 0.5).unwrap();

        let expected = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!((first.max_score - expected).abs() < 1e-6);
        assert_eq!(first, second);

        let (scorer, _) = verifier.into_parts();
        assert_eq!(scorer.calls, 2 * levels.len());
    }

    #[test]
    fn test_threshold_equality_rejects() {
        let (gallery, id) = gallery_with(&[50]);
        let mut verifier = Verifier::new(TableScorer::new(&[(50, 0.5)]), gallery);
        let decision = verifier.verify(&probe(), id, 0.5).unwrap();
        assert!(!decision.accepted);
        assert!((decision.max_score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_accepted_iff_strictly_greater() {
        let (gallery, id) = gallery_with(&[50]);
        let mut verifier = Verifier::new(TableScorer::new(&[(50, 0.6)]), gallery);
        for threshold in [0.0f32, 0.25, 0.59, 0.6, 0.61, 1.0] {
            let decision = verifier.verify(&probe(), id, threshold).unwrap();
            assert_eq!(decision.accepted, decision.max_score > threshold, "threshold {threshold}");
        }
    }

    #[test]
    fn test_no_references_is_error_not_reject() {
        let (gallery, id) = gallery_with(&[]);
        let mut verifier = Verifier::new(TableScorer::new(&[]), gallery);
        let err = verifier.verify(&probe(), id, 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::NoReferences(i) if i == id));
    }

    #[test]
    fn test_all_undecodable_is_empty_gallery() {
        let mut gallery = InMemoryGallery::new();
        let id = gallery.add_identity("Alice", "alice@example.com").unwrap();
        gallery.add_reference(id, b"garbage", &mut AlwaysSkip).unwrap();
        gallery.add_reference(id, b"more garbage", &mut AlwaysSkip).unwrap();

        let mut verifier = Verifier::new(TableScorer::new(&[]), gallery);
        let err = verifier.verify(&probe(), id, 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::EmptyGallery { undecodable: 2, .. }));
    }

    #[test]
    fn test_undecodable_reference_skipped() {
        let (mut gallery, id) = gallery_with(&[70]);
        gallery.add_reference(id, b"garbage", &mut AlwaysSkip).unwrap();

        let mut verifier = Verifier::new(TableScorer::new(&[(70, 0.7)]), gallery);
        let decision = verifier.verify(&probe(), id, 0.5).unwrap();
        assert_eq!(decision.scored, 1);
        assert_eq!(decision.skipped, 1);
        assert!(decision.accepted);
    }

    #[test]
    fn test_undecodable_probe() {
        let (gallery, id) = gallery_with(&[70]);
        let mut verifier = Verifier::new(TableScorer::new(&[(70, 0.7)]), gallery);
        let err = verifier
            .verify(&ImageSource::FromBytes(b"nope".to_vec()), id, 0.5)
            .unwrap_err();
        assert!(matches!(err, VerifyError::Decode(_)));
    }

    #[test]
    fn test_unknown_identity() {
        let gallery = InMemoryGallery::new();
        let mut verifier = Verifier::new(TableScorer::new(&[]), gallery);
        let err = verifier.verify(&probe(), IdentityId(3), 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::NoReferences(IdentityId(3))));
    }

    #[test]
    fn test_invalid_threshold() {
        let (gallery, id) = gallery_with(&[70]);
        let mut verifier = Verifier::new(TableScorer::new(&[(70, 0.7)]), gallery);
        for threshold in [-0.1f32, 1.5, f32::NAN] {
            assert!(matches!(
                verifier.verify(&probe(), id, threshold),
                Err(VerifyError::InvalidThreshold(_))
            ));
        }
    }

    #[test]
    fn test_out_of_range_score_rejected() {
        let (gallery, id) = gallery_with(&[70]);
        let mut verifier = Verifier::new(TableScorer::new(&[(70, 1.7)]), gallery);
        let err = verifier.verify(&probe(), id, 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidScore { reference_id: 1, .. }));
    }

    #[test]
    fn test_scorer_failure_carries_reference() {
        let (gallery, id) = gallery_with(&[70, 90]);
        let mut verifier = Verifier::new(TableScorer::new(&[(70, 0.7)]), gallery);
        let err = verifier.verify(&probe(), id, 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::Score { reference_id: 2, .. }));
    }

    #[test]
    fn test_zero_timeout_fails_before_finishing() {
        let (gallery, id) = gallery_with(&[10, 20, 30]);
        let table = [(10u8, 0.1f32), (20, 0.2), (30, 0.3)];
        let mut verifier =
            Verifier::new(TableScorer::new(&table), gallery).with_timeout(Duration::ZERO);
        let err = verifier.verify(&probe(), id, 0.5).unwrap_err();
        assert!(matches!(err, VerifyError::Timeout { scored: 1, .. }));
    }

    #[test]
    fn test_budget_spent_on_last_reference_still_decides() {
        let (gallery, id) = gallery_with(&[40]);
        let mut verifier =
            Verifier::new(TableScorer::new(&[(40, 0.8)]), gallery).with_timeout(Duration::ZERO);
        let decision = verifier.verify(&probe(), id, 0.5).unwrap();
        assert!(decision.accepted);
        assert_eq!(decision.scored, 1);
    }

    #[test]
    fn test_verify_default_uses_configured_threshold() {
        let (gallery, id) = gallery_with(&[50]);
        let mut verifier =
            Verifier::new(TableScorer::new(&[(50, 0.6)]), gallery).with_threshold(0.7);
        let decision = verifier.verify_default(&probe(), id).unwrap();
        assert!(!decision.accepted);
        assert!((decision.threshold - 0.7).abs() < 1e-6);
    }
}
