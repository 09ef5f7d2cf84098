//! Scores a labeled [`PairSet`] and summarises how well the threshold
//! separates genuine pairs from forged ones.
//!
//! The genuine label is the positive class. A pair is predicted genuine when
//! its score is strictly above the threshold, the same rule the verifier uses.

use crate::pairs::{PairSet, LABEL_GENUINE};
use crate::preprocess::{PreprocessError, Preprocessor, Tensor};
use crate::scorer::{ScoreError, Scorer};
use crate::types::ImageSource;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error("pair set is empty")]
    EmptyPairSet,
    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
    #[error(transparent)]
    Decode(#[from] PreprocessError),
    #[error("scoring pair {index} ({first} / {second}): {source}")]
    Score {
        index: usize,
        first: PathBuf,
        second: PathBuf,
        #[source]
        source: ScoreError,
    },
    #[error("scorer returned {score} for pair {index}; expected a value in [0, 1]")]
    InvalidScore { index: usize, score: f32 },
}

/// Binary confusion matrix, genuine = positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub true_positive: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.true_negative + self.false_positive + self.false_negative + self.true_positive
    }

    fn record(&mut self, label: u8, predicted_genuine: bool) {
        match (label == LABEL_GENUINE, predicted_genuine) {
            (true, true) => self.true_positive += 1,
            (true, false) => self.false_negative += 1,
            (false, true) => self.false_positive += 1,
            (false, false) => self.true_negative += 1,
        }
    }
}

/// Precision, recall and F1 for one class. Undefined ratios are 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

impl ClassMetrics {
    fn new(hits: usize, predicted: usize, support: usize) -> Self {
        let precision = ratio(hits, predicted);
        let recall = ratio(hits, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
            support,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub threshold: f32,
    pub confusion: ConfusionMatrix,
    pub genuine: ClassMetrics,
    pub forged: ClassMetrics,
    pub accuracy: f64,
}

impl Evaluation {
    pub fn from_confusion(confusion: ConfusionMatrix, threshold: f32) -> Self {
        let c = confusion;
        Self {
            threshold,
            confusion,
            genuine: ClassMetrics::new(
                c.true_positive,
                c.true_positive + c.false_positive,
                c.true_positive + c.false_negative,
            ),
            forged: ClassMetrics::new(
                c.true_negative,
                c.true_negative + c.false_negative,
                c.true_negative + c.false_positive,
            ),
            accuracy: ratio(c.true_positive + c.true_negative, c.total()),
        }
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1", "support")?;
        for (name, m) in [("Forged", &self.forged), ("Genuine", &self.genuine)] {
            writeln!(
                f,
                "{name:>10} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f, "{:>10} {:>29.2} {:>9}", "accuracy", self.accuracy, self.confusion.total())?;
        writeln!(f)?;
        writeln!(f, "confusion matrix (rows: true, columns: predicted; forged, genuine)")?;
        let c = &self.confusion;
        writeln!(f, "[[{} {}]", c.true_negative, c.false_positive)?;
        write!(f, " [{} {}]]", c.false_negative, c.true_positive)
    }
}

/// Score every pair of `pairs` and compare `score > threshold` to its label.
///
/// Each distinct image path is decoded once.
pub fn evaluate<S: Scorer + ?Sized>(
    scorer: &mut S,
    preprocessor: &Preprocessor,
    pairs: &PairSet,
    threshold: f32,
) -> Result<Evaluation, EvaluateError> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(EvaluateError::InvalidThreshold(threshold));
    }
    if pairs.is_empty() {
        return Err(EvaluateError::EmptyPairSet);
    }

    let mut tensors: HashMap<&Path, Tensor> = HashMap::new();
    for pair in pairs.iter() {
        for path in [pair.first, pair.second] {
            if !tensors.contains_key(path) {
                let tensor = preprocessor.preprocess(&ImageSource::FromPath(path.to_path_buf()))?;
                tensors.insert(path, tensor);
            }
        }
    }

    let mut confusion = ConfusionMatrix::default();
    for (index, pair) in pairs.iter().enumerate() {
        let (Some(a), Some(b)) = (tensors.get(pair.first), tensors.get(pair.second)) else {
            continue;
        };
        let score = scorer.score(a, b).map_err(|source| EvaluateError::Score {
            index,
            first: pair.first.to_path_buf(),
            second: pair.second.to_path_buf(),
            source,
        })?;
        if !(0.0..=1.0).contains(&score) {
            return Err(EvaluateError::InvalidScore { index, score });
        }
        confusion.record(pair.label, score > threshold);
    }

    let evaluation = Evaluation::from_confusion(confusion, threshold);
    tracing::info!(
        pairs = confusion.total(),
        images = tensors.len(),
        threshold,
        precision = evaluation.genuine.precision,
        recall = evaluation.genuine.recall,
        f1 = evaluation.genuine.f1,
        "evaluated pair set"
    );
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairs::LABEL_FORGED;
    use crate::preprocess::tests::gray_png;
    use std::fs;
    use tempfile::TempDir;

    /// Scores `1 - |mean(a) - mean(b)|`, so equal gray levels score 1.0.
    struct MeanGapScorer {
        calls: usize,
    }

    impl Scorer for MeanGapScorer {
        fn score(&mut self, a: &Tensor, b: &Tensor) -> Result<f32, ScoreError> {
            self.calls += 1;
            Ok((1.0 - (a.mean() - b.mean()).abs()).clamp(0.0, 1.0))
        }
    }

    struct ConstScorer(f32);

    impl Scorer for ConstScorer {
        fn score(&mut self, _a: &Tensor, _b: &Tensor) -> Result<f32, ScoreError> {
            Ok(self.0)
        }
    }

    struct Images {
        _tmp: TempDir,
        dir: PathBuf,
    }

    impl Images {
        fn new(levels: &[u8]) -> Self {
            let tmp = TempDir::new().unwrap();
            let dir = tmp.path().to_path_buf();
            for &level in levels {
                fs::write(dir.join(format!("{level}.png")), gray_png(6, 6, level)).unwrap();
            }
            Self { _tmp: tmp, dir }
        }

        fn path(&self, level: u8) -> PathBuf {
            self.dir.join(format!("{level}.png"))
        }

        fn pairs(&self, entries: &[(u8, u8, u8)]) -> PairSet {
            PairSet {
                pairs: entries.iter().map(|&(a, b, _)| (self.path(a), self.path(b))).collect(),
                labels: entries.iter().map(|&(_, _, label)| label).collect(),
            }
        }
    }

    #[test]
    fn test_confusion_and_metrics() {
        let images = Images::new(&[0, 50, 100, 110, 200, 255]);
        let set = images.pairs(&[
            (50, 50, LABEL_GENUINE),
            (100, 100, LABEL_GENUINE),
            (0, 200, LABEL_GENUINE),
            (0, 255, LABEL_FORGED),
            (100, 110, LABEL_FORGED),
        ]);
        let mut scorer = MeanGapScorer { calls: 0 };
        let eval = evaluate(&mut scorer, &Preprocessor::new(8), &set, 0.5).unwrap();

        assert_eq!(
            eval.confusion,
            ConfusionMatrix {
                true_negative: 1,
                false_positive: 1,
                false_negative: 1,
                true_positive: 2,
            }
        );
        assert!((eval.genuine.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((eval.genuine.recall - 2.0 / 3.0).abs() < 1e-9);
        assert!((eval.genuine.f1 - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(eval.genuine.support, 3);
        assert!((eval.forged.precision - 0.5).abs() < 1e-9);
        assert!((eval.forged.recall - 0.5).abs() < 1e-9);
        assert_eq!(eval.forged.support, 2);
        assert!((eval.accuracy - 0.6).abs() < 1e-9);
        assert_eq!(scorer.calls, 5);
    }

    #[test]
    fn test_score_equal_to_threshold_predicts_forged() {
        let images = Images::new(&[10, 20]);
        let set = images.pairs(&[(10, 20, LABEL_GENUINE), (10, 20, LABEL_FORGED)]);
        let eval = evaluate(&mut ConstScorer(0.5), &Preprocessor::new(8), &set, 0.5).unwrap();
        assert_eq!(eval.confusion.false_negative, 1);
        assert_eq!(eval.confusion.true_negative, 1);
        assert_eq!(eval.confusion.true_positive + eval.confusion.false_positive, 0);
    }

    #[test]
    fn test_no_positive_predictions_gives_zero_precision() {
        let images = Images::new(&[10, 20]);
        let set = images.pairs(&[(10, 20, LABEL_GENUINE)]);
        let eval = evaluate(&mut ConstScorer(0.1), &Preprocessor::new(8), &set, 0.5).unwrap();
        assert_eq!(eval.genuine.precision, 0.0);
        assert_eq!(eval.genuine.recall, 0.0);
        assert_eq!(eval.genuine.f1, 0.0);
        assert_eq!(eval.forged.support, 0);
    }

    #[test]
    fn test_empty_pair_set() {
        let err = evaluate(&mut ConstScorer(0.9), &Preprocessor::new(8), &PairSet::default(), 0.5)
            .unwrap_err();
        assert!(matches!(err, EvaluateError::EmptyPairSet));
    }

    #[test]
    fn test_invalid_threshold() {
        let images = Images::new(&[10]);
        let set = images.pairs(&[(10, 10, LABEL_GENUINE)]);
        let err = evaluate(&mut ConstScorer(0.9), &Preprocessor::new(8), &set, 1.5).unwrap_err();
        assert!(matches!(err, EvaluateError::InvalidThreshold(_)));
    }

    #[test]
    fn test_out_of_range_score() {
        let images = Images::new(&[10]);
        let set = images.pairs(&[(10, 10, LABEL_GENUINE)]);
        let err = evaluate(&mut ConstScorer(f32::NAN), &Preprocessor::new(8), &set, 0.5).unwrap_err();
        assert!(matches!(err, EvaluateError::InvalidScore { index: 0, .. }));
    }

    #[test]
    fn test_missing_image_is_decode_error() {
        let images = Images::new(&[10]);
        let mut set = images.pairs(&[(10, 10, LABEL_GENUINE)]);
        set.pairs[0].1 = images.dir.join("gone.png");
        let err = evaluate(&mut ConstScorer(0.9), &Preprocessor::new(8), &set, 0.5).unwrap_err();
        assert!(matches!(err, EvaluateError::Decode(_)));
    }

    #[test]
    fn test_report_lists_both_classes() {
        let eval = Evaluation::from_confusion(
            ConfusionMatrix {
                true_negative: 4,
                false_positive: 1,
                false_negative: 2,
                true_positive: 3,
            },
            0.5,
        );
        let report = eval.to_string();
        assert!(report.contains("Forged"));
        assert!(report.contains("Genuine"));
        assert!(report.contains("[[4 1]"));
        assert!(report.contains(" [2 3]]"));
    }
}
