//! Training pair synthesis from a genuine/forged dataset layout.
//!
//! Each identity has a folder under the genuine root and, optionally, a
//! folder under the forged root named `<identity><suffix>`. Positives are
//! every unordered pair of genuine images within one identity. Negatives
//! pair each genuine image with forged images drawn from the matching
//! forged folder. The combined list is shuffled once with a seeded RNG, so
//! the same inputs and seed always produce the same sequence.
//!
//! Negative partners are drawn from their own generator seeded with
//! `sampling_seed`; `seed` only drives the final permutation. Changing
//! `seed` therefore reorders the output without changing its contents.

use crate::dataset::{self, DatasetError};
use crate::preprocess::{PreprocessError, Preprocessor, Tensor};
use crate::types::ImageSource;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_FORGED_SUFFIX: &str = "_forged";
pub const DEFAULT_PAIR_SEED: u64 = 42;

pub const LABEL_GENUINE: u8 = 1;
pub const LABEL_FORGED: u8 = 0;

#[derive(Error, Debug)]
pub enum PairError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("forged folder {forged} has no genuine counterpart at {expected}")]
    MissingGenuineFolder { forged: PathBuf, expected: PathBuf },
    #[error("forged folder {0} has no images to pair with")]
    EmptyForgedFolder(PathBuf),
    #[error("no pairs could be built from {genuine} and {forged}")]
    EmptyDataset { genuine: PathBuf, forged: PathBuf },
    #[error("invalid pair configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairConfig {
    /// Removed from a forged folder name to find its genuine folder.
    pub forged_suffix: String,
    /// Forged partners drawn per genuine image.
    pub negatives_per_genuine: usize,
    /// Seed of the final shuffle.
    pub seed: u64,
    /// Seed of the forged-partner draws.
    pub sampling_seed: u64,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            forged_suffix: DEFAULT_FORGED_SUFFIX.to_string(),
            negatives_per_genuine: 1,
            seed: DEFAULT_PAIR_SEED,
            sampling_seed: DEFAULT_PAIR_SEED,
        }
    }
}

/// Positive and negative pair counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairCounts {
    pub positive: usize,
    pub negative: usize,
}

/// One labeled pair borrowed from a [`PairSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabeledPair<'a> {
    pub first: &'a Path,
    pub second: &'a Path,
    pub label: u8,
}

/// Parallel pair and label lists; `labels[i]` belongs to `pairs[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSet {
    pub pairs: Vec<(PathBuf, PathBuf)>,
    pub labels: Vec<u8>,
}

/// Decoded tensors for a whole pair set, in pair order.
#[derive(Debug, Clone)]
pub struct PairTensors {
    pub left: Vec<Tensor>,
    pub right: Vec<Tensor>,
    pub labels: Vec<u8>,
}

impl PairSet {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = LabeledPair<'_>> {
        self.pairs
            .iter()
            .zip(self.labels.iter())
            .map(|((first, second), &label)| LabeledPair {
                first,
                second,
                label,
            })
    }

    pub fn counts(&self) -> PairCounts {
        let positive = self.labels.iter().filter(|&&l| l == LABEL_GENUINE).count();
        PairCounts {
            positive,
            negative: self.labels.len() - positive,
        }
    }

    /// Decode every image through the shared preprocessor.
    ///
    /// Images referenced by several pairs are decoded once per occurrence.
    pub fn materialize(&self, preprocessor: &Preprocessor) -> Result<PairTensors, PreprocessError> {
        let mut left = Vec::with_capacity(self.len());
        let mut right = Vec::with_capacity(self.len());
        for (a, b) in &self.pairs {
            left.push(preprocessor.preprocess(&ImageSource::FromPath(a.clone()))?);
            right.push(preprocessor.preprocess(&ImageSource::FromPath(b.clone()))?);
        }
        Ok(PairTensors {
            left,
            right,
            labels: self.labels.clone(),
        })
    }
}

pub struct PairSynthesizer {
    config: PairConfig,
}

impl PairSynthesizer {
    pub fn new(config: PairConfig) -> Result<Self, PairError> {
        if config.forged_suffix.is_empty() {
            return Err(PairError::InvalidConfig("forged suffix must not be empty".into()));
        }
        if config.negatives_per_genuine == 0 {
            return Err(PairError::InvalidConfig(
                "negatives_per_genuine must be at least 1".into(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    pub fn synthesize(&self, genuine_dir: &Path, forged_dir: &Path) -> Result<PairSet, PairError> {
        let mut sampler = StdRng::seed_from_u64(self.config.sampling_seed);
        let mut labeled: Vec<(PathBuf, PathBuf, u8)> = Vec::new();
        let genuine_folders = dataset::list_subdirs(genuine_dir)?;

        for (name, folder) in &genuine_folders {
            let images = dataset::list_images(folder)?;
            let before = labeled.len();
            for (i, a) in images.iter().enumerate() {
                for b in &images[i + 1..] {
                    labeled.push((a.clone(), b.clone(), LABEL_GENUINE));
                }
            }
            tracing::debug!(
                identity = %name,
                images = images.len(),
                positives = labeled.len() - before,
                "genuine folder"
            );
        }

        for (name, folder) in dataset::list_subdirs(forged_dir)? {
            // Resolve against listed identity folders, never the genuine root.
            let identity = name.replace(&self.config.forged_suffix, "");
            let Some((_, expected)) = genuine_folders
                .iter()
                .find(|(genuine_name, _)| !identity.is_empty() && *genuine_name == identity)
            else {
                return Err(PairError::MissingGenuineFolder {
                    forged: folder,
                    expected: genuine_dir.join(identity),
                });
            };

            let genuine = dataset::list_images(expected)?;
            let forged = dataset::list_images(&folder)?;
            if genuine.is_empty() {
                continue;
            }
            if forged.is_empty() {
                return Err(PairError::EmptyForgedFolder(folder));
            }

            for g in &genuine {
                for _ in 0..self.config.negatives_per_genuine {
                    let f = &forged[sampler.gen_range(0..forged.len())];
                    labeled.push((g.clone(), f.clone(), LABEL_FORGED));
                }
            }
            tracing::debug!(
                identity = %name,
                negatives = genuine.len() * self.config.negatives_per_genuine,
                "forged folder"
            );
        }

        if labeled.is_empty() {
            return Err(PairError::EmptyDataset {
                genuine: genuine_dir.to_path_buf(),
                forged: forged_dir.to_path_buf(),
            });
        }

        labeled.shuffle(&mut StdRng::seed_from_u64(self.config.seed));

        let mut set = PairSet {
            pairs: Vec::with_capacity(labeled.len()),
            labels: Vec::with_capacity(labeled.len()),
        };
        for (a, b, label) in labeled {
            set.pairs.push((a, b));
            set.labels.push(label);
        }

        let counts = set.counts();
        tracing::info!(
            genuine = %genuine_dir.display(),
            forged = %forged_dir.display(),
            seed = self.config.seed,
            positives = counts.positive,
            negatives = counts.negative,
            "synthesized training pairs"
        );
        Ok(set)
    }
}

/// Synthesize with the default suffix and one negative per genuine image.
pub fn synthesize_pairs(genuine_dir: &Path, forged_dir: &Path, seed: u64) -> Result<PairSet, PairError> {
    PairSynthesizer::new(PairConfig {
        seed,
        ..PairConfig::default()
    })?
    .synthesize(genuine_dir, forged_dir)
}
