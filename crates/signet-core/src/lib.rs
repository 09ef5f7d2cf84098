//! signet-core — Signature verification against an enrolled gallery.
//!
//! A probe signature is scored against every reference enrolled for an
//! identity through a pluggable [`Scorer`]; the maximum score decides
//! acceptance. The same preprocessing feeds training pair synthesis from a
//! genuine/forged dataset tree.

pub mod dataset;
pub mod evaluate;
pub mod gallery;
pub mod onnx;
pub mod pairs;
pub mod preprocess;
pub mod scorer;
pub mod types;
pub mod verifier;

pub use evaluate::{evaluate, ClassMetrics, ConfusionMatrix, EvaluateError, Evaluation};
pub use gallery::{
    AddOutcome, AlwaysReplace, AlwaysSkip, DuplicateAction, DuplicatePolicy, GalleryStore,
    InMemoryGallery, StoreError,
};
pub use pairs::{synthesize_pairs, PairConfig, PairError, PairSet, PairSynthesizer};
pub use preprocess::{PreprocessError, Preprocessor, Tensor};
pub use scorer::{EmbeddingScorer, RetryingScorer, ScoreError, Scorer};
pub use types::{Embedding, Identity, IdentityId, ImageSource, ReferenceTemplate, VerifyDecision};
pub use verifier::{Verifier, VerifyError, DEFAULT_THRESHOLD};
