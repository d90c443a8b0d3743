//! Precondition faults raised while compiling batches and computing losses

use mixtune_tokenizer::Role;
use thiserror::Error;

/// Fatal faults in sequence compilation, collation and loss computation
///
/// None of these are retried; they abort the enclosing batch construction or
/// training step.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SftError {
    #[error("Role {0} cannot appear in a supervised conversation")]
    UnsupportedRole(Role),
    #[error("Example {index} carries context but mixture examples must not")]
    ContextInMixture { index: usize },
    #[error("Example {index} has no stage-two conversation")]
    MissingStageConversation { index: usize },
    #[error("Batch has no fields for stage prefix {prefix:?}")]
    MissingStageFields { prefix: String },
    #[error("Batch field {0} is already present")]
    FieldCollision(String),
    #[error("Cannot assemble a batch from zero sequences")]
    EmptyBatch,
    #[error("Sequence {index} has misaligned fields ({ids} ids, {attention} mask, {labels} labels)")]
    MisalignedSequence {
        index: usize,
        ids: usize,
        attention: usize,
        labels: usize,
    },
    #[error("Stage two ratio must lie in [0, 1], got {0}")]
    InvalidRatio(f32),
    #[error("Unknown dataset format: {0}")]
    UnknownDatasetFormat(String),
    #[error("No training examples available")]
    EmptyDataset,
}
