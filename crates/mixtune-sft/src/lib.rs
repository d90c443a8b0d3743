//! Mixture-objective supervised fine-tuning on multi-turn conversations
//!
//! This crate compiles conversations into token sequences whose labels
//! supervise assistant turns only, assembles them into single-stage or
//! two-stage batches, and trains a [`model::CausalLm`] on either a plain or a
//! weighted mixture loss.

pub mod checkpoint;
pub mod collator;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod mixture;
pub mod model;
pub mod sequence;
pub mod train;

pub use collator::{Batch, BatchAssembler, CollateMode, ConversationCollator, StageBatch};
pub use dataset::{DatasetFormat, Example};
pub use error::SftError;
pub use mixture::MixtureLossAggregator;
pub use model::{CausalLm, TrainingLoss};
pub use sequence::{CompiledSequence, ContextInclusion, SequenceBuilder, IGNORE_INDEX};
