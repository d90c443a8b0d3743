//! Model runtime seam
//!
//! The fine-tuning core never touches weights directly. A runtime implements
//! [`CausalLm`] for its model and picks a [`TrainingLoss`] type that keeps
//! whatever gradient bookkeeping it needs.

use crate::collator::StageBatch;
use anyhow::Result;
use std::path::Path;

/// Scalar loss that can be combined and read without affecting gradients
pub trait TrainingLoss: Sized {
    /// Plain value of the loss, outside any gradient graph
    fn detached(&self) -> f32;

    /// `a_weight * self + b_weight * other`, keeping gradients of both terms
    fn weighted_sum(self, a_weight: f32, other: Self, b_weight: f32) -> Result<Self>;
}

impl TrainingLoss for f32 {
    fn detached(&self) -> f32 {
        *self
    }

    fn weighted_sum(self, a_weight: f32, other: Self, b_weight: f32) -> Result<Self> {
        Ok(a_weight * self + b_weight * other)
    }
}

/// Causal language model being fine-tuned
pub trait CausalLm {
    /// Loss produced by a forward pass
    type Loss: TrainingLoss;

    /// Mean token loss over the supervised positions of one stage batch
    fn forward(&mut self, batch: &StageBatch) -> Result<Self::Loss>;

    /// Accumulate gradients of `loss`
    fn backward(&mut self, loss: Self::Loss) -> Result<()>;

    /// Apply and reset accumulated gradients
    fn optimizer_step(&mut self) -> Result<()>;

    /// Current learning rate, if the runtime tracks one
    fn learning_rate(&self) -> Option<f32> {
        None
    }

    /// Persist trainable adapter weights under `dir`
    fn save_adapter(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Restore adapter weights saved by [`CausalLm::save_adapter`]
    fn load_adapter(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}
