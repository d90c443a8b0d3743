//! Data loading for fine-tuning on prepared examples
//!
//! The loader owns the tokenizer and the examples, orders them once per epoch
//! and collates slices of that order into [`Batch`]es.

use crate::collator::{Batch, BatchAssembler, CollateMode, ConversationCollator};
use crate::config::FinetuneConfigFile;
use crate::dataset::Example;
use crate::sequence::{ContextInclusion, SequenceBuilder};
use anyhow::{Context, Result};
use mixtune_tokenizer::ChatTokenizer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::debug;

/// Examples per length-sorted mega-batch, in units of the batch size
const MEGABATCH_MULTIPLIER: usize = 50;

/// Seed offset separating the context-gate stream from the ordering stream
const CONTEXT_SEED_OFFSET: u64 = 0x9e37_79b9_7f4a_7c15;

/// DataLoader state for checkpointing
///
/// Restoring replays the example order exactly; context-gate draws are not
/// replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLoaderState {
    /// Position in the current epoch's example order
    pub current_pos: usize,
    /// Completed passes over the data
    pub epoch: usize,
    /// Seed the loader was created with
    pub rng_seed: u64,
}

/// Loader behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderOptions {
    /// Examples per batch
    pub batch_size: usize,
    /// Maximum tokens per assistant turn
    pub max_target_len: usize,
    /// Context inclusion policy
    pub context_inclusion: ContextInclusion,
    /// Single-stage or mixture collation
    pub mode: CollateMode,
    /// Pad token used when the vocabulary has none
    pub pad_fallback_token: String,
    /// Group examples of similar length into the same batches
    pub group_by_length: bool,
    /// Seed for ordering and context gating
    pub seed: u64,
}

impl LoaderOptions {
    /// Derive loader options from a fine-tuning config
    pub fn from_config(config: &FinetuneConfigFile) -> Self {
        let mode = if config.data.dataset_format.is_joint_loss() {
            CollateMode::Mixture
        } else {
            CollateMode::SingleStage
        };
        Self {
            batch_size: config.training.batch_size,
            max_target_len: config.sequence.target_max_len,
            context_inclusion: ContextInclusion::from_randomize(config.sequence.randomize_context),
            mode,
            pad_fallback_token: config.sequence.pad_fallback_token.clone(),
            group_by_length: config.training.group_by_length,
            seed: config.data.seed,
        }
    }
}

/// Batches of collated examples
pub struct ExampleDataLoader<T> {
    tokenizer: T,
    examples: Vec<Example>,
    order: Vec<usize>,
    options: LoaderOptions,
    assembler: BatchAssembler,
    current_pos: usize,
    epoch: usize,
    order_rng: StdRng,
    context_rng: StdRng,
}

impl<T: ChatTokenizer> ExampleDataLoader<T> {
    /// Create a loader
    ///
    /// # Errors
    /// Fails when neither the pad token nor the fallback token is in the
    /// vocabulary.
    pub fn new(examples: Vec<Example>, tokenizer: T, options: LoaderOptions) -> Result<Self> {
        let assembler = BatchAssembler::from_tokenizer(&tokenizer, &options.pad_fallback_token)
            .context("Failed to resolve pad token")?;
        let mut loader = Self {
            tokenizer,
            examples,
            order: Vec::new(),
            assembler,
            current_pos: 0,
            epoch: 0,
            order_rng: StdRng::seed_from_u64(options.seed),
            context_rng: StdRng::seed_from_u64(options.seed ^ CONTEXT_SEED_OFFSET),
            options,
        };
        loader.reorder();
        Ok(loader)
    }

    /// Next batch of the current epoch
    ///
    /// The final batch of an epoch may be smaller than the batch size.
    /// Returns `None` once the epoch is exhausted; call
    /// [`ExampleDataLoader::reset`] to start the next one.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.current_pos >= self.order.len() {
            return Ok(None);
        }

        let end = (self.current_pos + self.options.batch_size.max(1)).min(self.order.len());
        let examples: Vec<Example> = self.order[self.current_pos..end]
            .iter()
            .map(|&i| self.examples[i].clone())
            .collect();

        let builder = SequenceBuilder::new(&self.tokenizer, self.options.max_target_len)
            .with_context_inclusion(self.options.context_inclusion);
        let collator = ConversationCollator::new(builder, self.assembler, self.options.mode);
        let batch = collator
            .collate(&examples, &mut self.context_rng)
            .with_context(|| {
                format!(
                    "Failed to collate examples {}..{} of epoch {}",
                    self.current_pos, end, self.epoch
                )
            })?;

        self.current_pos = end;
        Ok(Some(batch))
    }

    /// Start the next epoch with a fresh order
    pub fn reset(&mut self) {
        self.current_pos = 0;
        self.epoch += 1;
        self.reorder();
    }

    /// Get the current dataloader state for checkpointing
    pub fn get_state(&self) -> DataLoaderState {
        DataLoaderState {
            current_pos: self.current_pos,
            epoch: self.epoch,
            rng_seed: self.options.seed,
        }
    }

    /// Restore dataloader state from checkpoint
    pub fn restore_state(&mut self, state: &DataLoaderState) {
        self.options.seed = state.rng_seed;
        self.order_rng = StdRng::seed_from_u64(state.rng_seed);
        self.context_rng = StdRng::seed_from_u64(state.rng_seed ^ CONTEXT_SEED_OFFSET);
        for _ in 0..=state.epoch {
            self.reorder();
        }
        self.epoch = state.epoch;
        self.current_pos = state.current_pos.min(self.order.len());
        debug!(
            "Restored loader at position {} of epoch {}",
            self.current_pos, self.epoch
        );
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the loader has no examples
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Completed passes over the data
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Fractional epoch, e.g. 1.5 halfway through the second pass
    pub fn progress(&self) -> f64 {
        if self.order.is_empty() {
            return self.epoch as f64;
        }
        self.epoch as f64 + self.current_pos as f64 / self.order.len() as f64
    }

    /// Loader options
    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Tokenizer used for collation
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    fn reorder(&mut self) {
        self.order = if self.options.group_by_length {
            let lengths: Vec<usize> = self.examples.iter().map(Example::length).collect();
            length_grouped_indices(&lengths, self.options.batch_size, &mut self.order_rng)
        } else {
            let mut indices: Vec<usize> = (0..self.examples.len()).collect();
            indices.shuffle(&mut self.order_rng);
            indices
        };
    }
}

/// Random order in which neighbouring examples have similar lengths
///
/// A random permutation is cut into mega-batches of `50 * batch_size`, each
/// sorted by descending length. The longest example overall is moved to the
/// front so an out-of-memory batch shows up on the first step.
pub fn length_grouped_indices<R: Rng + ?Sized>(
    lengths: &[usize],
    batch_size: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..lengths.len()).collect();
    indices.shuffle(rng);

    let megabatch_size = (MEGABATCH_MULTIPLIER * batch_size).max(1);
    for megabatch in indices.chunks_mut(megabatch_size) {
        megabatch.sort_by_key(|&i| Reverse(lengths[i]));
    }

    let longest = (0..indices.len())
        .step_by(megabatch_size)
        .max_by_key(|&start| (lengths[indices[start]], Reverse(start)));
    if let Some(start) = longest {
        indices.swap(0, start);
    }
    indices
}
