//! Batch assembly
//!
//! Compiled sequences are right-padded into rectangular [`StageBatch`]es.
//! A [`Batch`] holds one stage batch per field-name prefix: the unprefixed
//! stage is the one a single-stage model consumes, and a mixture adds stage
//! one under [`STAGE1_PREFIX`].

use crate::dataset::Example;
use crate::error::SftError;
use crate::sequence::{CompiledSequence, SequenceBuilder, IGNORE_INDEX};
use anyhow::{Context, Result};
use mixtune_tokenizer::{ChatTokenizer, Turn};
use rand::Rng;
use std::collections::BTreeMap;

/// Field name of the padded token ids
pub const INPUT_IDS: &str = "input_ids";
/// Field name of the padded attention mask
pub const ATTENTION_MASK: &str = "attention_mask";
/// Field name of the padded labels
pub const LABELS: &str = "labels";
/// Prefix for the stage-one fields of a mixture batch
pub const STAGE1_PREFIX: &str = "stage1_";

/// Padded id, attention and label rows for one stage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageBatch {
    /// `[batch_size, seq_len]` token ids
    pub input_ids: Vec<Vec<u32>>,
    /// `[batch_size, seq_len]` attention, 0 on padding
    pub attention_mask: Vec<Vec<u8>>,
    /// `[batch_size, seq_len]` labels, [`IGNORE_INDEX`] on padding
    pub labels: Vec<Vec<i64>>,
}

impl StageBatch {
    /// Number of rows
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    /// Row width
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// `(batch_size, seq_len)`
    pub fn shape(&self) -> (usize, usize) {
        (self.batch_size(), self.seq_len())
    }

    /// Number of positions that contribute loss
    pub fn supervised_tokens(&self) -> usize {
        self.labels
            .iter()
            .flatten()
            .filter(|&&label| label != IGNORE_INDEX)
            .count()
    }
}

/// Named stage batches handed to the model
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    stages: BTreeMap<String, StageBatch>,
}

impl Batch {
    /// Batch holding only the unprefixed stage
    pub fn single(stage: StageBatch) -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(String::new(), stage);
        Self { stages }
    }

    /// Add a stage under `prefix`
    ///
    /// # Errors
    /// [`SftError::FieldCollision`] if the prefix is already taken.
    pub fn insert_stage(&mut self, prefix: &str, stage: StageBatch) -> Result<()> {
        if self.stages.contains_key(prefix) {
            return Err(SftError::FieldCollision(format!("{}{}", prefix, INPUT_IDS)).into());
        }
        self.stages.insert(prefix.to_string(), stage);
        Ok(())
    }

    /// Stage stored under `prefix`
    pub fn stage(&self, prefix: &str) -> Option<&StageBatch> {
        self.stages.get(prefix)
    }

    /// Stage stored under `prefix`, or a fatal fault
    pub fn require_stage(&self, prefix: &str) -> Result<&StageBatch> {
        self.stage(prefix).ok_or_else(|| {
            SftError::MissingStageFields {
                prefix: prefix.to_string(),
            }
            .into()
        })
    }

    /// All field names, e.g. `input_ids` and `stage1_labels`
    pub fn field_names(&self) -> Vec<String> {
        self.stages
            .keys()
            .flat_map(|prefix| {
                [INPUT_IDS, ATTENTION_MASK, LABELS]
                    .into_iter()
                    .map(move |field| format!("{}{}", prefix, field))
            })
            .collect()
    }

    /// Whether the batch carries stage-one fields
    pub fn is_mixture(&self) -> bool {
        self.stages.contains_key(STAGE1_PREFIX)
    }

    /// Rows per stage
    pub fn batch_size(&self) -> usize {
        self.stages.values().next().map_or(0, StageBatch::batch_size)
    }
}

/// Pads compiled sequences to a common width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAssembler {
    pad_id: u32,
}

impl BatchAssembler {
    /// Assembler padding ids with `pad_id`
    pub fn new(pad_id: u32) -> Self {
        Self { pad_id }
    }

    /// Assembler using the tokenizer's pad id, or `fallback_token` when it has none
    pub fn from_tokenizer<T: ChatTokenizer + ?Sized>(
        tokenizer: &T,
        fallback_token: &str,
    ) -> Result<Self> {
        Ok(Self::new(tokenizer.resolve_pad_id(fallback_token)?))
    }

    /// Id used for padding
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Right-pad sequences to the longest one
    ///
    /// # Errors
    /// [`SftError::EmptyBatch`] for no sequences and
    /// [`SftError::MisalignedSequence`] when a sequence's fields disagree in length.
    pub fn assemble(&self, sequences: &[CompiledSequence]) -> Result<StageBatch> {
        if sequences.is_empty() {
            return Err(SftError::EmptyBatch.into());
        }
        for (index, sequence) in sequences.iter().enumerate() {
            if !sequence.is_aligned() {
                return Err(SftError::MisalignedSequence {
                    index,
                    ids: sequence.token_ids.len(),
                    attention: sequence.attention_mask.len(),
                    labels: sequence.labels.len(),
                }
                .into());
            }
        }

        let width = sequences.iter().map(CompiledSequence::len).max().unwrap_or(0);
        let mut batch = StageBatch::default();
        for sequence in sequences {
            batch
                .input_ids
                .push(padded(&sequence.token_ids, width, self.pad_id));
            batch
                .attention_mask
                .push(padded(&sequence.attention_mask, width, 0));
            batch.labels.push(padded(&sequence.labels, width, IGNORE_INDEX));
        }
        Ok(batch)
    }
}

fn padded<V: Copy>(values: &[V], width: usize, fill: V) -> Vec<V> {
    let mut row = Vec::with_capacity(width);
    row.extend_from_slice(values);
    row.resize(width, fill);
    row
}

/// Which objective the collated batches feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollateMode {
    /// Stage A only, emitted unprefixed
    SingleStage,
    /// Stage B unprefixed plus stage A under [`STAGE1_PREFIX`]
    Mixture,
}

/// Turns a list of examples into a [`Batch`]
pub struct ConversationCollator<'a, T: ?Sized> {
    builder: SequenceBuilder<'a, T>,
    assembler: BatchAssembler,
    mode: CollateMode,
}

impl<'a, T: ChatTokenizer + ?Sized> ConversationCollator<'a, T> {
    /// Create a collator
    pub fn new(builder: SequenceBuilder<'a, T>, assembler: BatchAssembler, mode: CollateMode) -> Self {
        Self {
            builder,
            assembler,
            mode,
        }
    }

    /// Collation mode
    pub fn mode(&self) -> CollateMode {
        self.mode
    }

    /// Collate examples according to the mode
    pub fn collate<R: Rng + ?Sized>(&self, examples: &[Example], rng: &mut R) -> Result<Batch> {
        match self.mode {
            CollateMode::SingleStage => self.assemble_single(examples, rng),
            CollateMode::Mixture => self.assemble_mixture(examples, rng),
        }
    }

    /// Compile each example's `stage_a` (with its context) into an unprefixed batch
    pub fn assemble_single<R: Rng + ?Sized>(
        &self,
        examples: &[Example],
        rng: &mut R,
    ) -> Result<Batch> {
        let sequences = examples
            .iter()
            .enumerate()
            .map(|(index, example)| {
                self.builder
                    .build(example.context.as_deref(), &example.stage_a, rng)
                    .with_context(|| format!("Failed to compile example {}", index))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Batch::single(self.assembler.assemble(&sequences)?))
    }

    /// Compile both stages of mixture examples
    ///
    /// Stage B becomes the unprefixed fields and stage A the `stage1_` fields.
    /// Examples must carry no context and must carry `stage_b`.
    pub fn assemble_mixture<R: Rng + ?Sized>(
        &self,
        examples: &[Example],
        rng: &mut R,
    ) -> Result<Batch> {
        let mut stage_b_turns = Vec::with_capacity(examples.len());
        for (index, example) in examples.iter().enumerate() {
            if example.context.is_some() {
                return Err(SftError::ContextInMixture { index }.into());
            }
            let stage_b = example
                .stage_b
                .as_deref()
                .ok_or(SftError::MissingStageConversation { index })?;
            stage_b_turns.push(stage_b);
        }

        let stage_b = self.compile_stage(stage_b_turns.iter().copied(), rng)?;
        let stage_a = self.compile_stage(examples.iter().map(|e| e.stage_a.as_slice()), rng)?;

        let mut batch = Batch::single(stage_b);
        batch.insert_stage(STAGE1_PREFIX, stage_a)?;
        Ok(batch)
    }

    fn compile_stage<'t, R: Rng + ?Sized>(
        &self,
        conversations: impl Iterator<Item = &'t [Turn]>,
        rng: &mut R,
    ) -> Result<StageBatch> {
        let sequences = conversations
            .enumerate()
            .map(|(index, turns)| {
                self.builder
                    .build(None, turns, rng)
                    .with_context(|| format!("Failed to compile example {}", index))
            })
            .collect::<Result<Vec<_>>>()?;
        self.assembler.assemble(&sequences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(ids: &[u32], labels: &[i64]) -> CompiledSequence {
        CompiledSequence {
            token_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: labels.to_vec(),
        }
    }

    #[test]
    fn test_assemble_pads_to_longest() {
        let assembler = BatchAssembler::new(9);
        let batch = assembler
            .assemble(&[
                sequence(&[1, 2, 3], &[IGNORE_INDEX, 2, 3]),
                sequence(&[1], &[IGNORE_INDEX]),
            ])
            .expect("assemble");

        assert_eq!(batch.shape(), (2, 3));
        assert_eq!(batch.input_ids[1], vec![1, 9, 9]);
        assert_eq!(batch.attention_mask[1], vec![1, 0, 0]);
        assert_eq!(batch.labels[1], vec![IGNORE_INDEX; 3]);
        assert_eq!(batch.supervised_tokens(), 2);
    }

    #[test]
    fn test_empty_input_is_a_fault() {
        let err = BatchAssembler::new(0).assemble(&[]).expect_err("empty");
        assert_eq!(err.downcast_ref::<SftError>(), Some(&SftError::EmptyBatch));
    }

    #[test]
    fn test_misaligned_sequence_is_rejected() {
        let mut bad = sequence(&[1, 2], &[IGNORE_INDEX, 2]);
        bad.labels.pop();

        let err = BatchAssembler::new(0)
            .assemble(&[sequence(&[1], &[IGNORE_INDEX]), bad])
            .expect_err("misaligned");
        assert_eq!(
            err.downcast_ref::<SftError>(),
            Some(&SftError::MisalignedSequence {
                index: 1,
                ids: 2,
                attention: 2,
                labels: 1
            })
        );
    }

    #[test]
    fn test_batch_field_names_are_disjoint_per_stage() {
        let mut batch = Batch::single(StageBatch::default());
        batch
            .insert_stage(STAGE1_PREFIX, StageBatch::default())
            .expect("insert stage one");

        let names = batch.field_names();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"labels".to_string()));
        assert!(names.contains(&"stage1_input_ids".to_string()));
        assert!(batch.is_mixture());

        let err = batch
            .insert_stage(STAGE1_PREFIX, StageBatch::default())
            .expect_err("collision");
        assert_eq!(
            err.downcast_ref::<SftError>(),
            Some(&SftError::FieldCollision("stage1_input_ids".to_string()))
        );
    }
}
