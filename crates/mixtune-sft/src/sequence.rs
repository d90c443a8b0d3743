//! Conversation-to-sequence compilation
//!
//! A conversation becomes one token sequence plus an aligned label mask.
//! Only assistant content is supervised: BOS, context and user turns are
//! always labelled [`IGNORE_INDEX`].

use crate::error::SftError;
use anyhow::Result;
use mixtune_tokenizer::{ChatTokenizer, Role, Turn};
use rand::Rng;

/// Label for positions that contribute no loss
pub const IGNORE_INDEX: i64 = -100;

/// Whether an example's context block is rendered before its conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextInclusion {
    /// Every example keeps its context
    #[default]
    Always,
    /// Each example keeps its context on a fair coin flip
    Coin,
}

impl ContextInclusion {
    /// Map the `randomize_context` config flag onto a policy
    pub fn from_randomize(randomize: bool) -> Self {
        if randomize {
            ContextInclusion::Coin
        } else {
            ContextInclusion::Always
        }
    }

    fn admits<R: Rng + ?Sized>(self, rng: &mut R) -> bool {
        match self {
            ContextInclusion::Always => true,
            ContextInclusion::Coin => rng.gen_bool(0.5),
        }
    }
}

/// Unpadded token sequence with attention and label masks
///
/// All three vectors always have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledSequence {
    /// Token ids, starting with BOS
    pub token_ids: Vec<u32>,
    /// 1 for every real token
    pub attention_mask: Vec<u8>,
    /// Token id where supervised, [`IGNORE_INDEX`] elsewhere
    pub labels: Vec<i64>,
}

impl CompiledSequence {
    fn starting_with(bos: u32) -> Self {
        Self {
            token_ids: vec![bos],
            attention_mask: vec![1],
            labels: vec![IGNORE_INDEX],
        }
    }

    fn push_prompt(&mut self, ids: &[u32], attention_mask: &[u8]) {
        self.token_ids.extend_from_slice(ids);
        self.attention_mask.extend_from_slice(attention_mask);
        self.labels
            .extend(std::iter::repeat(IGNORE_INDEX).take(ids.len()));
    }

    fn push_target(&mut self, ids: &[u32]) {
        self.token_ids.extend_from_slice(ids);
        self.attention_mask
            .extend(std::iter::repeat(1).take(ids.len()));
        self.labels.extend(ids.iter().map(|&id| id as i64));
    }

    /// Sequence length
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether the sequence holds no tokens
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Whether ids, attention mask and labels have equal length
    pub fn is_aligned(&self) -> bool {
        self.token_ids.len() == self.attention_mask.len()
            && self.token_ids.len() == self.labels.len()
    }

    /// Number of supervised positions
    pub fn supervised_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }
}

/// Drop a trailing user turn that has no reply
pub fn drop_dangling_user_turn(turns: &[Turn]) -> &[Turn] {
    match turns.split_last() {
        Some((last, rest)) if last.is_user() => rest,
        _ => turns,
    }
}

/// Compiles conversations into [`CompiledSequence`]s
///
/// Holds no mutable state; the only randomness is the caller's RNG, used by
/// [`ContextInclusion::Coin`].
pub struct SequenceBuilder<'a, T: ?Sized> {
    tokenizer: &'a T,
    max_target_len: usize,
    context_inclusion: ContextInclusion,
}

impl<'a, T: ChatTokenizer + ?Sized> SequenceBuilder<'a, T> {
    /// Create a builder that truncates each assistant turn to `max_target_len` tokens
    pub fn new(tokenizer: &'a T, max_target_len: usize) -> Self {
        Self {
            tokenizer,
            max_target_len,
            context_inclusion: ContextInclusion::Always,
        }
    }

    /// Set the context inclusion policy
    pub fn with_context_inclusion(mut self, context_inclusion: ContextInclusion) -> Self {
        self.context_inclusion = context_inclusion;
        self
    }

    /// Maximum number of tokens kept per assistant turn (EOS included)
    pub fn max_target_len(&self) -> usize {
        self.max_target_len
    }

    /// Tokenizer used for rendering
    pub fn tokenizer(&self) -> &'a T {
        self.tokenizer
    }

    /// Compile one conversation
    ///
    /// # Arguments
    /// * `context` - Optional prior dialogue, never supervised
    /// * `turns` - Conversation to supervise on
    /// * `rng` - Source for the context coin flip
    ///
    /// # Errors
    /// [`SftError::UnsupportedRole`] for any turn that is neither user nor
    /// assistant, and tokenizer errors for missing special tokens.
    pub fn build<R: Rng + ?Sized>(
        &self,
        context: Option<&[Turn]>,
        turns: &[Turn],
        rng: &mut R,
    ) -> Result<CompiledSequence> {
        let bos = self.tokenizer.bos_id()?;
        let mut sequence = CompiledSequence::starting_with(bos);

        if let Some(context) = context {
            if self.context_inclusion.admits(rng) {
                self.append_context(&mut sequence, context, bos)?;
            }
        }

        for turn in turns {
            match turn.role {
                Role::User => {
                    let prompt = self
                        .tokenizer
                        .apply_role_template(std::slice::from_ref(turn), true)?
                        .without_leading(bos);
                    sequence.push_prompt(&prompt.ids, &prompt.attention_mask);
                }
                Role::Assistant => {
                    let target = self.encode_target(&turn.content)?;
                    sequence.push_target(&target);
                }
                other => return Err(SftError::UnsupportedRole(other).into()),
            }
        }

        Ok(sequence)
    }

    fn append_context(
        &self,
        sequence: &mut CompiledSequence,
        context: &[Turn],
        bos: u32,
    ) -> Result<()> {
        let context = drop_dangling_user_turn(context);
        if context.is_empty() {
            return Ok(());
        }
        let rendered = self
            .tokenizer
            .apply_role_template(context, false)?
            .without_leading(bos);
        sequence.push_prompt(&rendered.ids, &rendered.attention_mask);
        Ok(())
    }

    /// Assistant content followed by EOS, truncated to `max_target_len`
    fn encode_target(&self, content: &str) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode(content)?;
        ids.push(self.tokenizer.eos_id()?);
        ids.truncate(self.max_target_len);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_dangling_user_turn() {
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        assert_eq!(drop_dangling_user_turn(&turns), &turns[..2]);
        assert_eq!(drop_dangling_user_turn(&turns[..2]), &turns[..2]);
        assert!(drop_dangling_user_turn(&[]).is_empty());
    }

    #[test]
    fn test_context_inclusion_from_flag() {
        assert_eq!(ContextInclusion::from_randomize(false), ContextInclusion::Always);
        assert_eq!(ContextInclusion::from_randomize(true), ContextInclusion::Coin);
    }

    #[test]
    fn test_supervised_count_ignores_prompt() {
        let mut sequence = CompiledSequence::starting_with(1);
        sequence.push_prompt(&[5, 6], &[1, 1]);
        sequence.push_target(&[7, 8, 9]);

        assert!(sequence.is_aligned());
        assert_eq!(sequence.len(), 6);
        assert_eq!(sequence.supervised_count(), 3);
        assert_eq!(sequence.labels, vec![IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX, 7, 8, 9]);
    }
}
