//! Chat role template
//!
//! The template frames each turn with its role's start/end tokens:
//!
//! ```text
//! <|bos|> <|user_start|> ... <|user_end|> <|assistant_start|> ... <|assistant_end|>
//! ```
//!
//! With `add_generation_prompt` a trailing `<|assistant_start|>` is emitted so
//! the rendered prompt ends where the model's reply begins.

use crate::conversation::{Role, Turn};
use crate::error::TokenizerError;
use crate::special_tokens::SpecialTokens;
use anyhow::Result;

/// Token ids produced by the role template
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedPrompt {
    /// Token ids, starting with BOS
    pub ids: Vec<u32>,
    /// Attention mask aligned with `ids`
    pub attention_mask: Vec<u8>,
}

impl RenderedPrompt {
    /// Wrap ids with a full attention mask
    pub fn new(ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; ids.len()];
        Self {
            ids,
            attention_mask,
        }
    }

    /// Drop the leading token if it is `bos`
    pub fn without_leading(mut self, bos: u32) -> Self {
        if self.ids.first() == Some(&bos) {
            self.ids.remove(0);
            self.attention_mask.remove(0);
        }
        self
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no tokens were rendered
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Tokenizer capabilities needed to compile conversations
///
/// Implementors supply plain text encoding, vocabulary lookup and the names of
/// their special tokens; the role template and id resolution are provided.
pub trait ChatTokenizer {
    /// Encode plain text (no special tokens added)
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Look up a single token in the vocabulary
    fn token_id(&self, token: &str) -> Option<u32>;

    /// Names of the special tokens for this vocabulary
    fn special_tokens(&self) -> &SpecialTokens;

    /// Id of a special token, or a configuration error when it is missing
    fn special_token_id(&self, token: &str) -> Result<u32> {
        self.token_id(token)
            .ok_or_else(|| TokenizerError::MissingSpecialToken(token.to_string()).into())
    }

    /// Beginning of sequence id
    fn bos_id(&self) -> Result<u32> {
        self.special_token_id(self.special_tokens().bos())
    }

    /// End of sequence id
    fn eos_id(&self) -> Result<u32> {
        self.special_token_id(self.special_tokens().eos())
    }

    /// Pad id, if the vocabulary has one
    fn pad_id(&self) -> Option<u32> {
        self.token_id(self.special_tokens().pad())
    }

    /// Pad id, falling back to `fallback_token` when no pad token exists
    fn resolve_pad_id(&self, fallback_token: &str) -> Result<u32> {
        if let Some(id) = self.pad_id() {
            return Ok(id);
        }
        self.token_id(fallback_token)
            .ok_or_else(|| TokenizerError::UnresolvablePad(fallback_token.to_string()).into())
    }

    /// Encode text, keeping at most `max_length` ids
    fn encode_truncated(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut ids = self.encode(text)?;
        ids.truncate(max_length);
        Ok(ids)
    }

    /// Render turns through the role template
    ///
    /// The result always starts with BOS. System turns share the user
    /// delimiters since the vocabulary has no dedicated system tokens.
    fn apply_role_template(
        &self,
        turns: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<RenderedPrompt> {
        let special = self.special_tokens();
        let mut ids = vec![self.bos_id()?];

        for turn in turns {
            let (start, end) = match turn.role {
                Role::User | Role::System => (special.user_start(), special.user_end()),
                Role::Assistant => (special.assistant_start(), special.assistant_end()),
            };
            ids.push(self.special_token_id(start)?);
            ids.extend(self.encode(&turn.content)?);
            ids.push(self.special_token_id(end)?);
        }

        if add_generation_prompt {
            ids.push(self.special_token_id(special.assistant_start())?);
        }

        Ok(RenderedPrompt::new(ids))
    }
}

impl<T: ChatTokenizer + ?Sized> ChatTokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        (**self).token_id(token)
    }

    fn special_tokens(&self) -> &SpecialTokens {
        (**self).special_tokens()
    }
}
