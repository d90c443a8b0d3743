//! Chat tokenization for mixtune
//!
//! This crate provides:
//! - The conversation data model ([`Role`], [`Turn`])
//! - Special token names for the chat vocabulary
//! - The [`ChatTokenizer`] trait with the role template used to frame turns
//! - A BPE [`Tokenizer`] backed by `aprender`
//!
//! # Example
//!
//! ```no_run
//! use mixtune_tokenizer::{ChatTokenizer, Tokenizer, Turn};
//!
//! let tokenizer = Tokenizer::from_directory("./tokenizer")?;
//! let prompt = tokenizer.apply_role_template(&[Turn::user("hi")], true)?;
//! assert_eq!(prompt.ids[0], tokenizer.bos_id()?);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod conversation;
pub mod error;
pub mod special_tokens;
pub mod template;

pub use aprender::text::tokenize::BpeTokenizer;
pub use conversation::{Role, Turn};
pub use error::TokenizerError;
pub use special_tokens::{SpecialTokens, SPECIAL_TOKENS};
pub use template::{ChatTokenizer, RenderedPrompt};

use anyhow::{Context, Result};
use std::path::Path;

/// Tokenizer data
///
/// On-disk form of the tokenizer: vocabulary (special tokens included) and
/// BPE merge rules, stored as `tokenizer.json`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TokenizerData {
    /// Token to ID mapping
    pub vocabulary: std::collections::HashMap<String, u32>,
    /// BPE merge rules
    pub merges: Vec<(String, String)>,
}

/// BPE tokenizer with chat special tokens
///
/// Uses `aprender::text::tokenize::BpeTokenizer` internally for BPE.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    bpe: BpeTokenizer,
    special: SpecialTokens,
}

impl Tokenizer {
    /// Train a new tokenizer from an iterator of text
    ///
    /// # Arguments
    /// * `text_iterator` - Iterator over training text
    /// * `vocab_size` - Target vocabulary size
    pub fn train_from_iterator<I, S>(text_iterator: I, vocab_size: usize) -> Result<Self>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        // aprender wants a slice of &str that outlives the call
        let corpus_owned: Vec<String> = text_iterator.map(|s| s.as_ref().to_string()).collect();
        let corpus: Vec<&str> = corpus_owned.iter().map(|s| s.as_str()).collect();

        let bpe = BpeTokenizer::train(&corpus, vocab_size)
            .map_err(|e| anyhow::anyhow!("Failed to train BPE tokenizer: {}", e))?;

        Ok(Self {
            bpe,
            special: SpecialTokens::default(),
        })
    }

    /// Use a different set of special token names
    pub fn with_special_tokens(mut self, special: SpecialTokens) -> Self {
        self.special = special;
        self
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// Load tokenizer from a directory containing `tokenizer.json`
    ///
    /// # Errors
    /// Returns an error if the tokenizer file cannot be read or parsed
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer_file = path.join("tokenizer.json");

        if !tokenizer_file.exists() {
            anyhow::bail!("Tokenizer file not found: {}", tokenizer_file.display());
        }

        let content = std::fs::read_to_string(&tokenizer_file).with_context(|| {
            format!(
                "Failed to read tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        let data: TokenizerData =
            serde_json::from_str(&content).context("Failed to parse tokenizer JSON")?;

        Ok(Self {
            bpe: BpeTokenizer::from_vocab(data.vocabulary, data.merges),
            special: SpecialTokens::default(),
        })
    }

    /// Save tokenizer to a directory as `tokenizer.json`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        let tokenizer_file = path.join("tokenizer.json");
        let data = TokenizerData {
            vocabulary: self.bpe.vocab().clone(),
            merges: self.bpe.merges().to_vec(),
        };

        let content = serde_json::to_string(&data).context("Failed to serialize tokenizer")?;
        std::fs::write(&tokenizer_file, content).with_context(|| {
            format!(
                "Failed to write tokenizer file: {}",
                tokenizer_file.display()
            )
        })?;

        Ok(())
    }
}

impl ChatTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.bpe.encode(text).map_err(|e| anyhow::anyhow!("Encoding failed: {}", e))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.bpe.token_to_id(token)
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }
}
