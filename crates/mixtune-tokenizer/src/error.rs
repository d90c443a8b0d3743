//! Tokenizer configuration errors

use thiserror::Error;

/// Errors raised when a vocabulary cannot serve the chat template
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    #[error("Special token not found in vocabulary: {0}")]
    MissingSpecialToken(String),
    #[error("No pad token configured and fallback token {0} is not in the vocabulary")]
    UnresolvablePad(String),
}
