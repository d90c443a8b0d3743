//! Special token handling

/// Every special token in the default chat vocabulary
pub const SPECIAL_TOKENS: [&str; 7] = [
    "<|bos|>",
    "<|eos|>",
    "<|pad|>",
    "<|user_start|>",
    "<|user_end|>",
    "<|assistant_start|>",
    "<|assistant_end|>",
];

/// Names of the special tokens used to frame conversations
///
/// These tokens mark sequence boundaries, turn boundaries, and padding for
/// batching. Ids are resolved against a concrete vocabulary by
/// [`ChatTokenizer`](crate::ChatTokenizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Beginning of Sequence token
    bos: String,
    /// End of Sequence token, appended to every supervised assistant turn
    eos: String,
    /// Padding token
    pad: String,
    /// User message start token
    user_start: String,
    /// User message end token
    user_end: String,
    /// Assistant message start token, doubles as the generation prompt
    assistant_start: String,
    /// Assistant message end token
    assistant_end: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: SPECIAL_TOKENS[0].to_string(),
            eos: SPECIAL_TOKENS[1].to_string(),
            pad: SPECIAL_TOKENS[2].to_string(),
            user_start: SPECIAL_TOKENS[3].to_string(),
            user_end: SPECIAL_TOKENS[4].to_string(),
            assistant_start: SPECIAL_TOKENS[5].to_string(),
            assistant_end: SPECIAL_TOKENS[6].to_string(),
        }
    }
}

impl SpecialTokens {
    /// Create a new SpecialTokens instance with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the padding token name
    pub fn with_pad(mut self, pad: impl Into<String>) -> Self {
        self.pad = pad.into();
        self
    }

    /// Replace the end of sequence token name
    pub fn with_eos(mut self, eos: impl Into<String>) -> Self {
        self.eos = eos.into();
        self
    }

    /// Get the Beginning of Sequence token
    pub fn bos(&self) -> &str {
        &self.bos
    }

    /// Get the End of Sequence token
    pub fn eos(&self) -> &str {
        &self.eos
    }

    /// Get the Padding token
    pub fn pad(&self) -> &str {
        &self.pad
    }

    /// Get the user start token
    pub fn user_start(&self) -> &str {
        &self.user_start
    }

    /// Get the user end token
    pub fn user_end(&self) -> &str {
        &self.user_end
    }

    /// Get the assistant start token
    pub fn assistant_start(&self) -> &str {
        &self.assistant_start
    }

    /// Get the assistant end token
    pub fn assistant_end(&self) -> &str {
        &self.assistant_end
    }

    /// Get all special tokens as a vector
    pub fn all(&self) -> Vec<&str> {
        vec![
            self.bos(),
            self.eos(),
            self.pad(),
            self.user_start(),
            self.user_end(),
            self.assistant_start(),
            self.assistant_end(),
        ]
    }

    /// Check if a token is a special token
    pub fn is_special(&self, token: &str) -> bool {
        self.all().contains(&token)
    }
}
