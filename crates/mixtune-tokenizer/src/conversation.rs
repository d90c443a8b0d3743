//! Conversation data model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Speaker of a conversation turn
///
/// Serialized in lowercase (`"user"`, `"assistant"`, `"system"`), matching the
/// JSONL conversation files. Any other role string fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction
    System,
    /// Human side of the dialogue
    User,
    /// Model side of the dialogue
    Assistant,
}

impl Role {
    /// Role name as it appears in data files
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who is speaking
    pub role: Role,
    /// Utterance text
    pub content: String,
}

impl Turn {
    /// Create a turn with the given role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user turn
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a system turn
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Whether this turn was spoken by the user
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}
