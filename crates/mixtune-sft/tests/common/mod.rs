//! Shared fixtures for integration tests

#![allow(dead_code)]

use anyhow::Result;
use mixtune_sft::model::CausalLm;
use mixtune_sft::StageBatch;
use mixtune_tokenizer::{ChatTokenizer, SpecialTokens};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

pub const PAD: u32 = 0;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
pub const USER_START: u32 = 3;
pub const USER_END: u32 = 4;
pub const ASSISTANT_START: u32 = 5;
pub const ASSISTANT_END: u32 = 6;
pub const UNK: u32 = 7;

const WORDS: [&str; 16] = [
    "hi", "hello", "how", "are", "you", "fine", "thanks", "what", "is", "rust", "a", "language",
    "bye", "ok", "context", "reply",
];

/// Whitespace tokenizer with fixed ids
///
/// Special tokens take ids 0..=6, unknown words map to 7 and the words in
/// `WORDS` start at 10.
pub struct WordTokenizer {
    special: SpecialTokens,
    vocab: HashMap<String, u32>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        let special = SpecialTokens::default();
        let mut vocab: HashMap<String, u32> = [
            (special.pad(), PAD),
            (special.bos(), BOS),
            (special.eos(), EOS),
            (special.user_start(), USER_START),
            (special.user_end(), USER_END),
            (special.assistant_start(), ASSISTANT_START),
            (special.assistant_end(), ASSISTANT_END),
        ]
        .into_iter()
        .map(|(token, id)| (token.to_string(), id))
        .collect();
        for (i, word) in WORDS.iter().enumerate() {
            vocab.insert(word.to_string(), 10 + i as u32);
        }
        Self { special, vocab }
    }

    /// Same vocabulary with the pad token removed
    pub fn without_pad() -> Self {
        let mut tokenizer = Self::new();
        let pad = tokenizer.special.pad().to_string();
        tokenizer.vocab.remove(&pad);
        tokenizer
    }

    pub fn id(&self, word: &str) -> u32 {
        self.vocab.get(word).copied().unwrap_or(UNK)
    }
}

impl ChatTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|word| self.id(word)).collect())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }
}

/// Model that returns scripted losses and records every call
///
/// Without a script, the loss of a forward pass is the number of supervised
/// tokens in the batch.
#[derive(Default)]
pub struct ScriptedModel {
    pub script: VecDeque<f32>,
    pub forwarded: Vec<StageBatch>,
    pub backward_losses: Vec<f32>,
    pub optimizer_steps: usize,
    pub loaded: Vec<PathBuf>,
    pub learning_rate: Option<f32>,
}

impl ScriptedModel {
    pub fn with_losses(losses: &[f32]) -> Self {
        Self {
            script: losses.iter().copied().collect(),
            ..Self::default()
        }
    }
}

impl CausalLm for ScriptedModel {
    type Loss = f32;

    fn forward(&mut self, batch: &StageBatch) -> Result<f32> {
        self.forwarded.push(batch.clone());
        Ok(self
            .script
            .pop_front()
            .unwrap_or(batch.supervised_tokens() as f32))
    }

    fn backward(&mut self, loss: f32) -> Result<()> {
        self.backward_losses.push(loss);
        Ok(())
    }

    fn optimizer_step(&mut self) -> Result<()> {
        self.optimizer_steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> Option<f32> {
        self.learning_rate
    }

    fn save_adapter(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("adapter.json"), b"{}")?;
        Ok(())
    }

    fn load_adapter(&mut self, dir: &Path) -> Result<()> {
        self.loaded.push(dir.to_path_buf());
        Ok(())
    }
}
