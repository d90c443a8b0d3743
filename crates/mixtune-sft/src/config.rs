//! Fine-tuning configuration loaded from JSON files
//!
//! Every section and field has a default, so a config file only needs to
//! name what it changes.

use crate::dataset::{DatasetFormat, PromptTemplates};
use crate::error::SftError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete fine-tuning configuration loaded from file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfigFile {
    /// Where the records come from and how they are split
    pub data: DataConfig,
    /// Sequence compilation options
    pub sequence: SequenceConfig,
    /// Training loop hyperparameters
    pub training: TrainingHyperparams,
    /// Prompt templates for building conversations from records
    pub prompts: PromptTemplates,
}

/// Data source and split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory containing `.jsonl` record files
    pub data_dir: PathBuf,
    /// How records become examples
    pub dataset_format: DatasetFormat,
    /// Seed for shuffling and the evaluation split
    pub seed: u64,
    /// Hold out an evaluation split
    pub do_eval: bool,
    /// Number of examples in the evaluation split
    pub eval_dataset_size: usize,
    /// Cap on training examples
    pub max_train_samples: Option<usize>,
    /// Cap on evaluation examples
    pub max_eval_samples: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            dataset_format: DatasetFormat::Conversation,
            seed: 42,
            do_eval: false,
            eval_dataset_size: 1024,
            max_train_samples: None,
            max_eval_samples: None,
        }
    }
}

/// Sequence compilation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Maximum tokens per assistant turn, EOS included
    pub target_max_len: usize,
    /// Keep each example's context only on a coin flip
    pub randomize_context: bool,
    /// Token used for padding when the vocabulary has no pad token
    pub pad_fallback_token: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            target_max_len: 256,
            randomize_context: false,
            pad_fallback_token: "<|eos|>".to_string(),
        }
    }
}

/// Training loop hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingHyperparams {
    /// Directory for checkpoints, the completion marker and metrics
    pub output_dir: PathBuf,
    /// Examples per micro-batch
    pub batch_size: usize,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Optimizer steps to run
    pub max_steps: usize,
    /// Optimizer steps between metrics records
    pub logging_steps: usize,
    /// Optimizer steps between adapter checkpoints (0 = disabled)
    pub save_steps: usize,
    /// Checkpoints kept on disk (None = keep all)
    pub save_total_limit: Option<usize>,
    /// Adapter weights to start from when the output directory has no checkpoint
    pub adapter_checkpoint_dir: Option<PathBuf>,
    /// Weight of the stage-two loss in the mixture objective
    pub stage2_ratio: f32,
    /// Order examples so batches hold conversations of similar length
    pub group_by_length: bool,
}

impl Default for TrainingHyperparams {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            batch_size: 1,
            gradient_accumulation_steps: 16,
            max_steps: 10000,
            logging_steps: 10,
            save_steps: 250,
            save_total_limit: Some(40),
            adapter_checkpoint_dir: None,
            stage2_ratio: 0.5,
            group_by_length: true,
        }
    }
}

impl FinetuneConfigFile {
    /// Load configuration from a JSON file and validate it
    ///
    /// # Example
    /// ```no_run
    /// use mixtune_sft::config::FinetuneConfigFile;
    /// use std::path::Path;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = FinetuneConfigFile::from_file(Path::new("finetune.json"))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: FinetuneConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let training = &self.training;
        if !(0.0..=1.0).contains(&training.stage2_ratio) {
            return Err(SftError::InvalidRatio(training.stage2_ratio).into());
        }
        for (name, value) in [
            ("batch_size", training.batch_size),
            ("gradient_accumulation_steps", training.gradient_accumulation_steps),
            ("logging_steps", training.logging_steps),
            ("sequence.target_max_len", self.sequence.target_max_len),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be positive", name);
            }
        }
        if training.save_total_limit == Some(0) {
            anyhow::bail!("save_total_limit must be positive, omit it to keep all checkpoints");
        }
        Ok(())
    }
}
