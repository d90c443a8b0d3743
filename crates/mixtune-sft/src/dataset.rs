//! Dataset formats and example preparation
//!
//! Raw agent-trajectory records are turned into [`Example`]s by a closed set
//! of [`DatasetFormat`]s, so everything downstream sees a single shape
//! regardless of where the data came from.

use crate::config::DataConfig;
use crate::error::SftError;
use anyhow::{Context, Result};
use mixtune_tokenizer::Turn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Marker a simulated user emits to end a teacher conversation
pub const END_CONVERSATION_TOKEN: &str = "[END_CONVERSATION]";

/// Speaker markers separating turns in a context transcript
const SPEAKER_MARKER_PATTERN: &str = r"<USER>:|<AGENT>:";

/// One training example
///
/// With `stage_b` present the example feeds the mixture objective and must
/// not carry `context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Prior dialogue rendered before `stage_a`, never supervised
    #[serde(default)]
    pub context: Option<Vec<Turn>>,
    /// Primary conversation (stage one in a mixture)
    pub stage_a: Vec<Turn>,
    /// Stage-two conversation of a mixture example
    #[serde(default)]
    pub stage_b: Option<Vec<Turn>>,
}

impl Example {
    /// Single-stage example without context
    pub fn single(turns: Vec<Turn>) -> Self {
        Self {
            context: None,
            stage_a: turns,
            stage_b: None,
        }
    }

    /// Single-stage example with a context block
    pub fn with_context(context: Vec<Turn>, turns: Vec<Turn>) -> Self {
        Self {
            context: Some(context),
            stage_a: turns,
            stage_b: None,
        }
    }

    /// Two-stage example
    pub fn mixture(stage_a: Vec<Turn>, stage_b: Vec<Turn>) -> Self {
        Self {
            context: None,
            stage_a,
            stage_b: Some(stage_b),
        }
    }

    /// Whether both stage conversations are present
    pub fn is_mixture(&self) -> bool {
        self.stage_b.is_some()
    }

    /// Turn count used for length grouping
    ///
    /// Mixture examples are measured by their stage-two conversation.
    pub fn length(&self) -> usize {
        self.stage_b.as_ref().unwrap_or(&self.stage_a).len()
    }
}

/// Agent trajectory record as stored in the JSONL data files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Task input shown to the student
    pub pseudo_input: String,
    /// Prior transcript using `<USER>:` / `<AGENT>:` markers
    #[serde(default)]
    pub context: String,
    /// Teacher's single-turn answer
    #[serde(default)]
    pub teacher_output_single: String,
    /// Student's single-turn answer
    #[serde(default)]
    pub student_output_single: String,
    /// Explanation of what the student was missing
    #[serde(default)]
    pub reason: String,
    /// Teacher's multi-turn interaction with the environment
    pub teacher_output_conv: Vec<Turn>,
}

/// Prompt templates used to turn records into turns
///
/// Placeholders: `{input}`, `{teacher_output}`, `{student_output}`,
/// `{context}`, `{reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// First user turn of the student conversation
    pub student_input: String,
    /// User turn of the meta-cognition conversation
    pub meta_cognition_input: String,
    /// Assistant turn of the meta-cognition conversation
    pub meta_cognition_output: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            student_input: "{input}".to_string(),
            meta_cognition_input: "Task:\n{input}\n\nReference response:\n{teacher_output}\n\n\
                                   Your response:\n{student_output}\n\n\
                                   What context were you missing, and why does your response differ?"
                .to_string(),
            meta_cognition_output: "Missing context:\n{context}\n\nReason:\n{reason}".to_string(),
        }
    }
}

impl PromptTemplates {
    fn student_prompt(&self, record: &AgentRecord) -> String {
        fill(&self.student_input, record)
    }

    fn meta_cognition_turns(&self, record: &AgentRecord) -> Vec<Turn> {
        vec![
            Turn::user(fill(&self.meta_cognition_input, record)),
            Turn::assistant(fill(&self.meta_cognition_output, record)),
        ]
    }
}

fn fill(template: &str, record: &AgentRecord) -> String {
    template
        .replace("{input}", &record.pseudo_input)
        .replace("{teacher_output}", &record.teacher_output_single)
        .replace("{student_output}", &record.student_output_single)
        .replace("{context}", &record.context)
        .replace("{reason}", &record.reason)
}

/// Supported ways of turning an [`AgentRecord`] into an [`Example`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetFormat {
    /// Student prompt followed by the teacher conversation
    #[serde(rename = "conv-stage2")]
    Conversation,
    /// As [`DatasetFormat::Conversation`], prefixed by the record's context transcript
    #[serde(rename = "conv-stage2_w_prompt")]
    ConversationWithContext,
    /// Meta-cognition conversation (stage one) mixed with the teacher conversation (stage two)
    #[serde(rename = "cot-stage1_conv_stage2_joint_loss")]
    JointLoss,
}

impl DatasetFormat {
    /// Format name as used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetFormat::Conversation => "conv-stage2",
            DatasetFormat::ConversationWithContext => "conv-stage2_w_prompt",
            DatasetFormat::JointLoss => "cot-stage1_conv_stage2_joint_loss",
        }
    }

    /// Whether examples of this format train with the mixture objective
    pub fn is_joint_loss(&self) -> bool {
        matches!(self, DatasetFormat::JointLoss)
    }

    /// Convert a record into an example
    pub fn to_example(&self, record: &AgentRecord, prompts: &PromptTemplates) -> Result<Example> {
        let example = match self {
            DatasetFormat::Conversation => {
                let mut turns = vec![Turn::user(prompts.student_prompt(record))];
                turns.extend(strip_end_of_conversation(&record.teacher_output_conv).iter().cloned());
                Example::single(turns)
            }
            DatasetFormat::ConversationWithContext => {
                let mut turns = vec![Turn::user(prompts.student_prompt(record).trim())];
                turns.extend(strip_end_of_conversation(&record.teacher_output_conv).iter().cloned());
                match parse_context_transcript(&record.context)? {
                    Some(context) => Example::with_context(context, turns),
                    None => Example::single(turns),
                }
            }
            DatasetFormat::JointLoss => {
                let mut stage_b = vec![Turn::user(prompts.student_prompt(record))];
                stage_b.extend(strip_end_of_conversation(&record.teacher_output_conv).iter().cloned());
                Example::mixture(prompts.meta_cognition_turns(record), stage_b)
            }
        };
        Ok(example)
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetFormat {
    type Err = SftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            DatasetFormat::Conversation,
            DatasetFormat::ConversationWithContext,
            DatasetFormat::JointLoss,
        ]
        .into_iter()
        .find(|format| format.as_str() == s)
        .ok_or_else(|| SftError::UnknownDatasetFormat(s.to_string()))
    }
}

/// Drop a trailing user turn that only signals the end of the conversation
pub fn strip_end_of_conversation(turns: &[Turn]) -> &[Turn] {
    match turns.split_last() {
        Some((last, rest)) if last.is_user() && last.content.contains(END_CONVERSATION_TOKEN) => {
            rest
        }
        _ => turns,
    }
}

/// Parse a `<USER>: ... <AGENT>: ...` transcript into alternating turns
///
/// Segments are trimmed and empty ones dropped; roles alternate starting with
/// the user. A trailing user turn is dropped. Returns `None` when nothing is
/// left.
pub fn parse_context_transcript(transcript: &str) -> Result<Option<Vec<Turn>>> {
    let speaker_marker = Regex::new(SPEAKER_MARKER_PATTERN)
        .context("Failed to compile speaker marker regex")?;
    let mut turns: Vec<Turn> = speaker_marker
        .split(transcript)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .enumerate()
        .map(|(i, segment)| {
            if i % 2 == 0 {
                Turn::user(segment)
            } else {
                Turn::assistant(segment)
            }
        })
        .collect();

    if turns.last().is_some_and(Turn::is_user) {
        turns.pop();
    }

    if turns.is_empty() {
        Ok(None)
    } else {
        Ok(Some(turns))
    }
}

/// Load agent records from every `.jsonl` file in a directory
///
/// Files are read in path order; blank lines are skipped.
pub fn load_records(data_dir: &Path) -> Result<Vec<AgentRecord>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read data directory: {:?}", data_dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .context("Failed to read directory entry")?;
    paths.retain(|path| path.extension().and_then(|s| s.to_str()) == Some("jsonl"));
    paths.sort();

    let mut records = Vec::new();
    for path in &paths {
        let file =
            fs::File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
        let reader = BufReader::new(file);

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read line")?;
            if line.trim().is_empty() {
                continue;
            }

            let record: AgentRecord = serde_json::from_str(&line).with_context(|| {
                format!(
                    "Failed to parse record at line {} in {:?}",
                    line_num + 1,
                    path
                )
            })?;
            records.push(record);
        }
        debug!("Loaded records from {:?}", path);
    }

    Ok(records)
}

/// Train and evaluation examples
#[derive(Debug, Clone, Default)]
pub struct PreparedData {
    /// Examples to train on
    pub train: Vec<Example>,
    /// Held-out examples, empty unless evaluation is enabled
    pub eval: Vec<Example>,
}

/// Convert records, shuffle, split off an evaluation set and apply sample caps
pub fn prepare_examples(
    records: &[AgentRecord],
    format: DatasetFormat,
    prompts: &PromptTemplates,
    config: &DataConfig,
) -> Result<PreparedData> {
    let mut examples: Vec<Example> = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            format
                .to_example(record, prompts)
                .with_context(|| format!("Failed to convert record {}", index))
        })
        .collect::<Result<_>>()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    examples.shuffle(&mut rng);

    let mut eval = Vec::new();
    if config.do_eval {
        if config.eval_dataset_size >= examples.len() {
            anyhow::bail!(
                "Evaluation split of {} examples leaves nothing to train on ({} examples)",
                config.eval_dataset_size,
                examples.len()
            );
        }
        eval = examples.split_off(examples.len() - config.eval_dataset_size);
        if let Some(max) = config.max_eval_samples {
            eval.truncate(max);
        }
    }

    if let Some(max) = config.max_train_samples {
        examples.truncate(max);
    }

    info!(
        "Prepared {} train and {} eval examples ({})",
        examples.len(),
        eval.len(),
        format
    );

    Ok(PreparedData {
        train: examples,
        eval,
    })
}
