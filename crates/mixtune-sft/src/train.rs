//! Training loop for mixture-objective fine-tuning

use crate::checkpoint::{
    adapter_dir, checkpoint_dir, find_last_checkpoint, mark_completed, rotate_checkpoints,
    ADAPTER_DIR,
};
pub use crate::checkpoint::TRAINER_STATE_FILE;
use crate::collator::Batch;
use crate::config::FinetuneConfigFile;
use crate::dataloader::{DataLoaderState, ExampleDataLoader, LoaderOptions};
use crate::dataset::{load_records, prepare_examples};
use crate::error::SftError;
use crate::metrics::{MetricsLogger, MetricsRecord};
use crate::mixture::{LossWindow, MixtureLossAggregator};
use crate::model::{CausalLm, TrainingLoss};
use anyhow::{Context, Result};
use mixtune_tokenizer::ChatTokenizer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Summary written to the output directory when training finishes
pub const METRICS_FILE: &str = "metrics.json";
/// Metric key for the mean evaluation loss
pub const EVAL_LOSS: &str = "eval_loss";
/// Metric key for the mean stage-one evaluation loss
pub const EVAL_STAGE1_LOSS: &str = "eval_stage1_loss";
/// Metric key for the mean stage-two evaluation loss
pub const EVAL_STAGE2_LOSS: &str = "eval_stage2_loss";

/// Loss the training loop minimizes
#[derive(Debug, Clone)]
pub enum Objective {
    /// Plain causal LM loss on the unprefixed fields
    Single,
    /// Weighted two-stage loss
    Mixture(MixtureLossAggregator),
}

impl Objective {
    /// Mixture objective for joint-loss formats, single otherwise
    pub fn from_config(config: &FinetuneConfigFile) -> Result<Self> {
        if config.data.dataset_format.is_joint_loss() {
            Ok(Objective::Mixture(MixtureLossAggregator::new(
                config.training.stage2_ratio,
            )?))
        } else {
            Ok(Objective::Single)
        }
    }

    /// Loss for one micro-batch
    pub fn compute_loss<M: CausalLm>(&mut self, model: &mut M, batch: &Batch) -> Result<M::Loss> {
        match self {
            Objective::Single => model.forward(batch.require_stage("")?),
            Objective::Mixture(aggregator) => aggregator.compute_loss(model, batch),
        }
    }

    /// Detached loss of one batch without touching any window
    ///
    /// Returns the total and, for the mixture, the `(stage1, stage2)` pair.
    pub fn evaluate_loss<M: CausalLm>(
        &self,
        model: &mut M,
        batch: &Batch,
    ) -> Result<(f32, Option<(f32, f32)>)> {
        match self {
            Objective::Single => Ok((model.forward(batch.require_stage("")?)?.detached(), None)),
            Objective::Mixture(aggregator) => {
                let (stage1, stage2, total) = aggregator.evaluate_loss(model, batch)?;
                Ok((total, Some((stage1, stage2))))
            }
        }
    }

    /// Emit a metrics record, adding the mixture's window means when present
    pub fn log(&mut self, logger: &mut MetricsLogger, record: MetricsRecord) {
        match self {
            Objective::Single => logger.log(record),
            Objective::Mixture(aggregator) => aggregator.log(logger, record),
        }
    }
}

/// Training loop options
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerOptions {
    /// Directory for checkpoints, the completion marker and metrics
    pub output_dir: PathBuf,
    /// Micro-batches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Optimizer steps to run
    pub max_steps: usize,
    /// Optimizer steps between metrics records
    pub logging_steps: usize,
    /// Optimizer steps between checkpoints (0 = disabled)
    pub save_steps: usize,
    /// Checkpoints kept on disk (None = keep all)
    pub save_total_limit: Option<usize>,
}

impl TrainerOptions {
    /// Derive loop options from a fine-tuning config
    pub fn from_config(config: &FinetuneConfigFile) -> Self {
        let training = &config.training;
        Self {
            output_dir: training.output_dir.clone(),
            gradient_accumulation_steps: training.gradient_accumulation_steps,
            max_steps: training.max_steps,
            logging_steps: training.logging_steps,
            save_steps: training.save_steps,
            save_total_limit: training.save_total_limit,
        }
    }
}

/// Loop position saved alongside each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken
    pub global_step: usize,
    /// Loader position at the time of saving
    pub dataloader: DataLoaderState,
}

/// Outcome of a training run, written to `metrics.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Optimizer steps taken, including resumed ones
    pub global_step: usize,
    /// Fractional epochs consumed
    pub epoch: f64,
    /// Mean micro-batch loss over this run
    pub train_loss: f64,
    /// Evaluation metrics, empty when no evaluation ran
    #[serde(flatten, default)]
    pub eval: MetricsRecord,
}

impl TrainSummary {
    /// Write the summary to `metrics.json` in `output_dir`
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        let metrics_path = output_dir.join(METRICS_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize metrics")?;
        fs::write(&metrics_path, json)
            .with_context(|| format!("Failed to write metrics: {:?}", metrics_path))
    }
}

/// Drives a [`CausalLm`] through gradient-accumulated optimizer steps
pub struct Trainer {
    options: TrainerOptions,
    objective: Objective,
    logger: MetricsLogger,
    start_step: usize,
}

impl Trainer {
    /// Create a trainer
    pub fn new(options: TrainerOptions, objective: Objective) -> Self {
        let logger = MetricsLogger::new(options.logging_steps);
        Self {
            options,
            objective,
            logger,
            start_step: 0,
        }
    }

    /// Metrics logged so far
    pub fn logger(&self) -> &MetricsLogger {
        &self.logger
    }

    /// Objective being minimized
    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    /// Step the next [`Trainer::train`] call starts counting from
    pub fn start_step(&self) -> usize {
        self.start_step
    }

    /// Continue from a checkpoint directory written by this trainer
    ///
    /// Restores adapter weights through the model, the loader position and
    /// the step counter.
    pub fn resume_from<M: CausalLm, T: ChatTokenizer>(
        &mut self,
        model: &mut M,
        loader: &mut ExampleDataLoader<T>,
        checkpoint: &Path,
    ) -> Result<()> {
        let state_path = checkpoint.join(TRAINER_STATE_FILE);
        let content = fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read trainer state: {:?}", state_path))?;
        let state: TrainerState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse trainer state: {:?}", state_path))?;

        model
            .load_adapter(&checkpoint.join(ADAPTER_DIR))
            .context("Failed to load adapter")?;
        loader.restore_state(&state.dataloader);
        self.start_step = state.global_step;

        info!("Resumed from checkpoint at step {}", state.global_step);
        Ok(())
    }

    /// Run the training loop until `max_steps` optimizer steps
    ///
    /// # Errors
    /// [`SftError::EmptyDataset`] when the loader has no examples; any
    /// collation, loss or runtime failure aborts the run.
    pub fn train<M: CausalLm, T: ChatTokenizer>(
        &mut self,
        model: &mut M,
        loader: &mut ExampleDataLoader<T>,
    ) -> Result<TrainSummary> {
        if loader.is_empty() {
            return Err(SftError::EmptyDataset.into());
        }
        let output_dir = self.options.output_dir.clone();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        let accumulation = self.options.gradient_accumulation_steps.max(1);
        let mut step = self.start_step;
        let mut accumulation_count = 0;
        let mut interval_loss = 0.0f64;
        let mut interval_batches = 0usize;
        let mut run_loss = 0.0f64;
        let mut run_batches = 0usize;

        info!(
            "Training from step {} to {} ({} examples)",
            step,
            self.options.max_steps,
            loader.len()
        );

        while step < self.options.max_steps {
            let batch = match loader.next_batch()? {
                Some(batch) => batch,
                None => {
                    loader.reset();
                    continue;
                }
            };

            let loss = self
                .objective
                .compute_loss(model, &batch)
                .with_context(|| format!("Loss computation failed at step {}", step))?;
            let value = loss.detached() as f64;
            model.backward(loss).context("Backward pass failed")?;

            interval_loss += value;
            interval_batches += 1;
            run_loss += value;
            run_batches += 1;
            accumulation_count += 1;

            if accumulation_count < accumulation {
                continue;
            }
            model.optimizer_step().context("Optimizer step failed")?;
            accumulation_count = 0;
            step += 1;

            if self.logger.should_log(step) {
                let mut record = MetricsRecord::new()
                    .with("loss", interval_loss / interval_batches as f64)
                    .with("epoch", loader.progress())
                    .with("step", step as f64);
                if let Some(learning_rate) = model.learning_rate() {
                    record.insert("learning_rate", learning_rate as f64);
                }
                self.objective.log(&mut self.logger, record);
                interval_loss = 0.0;
                interval_batches = 0;
            }

            if self.options.save_steps > 0 && step % self.options.save_steps == 0 {
                self.save_checkpoint(model, loader, step)?;
            }
        }

        if accumulation_count > 0 {
            warn!(
                "Discarding {} accumulated micro-batches after the last step",
                accumulation_count
            );
        }

        mark_completed(&output_dir)?;
        model
            .save_adapter(&output_dir.join(ADAPTER_DIR))
            .context("Failed to save final adapter")?;

        let summary = TrainSummary {
            global_step: step,
            epoch: loader.progress(),
            train_loss: if run_batches > 0 {
                run_loss / run_batches as f64
            } else {
                0.0
            },
            eval: MetricsRecord::new(),
        };
        summary.write(&output_dir)?;

        info!("Training completed at step {}", step);
        Ok(summary)
    }

    /// Forward every remaining batch of `loader` without backward passes
    ///
    /// Reports the mean [`EVAL_LOSS`] and, for the mixture objective, the
    /// per-stage means. The record is also logged.
    ///
    /// # Errors
    /// [`SftError::EmptyDataset`] when the loader yields no batch.
    pub fn evaluate<M: CausalLm, T: ChatTokenizer>(
        &mut self,
        model: &mut M,
        loader: &mut ExampleDataLoader<T>,
    ) -> Result<MetricsRecord> {
        let mut eval_loss = 0.0f64;
        let mut batches = 0usize;
        let mut stages = LossWindow::default();

        while let Some(batch) = loader.next_batch()? {
            let (total, split) = self
                .objective
                .evaluate_loss(model, &batch)
                .with_context(|| format!("Evaluation failed at batch {}", batches))?;
            eval_loss += total as f64;
            batches += 1;
            if let Some((stage1, stage2)) = split {
                stages.push(stage1, stage2, total);
            }
        }
        if batches == 0 {
            return Err(SftError::EmptyDataset.into());
        }

        let mut record = MetricsRecord::new().with(EVAL_LOSS, eval_loss / batches as f64);
        if let Some(means) = stages.means() {
            record.insert(EVAL_STAGE1_LOSS, means.stage1);
            record.insert(EVAL_STAGE2_LOSS, means.stage2);
        }
        info!("Evaluated {} batches", batches);
        self.logger.log(record.clone());
        Ok(record)
    }

    fn save_checkpoint<M: CausalLm, T: ChatTokenizer>(
        &self,
        model: &M,
        loader: &ExampleDataLoader<T>,
        step: usize,
    ) -> Result<()> {
        let output_dir = &self.options.output_dir;
        let adapter = adapter_dir(output_dir, step);
        fs::create_dir_all(&adapter)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", adapter))?;
        model
            .save_adapter(&adapter)
            .with_context(|| format!("Failed to save adapter at step {}", step))?;

        let state = TrainerState {
            global_step: step,
            dataloader: loader.get_state(),
        };
        let state_path = checkpoint_dir(output_dir, step).join(TRAINER_STATE_FILE);
        let json = serde_json::to_string_pretty(&state).context("Failed to serialize trainer state")?;
        fs::write(&state_path, json)
            .with_context(|| format!("Failed to write trainer state: {:?}", state_path))?;
        info!("Saved checkpoint at step {} to {:?}", step, adapter);

        if let Some(limit) = self.options.save_total_limit {
            rotate_checkpoints(output_dir, limit)?;
        }
        Ok(())
    }
}

/// Load data per `config` and fine-tune `model`
///
/// Resumes from the newest complete checkpoint in the output directory, or
/// starts from `training.adapter_checkpoint_dir` when there is none. With
/// `data.do_eval` the held-out split is evaluated after training and its
/// metrics are merged into `metrics.json`. Returns `None` without training
/// when a previous run already completed.
pub fn finetune<M: CausalLm, T: ChatTokenizer>(
    config: &FinetuneConfigFile,
    tokenizer: T,
    model: &mut M,
) -> Result<Option<TrainSummary>> {
    config.validate()?;
    let lookup = find_last_checkpoint(&config.training.output_dir)?;
    if lookup.completed {
        info!("Detected that training was already completed!");
        return Ok(None);
    }

    let records = load_records(&config.data.data_dir).context("Failed to load records")?;
    let prepared = prepare_examples(
        &records,
        config.data.dataset_format,
        &config.prompts,
        &config.data,
    )?;
    if prepared.train.is_empty() {
        return Err(SftError::EmptyDataset.into());
    }

    let options = LoaderOptions::from_config(config);
    let mut loader = ExampleDataLoader::new(prepared.train, &tokenizer, options.clone())
        .context("Failed to create data loader")?;
    let mut trainer = Trainer::new(
        TrainerOptions::from_config(config),
        Objective::from_config(config)?,
    );
    match (lookup.last_checkpoint, &config.training.adapter_checkpoint_dir) {
        (Some(checkpoint), _) => trainer.resume_from(model, &mut loader, &checkpoint)?,
        (None, Some(adapter)) => {
            model
                .load_adapter(adapter)
                .with_context(|| format!("Failed to load adapter: {:?}", adapter))?;
            info!("Starting from adapter weights in {:?}", adapter);
        }
        (None, None) => {}
    }

    let mut summary = trainer.train(model, &mut loader)?;

    if config.data.do_eval && !prepared.eval.is_empty() {
        let eval_options = LoaderOptions {
            group_by_length: false,
            ..options
        };
        let mut eval_loader = ExampleDataLoader::new(prepared.eval, &tokenizer, eval_options)
            .context("Failed to create evaluation data loader")?;
        summary.eval = trainer.evaluate(model, &mut eval_loader)?;
        summary.write(&config.training.output_dir)?;
    }
    Ok(Some(summary))
}
