//! Mixture loss aggregation
//!
//! A mixture batch carries two stages. The combined loss is
//!
//! ```text
//! (1 - r) * loss(stage1_*) + r * loss(unprefixed)
//! ```
//!
//! and the detached per-stage values accumulate in a [`LossWindow`] until the
//! next logging event reports their means.

use crate::collator::{Batch, STAGE1_PREFIX};
use crate::error::SftError;
use crate::metrics::{MetricsLogger, MetricsRecord};
use crate::model::{CausalLm, TrainingLoss};
use anyhow::{Context, Result};
use tracing::debug;

/// Metric key for the stage-one mean
pub const STAGE1_LOSS: &str = "stage1_loss";
/// Metric key for the stage-two mean
pub const STAGE2_LOSS: &str = "stage2_loss";
/// Metric key for the combined mean
pub const TOTAL_LOSS: &str = "total_loss";

/// Means of the losses recorded since the last logging event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMeans {
    pub stage1: f64,
    pub stage2: f64,
    pub total: f64,
}

/// Detached loss values recorded between logging events
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossWindow {
    stage1: Vec<f32>,
    stage2: Vec<f32>,
    total: Vec<f32>,
}

impl LossWindow {
    /// Record one step
    pub fn push(&mut self, stage1: f32, stage2: f32, total: f32) {
        self.stage1.push(stage1);
        self.stage2.push(stage2);
        self.total.push(total);
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.total.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.total.is_empty()
    }

    /// Arithmetic means, or `None` for an empty window
    pub fn means(&self) -> Option<WindowMeans> {
        if self.is_empty() {
            return None;
        }
        Some(WindowMeans {
            stage1: mean(&self.stage1),
            stage2: mean(&self.stage2),
            total: mean(&self.total),
        })
    }

    /// Drop every recorded value
    pub fn clear(&mut self) {
        self.stage1.clear();
        self.stage2.clear();
        self.total.clear();
    }
}

fn mean(values: &[f32]) -> f64 {
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

/// Weighted two-stage objective with a per-instance loss window
#[derive(Debug, Clone)]
pub struct MixtureLossAggregator {
    stage2_ratio: f32,
    window: LossWindow,
}

impl MixtureLossAggregator {
    /// Create an aggregator weighting stage two by `stage2_ratio`
    ///
    /// # Errors
    /// [`SftError::InvalidRatio`] unless `0 <= stage2_ratio <= 1`.
    pub fn new(stage2_ratio: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&stage2_ratio) {
            return Err(SftError::InvalidRatio(stage2_ratio).into());
        }
        Ok(Self {
            stage2_ratio,
            window: LossWindow::default(),
        })
    }

    /// Weight of the stage-two loss
    pub fn stage2_ratio(&self) -> f32 {
        self.stage2_ratio
    }

    /// Losses recorded since the last [`MixtureLossAggregator::log`]
    pub fn window(&self) -> &LossWindow {
        &self.window
    }

    /// Run both stages through `model` and combine their losses
    ///
    /// Stage two (unprefixed fields) is forwarded first, then stage one. The
    /// returned loss keeps the model's gradient tracking.
    ///
    /// # Errors
    /// [`SftError::MissingStageFields`] if either stage is absent.
    pub fn compute_loss<M: CausalLm>(&mut self, model: &mut M, batch: &Batch) -> Result<M::Loss> {
        let (combined, stage1_value, stage2_value) = self.combine(model, batch)?;
        let total_value = combined.detached();

        debug!(
            "stage1={:.6} stage2={:.6} total={:.6}",
            stage1_value, stage2_value, total_value
        );
        self.window.push(stage1_value, stage2_value, total_value);
        Ok(combined)
    }

    /// Detached `(stage1, stage2, total)` losses of a batch
    ///
    /// Runs the same forward passes as [`MixtureLossAggregator::compute_loss`]
    /// but leaves the window untouched.
    pub fn evaluate_loss<M: CausalLm>(&self, model: &mut M, batch: &Batch) -> Result<(f32, f32, f32)> {
        let (combined, stage1_value, stage2_value) = self.combine(model, batch)?;
        Ok((stage1_value, stage2_value, combined.detached()))
    }

    fn combine<M: CausalLm>(&self, model: &mut M, batch: &Batch) -> Result<(M::Loss, f32, f32)> {
        let stage2_batch = batch.require_stage("")?;
        let stage1_batch = batch.require_stage(STAGE1_PREFIX)?;

        let stage2 = model
            .forward(stage2_batch)
            .context("Stage two forward pass failed")?;
        let stage1 = model
            .forward(stage1_batch)
            .context("Stage one forward pass failed")?;

        let (stage1_value, stage2_value) = (stage1.detached(), stage2.detached());
        let combined = stage1.weighted_sum(1.0 - self.stage2_ratio, stage2, self.stage2_ratio)?;
        Ok((combined, stage1_value, stage2_value))
    }

    /// Add the window means to `record`, log it and clear the window
    ///
    /// With an empty window the record is logged unchanged.
    pub fn log(&mut self, logger: &mut MetricsLogger, mut record: MetricsRecord) {
        let window = std::mem::take(&mut self.window);
        if let Some(means) = window.means() {
            record.insert(STAGE1_LOSS, means.stage1);
            record.insert(STAGE2_LOSS, means.stage2);
            record.insert(TOTAL_LOSS, means.total);
        }
        logger.log(record);
    }
}
