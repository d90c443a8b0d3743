//! Tests for the mixture loss aggregator

mod common;

use common::*;
use mixtune_sft::collator::{Batch, StageBatch, STAGE1_PREFIX};
use mixtune_sft::metrics::{MetricsLogger, MetricsRecord};
use mixtune_sft::mixture::{STAGE1_LOSS, STAGE2_LOSS, TOTAL_LOSS};
use mixtune_sft::{MixtureLossAggregator, SftError};

fn stage(first_token: u32) -> StageBatch {
    StageBatch {
        input_ids: vec![vec![first_token]],
        attention_mask: vec![vec![1]],
        labels: vec![vec![first_token as i64]],
    }
}

fn mixture_batch() -> Batch {
    let mut batch = Batch::single(stage(200));
    batch.insert_stage(STAGE1_PREFIX, stage(100)).expect("stage one");
    batch
}

fn combined(ratio: f32, stage2_loss: f32, stage1_loss: f32) -> f32 {
    let mut aggregator = MixtureLossAggregator::new(ratio).expect("ratio");
    let mut model = ScriptedModel::with_losses(&[stage2_loss, stage1_loss]);
    aggregator
        .compute_loss(&mut model, &mixture_batch())
        .expect("loss")
}

#[test]
fn test_combined_loss_is_linear_in_ratio() {
    assert!((combined(0.0, 2.0, 4.0) - 4.0).abs() < 1e-6);
    assert!((combined(1.0, 2.0, 4.0) - 2.0).abs() < 1e-6);
    assert!((combined(0.5, 2.0, 4.0) - 3.0).abs() < 1e-6);
}

#[test]
fn test_stage_two_is_forwarded_first() {
    let mut aggregator = MixtureLossAggregator::new(0.5).expect("ratio");
    let mut model = ScriptedModel::default();

    aggregator
        .compute_loss(&mut model, &mixture_batch())
        .expect("loss");

    assert_eq!(model.forwarded.len(), 2);
    assert_eq!(model.forwarded[0].input_ids[0][0], 200);
    assert_eq!(model.forwarded[1].input_ids[0][0], 100);
}

#[test]
fn test_missing_stage_is_a_fault() {
    let mut aggregator = MixtureLossAggregator::new(0.5).expect("ratio");
    let mut model = ScriptedModel::default();

    let err = aggregator
        .compute_loss(&mut model, &Batch::single(stage(1)))
        .expect_err("no stage one");
    assert_eq!(
        err.downcast_ref::<SftError>(),
        Some(&SftError::MissingStageFields {
            prefix: STAGE1_PREFIX.to_string()
        })
    );
    assert!(aggregator.window().is_empty());
}

#[test]
fn test_log_reports_window_means_and_clears() {
    let mut aggregator = MixtureLossAggregator::new(0.5).expect("ratio");
    let mut model = ScriptedModel::with_losses(&[2.0, 4.0, 6.0, 8.0]);
    for _ in 0..2 {
        aggregator
            .compute_loss(&mut model, &mixture_batch())
            .expect("loss");
    }
    assert_eq!(aggregator.window().len(), 2);

    let mut logger = MetricsLogger::new(1);
    aggregator.log(&mut logger, MetricsRecord::new().with("step", 1.0));

    let record = logger.last().expect("record");
    assert_eq!(record.get(STAGE2_LOSS), Some(4.0));
    assert_eq!(record.get(STAGE1_LOSS), Some(6.0));
    assert_eq!(record.get(TOTAL_LOSS), Some(5.0));
    assert_eq!(record.get("step"), Some(1.0));
    assert!(aggregator.window().is_empty());
}

#[test]
fn test_log_on_empty_window_passes_record_through() {
    let mut aggregator = MixtureLossAggregator::new(0.3).expect("ratio");
    let mut logger = MetricsLogger::new(1);

    aggregator.log(&mut logger, MetricsRecord::new().with("loss", 1.0));
    aggregator.log(&mut logger, MetricsRecord::new().with("loss", 1.0));

    assert_eq!(logger.history().len(), 2);
    assert_eq!(logger.history()[0], logger.history()[1]);
    assert!(!logger.history()[0].contains(TOTAL_LOSS));
}

#[test]
fn test_each_instance_owns_its_window() {
    let mut a = MixtureLossAggregator::new(0.5).expect("ratio");
    let b = MixtureLossAggregator::new(0.5).expect("ratio");
    let mut model = ScriptedModel::default();

    a.compute_loss(&mut model, &mixture_batch()).expect("loss");
    assert_eq!(a.window().len(), 1);
    assert!(b.window().is_empty());
}

#[test]
fn test_evaluate_loss_leaves_window_empty() {
    let aggregator = MixtureLossAggregator::new(0.25).expect("ratio");
    let mut model = ScriptedModel::with_losses(&[2.0, 4.0]);

    let (stage1, stage2, total) = aggregator
        .evaluate_loss(&mut model, &mixture_batch())
        .expect("loss");

    assert_eq!((stage1, stage2), (4.0, 2.0));
    assert!((total - 3.5).abs() < 1e-6);
    assert_eq!(model.forwarded.len(), 2);
    assert!(model.backward_losses.is_empty());
    assert!(aggregator.window().is_empty());
}
