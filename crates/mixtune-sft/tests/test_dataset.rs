//! Tests for record loading and dataset formats

use anyhow::Result;
use mixtune_sft::config::DataConfig;
use mixtune_sft::dataset::{
    load_records, parse_context_transcript, prepare_examples, strip_end_of_conversation,
    AgentRecord, PromptTemplates,
};
use mixtune_sft::DatasetFormat;
use mixtune_tokenizer::{Role, Turn};
use std::fs;
use std::io::Write;
use tempfile::TempDir;

fn record(input: &str, context: &str) -> AgentRecord {
    AgentRecord {
        pseudo_input: input.to_string(),
        context: context.to_string(),
        teacher_output_single: "teacher answer".to_string(),
        student_output_single: "student answer".to_string(),
        reason: "needed the file list".to_string(),
        teacher_output_conv: vec![
            Turn::assistant("ls"),
            Turn::user("a.txt b.txt"),
            Turn::assistant("done"),
            Turn::user("[END_CONVERSATION]"),
        ],
    }
}

fn write_jsonl(dir: &TempDir, name: &str, records: &[AgentRecord]) -> Result<()> {
    let mut file = fs::File::create(dir.path().join(name))?;
    for record in records {
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

#[test]
fn test_conversation_format_strips_end_marker() {
    let example = DatasetFormat::Conversation
        .to_example(&record("list files", ""), &PromptTemplates::default())
        .expect("example");

    assert!(!example.is_mixture());
    assert_eq!(example.context, None);
    assert_eq!(example.stage_a.len(), 4);
    assert_eq!(example.stage_a[0], Turn::user("list files"));
    assert_eq!(example.stage_a.last(), Some(&Turn::assistant("done")));
}

#[test]
fn test_end_marker_only_stripped_from_trailing_user_turn() {
    let turns = vec![Turn::user("[END_CONVERSATION]"), Turn::assistant("ok")];
    assert_eq!(strip_end_of_conversation(&turns), &turns[..]);

    let turns = vec![Turn::assistant("ok"), Turn::user("thanks")];
    assert_eq!(strip_end_of_conversation(&turns), &turns[..]);
}

#[test]
fn test_context_format_parses_transcript() {
    let example = DatasetFormat::ConversationWithContext.to_example(
        &record("  list files \n", "<USER>: where am I <AGENT>: in /tmp <USER>: and now?"),
        &PromptTemplates::default(),
    )
    .expect("example");

    assert_eq!(example.stage_a[0], Turn::user("list files"));
    assert_eq!(
        example.context,
        Some(vec![Turn::user("where am I"), Turn::assistant("in /tmp")])
    );
}

#[test]
fn test_context_format_without_transcript_has_no_context() {
    let example = DatasetFormat::ConversationWithContext
        .to_example(&record("list files", "<USER>: hello"), &PromptTemplates::default())
        .expect("example");
    assert_eq!(example.context, None);
}

#[test]
fn test_parse_context_transcript() {
    assert_eq!(parse_context_transcript("").expect("parse"), None);
    assert_eq!(parse_context_transcript("<USER>:   ").expect("parse"), None);

    let turns = parse_context_transcript("<USER>: a\n<AGENT>: b\n<USER>: c\n<AGENT>: d")
        .expect("parse")
        .expect("turns");
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(turns[3].content, "d");
}

#[test]
fn test_joint_loss_format_builds_both_stages() {
    let example =
        DatasetFormat::JointLoss.to_example(&record("list files", "cwd is /tmp"), &PromptTemplates::default())
        .expect("example");

    assert!(example.is_mixture());
    assert_eq!(example.context, None);
    assert_eq!(example.stage_a.len(), 2);
    assert!(example.stage_a[0].content.contains("teacher answer"));
    assert!(example.stage_a[0].content.contains("student answer"));
    assert!(example.stage_a[1].content.contains("cwd is /tmp"));
    assert!(example.stage_a[1].content.contains("needed the file list"));

    let stage_b = example.stage_b.as_ref().expect("stage two");
    assert_eq!(stage_b.len(), 4);
    assert_eq!(stage_b[0], Turn::user("list files"));
}

#[test]
fn test_custom_templates() {
    let prompts = PromptTemplates {
        student_input: "Task: {input}".to_string(),
        ..PromptTemplates::default()
    };
    let example = DatasetFormat::Conversation.to_example(&record("list files", ""), &prompts)
        .expect("example");
    assert_eq!(example.stage_a[0].content, "Task: list files");
}

#[test]
fn test_load_records_reads_sorted_jsonl_files() -> Result<()> {
    let dir = TempDir::new()?;
    write_jsonl(&dir, "b.jsonl", &[record("second", "")])?;
    write_jsonl(&dir, "a.jsonl", &[record("first", "")])?;
    fs::write(dir.path().join("notes.txt"), "not a record")?;

    let records = load_records(dir.path())?;
    let inputs: Vec<&str> = records.iter().map(|r| r.pseudo_input.as_str()).collect();
    assert_eq!(inputs, vec!["first", "second"]);
    Ok(())
}

#[test]
fn test_load_records_reports_bad_line() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("bad.jsonl"), "{\"pseudo_input\": 1}\n")?;

    let err = load_records(dir.path()).expect_err("malformed record");
    assert!(format!("{:#}", err).contains("line 1"));
    Ok(())
}

#[test]
fn test_prepare_examples_splits_and_caps() {
    let records: Vec<AgentRecord> = (0..10).map(|i| record(&format!("task {}", i), "")).collect();
    let config = DataConfig {
        do_eval: true,
        eval_dataset_size: 3,
        max_train_samples: Some(5),
        max_eval_samples: Some(2),
        ..DataConfig::default()
    };

    let prepared = prepare_examples(
        &records,
        DatasetFormat::Conversation,
        &PromptTemplates::default(),
        &config,
    )
    .expect("prepare");
    assert_eq!(prepared.train.len(), 5);
    assert_eq!(prepared.eval.len(), 2);

    let again = prepare_examples(
        &records,
        DatasetFormat::Conversation,
        &PromptTemplates::default(),
        &config,
    )
    .expect("prepare");
    assert_eq!(prepared.train, again.train);
}

#[test]
fn test_eval_split_larger_than_data_fails() {
    let records = vec![record("only", "")];
    let config = DataConfig {
        do_eval: true,
        ..DataConfig::default()
    };
    assert!(prepare_examples(
        &records,
        DatasetFormat::Conversation,
        &PromptTemplates::default(),
        &config
    )
    .is_err());
}
