// Runs the checked-in sample workspace (sources.yaml, quality.yaml, fixtures/)
// end to end against file-backed state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fdp_core::{ExecutionOutcome, RunTrigger, Verdict};
use fdp_storage::TierStore;
use fdp_sync::{build_orchestrator, PipelineConfig};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

fn copy_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

fn sample_workspace() -> (tempfile::TempDir, PipelineConfig) {
    let root = workspace_root();
    let dir = tempfile::tempdir().unwrap();
    for file in ["sources.yaml", "quality.yaml"] {
        std::fs::copy(root.join(file), dir.path().join(file)).unwrap();
    }
    copy_tree(&root.join("fixtures"), &dir.path().join("fixtures"));

    let mut config = PipelineConfig::for_workspace(dir.path());
    config.drain_poll_interval = Duration::from_millis(10);
    config.worker_concurrency = 2;
    (dir, config)
}

#[test]
fn sample_workspace_files_exist() {
    let root = workspace_root();
    assert!(root.join("sources.yaml").exists());
    assert!(root.join("quality.yaml").exists());
    assert!(root.join("fixtures/house-ptr-2024/index.json").exists());
    assert!(root.join("fixtures/house-annual-2024/index.json").exists());
}

#[tokio::test]
async fn sample_workspace_publishes_then_idles() {
    let (_dir, config) = sample_workspace();
    let orchestrator = build_orchestrator(&config).await.unwrap();
    assert_eq!(orchestrator.sources().len(), 2);

    let first = orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(first.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(first.counters.items_enqueued, 5);
    assert_eq!(first.counters.items_succeeded, 5);
    assert_eq!(first.counters.items_dead_lettered, 0);
    assert_eq!(first.quality_reports[0].verdict, Verdict::Passed);

    let tiers = TierStore::new(config.tiers_dir());
    let aggregated = tiers.read("aggregated").await.unwrap();
    assert_eq!(aggregated.len(), 7);
    assert!(aggregated.iter().any(|row| row.key == "20024501#1"));

    let manifest = first.published_manifest.clone().unwrap();
    assert!(Path::new(&manifest).exists());
    assert!(config.queue_state_path().exists());

    let second = orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(second.outcome, Some(ExecutionOutcome::NoUpdatesFound));
}

#[tokio::test]
async fn state_survives_a_restart() {
    let (_dir, config) = sample_workspace();
    let first = build_orchestrator(&config)
        .await
        .unwrap()
        .run(RunTrigger::manual())
        .await
        .unwrap();
    assert_eq!(first.outcome, Some(ExecutionOutcome::Published));

    let restarted = build_orchestrator(&config).await.unwrap();
    let second = restarted.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(second.outcome, Some(ExecutionOutcome::NoUpdatesFound));
    assert_eq!(restarted.log().list(10).await.unwrap().len(), 2);
}

fn workspace_with_sources(sources_yaml: &str) -> (tempfile::TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sources.yaml"), sources_yaml).unwrap();
    let mut config = PipelineConfig::for_workspace(dir.path());
    config.drain_poll_interval = Duration::from_millis(10);
    (dir, config)
}

#[tokio::test]
async fn unpublished_source_starts_and_finds_no_updates() {
    let (dir, config) = workspace_with_sources(
        r#"
sources:
  - key: house-annual-2026
    filing_type: annual
"#,
    );
    let orchestrator = build_orchestrator(&config).await.unwrap();

    let first = orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(first.outcome, Some(ExecutionOutcome::NoUpdatesFound));
    assert_eq!(
        first.sources["house-annual-2026"].update_reason.as_deref(),
        Some("not_yet_available")
    );

    // Once the index appears the same orchestrator picks it up.
    let fixture_dir = dir.path().join("fixtures/house-annual-2026");
    std::fs::create_dir_all(&fixture_dir).unwrap();
    std::fs::write(
        fixture_dir.join("index.json"),
        r#"{"source_key":"house-annual-2026","items":[
            {"sequence":1,"item_id":"10070001","content_type":"application/json",
             "inline_text":"{\"records\":[{\"owner\":\"self\",\"asset\":\"Index fund\"}]}"}
        ]}"#,
    )
    .unwrap();
    let second = orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(second.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(second.counters.items_succeeded, 1);
}

#[tokio::test]
async fn http_head_source_without_url_is_rejected() {
    let (_dir, config) = workspace_with_sources(
        r#"
sources:
  - key: house-annual-2019
    probe: http_head
"#,
    );
    let Err(err) = build_orchestrator(&config).await else {
        panic!("an http_head source without a url must not wire");
    };
    assert!(format!("{err:#}").contains("house-annual-2019 uses an http_head probe but has no url"));
}
