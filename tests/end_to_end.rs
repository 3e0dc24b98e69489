//! Integration tests for whole test runs

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use stage_report::{
    DirectoryStorage, FailureCause, JsonSerializer, MemoryStorage, MockDevice, ReportDocument,
    RunContext, RunSettings, RunSummary, StageKind, StageOutcome, StageStatus, StageTree, Storage,
    TestRun,
};

fn context(storage: &MemoryStorage) -> RunContext {
    RunContext::new(Arc::new(storage.clone())).with_settings(RunSettings {
        step_screenshots: false,
        failure_artifacts: false,
    })
}

#[test]
fn test_open_and_close_settings_scenario() {
    let storage = MemoryStorage::new();
    let mut tree = StageTree::new("Settings", None);

    let open = tree.open(StageKind::Step, "Open settings", None).unwrap();
    tree.node_mut(open).pass(&storage).unwrap();
    tree.close(open).unwrap();

    let close = tree.open(StageKind::Step, "Close settings", None).unwrap();
    let cause = FailureCause::new("boom");
    tree.node_mut(close).fail(cause.clone()).unwrap();
    tree.close(close).unwrap();

    tree.propagate_failure(&cause, |_| {}).unwrap();

    let root = tree.root();
    assert_eq!(root.status(), StageStatus::Failed);
    assert_eq!(root.failure_cause().unwrap().message, "boom");
    assert_eq!(root.test_children(), &[open, close]);
    assert_eq!(tree.node(open).status(), StageStatus::Passed);
    assert_eq!(tree.node(close).status(), StageStatus::Failed);
    assert!(tree.stack().is_empty());
}

#[test]
fn test_same_scenario_through_test_run() {
    let storage = MemoryStorage::new();
    let summary = Arc::new(RunSummary::new());
    let mut run = TestRun::new(
        "Settings",
        Some("settings-1".to_string()),
        context(&storage).with_listener(summary.clone()),
    );

    let failure = run
        .run(|run| -> Result<(), String> {
            run.step("Open settings", |_| Ok::<_, String>(()))?;
            run.step("Close settings", |_| Err::<(), _>("boom".to_string()))
        })
        .unwrap_err();
    assert_eq!(failure.cause.message, "boom");

    let bytes = storage.contents("settings-1-result.json").unwrap();
    let document: ReportDocument = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(document.test.status, StageStatus::Failed);
    assert_eq!(document.test.failure.unwrap().message, "boom");
    let steps: Vec<(&str, StageStatus)> = document
        .test
        .steps
        .iter()
        .map(|step| (step.title.as_str(), step.status))
        .collect();
    assert_eq!(
        steps,
        vec![
            ("Open settings", StageStatus::Passed),
            ("Close settings", StageStatus::Failed)
        ]
    );

    let counts = summary.snapshot();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 1);
}

#[test]
fn test_panic_fails_every_open_stage() {
    let storage = MemoryStorage::new();
    let mut run = TestRun::new("Checkout", None, context(&storage));

    let failure = run
        .run(|run| {
            run.scenario("pay", |run| {
                run.step("enter card", |_| -> Result<(), String> {
                    panic!("card field missing")
                })
            })
        })
        .unwrap_err();

    assert_eq!(failure.cause.message, "card field missing");
    let tree = run.tree();
    let statuses: Vec<(usize, StageStatus)> = tree
        .walk()
        .into_iter()
        .map(|(depth, id)| (depth, tree.node(id).status()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (0, StageStatus::Failed),
            (1, StageStatus::Failed),
            (2, StageStatus::Failed)
        ]
    );
    assert!(tree.stack().is_empty());
}

#[test]
fn test_kept_and_pruned_attachments_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(DirectoryStorage::new(dir.path()));
    let device = Arc::new(MockDevice::with_color(32, 64, [10, 20, 30]));
    let context = RunContext::new(storage.clone())
        .with_device(device)
        .with_serializer(Arc::new(JsonSerializer::compact()))
        .with_settings(RunSettings {
            step_screenshots: true,
            failure_artifacts: true,
        });
    let mut run = TestRun::new("Profile", Some("profile".to_string()), context);

    run.run(|run| {
        run.step("open profile", |run| {
            run.screenshot("profile page");
            Ok::<_, String>(())
        })
    })
    .unwrap();

    let step = run.tree().node(run.tree().root().test_children()[0]);
    assert_eq!(step.attachments().len(), 1);
    assert_eq!(step.attachments()[0].description, "profile page");
    assert!(dir.path().join(&step.attachments()[0].relative_path).exists());

    let screenshots: Vec<_> = std::fs::read_dir(dir.path().join("screenshots"))
        .unwrap()
        .collect();
    assert_eq!(screenshots.len(), 1, "step-start screenshot should be pruned");
    assert!(storage.root_output_dir().join("profile-result.json").exists());
}

#[test]
fn test_manual_stage_api() {
    let storage = MemoryStorage::new();
    let mut run = TestRun::new("Manual", None, context(&storage));

    let outer = run.begin_stage(StageKind::Scenario, "outer").unwrap();
    let inner = run.begin_stage(StageKind::Step, "inner").unwrap();
    assert!(run.end_stage(outer, StageOutcome::Passed).is_err());
    run.end_stage(inner, StageOutcome::Skipped).unwrap();
    run.end_stage(outer, StageOutcome::Passed).unwrap();
    run.on_ignored().unwrap();

    assert_eq!(run.tree().node(inner).status(), StageStatus::Skipped);
    assert_eq!(run.tree().root().status(), StageStatus::Ignored);
}

#[tokio::test]
async fn test_async_stage() {
    let storage = MemoryStorage::new();
    let mut run = TestRun::new("Async", None, context(&storage));
    run.on_starting();

    let value: Result<u32, String> = run
        .stage_async(StageKind::Step, "wait for sync", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(7)
        })
        .await;
    let failed: Result<(), String> = run
        .stage_async(StageKind::Step, "wait for upload", async {
            Err("timed out".to_string())
        })
        .await;

    assert_eq!(value, Ok(7));
    assert!(failed.is_err());
    run.on_failed(FailureCause::new("timed out")).unwrap();

    let steps = run.tree().root().test_children();
    assert_eq!(run.tree().node(steps[0]).status(), StageStatus::Passed);
    assert_eq!(run.tree().node(steps[1]).status(), StageStatus::Failed);
    assert_eq!(run.tree().root().status(), StageStatus::Failed);
}
