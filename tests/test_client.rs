//! Client surface tests: idempotent start, forced re-runs, cancel, lookups.

use std::sync::Arc;

use chapterflow::engine::types::{WorkflowStatus, run_id_for};
use chapterflow::engine::workflow::WorkflowDefinition;
use chapterflow::engine::{ChapterWorkflow, WorkflowClient, WorkflowError};
use chapterflow::storage::RunStore;
use chapterflow::storage::memory_store::MemoryRunStore;

fn client_with_store() -> (WorkflowClient, Arc<dyn RunStore>) {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> = Arc::new(ChapterWorkflow::default());
    (WorkflowClient::new(store.clone(), workflow), store)
}

#[tokio::test]
async fn start_derives_a_deterministic_run_id() {
    let (client, _store) = client_with_store();

    let receipt = client.start("book-42", "ch-3", false).await.unwrap();
    assert_eq!(receipt.run_id, run_id_for("book-42", "ch-3"));
    assert!(!receipt.deduplicated);

    // The run exists with its first step scheduled.
    let run = client.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.status(), WorkflowStatus::Running);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].activity, "fetch_chapter");
}

#[tokio::test]
async fn duplicate_start_reports_the_existing_run() {
    let (client, _store) = client_with_store();

    let first = client.start("book-42", "ch-3", false).await.unwrap();
    let err = client.start("book-42", "ch-3", false).await.unwrap_err();
    match err {
        WorkflowError::AlreadyRunning { run_id } => assert_eq!(run_id, first.run_id),
        other => panic!("expected AlreadyRunning, got {other}"),
    }

    // The attach variant folds the conflict into a deduplicated receipt.
    let attached = client.start_or_attach("book-42", "ch-3").await.unwrap();
    assert_eq!(attached.run_id, first.run_id);
    assert!(attached.deduplicated);
}

#[tokio::test]
async fn terminal_run_start_is_deduplicated_not_restarted() {
    let (client, store) = client_with_store();

    let first = client.start("book-42", "ch-3", false).await.unwrap();
    client.cancel(&first.run_id).await.unwrap();

    let again = client.start("book-42", "ch-3", false).await.unwrap();
    assert_eq!(again.run_id, first.run_id);
    assert!(again.deduplicated);

    // Still the single run, still terminal.
    let run = store.get_run(&first.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Cancelled);
}

#[tokio::test]
async fn force_new_creates_a_versioned_run() {
    let (client, store) = client_with_store();

    let base = client.start("book-42", "ch-3", false).await.unwrap();
    let forced = client.start("book-42", "ch-3", true).await.unwrap();
    assert_eq!(forced.run_id, format!("{}--v2", base.run_id));
    assert!(!forced.deduplicated);

    let forced_again = client.start("book-42", "ch-3", true).await.unwrap();
    assert_eq!(forced_again.run_id, format!("{}--v3", base.run_id));

    assert_eq!(store.list_runs(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn force_new_after_delete_skips_surviving_versions() {
    let (client, store) = client_with_store();

    let base = client.start("book-42", "ch-3", false).await.unwrap();
    let v2 = client.start("book-42", "ch-3", true).await.unwrap();
    let v3 = client.start("book-42", "ch-3", true).await.unwrap();
    assert_eq!(v3.run_id, format!("{}--v3", base.run_id));

    // Deleting an intermediate version must not make the next forced run
    // collide with a surviving one.
    store.delete_run(&v2.run_id).await.unwrap();

    let v4 = client.start("book-42", "ch-3", true).await.unwrap();
    assert_eq!(v4.run_id, format!("{}--v4", base.run_id));
    assert!(!v4.deduplicated);
}

#[tokio::test]
async fn empty_identifiers_are_rejected() {
    let (client, _store) = client_with_store();

    assert!(matches!(
        client.start("", "ch-3", false).await,
        Err(WorkflowError::InvalidId(_))
    ));
    assert!(matches!(
        client.start("book-42", "   ", false).await,
        Err(WorkflowError::InvalidId(_))
    ));
}

#[tokio::test]
async fn unknown_run_id_is_not_found() {
    let (client, _store) = client_with_store();

    assert!(matches!(
        client.get_run("nope").await,
        Err(WorkflowError::RunNotFound(_))
    ));
    assert!(matches!(
        client.cancel("nope").await,
        Err(WorkflowError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn cancel_is_a_no_op_on_terminal_runs() {
    let (client, _store) = client_with_store();

    let receipt = client.start("book-42", "ch-3", false).await.unwrap();
    assert_eq!(
        client.cancel(&receipt.run_id).await.unwrap(),
        WorkflowStatus::Cancelled
    );
    // Second cancel reports the same terminal status without touching state.
    assert_eq!(
        client.cancel(&receipt.run_id).await.unwrap(),
        WorkflowStatus::Cancelled
    );
}

#[tokio::test]
async fn report_includes_last_completed_step() {
    let (client, store) = client_with_store();

    let receipt = client.start("book-42", "ch-3", false).await.unwrap();
    let claim = store
        .claim_step("w", std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    store
        .report_step(
            &claim.run_id,
            claim.step_index,
            &claim.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({ "text": "ok" }),
            },
        )
        .await
        .unwrap();

    let report = client
        .report(&receipt.run_id, std::time::Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Running);
    assert_eq!(report.last_completed_step, Some(0));
    assert!(report.stall_diagnostic.is_none());
}

#[tokio::test]
async fn report_flags_a_run_with_nothing_scheduled() {
    let (client, store) = client_with_store();

    let receipt = client.start("book-42", "ch-3", false).await.unwrap();
    let claim = store
        .claim_step("w", std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    // Step 0 succeeds but no worker survives to schedule step 1.
    store
        .report_step(
            &claim.run_id,
            claim.step_index,
            &claim.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({ "text": "ok" }),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let report = client
        .report(&receipt.run_id, std::time::Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Running);
    let diag = report.stall_diagnostic.expect("stalled run must be surfaced");
    assert!(diag.contains("no step scheduled"));
}
