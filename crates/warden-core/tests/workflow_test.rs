//! Workflow submission: expansion, dependency-ordered execution, and
//! two-phase coordination gating.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{orchestrator, register_worker, task_id_of, test_config, wait_for_status};
use warden_core::CompletionReport;
use warden_core::comms::{CoordinationOutcome, MessageType};
use warden_core::workflow::parse_workflow_toml;
use warden_store::models::TaskStatus;
use warden_core::Orchestrator;

const PIPELINE: &str = r#"
    [workflow]
    id = "1f0a33f2-54f7-4c8a-9e3b-6f1f37f7a001"
    name = "quarterly-evidence"
    tenant = "tenant-a"

    [[tasks]]
    id = "collect"
    kind = "evidence_collection"
    priority = "high"

    [[tasks]]
    id = "verify"
    kind = "crypto_verification"
    depends_on = ["collect"]
"#;

async fn drive_to_completion(
    orch: &Arc<Orchestrator>,
    worker: &mut common::TestWorker,
    expected: uuid::Uuid,
) {
    let request = worker
        .expect(MessageType::TaskRequest, Duration::from_secs(3))
        .await;
    assert_eq!(task_id_of(&request), expected);
    orch.ack(request.id).await.unwrap();
    wait_for_status(orch, expected, TaskStatus::Running, Duration::from_secs(1)).await;
    orch.report_completion(expected, CompletionReport::default())
        .await
        .unwrap();
    wait_for_status(orch, expected, TaskStatus::Completed, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn workflow_runs_in_dependency_order() {
    let orch = orchestrator(test_config());
    let mut worker = register_worker(
        &orch,
        "clearance",
        "clearance-1",
        "tenant-a",
        4,
        vec![
            warden_store::models::TaskKind::EvidenceCollection,
            warden_store::models::TaskKind::CryptoVerification,
        ],
        0.9,
    )
    .await;

    let definition = parse_workflow_toml(PIPELINE).unwrap();
    let submission = orch.submit_workflow(&definition).await.unwrap();
    assert_eq!(submission.task_ids.len(), 2);
    assert!(submission.coordination.is_none());

    let collect_id = submission.task_ids[0];
    let verify_id = submission.task_ids[1];

    // The dependent waits while the root dispatches.
    wait_for_status(&orch, verify_id, TaskStatus::WaitingDeps, Duration::from_secs(1)).await;
    drive_to_completion(&orch, &mut worker, collect_id).await;

    // Completion releases the dependent.
    drive_to_completion(&orch, &mut worker, verify_id).await;

    // All workflow tasks share the workflow correlation tag.
    for id in submission.task_ids {
        let task = orch.task_status(id).await.unwrap().unwrap();
        assert_eq!(
            task.correlation_id.as_deref(),
            Some("1f0a33f2-54f7-4c8a-9e3b-6f1f37f7a001")
        );
    }

    orch.shutdown().await;
}

#[tokio::test]
async fn resubmitting_a_workflow_is_rejected_by_task_identity() {
    let orch = orchestrator(test_config());
    let definition = parse_workflow_toml(PIPELINE).unwrap();

    orch.submit_workflow(&definition).await.unwrap();
    // Deterministic expansion produces the same task ids, so the second
    // submission trips the duplicate-id guard.
    let err = orch.submit_workflow(&definition).await.unwrap_err();
    assert!(err.to_string().contains("already exists"), "got: {err}");

    orch.shutdown().await;
}

const COORDINATED: &str = r#"
    [workflow]
    name = "coordinated-audit"
    tenant = "tenant-a"
    participants = ["clearance", "atlas"]

    [[tasks]]
    id = "collect"
    kind = "evidence_collection"
    priority = "high"
"#;

#[tokio::test]
async fn coordination_gate_releases_tasks_when_all_ready() {
    let orch = orchestrator(test_config());
    let mut clearance = register_worker(
        &orch,
        "clearance",
        "clearance-1",
        "tenant-a",
        4,
        vec![warden_store::models::TaskKind::EvidenceCollection],
        0.9,
    )
    .await;
    let mut atlas = register_worker(
        &orch,
        "atlas",
        "atlas-1",
        "tenant-a",
        4,
        vec![warden_store::models::TaskKind::SecurityScan],
        0.9,
    )
    .await;

    let definition = parse_workflow_toml(COORDINATED).unwrap();

    // Workers answer ready as the coordination requests arrive.
    let responder_orch = Arc::clone(&orch);
    let responder = tokio::spawn(async move {
        for (worker, kind) in [(&mut clearance, "clearance"), (&mut atlas, "atlas")] {
            let request = worker
                .expect(MessageType::CoordinationRequest, Duration::from_secs(5))
                .await;
            let coordination_id: uuid::Uuid = serde_json::from_value(
                request.payload.get("coordination_id").unwrap().clone(),
            )
            .unwrap();
            responder_orch.record_coordination_response(coordination_id, kind, true);
        }
        clearance
    });

    let submission = orch.submit_workflow(&definition).await.unwrap();
    assert_eq!(submission.coordination, Some(CoordinationOutcome::Coordinated));
    assert_eq!(submission.task_ids.len(), 1);

    // The first task is released and dispatched to the clearance worker.
    let mut clearance = responder.await.unwrap();
    let request = clearance
        .expect(MessageType::TaskRequest, Duration::from_secs(3))
        .await;
    assert_eq!(task_id_of(&request), submission.task_ids[0]);

    orch.shutdown().await;
}

#[tokio::test]
async fn a_not_ready_participant_blocks_the_whole_workflow() {
    let orch = orchestrator(test_config());
    let mut clearance = register_worker(
        &orch,
        "clearance",
        "clearance-1",
        "tenant-a",
        4,
        vec![warden_store::models::TaskKind::EvidenceCollection],
        0.9,
    )
    .await;
    let mut atlas = register_worker(
        &orch,
        "atlas",
        "atlas-1",
        "tenant-a",
        4,
        vec![warden_store::models::TaskKind::SecurityScan],
        0.9,
    )
    .await;

    let definition = parse_workflow_toml(COORDINATED).unwrap();

    let responder_orch = Arc::clone(&orch);
    let responder = tokio::spawn(async move {
        for (worker, kind, ready) in
            [(&mut clearance, "clearance", true), (&mut atlas, "atlas", false)]
        {
            let request = worker
                .expect(MessageType::CoordinationRequest, Duration::from_secs(5))
                .await;
            let coordination_id: uuid::Uuid = serde_json::from_value(
                request.payload.get("coordination_id").unwrap().clone(),
            )
            .unwrap();
            responder_orch.record_coordination_response(coordination_id, kind, ready);
        }
        clearance
    });

    let submission = orch.submit_workflow(&definition).await.unwrap();
    assert_eq!(submission.coordination, Some(CoordinationOutcome::Failed));
    // Nothing was submitted, nothing will dispatch.
    assert!(submission.task_ids.is_empty());

    let mut clearance = responder.await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(envelope) = clearance.rx.try_recv() {
        assert_ne!(envelope.message_type, MessageType::TaskRequest);
    }

    orch.shutdown().await;
}
