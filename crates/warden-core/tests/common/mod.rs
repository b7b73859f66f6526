//! Shared fixtures for the core integration tests: an in-memory-backed
//! orchestrator with a fast dispatcher tick, and a scripted worker that
//! consumes its hub channel.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use warden_core::comms::{MessageType, WireEnvelope};
use warden_core::registry::{WorkerCapability, WorkerInstance};
use warden_core::{CoreConfig, Orchestrator};
use warden_store::MemoryTaskStore;
use warden_store::models::{Task, TaskKind, TaskStatus};

/// Config tuned for tests: fast ticks, short defers.
pub fn test_config() -> CoreConfig {
    CoreConfig {
        max_workers: 64,
        dispatcher_tick_ms: 20,
        default_task_timeout_s: 300,
        default_message_response_timeout_s: 5,
        no_worker_defer_s: 1,
        ..CoreConfig::default()
    }
}

pub fn orchestrator(config: CoreConfig) -> Arc<Orchestrator> {
    let store = Arc::new(MemoryTaskStore::new());
    let orchestrator = Arc::new(Orchestrator::new(store, config));
    orchestrator.start();
    orchestrator
}

/// A registered worker holding its hub channel.
pub struct TestWorker {
    pub instance_id: String,
    pub worker_kind: String,
    pub rx: mpsc::Receiver<WireEnvelope>,
}

impl TestWorker {
    /// Receive envelopes until one matches `message_type`, or time out.
    pub async fn expect(&mut self, message_type: MessageType, timeout: Duration) -> WireEnvelope {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {message_type}"))
                .expect("hub channel closed");
            if envelope.message_type == message_type {
                return envelope;
            }
        }
    }
}

/// Register a worker instance with a matching capability declaration.
pub async fn register_worker(
    orchestrator: &Arc<Orchestrator>,
    worker_kind: &str,
    instance_id: &str,
    tenant: &str,
    capacity: u32,
    tasks: Vec<TaskKind>,
    specialization: f64,
) -> TestWorker {
    let mut capability = WorkerCapability::new(worker_kind, tasks.clone());
    capability.max_concurrent = capacity;
    for kind in tasks {
        capability.specialization.insert(kind, specialization);
    }
    let instance = WorkerInstance::new(instance_id, worker_kind, tenant, capacity);
    let rx = orchestrator.register_worker(instance, capability).await;
    TestWorker {
        instance_id: instance_id.to_owned(),
        worker_kind: worker_kind.to_owned(),
        rx,
    }
}

/// Poll until the task reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    orchestrator: &Arc<Orchestrator>,
    task_id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = orchestrator
            .task_status(task_id)
            .await
            .expect("status query failed")
            .expect("task should exist");
        if task.status == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} stuck in {} while waiting for {status}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The task id carried in a TaskRequest / CancelRequest envelope.
pub fn task_id_of(envelope: &WireEnvelope) -> Uuid {
    serde_json::from_value(
        envelope
            .context
            .get("task_id")
            .expect("envelope should carry a task id")
            .clone(),
    )
    .expect("task id should be a uuid")
}
