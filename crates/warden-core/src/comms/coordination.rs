//! Two-phase workflow coordination.
//!
//! Before a workflow's first task is released, every participant worker
//! kind receives a CoordinationRequest and must answer `ready`. The service
//! tracks one state record per coordination round: responses arrive through
//! [`CoordinationService::record_response`] and a waiter resolves the round
//! as soon as every participant has answered, or when the overall deadline
//! passes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// How a coordination round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationOutcome {
    /// Every participant answered `ready` in time.
    Coordinated,
    /// Every participant answered, but at least one was not ready.
    Failed,
    /// The deadline passed with answers still missing.
    TimedOut,
}

#[derive(Debug, Clone)]
struct RoundState {
    workflow_id: String,
    participants: Vec<String>,
    responses: HashMap<String, bool>,
    started_at: DateTime<Utc>,
}

struct Round {
    state: RoundState,
}

/// Owner of in-flight coordination rounds.
#[derive(Default)]
pub struct CoordinationService {
    rounds: Mutex<HashMap<Uuid, Round>>,
}

impl CoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Round>> {
        self.rounds.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a round and return its id; the caller sends the requests.
    pub fn begin(&self, workflow_id: &str, participants: &[String]) -> Uuid {
        let coordination_id = Uuid::new_v4();
        self.lock().insert(
            coordination_id,
            Round {
                state: RoundState {
                    workflow_id: workflow_id.to_owned(),
                    participants: participants.to_vec(),
                    responses: HashMap::new(),
                    started_at: Utc::now(),
                },
            },
        );
        coordination_id
    }

    /// Record a participant's answer. Unknown rounds and non-participants
    /// are ignored; a kind's repeated answers keep the latest value.
    pub fn record_response(&self, coordination_id: Uuid, worker_kind: &str, ready: bool) {
        let mut rounds = self.lock();
        let Some(round) = rounds.get_mut(&coordination_id) else {
            return;
        };
        if !round
            .state
            .participants
            .iter()
            .any(|p| p == worker_kind)
        {
            return;
        }
        round
            .state
            .responses
            .insert(worker_kind.to_owned(), ready);
        info!(
            coordination_id = %coordination_id,
            workflow_id = %round.state.workflow_id,
            worker_kind,
            ready,
            "coordination response received"
        );
    }

    fn evaluate(&self, coordination_id: Uuid) -> Option<CoordinationOutcome> {
        let rounds = self.lock();
        let round = rounds.get(&coordination_id)?;
        if round.state.responses.len() < round.state.participants.len() {
            return None;
        }
        if round.state.responses.values().all(|ready| *ready) {
            Some(CoordinationOutcome::Coordinated)
        } else {
            Some(CoordinationOutcome::Failed)
        }
    }

    /// Wait for the round to resolve, up to `overall_timeout`.
    ///
    /// Polls the round state on a short cadence; responses land through
    /// [`Self::record_response`] concurrently. The round's state is dropped
    /// on return; late responses become no-ops.
    pub async fn wait(&self, coordination_id: Uuid, overall_timeout: Duration) -> CoordinationOutcome {
        let deadline = tokio::time::Instant::now() + overall_timeout;

        let outcome = loop {
            if let Some(outcome) = self.evaluate(coordination_id) {
                break outcome;
            }
            if !self.lock().contains_key(&coordination_id) {
                // Round vanished (concurrent teardown): treat as failed.
                break CoordinationOutcome::Failed;
            }
            if tokio::time::Instant::now() >= deadline {
                break CoordinationOutcome::TimedOut;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        };

        let round = self.lock().remove(&coordination_id);
        if let Some(round) = round {
            let elapsed = Utc::now() - round.state.started_at;
            info!(
                coordination_id = %coordination_id,
                workflow_id = %round.state.workflow_id,
                outcome = ?outcome,
                elapsed_ms = elapsed.num_milliseconds(),
                "coordination round resolved"
            );
        }
        outcome
    }

    pub fn open_rounds(&self) -> usize {
        self.lock().len()
    }
}
