//! Communication hub: typed message routing, reliable delivery, and
//! multi-agent coordination.
//!
//! The hub composes the router (recipient resolution), the delivery
//! service (protocol formatting, acknowledgments, retries), and the
//! coordination service (two-phase workflow agreement). Recipients are
//! filtered by worker health and a per-recipient in-flight soft cap before
//! transport; critical-priority messages bypass the load filter.

pub mod coordination;
pub mod delivery;
pub mod message;
pub mod protocol;
pub mod router;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use warden_store::models::WorkerHealth;

use crate::registry::CapabilityRegistry;

pub use coordination::{CoordinationOutcome, CoordinationService};
pub use delivery::{
    DeliveryService, DeliveryStats, NoopCipher, PayloadCipher, decode_payload, format_envelope,
    IN_FLIGHT_SOFT_CAP,
};
pub use message::{Message, MessagePriority, MessageType, Recipient, WireEnvelope};
pub use protocol::{ProtocolMatrix, ProtocolSpec};
pub use router::MessageRouter;

/// Hub-level counters plus a snapshot of the delivery state.
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationStats {
    pub messages_sent: u64,
    pub coordination_rounds: u64,
    pub registered_instances: usize,
    pub pending_responses: usize,
    pub delivery: DeliveryStats,
}

#[derive(Default)]
struct Counters {
    messages_sent: u64,
    coordination_rounds: u64,
}

/// Inter-agent messaging surface for the orchestration core.
pub struct CommunicationHub {
    router: MessageRouter,
    delivery: DeliveryService,
    coordination: CoordinationService,
    registry: Arc<CapabilityRegistry>,
    counters: Mutex<Counters>,
}

impl CommunicationHub {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        protocols: ProtocolMatrix,
        default_response_timeout_secs: u64,
    ) -> Self {
        Self {
            router: MessageRouter::new(),
            delivery: DeliveryService::new(protocols, default_response_timeout_secs),
            coordination: CoordinationService::new(),
            registry,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Same as [`Self::new`] with a deployment-provided payload cipher.
    pub fn with_cipher(
        registry: Arc<CapabilityRegistry>,
        protocols: ProtocolMatrix,
        default_response_timeout_secs: u64,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            router: MessageRouter::new(),
            delivery: DeliveryService::with_cipher(
                protocols,
                default_response_timeout_secs,
                cipher,
            ),
            coordination: CoordinationService::new(),
            registry,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a worker's message feed: routing-table entry plus delivery
    /// channel. The returned receiver is the instance's inbox.
    pub fn register_worker(
        &self,
        worker_kind: &str,
        instance_id: &str,
    ) -> mpsc::Receiver<WireEnvelope> {
        self.router.register_instance(worker_kind, instance_id);
        self.delivery.open_channel(instance_id)
    }

    /// [`Self::register_worker`] as a `Stream`, for consumers composing
    /// the feed with stream combinators.
    pub fn register_worker_stream(
        &self,
        worker_kind: &str,
        instance_id: &str,
    ) -> ReceiverStream<WireEnvelope> {
        ReceiverStream::new(self.register_worker(worker_kind, instance_id))
    }

    pub fn unregister_worker(&self, instance_id: &str) {
        self.router.unregister_instance(instance_id);
        self.delivery.close_channel(instance_id);
    }

    pub fn subscribe_channel(&self, channel: &str, instance_id: &str) {
        self.router.subscribe_channel(channel, instance_id);
    }

    pub fn unsubscribe_channel(&self, channel: &str, instance_id: &str) {
        self.router.unsubscribe_channel(channel, instance_id);
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// A recipient is skipped when the registry marks it inactive or
    /// unhealthy, or when its unacked backlog hits the soft cap (critical
    /// messages ignore the cap). Instances the registry has never seen are
    /// allowed through: the routing table is the authority on existence.
    fn deliverable(&self, instance_id: &str, priority: MessagePriority) -> bool {
        if let Some(instance) = self.registry.instance(instance_id) {
            if !instance.active || instance.health == WorkerHealth::Unhealthy {
                return false;
            }
        }
        priority == MessagePriority::Critical
            || self.delivery.in_flight(instance_id) < IN_FLIGHT_SOFT_CAP
    }

    /// Route and deliver a message. Returns how many instances received it.
    pub fn send(&self, message: &Message) -> Result<usize> {
        let recipient_key = match &message.recipient {
            Recipient::Kind(kind) => kind.clone(),
            Recipient::Broadcast => "broadcast".to_owned(),
            Recipient::Channel(name) => format!("channel:{name}"),
            Recipient::Instance(id) => self
                .router
                .kind_of(id)
                .unwrap_or_else(|| id.clone()),
        };

        let resolved = self.router.resolve(&message.recipient);
        let recipients: Vec<String> = resolved
            .into_iter()
            .filter(|id| self.deliverable(id, message.priority))
            .collect();

        if recipients.is_empty() {
            debug!(
                message_id = %message.id,
                recipient = %message.recipient,
                "no deliverable recipients"
            );
            return Ok(0);
        }

        let delivered = self.delivery.publish(message, &recipients, &recipient_key)?;
        self.counters().messages_sent += delivered as u64;
        Ok(delivered)
    }

    /// Acknowledge a message; returns the acked message when it was
    /// pending. Repeated acks are no-ops.
    pub fn ack(&self, message_id: Uuid) -> Option<Message> {
        self.delivery.ack(message_id)
    }

    /// Drive delivery deadlines; called by the 10 s sweeper.
    pub fn sweep(&self, now: DateTime<Utc>) {
        self.delivery.sweep(now);
    }

    /// Run a coordination round: CoordinationRequest to every participant
    /// kind, then wait for all of them to answer ready.
    pub async fn coordinate(
        &self,
        workflow_id: &str,
        participants: &[String],
        response_timeout_secs: u64,
        overall_timeout: Duration,
    ) -> CoordinationOutcome {
        let coordination_id = self.coordination.begin(workflow_id, participants);
        self.counters().coordination_rounds += 1;

        for participant in participants {
            let request = Message::new(
                "orchestrator",
                Recipient::kind(participant.clone()),
                MessageType::CoordinationRequest,
                MessagePriority::High,
            )
            .with_payload(serde_json::json!({
                "coordination_id": coordination_id,
                "workflow_id": workflow_id,
                "participants": participants,
            }))
            .with_correlation(workflow_id.to_owned())
            .expecting_response(response_timeout_secs);

            if let Err(err) = self.send(&request) {
                tracing::warn!(
                    workflow_id,
                    participant,
                    error = %err,
                    "failed to send coordination request"
                );
            }
        }

        self.coordination.wait(coordination_id, overall_timeout).await
    }

    /// Record a participant's coordination answer.
    pub fn record_coordination_response(
        &self,
        coordination_id: Uuid,
        worker_kind: &str,
        ready: bool,
    ) {
        self.coordination
            .record_response(coordination_id, worker_kind, ready);
    }

    pub fn stats(&self) -> CommunicationStats {
        let counters = self.counters();
        CommunicationStats {
            messages_sent: counters.messages_sent,
            coordination_rounds: counters.coordination_rounds,
            registered_instances: self.router.instance_count(),
            pending_responses: self.delivery.pending_count(),
            delivery: self.delivery.stats(),
        }
    }
}
