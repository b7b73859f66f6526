//! Reliable message delivery.
//!
//! Each registered instance gets a bounded in-process channel; publishing
//! formats the payload per the protocol matrix (cipher, gzip+base64
//! compression, sha-256 integrity checksum), pushes the envelope, and -- for
//! messages that require a response -- tracks the message id against a
//! deadline. Unacknowledged messages retry with `2^attempt`-second backoff
//! up to their retry budget; exhausted and TTL-expired messages count as
//! failed. A sweeper drives the deadline machinery every 10 s.
//!
//! Ordering: sends from one sender to one recipient land on one channel in
//! publish order; nothing is promised across senders.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Message, WireEnvelope};
use super::protocol::{ProtocolMatrix, ProtocolSpec};

/// Per-recipient channel capacity. A full channel fails the delivery
/// rather than blocking the publisher.
const CHANNEL_CAPACITY: usize = 256;

/// Soft cap on unacknowledged messages per recipient; recipients at the
/// cap are skipped by the hub's routing filter.
pub const IN_FLIGHT_SOFT_CAP: usize = 100;

/// Seam for payload encryption on protocol pairs that demand it.
///
/// The core marks envelopes and routes bytes through the cipher; the actual
/// algorithm is a deployment concern. The default [`NoopCipher`] passes
/// bytes through unchanged.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Identity cipher used until a deployment installs a real one.
pub struct NoopCipher;

impl PayloadCipher for NoopCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, Copy)]
enum PendingPhase {
    /// Waiting for an ack until the deadline.
    AwaitingAck { deadline: DateTime<Utc> },
    /// Deadline missed; waiting out the exponential backoff.
    Backoff { until: DateTime<Utc> },
}

struct Pending {
    message: Message,
    recipient_key: String,
    recipients: Vec<String>,
    phase: PendingPhase,
    attempt: u32,
}

#[derive(Default)]
struct DeliveryInner {
    channels: HashMap<String, mpsc::Sender<WireEnvelope>>,
    pending: HashMap<Uuid, Pending>,
    unacked: HashMap<String, usize>,
    stats: DeliveryStats,
}

/// Publisher + acknowledgment tracker.
pub struct DeliveryService {
    inner: Mutex<DeliveryInner>,
    protocols: ProtocolMatrix,
    cipher: Arc<dyn PayloadCipher>,
    default_response_timeout: Duration,
}

impl DeliveryService {
    pub fn new(protocols: ProtocolMatrix, default_response_timeout_secs: u64) -> Self {
        Self::with_cipher(
            protocols,
            default_response_timeout_secs,
            Arc::new(NoopCipher),
        )
    }

    pub fn with_cipher(
        protocols: ProtocolMatrix,
        default_response_timeout_secs: u64,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        Self {
            inner: Mutex::new(DeliveryInner::default()),
            protocols,
            cipher,
            default_response_timeout: Duration::seconds(default_response_timeout_secs as i64),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the delivery channel for an instance, replacing any previous
    /// one. The returned receiver is the instance's message feed.
    pub fn open_channel(&self, instance_id: &str) -> mpsc::Receiver<WireEnvelope> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.lock().channels.insert(instance_id.to_owned(), tx);
        rx
    }

    pub fn close_channel(&self, instance_id: &str) {
        let mut inner = self.lock();
        inner.channels.remove(instance_id);
        inner.unacked.remove(instance_id);
    }

    /// Unacknowledged message count for a recipient.
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.lock().unacked.get(instance_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> DeliveryStats {
        self.lock().stats.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Publish a message to resolved recipients.
    ///
    /// `recipient_key` is the message-level recipient string used for the
    /// protocol lookup (a worker kind, `broadcast`, ...). Returns the number
    /// of channels the envelope actually landed on.
    pub fn publish(
        &self,
        message: &Message,
        recipients: &[String],
        recipient_key: &str,
    ) -> Result<usize> {
        let now = Utc::now();
        if message.is_expired(now) {
            self.lock().stats.expired += 1;
            debug!(message_id = %message.id, "dropping expired message");
            return Ok(0);
        }

        let spec = self.protocols.get(&message.sender, recipient_key);
        let missing = spec.missing_fields(&message.payload);
        if !missing.is_empty() {
            warn!(
                message_id = %message.id,
                sender = %message.sender,
                recipient = recipient_key,
                missing = ?missing,
                "payload is missing protocol-required fields"
            );
        }

        let envelope = format_envelope(message, &spec, self.cipher.as_ref())?;

        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut landed = Vec::new();
        for recipient in recipients {
            let Some(channel) = inner.channels.get(recipient).cloned() else {
                inner.stats.failed += 1;
                warn!(message_id = %message.id, recipient, "no channel for recipient");
                continue;
            };
            match channel.try_send(envelope.clone()) {
                Ok(()) => {
                    inner.stats.sent += 1;
                    landed.push(recipient.clone());
                }
                Err(err) => {
                    inner.stats.failed += 1;
                    warn!(
                        message_id = %message.id,
                        recipient,
                        error = %err,
                        "failed to push envelope onto recipient channel"
                    );
                }
            }
        }

        if message.requires_response && !landed.is_empty() {
            let timeout = message
                .response_timeout_secs
                .map(|secs| Duration::seconds(secs as i64))
                .unwrap_or(self.default_response_timeout);
            for recipient in &landed {
                *inner.unacked.entry(recipient.clone()).or_default() += 1;
            }
            inner.pending.insert(
                message.id,
                Pending {
                    message: message.clone(),
                    recipient_key: recipient_key.to_owned(),
                    recipients: landed.clone(),
                    phase: PendingPhase::AwaitingAck {
                        deadline: now + timeout,
                    },
                    attempt: 0,
                },
            );
        }

        Ok(landed.len())
    }

    /// Acknowledge receipt of a message. Unknown or already-acked ids are
    /// a no-op; the acked message is returned to the caller for inspection.
    pub fn ack(&self, message_id: Uuid) -> Option<Message> {
        let mut inner = self.lock();
        let pending = inner.pending.remove(&message_id)?;
        for recipient in &pending.recipients {
            if let Some(count) = inner.unacked.get_mut(recipient) {
                *count = count.saturating_sub(1);
            }
        }
        inner.stats.delivered += 1;
        Some(pending.message)
    }

    /// Drive deadlines: expire TTLs, move missed deadlines into backoff,
    /// and replay backoffs that have elapsed. Runs from the 10 s sweeper.
    pub fn sweep(&self, now: DateTime<Utc>) {
        // Phase 1: classify under the lock.
        let mut to_retry = Vec::new();
        {
            let mut inner = self.lock();
            let mut drop_ids = Vec::new();
            for (id, pending) in inner.pending.iter_mut() {
                if pending.message.is_expired(now) {
                    drop_ids.push((*id, true));
                    continue;
                }
                match pending.phase {
                    PendingPhase::AwaitingAck { deadline } if now >= deadline => {
                        pending.attempt += 1;
                        if pending.attempt > pending.message.max_retries {
                            drop_ids.push((*id, false));
                        } else {
                            let backoff =
                                Duration::seconds(2_i64.saturating_pow(pending.attempt));
                            pending.phase = PendingPhase::Backoff {
                                until: now + backoff,
                            };
                        }
                    }
                    PendingPhase::Backoff { until } if now >= until => {
                        to_retry.push(*id);
                    }
                    _ => {}
                }
            }

            for (id, expired) in drop_ids {
                if let Some(pending) = inner.pending.remove(&id) {
                    for recipient in &pending.recipients {
                        if let Some(count) = inner.unacked.get_mut(recipient) {
                            *count = count.saturating_sub(1);
                        }
                    }
                    if expired {
                        inner.stats.expired += 1;
                    } else {
                        inner.stats.failed += 1;
                        warn!(
                            message_id = %pending.message.id,
                            recipient = %pending.message.recipient,
                            "message exhausted its retries without acknowledgment"
                        );
                    }
                }
            }
        }

        // Phase 2: replay outside the classification pass.
        for id in to_retry {
            self.replay(id, now);
        }
    }

    fn replay(&self, message_id: Uuid, now: DateTime<Utc>) {
        let (message, recipient_key, recipients, attempt) = {
            let inner = self.lock();
            let Some(pending) = inner.pending.get(&message_id) else {
                return;
            };
            (
                pending.message.clone(),
                pending.recipient_key.clone(),
                pending.recipients.clone(),
                pending.attempt,
            )
        };

        let spec = self.protocols.get(&message.sender, &recipient_key);
        let envelope = match format_envelope(&message, &spec, self.cipher.as_ref()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "failed to re-format envelope");
                return;
            }
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut any = false;
        for recipient in &recipients {
            if let Some(channel) = inner.channels.get(recipient).cloned() {
                if channel.try_send(envelope.clone()).is_ok() {
                    inner.stats.sent += 1;
                    any = true;
                }
            }
        }
        inner.stats.retried += 1;

        if let Some(pending) = inner.pending.get_mut(&message_id) {
            let timeout = message
                .response_timeout_secs
                .map(|secs| Duration::seconds(secs as i64))
                .unwrap_or(self.default_response_timeout);
            pending.phase = PendingPhase::AwaitingAck {
                deadline: now + timeout,
            };
            debug!(
                message_id = %message_id,
                attempt,
                replayed = any,
                "replayed unacknowledged message"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope formatting
// ---------------------------------------------------------------------------

/// Build the wire envelope for a message under a protocol contract.
///
/// Transform order matches the platform convention: cipher first, then
/// compression, then the integrity checksum over the transported bytes.
pub fn format_envelope(
    message: &Message,
    spec: &ProtocolSpec,
    cipher: &dyn PayloadCipher,
) -> Result<WireEnvelope> {
    let mut payload = message.payload.clone();
    let mut encrypted = false;
    let mut compressed = false;

    if spec.encryption {
        let plaintext = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let ciphertext = cipher.encrypt(&plaintext).context("cipher failed")?;
        payload = serde_json::Value::String(BASE64.encode(ciphertext));
        encrypted = true;
    }

    if spec.compression {
        let bytes = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&bytes)
            .context("failed to compress payload")?;
        let gz = encoder.finish().context("failed to finish compression")?;
        payload = serde_json::Value::String(BASE64.encode(gz));
        compressed = true;
    }

    let checksum = if spec.integrity_check {
        let bytes = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Some(hex::encode(hasher.finalize()))
    } else {
        None
    };

    Ok(WireEnvelope {
        id: message.id,
        sender: message.sender.clone(),
        recipient: message.recipient.to_string(),
        message_type: message.message_type,
        priority: spec.priority_override.unwrap_or(message.priority),
        payload,
        context: message.context.clone(),
        requires_response: message.requires_response,
        correlation_id: message.correlation_id.clone(),
        timestamp: message.timestamp,
        ttl_seconds: message.ttl_seconds,
        retry_count: message.retry_count,
        max_retries: message.max_retries,
        encrypted,
        compressed,
        checksum,
    })
}

/// Reverse the transport transforms of [`format_envelope`], verifying the
/// checksum when present.
pub fn decode_payload(
    envelope: &WireEnvelope,
    cipher: &dyn PayloadCipher,
) -> Result<serde_json::Value> {
    let mut payload = envelope.payload.clone();

    if let Some(expected) = &envelope.checksum {
        let bytes = serde_json::to_vec(&payload).context("failed to serialize payload")?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());
        if &actual != expected {
            anyhow::bail!("payload checksum mismatch: expected {expected}, got {actual}");
        }
    }

    if envelope.compressed {
        let encoded = payload
            .as_str()
            .context("compressed payload should be a base64 string")?;
        let gz = BASE64.decode(encoded).context("invalid base64 payload")?;
        let mut decoder = GzDecoder::new(Vec::new());
        decoder.write_all(&gz).context("failed to decompress payload")?;
        let bytes = decoder.finish().context("failed to finish decompression")?;
        payload = serde_json::from_slice(&bytes).context("decompressed payload is not JSON")?;
    }

    if envelope.encrypted {
        let encoded = payload
            .as_str()
            .context("encrypted payload should be a base64 string")?;
        let ciphertext = BASE64.decode(encoded).context("invalid base64 payload")?;
        let plaintext = cipher.decrypt(&ciphertext).context("cipher failed")?;
        payload = serde_json::from_slice(&plaintext).context("decrypted payload is not JSON")?;
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message::{MessagePriority, MessageType, Recipient};

    fn message(requires_response: bool) -> Message {
        let mut msg = Message::new(
            "clearance",
            Recipient::kind("crypto_verification"),
            MessageType::DataShare,
            MessagePriority::Normal,
        )
        .with_payload(serde_json::json!({
            "evidence_items": [1, 2, 3],
            "metadata": {"region": "us-east-1"},
            "signatures": ["sig-a"],
        }));
        if requires_response {
            msg = msg.expecting_response(30);
        }
        msg
    }

    fn service() -> DeliveryService {
        DeliveryService::new(ProtocolMatrix::with_defaults(), 30)
    }

    #[tokio::test]
    async fn publish_lands_on_open_channels() {
        let svc = service();
        let mut rx = svc.open_channel("crypto-1");

        let msg = message(false);
        let landed = svc
            .publish(&msg, &["crypto-1".to_owned()], "crypto_verification")
            .unwrap();
        assert_eq!(landed, 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, msg.id);
        // clearance -> crypto_verification is encrypted + checksummed and
        // overrides priority to critical.
        assert!(envelope.encrypted);
        assert!(envelope.checksum.is_some());
        assert_eq!(envelope.priority, MessagePriority::Critical);

        let decoded = decode_payload(&envelope, &NoopCipher).unwrap();
        assert_eq!(decoded, msg.payload);
    }

    #[tokio::test]
    async fn compression_roundtrip() {
        let svc = DeliveryService::new(ProtocolMatrix::with_defaults(), 30);
        let mut rx = svc.open_channel("prism-1");

        let msg = Message::new(
            "atlas",
            Recipient::kind("prism"),
            MessageType::DataShare,
            MessagePriority::Normal,
        )
        .with_payload(serde_json::json!({
            "vulnerabilities": ["CVE-2025-0001"],
            "security_score": 42,
            "threat_level": "medium",
        }));

        svc.publish(&msg, &["prism-1".to_owned()], "prism").unwrap();
        let envelope = rx.recv().await.unwrap();
        assert!(envelope.encrypted);
        assert!(envelope.compressed);
        assert_eq!(envelope.priority, MessagePriority::High);

        let decoded = decode_payload(&envelope, &NoopCipher).unwrap();
        assert_eq!(decoded, msg.payload);
    }

    #[tokio::test]
    async fn ack_clears_pending_and_is_idempotent() {
        let svc = service();
        let _rx = svc.open_channel("crypto-1");
        let msg = message(true);
        svc.publish(&msg, &["crypto-1".to_owned()], "crypto_verification")
            .unwrap();

        assert_eq!(svc.pending_count(), 1);
        assert_eq!(svc.in_flight("crypto-1"), 1);

        let acked = svc.ack(msg.id);
        assert!(acked.is_some());
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.in_flight("crypto-1"), 0);
        assert_eq!(svc.stats().delivered, 1);

        // Second ack is a no-op.
        assert!(svc.ack(msg.id).is_none());
        assert_eq!(svc.stats().delivered, 1);
    }

    #[tokio::test]
    async fn unacked_messages_back_off_and_replay() {
        let svc = service();
        let mut rx = svc.open_channel("crypto-1");
        let mut msg = message(true);
        msg.response_timeout_secs = Some(5);
        msg.max_retries = 2;
        svc.publish(&msg, &["crypto-1".to_owned()], "crypto_verification")
            .unwrap();
        assert!(rx.recv().await.is_some());

        let start = Utc::now();
        // Deadline missed: moves to backoff (2^1 = 2 s), nothing resent yet.
        svc.sweep(start + Duration::seconds(6));
        assert!(rx.try_recv().is_err());
        assert_eq!(svc.pending_count(), 1);

        // Backoff elapsed: replayed with a fresh deadline.
        svc.sweep(start + Duration::seconds(9));
        let replayed = rx.try_recv().unwrap();
        assert_eq!(replayed.id, msg.id);
        assert_eq!(svc.stats().retried, 1);
    }

    #[tokio::test]
    async fn exhausted_messages_count_as_failed() {
        let svc = service();
        let _rx = svc.open_channel("crypto-1");
        let mut msg = message(true);
        msg.response_timeout_secs = Some(5);
        msg.max_retries = 0;
        svc.publish(&msg, &["crypto-1".to_owned()], "crypto_verification")
            .unwrap();

        svc.sweep(Utc::now() + Duration::seconds(6));
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.stats().failed, 1);
        assert_eq!(svc.in_flight("crypto-1"), 0);
    }

    #[tokio::test]
    async fn ttl_expired_messages_are_dropped() {
        let svc = service();
        let _rx = svc.open_channel("crypto-1");

        let mut msg = message(false).with_ttl(1);
        msg.timestamp = Utc::now() - Duration::seconds(5);
        let landed = svc
            .publish(&msg, &["crypto-1".to_owned()], "crypto_verification")
            .unwrap();
        assert_eq!(landed, 0);
        assert_eq!(svc.stats().expired, 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_recipient_counts_failed() {
        let svc = service();
        let msg = message(false);
        let landed = svc
            .publish(&msg, &["ghost".to_owned()], "crypto_verification")
            .unwrap();
        assert_eq!(landed, 0);
        assert_eq!(svc.stats().failed, 1);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let msg = message(false);
        let spec = ProtocolMatrix::with_defaults().get("clearance", "crypto_verification");
        let mut envelope = format_envelope(&msg, &spec, &NoopCipher).unwrap();
        envelope.checksum = Some("00".repeat(32));
        let err = decode_payload(&envelope, &NoopCipher).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
