//! Typed inter-agent messages and the wire envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of messages agents exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    DataShare,
    CoordinationRequest,
    Alert,
    HealthCheck,
    WorkflowSignal,
    ContextUpdate,
    CapabilityAnnounce,
    CancelRequest,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::StatusUpdate => "status_update",
            Self::DataShare => "data_share",
            Self::CoordinationRequest => "coordination_request",
            Self::Alert => "alert",
            Self::HealthCheck => "health_check",
            Self::WorkflowSignal => "workflow_signal",
            Self::ContextUpdate => "context_update",
            Self::CapabilityAnnounce => "capability_announce",
            Self::CancelRequest => "cancel_request",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_request" => Ok(Self::TaskRequest),
            "task_response" => Ok(Self::TaskResponse),
            "status_update" => Ok(Self::StatusUpdate),
            "data_share" => Ok(Self::DataShare),
            "coordination_request" => Ok(Self::CoordinationRequest),
            "alert" => Ok(Self::Alert),
            "health_check" => Ok(Self::HealthCheck),
            "workflow_signal" => Ok(Self::WorkflowSignal),
            "context_update" => Ok(Self::ContextUpdate),
            "capability_announce" => Ok(Self::CapabilityAnnounce),
            "cancel_request" => Ok(Self::CancelRequest),
            other => Err(MessageTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MessageType`] string.
#[derive(Debug, Clone)]
pub struct MessageTypeParseError(pub String);

impl fmt::Display for MessageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message type: {:?}", self.0)
    }
}

impl std::error::Error for MessageTypeParseError {}

/// Message priority. Distinct from task priority: four levels only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for MessagePriority {
    type Err = MessagePriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(MessagePriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MessagePriority`] string.
#[derive(Debug, Clone)]
pub struct MessagePriorityParseError(pub String);

impl fmt::Display for MessagePriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message priority: {:?}", self.0)
    }
}

impl std::error::Error for MessagePriorityParseError {}

/// Where a message is addressed.
///
/// The wire form is a single string: a worker kind, an instance id,
/// `broadcast`, or `channel:<name>`. Kind and instance strings are only
/// distinguishable against the routing table, so parsing takes a
/// kind-lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// Every registered instance of a worker kind.
    Kind(String),
    /// Exactly one instance.
    Instance(String),
    /// Every registered instance of every kind.
    Broadcast,
    /// Subscribers of a named channel.
    Channel(String),
}

impl Recipient {
    pub fn kind(name: impl Into<String>) -> Self {
        Self::Kind(name.into())
    }

    pub fn instance(id: impl Into<String>) -> Self {
        Self::Instance(id.into())
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }

    /// Parse a wire recipient string. `known_kind` disambiguates worker
    /// kinds from instance ids.
    pub fn parse(s: &str, known_kind: impl Fn(&str) -> bool) -> Self {
        if s == "broadcast" {
            return Self::Broadcast;
        }
        if let Some(channel) = s.strip_prefix("channel:") {
            return Self::Channel(channel.to_owned());
        }
        if known_kind(s) {
            Self::Kind(s.to_owned())
        } else {
            Self::Instance(s.to_owned())
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => f.write_str(kind),
            Self::Instance(id) => f.write_str(id),
            Self::Broadcast => f.write_str("broadcast"),
            Self::Channel(name) => write!(f, "channel:{name}"),
        }
    }
}

/// A message between agents, before protocol formatting.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    /// Sending worker kind, or `orchestrator` for core-originated traffic.
    pub sender: String,
    pub recipient: Recipient,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub payload: serde_json::Value,
    pub context: serde_json::Value,
    pub requires_response: bool,
    pub response_timeout_secs: Option<u64>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        message_type: MessageType,
        priority: MessagePriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient,
            message_type,
            priority,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            context: serde_json::Value::Object(serde_json::Map::new()),
            requires_response: false,
            response_timeout_secs: None,
            correlation_id: None,
            timestamp: Utc::now(),
            ttl_seconds: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn expecting_response(mut self, timeout_secs: u64) -> Self {
        self.requires_response = true;
        self.response_timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    /// True when the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_seconds.is_some_and(|ttl| {
            now - self.timestamp >= chrono::Duration::seconds(ttl as i64)
        })
    }
}

/// The transported form of a message.
///
/// Field names and shapes are the compatibility contract with workers;
/// unknown fields on the way in are tolerated by serde's default behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: Uuid,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Set when the payload was passed through the configured cipher.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    /// Set when the payload is gzip-compressed and base64-encoded.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    /// Hex sha-256 of the transported payload, when the protocol demands
    /// integrity checking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}
