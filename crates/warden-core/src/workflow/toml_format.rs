//! On-disk TOML shape for workflow definitions.
//!
//! ```toml
//! [workflow]
//! name = "soc2-quarterly"
//! tenant = "tenant-a"
//! timeout_minutes = 60
//! participants = ["clearance", "crypto_verification"]
//! success_criteria = ["report"]
//!
//! [[tasks]]
//! id = "collect"
//! kind = "evidence_collection"
//! priority = "high"
//! target = "clearance"
//! depends_on = []
//!
//! [tasks.payload]
//! control_id = "CC6.1"
//!
//! [tasks.retry]
//! strategy = "exp_backoff"
//! initial_delay_secs = 30
//!
//! [[parallel_groups]]
//! members = ["scan", "validate"]
//! ```

use serde::{Deserialize, Serialize};

use warden_store::models::RetryConfig;

/// Root of a `workflow.toml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowToml {
    pub workflow: WorkflowHeader,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHeader {
    /// Stable workflow id; generated when omitted. Supplying one makes
    /// expansion deterministic.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tenant: String,
    #[serde(default)]
    pub submitted_by: String,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Default retry policy for tasks that declare none.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub priority: Option<String>,
    /// Preferred worker kind.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
    #[serde(default)]
    pub payload: Option<toml::Value>,
    #[serde(default)]
    pub configuration: Option<toml::Value>,
    /// Per-task retry policy, overriding the workflow default.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroupEntry {
    pub members: Vec<String>,
}
