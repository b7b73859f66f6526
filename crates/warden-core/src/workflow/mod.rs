//! Multi-agent workflow definitions and expansion.
//!
//! A workflow is an ordered set of task templates with a dependency map,
//! advisory parallel groups, an optional coordination participant list,
//! and workflow-level timeout/retry policy. It is expanded exactly once at
//! submission into concrete tasks sharing the workflow id as their
//! correlation tag.

pub mod expand;
pub mod parser;
pub mod toml_format;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warden_store::models::{RetryConfig, TaskKind, TaskPriority};

pub use expand::expand_workflow;
pub use parser::{parse_workflow_toml, WorkflowParseError};

/// One template inside a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Template id, unique within the workflow; dependency edges and the
    /// deterministic task-id derivation key off it.
    pub template_id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub target_worker_kind: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub configuration: serde_json::Value,
    #[serde(default = "default_template_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryConfig>,
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
}

fn default_template_retries() -> u32 {
    3
}

/// A validated workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tenant_id: String,
    #[serde(default)]
    pub submitted_by: String,
    pub templates: Vec<TaskTemplate>,
    /// template id -> template ids it depends on.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    /// Advisory groups of templates declared mutually independent.
    #[serde(default)]
    pub parallel_groups: Vec<Vec<String>>,
    /// Workflow deadline, measured from the first task start.
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    /// Default retry policy for templates that declare none.
    #[serde(default)]
    pub retry_policy: Option<RetryConfig>,
    /// Template ids that must complete for the workflow to count as
    /// successful.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Worker kinds that must agree (two-phase) before the first task is
    /// released.
    #[serde(default)]
    pub participants: Vec<String>,
}

impl WorkflowDefinition {
    pub fn template(&self, template_id: &str) -> Option<&TaskTemplate> {
        self.templates
            .iter()
            .find(|t| t.template_id == template_id)
    }

    pub fn dependencies_of(&self, template_id: &str) -> &[String] {
        self.dependencies
            .get(template_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
