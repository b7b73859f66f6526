//! Workflow TOML parser with validation.
//!
//! Parses a `workflow.toml` string into a [`WorkflowDefinition`] and
//! validates:
//! - Task kinds and priorities are valid enum variants.
//! - Template ids are unique.
//! - `depends_on` references point to existing template ids.
//! - Parallel-group members do not depend on one another.
//! - Success criteria name existing templates.
//! - The dependency graph is acyclic (topological sort).

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use uuid::Uuid;

use warden_store::models::{TaskKind, TaskPriority};

use super::toml_format::WorkflowToml;
use super::{TaskTemplate, WorkflowDefinition};

/// Errors that can occur during workflow parsing and validation.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("workflow must contain at least one task")]
    NoTasks,

    #[error("duplicate template id: {0:?}")]
    DuplicateTemplate(String),

    #[error("template {template:?} depends on unknown template {dependency:?}")]
    UnknownDependency { template: String, dependency: String },

    #[error("invalid task kind {value:?} on template {template:?}")]
    InvalidKind { template: String, value: String },

    #[error("invalid priority {value:?} on template {template:?}")]
    InvalidPriority { template: String, value: String },

    #[error("invalid workflow id {0:?} (expected a UUID)")]
    InvalidWorkflowId(String),

    #[error("parallel group declares {member:?} but no such template exists")]
    UnknownGroupMember { member: String },

    #[error("templates {a:?} and {b:?} share a parallel group but {a:?} depends on {b:?}")]
    ParallelGroupConflict { a: String, b: String },

    #[error("success criteria name unknown template {0:?}")]
    UnknownSuccessCriterion(String),

    #[error("dependency cycle detected involving templates: {0}")]
    CycleDetected(String),

    #[error("payload on template {template:?} is not convertible to JSON: {source}")]
    PayloadConversion {
        template: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse and validate a `workflow.toml` string.
pub fn parse_workflow_toml(content: &str) -> Result<WorkflowDefinition, WorkflowParseError> {
    let raw: WorkflowToml = toml::from_str(content)?;
    build(raw)
}

fn build(raw: WorkflowToml) -> Result<WorkflowDefinition, WorkflowParseError> {
    if raw.tasks.is_empty() {
        return Err(WorkflowParseError::NoTasks);
    }

    let id = match &raw.workflow.id {
        Some(value) => value
            .parse::<Uuid>()
            .map_err(|_| WorkflowParseError::InvalidWorkflowId(value.clone()))?,
        None => Uuid::new_v4(),
    };

    let mut seen = HashSet::new();
    for task in &raw.tasks {
        if !seen.insert(task.id.clone()) {
            return Err(WorkflowParseError::DuplicateTemplate(task.id.clone()));
        }
    }

    let mut templates = Vec::with_capacity(raw.tasks.len());
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

    for task in &raw.tasks {
        let kind = task
            .kind
            .parse::<TaskKind>()
            .map_err(|_| WorkflowParseError::InvalidKind {
                template: task.id.clone(),
                value: task.kind.clone(),
            })?;

        let priority = match &task.priority {
            Some(value) => {
                value
                    .parse::<TaskPriority>()
                    .map_err(|_| WorkflowParseError::InvalidPriority {
                        template: task.id.clone(),
                        value: value.clone(),
                    })?
            }
            None => TaskPriority::default(),
        };

        for dep in &task.depends_on {
            if !seen.contains(dep) {
                return Err(WorkflowParseError::UnknownDependency {
                    template: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if !task.depends_on.is_empty() {
            dependencies.insert(task.id.clone(), task.depends_on.clone());
        }

        templates.push(TaskTemplate {
            template_id: task.id.clone(),
            kind,
            priority,
            target_worker_kind: task.target.clone(),
            payload: toml_to_json(&task.id, task.payload.as_ref())?,
            configuration: toml_to_json(&task.id, task.configuration.as_ref())?,
            max_retries: task.max_retries.unwrap_or(3),
            timeout_secs: task.timeout_secs,
            retry_policy: task.retry.clone(),
            estimated_duration_secs: task.estimated_duration_secs,
        });
    }

    let parallel_groups: Vec<Vec<String>> = raw
        .parallel_groups
        .iter()
        .map(|g| g.members.clone())
        .collect();

    for group in &parallel_groups {
        for member in group {
            if !seen.contains(member) {
                return Err(WorkflowParseError::UnknownGroupMember {
                    member: member.clone(),
                });
            }
        }
        // Members of one group must be mutually independent.
        for a in group {
            let deps = dependencies.get(a).cloned().unwrap_or_default();
            for b in group {
                if a != b && deps.contains(b) {
                    return Err(WorkflowParseError::ParallelGroupConflict {
                        a: a.clone(),
                        b: b.clone(),
                    });
                }
            }
        }
    }

    for criterion in &raw.workflow.success_criteria {
        if !seen.contains(criterion) {
            return Err(WorkflowParseError::UnknownSuccessCriterion(criterion.clone()));
        }
    }

    let definition = WorkflowDefinition {
        id,
        name: raw.workflow.name,
        description: raw.workflow.description,
        tenant_id: raw.workflow.tenant,
        submitted_by: raw.workflow.submitted_by,
        templates,
        dependencies,
        parallel_groups,
        timeout_minutes: raw.workflow.timeout_minutes,
        retry_policy: raw.workflow.retry,
        success_criteria: raw.workflow.success_criteria,
        participants: raw.workflow.participants,
    };

    check_for_cycles(&definition)?;
    Ok(definition)
}

fn toml_to_json(
    template: &str,
    value: Option<&toml::Value>,
) -> Result<serde_json::Value, WorkflowParseError> {
    match value {
        None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        Some(value) => {
            serde_json::to_value(value).map_err(|source| WorkflowParseError::PayloadConversion {
                template: template.to_owned(),
                source,
            })
        }
    }
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
fn check_for_cycles(definition: &WorkflowDefinition) -> Result<(), WorkflowParseError> {
    let ids: Vec<&str> = definition
        .templates
        .iter()
        .map(|t| t.template_id.as_str())
        .collect();
    let index_of: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (template, deps) in &definition.dependencies {
        let Some(&template_idx) = index_of.get(template.as_str()) else {
            continue;
        };
        for dep in deps {
            let Some(&dep_idx) = index_of.get(dep.as_str()) else {
                continue;
            };
            // Edge: dep -> template (dep must complete first).
            adj[dep_idx].push(template_idx);
            in_degree[template_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let cyclic: Vec<&str> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| ids[i])
            .collect();
        return Err(WorkflowParseError::CycleDetected(cyclic.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [workflow]
        name = "soc2-quarterly"
        tenant = "tenant-a"
        timeout_minutes = 60
        participants = ["clearance", "crypto_verification"]
        success_criteria = ["report"]

        [workflow.retry]
        strategy = "linear_backoff"
        max_attempts = 2

        [[tasks]]
        id = "collect"
        kind = "evidence_collection"
        priority = "high"
        target = "clearance"

        [tasks.payload]
        control_id = "CC6.1"
        platform = "aws"

        [[tasks]]
        id = "verify"
        kind = "crypto_verification"
        depends_on = ["collect"]

        [tasks.retry]
        strategy = "fibonacci_backoff"
        initial_delay_secs = 30
        jitter = false

        [[tasks]]
        id = "scan"
        kind = "security_scan"

        [[tasks]]
        id = "report"
        kind = "report_generation"
        priority = "low"
        depends_on = ["verify", "scan"]

        [[parallel_groups]]
        members = ["collect", "scan"]
    "#;

    #[test]
    fn parses_a_valid_workflow() {
        let wf = parse_workflow_toml(VALID).unwrap();
        assert_eq!(wf.name, "soc2-quarterly");
        assert_eq!(wf.templates.len(), 4);
        assert_eq!(wf.dependencies_of("verify"), &["collect".to_owned()]);
        assert_eq!(wf.participants.len(), 2);

        let collect = wf.template("collect").unwrap();
        assert_eq!(collect.kind, TaskKind::EvidenceCollection);
        assert_eq!(collect.priority, TaskPriority::High);
        assert_eq!(
            collect.payload.get("control_id").and_then(|v| v.as_str()),
            Some("CC6.1")
        );
    }

    #[test]
    fn retry_policies_are_threaded_through() {
        use warden_store::models::RetryStrategy;

        let wf = parse_workflow_toml(VALID).unwrap();

        // Workflow-level default.
        let default = wf.retry_policy.as_ref().expect("workflow retry policy");
        assert_eq!(default.strategy, RetryStrategy::LinearBackoff);
        assert_eq!(default.max_attempts, 2);

        // Per-task override on "verify"; "collect" declares none.
        let verify = wf.template("verify").unwrap();
        let policy = verify.retry_policy.as_ref().expect("task retry policy");
        assert_eq!(policy.strategy, RetryStrategy::FibonacciBackoff);
        assert_eq!(policy.initial_delay_secs, 30);
        assert!(!policy.jitter);
        assert!(wf.template("collect").unwrap().retry_policy.is_none());
    }

    #[test]
    fn rejects_empty_workflows() {
        let toml = "[workflow]\nname = \"x\"\ntenant = \"t\"\n";
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::NoTasks)
        ));
    }

    #[test]
    fn rejects_duplicate_templates() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
            [[tasks]]
            id = "a"
            kind = "security_scan"
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::DuplicateTemplate(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
            depends_on = ["ghost"]
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn rejects_invalid_kind_and_priority() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "mining"
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::InvalidKind { .. })
        ));

        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
            priority = "urgent"
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::InvalidPriority { .. })
        ));
    }

    #[test]
    fn rejects_dependency_cycles() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
            depends_on = ["c"]
            [[tasks]]
            id = "b"
            kind = "security_scan"
            depends_on = ["a"]
            [[tasks]]
            id = "c"
            kind = "security_scan"
            depends_on = ["b"]
        "#;
        let err = parse_workflow_toml(toml).unwrap_err();
        assert!(matches!(err, WorkflowParseError::CycleDetected(_)));
    }

    #[test]
    fn rejects_dependent_parallel_group_members() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
            [[tasks]]
            id = "b"
            kind = "security_scan"
            depends_on = ["a"]
            [[parallel_groups]]
            members = ["a", "b"]
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::ParallelGroupConflict { .. })
        ));
    }

    #[test]
    fn rejects_unknown_success_criteria() {
        let toml = r#"
            [workflow]
            name = "x"
            tenant = "t"
            success_criteria = ["ghost"]
            [[tasks]]
            id = "a"
            kind = "security_scan"
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::UnknownSuccessCriterion(c)) if c == "ghost"
        ));
    }

    #[test]
    fn explicit_workflow_id_must_be_a_uuid() {
        let toml = r#"
            [workflow]
            id = "not-a-uuid"
            name = "x"
            tenant = "t"
            [[tasks]]
            id = "a"
            kind = "security_scan"
        "#;
        assert!(matches!(
            parse_workflow_toml(toml),
            Err(WorkflowParseError::InvalidWorkflowId(_))
        ));
    }
}
