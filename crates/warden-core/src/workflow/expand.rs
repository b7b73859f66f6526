//! Workflow expansion: templates to concrete tasks.
//!
//! Expansion happens exactly once at submission. Concrete task ids are
//! uuid-v5 digests of (workflow id, template id), so expanding the same
//! definition twice produces the identical task-id set; the orchestrator's
//! duplicate-id rejection then makes double submission harmless.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use warden_store::models::Task;

use super::WorkflowDefinition;

/// Materialize every template into a concrete [`Task`].
///
/// Tasks come out `pending`, share the workflow id as correlation tag, and
/// carry their dependency sets translated from template ids to task ids.
/// Order follows the definition's template order.
pub fn expand_workflow(definition: &WorkflowDefinition) -> Vec<Task> {
    let task_ids: HashMap<&str, Uuid> = definition
        .templates
        .iter()
        .map(|t| {
            (
                t.template_id.as_str(),
                Uuid::new_v5(&definition.id, t.template_id.as_bytes()),
            )
        })
        .collect();

    let now = Utc::now();
    definition
        .templates
        .iter()
        .map(|template| {
            let mut task = Task::new(template.kind, template.priority, &definition.tenant_id);
            task.id = task_ids[template.template_id.as_str()];
            task.target_worker_kind = template.target_worker_kind.clone();
            task.submitted_by = definition.submitted_by.clone();
            task.payload = template.payload.clone();
            task.configuration = template.configuration.clone();
            task.dependencies = definition
                .dependencies_of(&template.template_id)
                .iter()
                .filter_map(|dep| task_ids.get(dep.as_str()).copied())
                .collect();
            task.max_retries = template.max_retries;
            task.timeout_secs = template.timeout_secs;
            task.retry_policy = template
                .retry_policy
                .clone()
                .or_else(|| definition.retry_policy.clone());
            if let Some(estimate) = template.estimated_duration_secs {
                task.estimated_duration_secs = estimate;
            }
            task.correlation_id = Some(definition.id.to_string());
            task.created_at = now;
            task
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow_toml;
    use warden_store::models::{TaskKind, TaskStatus};

    const WORKFLOW: &str = r#"
        [workflow]
        id = "8c5c4b1e-3f65-44a4-9d3a-1f2b9f6f0a11"
        name = "quarterly"
        tenant = "tenant-a"

        [workflow.retry]
        strategy = "exp_backoff"
        initial_delay_secs = 120

        [[tasks]]
        id = "collect"
        kind = "evidence_collection"
        priority = "high"

        [[tasks]]
        id = "verify"
        kind = "crypto_verification"
        depends_on = ["collect"]

        [tasks.retry]
        strategy = "immediate"

        [[tasks]]
        id = "report"
        kind = "report_generation"
        depends_on = ["verify"]
    "#;

    #[test]
    fn expansion_translates_dependencies_to_task_ids() {
        let definition = parse_workflow_toml(WORKFLOW).unwrap();
        let tasks = expand_workflow(&definition);
        assert_eq!(tasks.len(), 3);

        let collect = &tasks[0];
        let verify = &tasks[1];
        let report = &tasks[2];
        assert_eq!(collect.kind, TaskKind::EvidenceCollection);
        assert!(collect.dependencies.is_empty());
        assert_eq!(verify.dependencies, vec![collect.id]);
        assert_eq!(report.dependencies, vec![verify.id]);

        for task in &tasks {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(
                task.correlation_id.as_deref(),
                Some("8c5c4b1e-3f65-44a4-9d3a-1f2b9f6f0a11")
            );
        }
    }

    #[test]
    fn retry_policy_falls_back_to_the_workflow_default() {
        use warden_store::models::RetryStrategy;

        let definition = parse_workflow_toml(WORKFLOW).unwrap();
        let tasks = expand_workflow(&definition);

        // "collect" declares no policy and inherits the workflow default.
        let inherited = tasks[0].retry_policy.as_ref().expect("inherited policy");
        assert_eq!(inherited.strategy, RetryStrategy::ExpBackoff);
        assert_eq!(inherited.initial_delay_secs, 120);

        // "verify" keeps its own override.
        let own = tasks[1].retry_policy.as_ref().expect("own policy");
        assert_eq!(own.strategy, RetryStrategy::Immediate);
    }

    #[test]
    fn expansion_is_deterministic_for_a_fixed_workflow_id() {
        let definition = parse_workflow_toml(WORKFLOW).unwrap();
        let first: Vec<Uuid> = expand_workflow(&definition).iter().map(|t| t.id).collect();
        let second: Vec<Uuid> = expand_workflow(&definition).iter().map(|t| t.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn different_workflow_ids_produce_disjoint_task_ids() {
        let a = parse_workflow_toml(WORKFLOW).unwrap();
        let mut b = a.clone();
        b.id = Uuid::new_v4();

        let ids_a: Vec<Uuid> = expand_workflow(&a).iter().map(|t| t.id).collect();
        let ids_b: Vec<Uuid> = expand_workflow(&b).iter().map(|t| t.id).collect();
        for id in ids_a {
            assert!(!ids_b.contains(&id));
        }
    }
}
