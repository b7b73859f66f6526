//! `warden submit-workflow`.

use anyhow::{bail, Context, Result};

use warden_core::workflow::parse_workflow_toml;

use crate::config::WardenConfig;
use crate::task_cmds::connect;

pub async fn submit(config: &WardenConfig, file: &str) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file}"))?;
    let definition = parse_workflow_toml(&contents)?;

    // Coordination needs connected workers, which only the service
    // process has; the CLI cannot run the two-phase round.
    if !definition.participants.is_empty() {
        bail!(
            "workflow {:?} declares coordination participants; submit it through the service API",
            definition.name
        );
    }

    let orchestrator = connect(config).await?;
    let submission = orchestrator.submit_workflow(&definition).await?;

    println!("workflow {}", submission.workflow_id);
    for task_id in submission.task_ids {
        println!("  {task_id}");
    }
    Ok(())
}
