//! Plan construction and job intake.
//!
//! Grounded on `agents/planner_agent.py`: a planner's only job is to turn a
//! goal into a [`Plan`], after which intake (validation + persistence) is
//! identical for every job regardless of which planner produced it.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use loom_broker::{Broker, BrokerError};

use crate::dag::{validate_acyclic, DagError};
use crate::model::{JobStatus, Plan, Task};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("plan failed validation: {0}")]
    InvalidPlan(#[from] DagError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// The two-task echo/upper demo plan exercised end-to-end in `SPEC_FULL.md`
/// §8 scenario S1: `upper1` reads its input from `echo1`'s result field.
pub fn build_demo_plan(job_id: impl Into<String>, text: impl Into<String>) -> Plan {
    let mut echo_details = BTreeMap::new();
    echo_details.insert("text".to_string(), Value::String(text.into()));

    let mut upper_details = BTreeMap::new();
    upper_details.insert(
        "text".to_string(),
        Value::String("data_from:echo1.result".to_string()),
    );

    Plan {
        job_id: job_id.into(),
        goal: "echo then uppercase".to_string(),
        tasks: vec![
            Task {
                task_id: "echo1".to_string(),
                agent: "echo".to_string(),
                details: echo_details,
                dependencies: vec![],
            },
            Task {
                task_id: "upper1".to_string(),
                agent: "upper".to_string(),
                details: upper_details,
                dependencies: vec!["echo1".to_string()],
            },
        ],
    }
}

/// Generate a fresh job id for a new submission.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Validate `plan` and persist it as a new pending job.
///
/// Stores the plan's canonical JSON encoding plus `status=pending` on
/// `job:{job_id}`, seeding `status:{task_id}=pending` for every task so the
/// first dispatch sweep has a consistent starting point.
pub async fn start_job(broker: &Arc<dyn Broker>, plan: &Plan) -> Result<(), IntakeError> {
    validate_acyclic(plan)?;

    let key = format!("job:{}", plan.job_id);
    let plan_json =
        serde_json::to_string(plan).expect("Plan serialization is infallible for well-formed plans");

    broker.hset(&key, "plan", &plan_json).await?;
    broker.hset(&key, "goal", &plan.goal).await?;
    broker
        .hset(&key, "status", &JobStatus::Pending.to_string())
        .await?;
    for task in &plan.tasks {
        broker
            .hset(
                &key,
                &format!("task_status:{}", task.task_id),
                &crate::model::TaskStatus::Pending.to_string(),
            )
            .await?;
    }

    info!(job_id = %plan.job_id, tasks = plan.tasks.len(), "job accepted");
    Ok(())
}
