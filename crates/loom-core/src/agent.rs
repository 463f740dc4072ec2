//! Agent contract and the generic agent runtime loop.
//!
//! Grounded on the reference agents (`agents/planner_agent.py` and friends):
//! a concrete capability is a plain struct implementing a small async trait,
//! and a single free function drives the loop for any of them (see
//! `SPEC_FULL.md` §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use loom_broker::{Broker, BrokerError};

use crate::governance::{Governance, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS};
use crate::value::Value;

const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A unit of work an agent can perform.
///
/// Object-safe by construction (no generic methods, no `Self` return) -- see
/// the compile-time assertion in `loom-broker`'s `trait_def` module for the
/// analogous check on `Broker`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The agent name this handler registers and listens under, e.g. `"echo"`.
    fn name(&self) -> &str;

    /// The governance tool name gating this handler's calls. Usually the
    /// same as `name()`, but kept distinct since a single agent process
    /// could in principle gate several tool identities.
    fn tool(&self) -> &str;

    /// Perform the task given its resolved field values, returning the
    /// result fields to publish, or a human-readable error string.
    async fn perform(&self, fields: HashMap<String, Value>) -> Result<HashMap<String, Value>, String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// Run `handler`'s main loop against `broker` until `cancel` fires.
///
/// Mirrors the reference agent loop: register the agent's tool-access
/// consumer group, then repeatedly pull one task, gate it through
/// governance, perform it, and publish to `results:{task}` or
/// `errors:{task}`, acking unconditionally so a permanently-failing task
/// does not wedge the stream. Cancellation is checked by racing the blocking
/// read itself against `cancel.cancelled()`, so a shutdown signal is noticed
/// without waiting out a full read timeout.
pub async fn run_agent_loop(
    broker: Arc<dyn Broker>,
    handler: Arc<dyn TaskHandler>,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    let governance = Governance::new(broker.clone());
    let agent_name = handler.name().to_string();
    let stream = format!("tasks:{agent_name}");
    let consumer = format!("{agent_name}-consumer");

    broker.sadd("registered_agents", &agent_name).await?;
    broker.xgroup_create(&stream, &agent_name, "0").await?;
    info!(agent = %agent_name, stream = %stream, "agent loop starting");

    loop {
        let entries = tokio::select! {
            _ = cancel.cancelled() => {
                info!(agent = %agent_name, "agent loop cancelled");
                return Ok(());
            }
            result = broker.xreadgroup(&agent_name, &consumer, &[(stream.clone(), ">".to_string())], 1, 1000) => {
                match result {
                    Ok(entries) => entries,
                    Err(err) => {
                        error!(agent = %agent_name, error = %err, "broker error in agent loop, backing off");
                        tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }
        };

        for entry in entries {
            handle_one(&broker, &governance, handler.as_ref(), &entry.stream, &entry.id, &entry.fields).await;
            broker.xack(&entry.stream, &agent_name, &entry.id).await?;
        }
    }
}

async fn handle_one(
    broker: &Arc<dyn Broker>,
    governance: &Governance,
    handler: &dyn TaskHandler,
    stream: &str,
    id: &str,
    raw_fields: &HashMap<String, String>,
) {
    let task_id = raw_fields
        .get("task_id")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let job_id = raw_fields
        .get("job_id")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());

    if let Err(err) = governance
        .gate(handler.name(), handler.tool(), DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS)
        .await
    {
        warn!(%task_id, %job_id, agent = handler.name(), error = %err, "governance denied task");
        publish_error(broker, handler.name(), &task_id, &job_id, &err.to_string(), raw_fields).await;
        return;
    }

    let fields: HashMap<String, Value> = raw_fields
        .iter()
        .filter(|(k, _)| *k != "task_id" && *k != "job_id")
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    match handler.perform(fields).await {
        Ok(result) => publish_result(broker, handler.name(), &task_id, &job_id, &result).await,
        Err(message) => {
            error!(%task_id, %job_id, %message, stream, %id, "task handler returned an error");
            publish_error(broker, handler.name(), &task_id, &job_id, &message, raw_fields).await;
        }
    }
}

/// Encode `result` the same way a job's `result:{task_id}` hash field reads:
/// a single stringified dict, per `SPEC_FULL.md` §3/§8 (scenario S1 expects
/// `result:t2 == "{'result': 'HI'}"`).
fn stringify_result(result: &HashMap<String, Value>) -> String {
    Value::Dict(result.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).to_string()
}

async fn publish_result(
    broker: &Arc<dyn Broker>,
    agent_name: &str,
    task_id: &str,
    job_id: &str,
    result: &HashMap<String, Value>,
) {
    let mut fields: HashMap<String, String> = HashMap::new();
    fields.insert("task_id".to_string(), task_id.to_string());
    fields.insert("job_id".to_string(), job_id.to_string());
    fields.insert("result".to_string(), stringify_result(result));
    if let Err(err) = broker.xadd(&format!("results:{agent_name}"), &fields).await {
        error!(%task_id, error = %err, "failed to publish task result");
    }
}

async fn publish_error(
    broker: &Arc<dyn Broker>,
    agent_name: &str,
    task_id: &str,
    job_id: &str,
    message: &str,
    original_task: &HashMap<String, String>,
) {
    let original = Value::Dict(
        original_task
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    let mut fields: HashMap<String, String> = HashMap::new();
    fields.insert("task_id".to_string(), task_id.to_string());
    fields.insert("job_id".to_string(), job_id.to_string());
    fields.insert("error".to_string(), message.to_string());
    fields.insert("original_task".to_string(), original.to_string());
    if let Err(err) = broker.xadd(&format!("errors:{agent_name}"), &fields).await {
        error!(%task_id, error = %err, "failed to publish task error");
    }
}

/// Demo handler that echoes its `text` field back unchanged, used in the
/// end-to-end scenario in `SPEC_FULL.md` §8 (S1).
pub struct EchoAgent;

#[async_trait]
impl TaskHandler for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    fn tool(&self) -> &str {
        "echo"
    }

    async fn perform(&self, fields: HashMap<String, Value>) -> Result<HashMap<String, Value>, String> {
        let text = match fields.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_wire_string(),
            None => return Err("missing field 'text'".to_string()),
        };
        let mut result = HashMap::new();
        result.insert("result".to_string(), Value::String(text));
        Ok(result)
    }
}

/// Demo handler that uppercases its `text` field, used alongside
/// [`EchoAgent`] in the two-task S1 scenario.
pub struct UpperAgent;

#[async_trait]
impl TaskHandler for UpperAgent {
    fn name(&self) -> &str {
        "upper"
    }

    fn tool(&self) -> &str {
        "upper"
    }

    async fn perform(&self, fields: HashMap<String, Value>) -> Result<HashMap<String, Value>, String> {
        let text = match fields.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_wire_string(),
            None => return Err("missing field 'text'".to_string()),
        };
        let mut result = HashMap::new();
        result.insert("result".to_string(), Value::String(text.to_uppercase()));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_broker::InMemoryBroker;

    fn echo_fields(text: &str) -> HashMap<String, Value> {
        let mut fields = HashMap::new();
        fields.insert("text".to_string(), Value::String(text.to_string()));
        fields
    }

    #[tokio::test]
    async fn echo_agent_returns_input_unchanged() {
        let result = EchoAgent.perform(echo_fields("hi")).await.unwrap();
        assert_eq!(result.get("result"), Some(&Value::String("hi".to_string())));
    }

    #[tokio::test]
    async fn upper_agent_uppercases_input() {
        let result = UpperAgent.perform(echo_fields("hi")).await.unwrap();
        assert_eq!(result.get("result"), Some(&Value::String("HI".to_string())));
    }

    #[tokio::test]
    async fn missing_field_is_reported_as_error() {
        let err = EchoAgent.perform(HashMap::new()).await.unwrap_err();
        assert!(err.contains("text"));
    }

    #[tokio::test]
    async fn handle_one_publishes_result_when_access_granted() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let governance = Governance::new(broker.clone());
        governance
            .register_tool_access("echo", &["echo".to_string()])
            .await
            .unwrap();

        let mut raw = HashMap::new();
        raw.insert("task_id".to_string(), "t1".to_string());
        raw.insert("job_id".to_string(), "j1".to_string());
        raw.insert("text".to_string(), "hi".to_string());

        handle_one(&broker, &governance, &EchoAgent, "tasks:echo", "1-0", &raw).await;

        broker.xgroup_create("results:echo", "g", "0").await.unwrap();
        let entries = broker
            .xreadgroup("g", "c", &[("results:echo".to_string(), ">".to_string())], 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].fields.get("result"),
            Some(&"{'result': 'hi'}".to_string())
        );
    }

    #[tokio::test]
    async fn handle_one_publishes_error_when_access_denied() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let governance = Governance::new(broker.clone());
        // No registration: every tool call is denied.

        let mut raw = HashMap::new();
        raw.insert("task_id".to_string(), "t1".to_string());
        raw.insert("job_id".to_string(), "j1".to_string());

        handle_one(&broker, &governance, &EchoAgent, "tasks:echo", "1-0", &raw).await;

        broker.xgroup_create("errors:echo", "g", "0").await.unwrap();
        let entries = broker
            .xreadgroup("g", "c", &[("errors:echo".to_string(), ">".to_string())], 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fields.contains_key("error"));
        assert!(entries[0].fields.contains_key("original_task"));
    }
}
