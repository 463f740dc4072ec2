//! Shared test fixtures for `loom` integration tests.
//!
//! `loom`'s only external dependency is the broker, and
//! [`loom_broker::InMemoryBroker`] already stands in for a live Redis
//! instance with no container needed. What integration tests need instead is
//! a way to run the full fleet -- agent loops plus the orchestrator loop --
//! concurrently against one shared in-memory broker and wait for a job to
//! reach a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use loom_broker::{Broker, InMemoryBroker};
use loom_core::{run_agent_loop, Orchestrator, Plan, TaskHandler};

/// A running fleet: an orchestrator and a set of agent loops, all spawned as
/// background tasks against a shared [`InMemoryBroker`].
///
/// Dropping this struct fires the shared [`CancellationToken`] so every
/// spawned loop exits its own read on the next iteration, the same shutdown
/// path `loom`'s driver uses -- tests don't need to explicitly tear the
/// fleet down.
pub struct Fleet {
    pub broker: Arc<dyn Broker>,
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Fleet {
    /// Start an orchestrator plus one loop per `handlers`, all against a
    /// fresh in-memory broker.
    pub async fn spawn(handlers: Vec<Arc<dyn TaskHandler>>) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let agent_names: Vec<String> = handlers.iter().map(|h| h.name().to_string()).collect();
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for handler in handlers {
            let broker = broker.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _ = run_agent_loop(broker, handler, cancel).await;
            }));
        }

        let orchestrator = Orchestrator::new(broker.clone(), &agent_names)
            .await
            .expect("orchestrator discovery against a fresh in-memory broker cannot fail");
        let orchestrator_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _ = orchestrator.run(orchestrator_cancel).await;
        }));

        Self { broker, cancel, handles }
    }

    /// Submit `plan` as a new job via a fresh [`Orchestrator`] handle sharing
    /// this fleet's broker (mirrors the driver calling `Orchestrator.StartJob`
    /// once, separately from the long-running orchestrator loop).
    pub async fn start_job(&self, plan: &Plan, default_agents: &[String]) {
        let orchestrator = Orchestrator::new(self.broker.clone(), default_agents)
            .await
            .expect("orchestrator discovery against a running fleet's broker cannot fail");
        orchestrator
            .start_job(plan)
            .await
            .expect("well-formed demo plans must pass intake");
    }

    /// Poll `job:{job_id}`'s `status` field until it is `completed` or
    /// `failed`, or `timeout` elapses. Returns the terminal status, or `None`
    /// on timeout.
    pub async fn wait_for_terminal_status(&self, job_id: &str, timeout: Duration) -> Option<String> {
        let key = format!("job:{job_id}");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.broker.hget(&key, "status").await {
                if status == "completed" || status == "failed" {
                    return Some(status);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::build_demo_plan;
    use loom_core::{EchoAgent, UpperAgent};

    #[tokio::test]
    async fn fleet_runs_demo_plan_to_completion() {
        let fleet = Fleet::spawn(vec![Arc::new(EchoAgent), Arc::new(UpperAgent)]).await;

        fleet
            .broker
            .hset("gov:permissions", "echo", "echo")
            .await
            .unwrap();
        fleet
            .broker
            .hset("gov:permissions", "upper", "upper")
            .await
            .unwrap();

        let plan = build_demo_plan("fleet-job-1", "hello");
        fleet
            .start_job(&plan, &["echo".to_string(), "upper".to_string()])
            .await;

        let status = fleet
            .wait_for_terminal_status("fleet-job-1", Duration::from_secs(5))
            .await;
        assert_eq!(status.as_deref(), Some("completed"));

        let result = fleet
            .broker
            .hget("job:fleet-job-1", "result:upper1")
            .await
            .unwrap();
        assert_eq!(result, Some("{'result': 'HELLO'}".to_string()));
    }
}
