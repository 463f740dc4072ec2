//! Tool-level authorization and per-agent-per-tool rate limiting.
//!
//! Grounded on the reference `governance.py`: `register_tool_access`,
//! `check_tool_access`, and `check_rate_limit` map directly onto the
//! methods here, with the same fixed-tumbling-window semantics (see
//! `SPEC_FULL.md` §4.2).

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use loom_broker::{Broker, BrokerError};

const PERMISSIONS_KEY: &str = "gov:permissions";

/// Errors surfaced by a governance gate check.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("Access denied for tool {tool}")]
    AccessDenied { agent: String, tool: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { agent: String, tool: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// The default per-tool rate limit applied by the agent runtime, per
/// `SPEC_FULL.md` §4.2.
pub const DEFAULT_RATE_LIMIT: i64 = 100;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 3600;

/// Tool-access and rate-limit governance, backed by the same broker every
/// other component shares.
pub struct Governance {
    broker: Arc<dyn Broker>,
}

impl Governance {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Overwrite `agent`'s allowed tool list.
    pub async fn register_tool_access(
        &self,
        agent: &str,
        tools: &[String],
    ) -> Result<(), BrokerError> {
        let csv = tools.join(",");
        self.broker.hset(PERMISSIONS_KEY, agent, &csv).await
    }

    /// Whether `agent` may call `tool`. A missing permission entry is
    /// logged and treated as a denial.
    pub async fn check_tool_access(&self, agent: &str, tool: &str) -> Result<bool, BrokerError> {
        let Some(csv) = self.broker.hget(PERMISSIONS_KEY, agent).await? else {
            warn!(agent, tool, "no registered permissions for agent");
            return Ok(false);
        };
        Ok(csv.split(',').any(|t| t == tool))
    }

    /// Increment and check `agent`'s call counter for `tool` against a
    /// fixed tumbling window: `Incr` then, only on the call that creates
    /// the counter, `Expire(window_seconds)`.
    pub async fn check_rate_limit(
        &self,
        agent: &str,
        tool: &str,
        limit: i64,
        window_seconds: u64,
    ) -> Result<bool, BrokerError> {
        let key = format!("gov:rate_limit:{agent}:{tool}");
        let n = self.broker.incr(&key).await?;
        if n == 1 {
            self.broker.expire(&key, window_seconds).await?;
        }
        Ok(n <= limit)
    }

    /// Run both checks and return a single typed error on denial, matching
    /// the agent runtime's gate in `SPEC_FULL.md` §4.3. Callers pass the
    /// rate-limit policy explicitly (the agent runtime uses
    /// [`DEFAULT_RATE_LIMIT`]/[`DEFAULT_RATE_WINDOW_SECS`]).
    pub async fn gate(
        &self,
        agent: &str,
        tool: &str,
        limit: i64,
        window_seconds: u64,
    ) -> Result<(), GovernanceError> {
        if !self.check_tool_access(agent, tool).await? {
            return Err(GovernanceError::AccessDenied {
                agent: agent.to_string(),
                tool: tool.to_string(),
            });
        }
        if !self.check_rate_limit(agent, tool, limit, window_seconds).await? {
            return Err(GovernanceError::RateLimitExceeded {
                agent: agent.to_string(),
                tool: tool.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_broker::InMemoryBroker;

    fn governance() -> Governance {
        Governance::new(Arc::new(InMemoryBroker::new()))
    }

    #[tokio::test]
    async fn unregistered_agent_is_denied() {
        let gov = governance();
        assert!(!gov.check_tool_access("A", "X").await.unwrap());
    }

    #[tokio::test]
    async fn registered_tool_is_allowed() {
        let gov = governance();
        gov.register_tool_access("A", &["X".to_string(), "Y".to_string()])
            .await
            .unwrap();
        assert!(gov.check_tool_access("A", "X").await.unwrap());
        assert!(!gov.check_tool_access("A", "Z").await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_denies_after_n_calls() {
        let gov = governance();
        for _ in 0..3 {
            assert!(gov.check_rate_limit("A", "T", 3, 60).await.unwrap());
        }
        assert!(!gov.check_rate_limit("A", "T", 3, 60).await.unwrap());
    }

    #[tokio::test]
    async fn gate_reports_access_denied_message() {
        let gov = governance();
        let err = gov
            .gate("A", "Y", DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW_SECS)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Access denied for tool Y");
    }

    #[tokio::test]
    async fn gate_reports_rate_limit_message() {
        let gov = governance();
        gov.register_tool_access("A", &["T".to_string()])
            .await
            .unwrap();
        assert!(gov.gate("A", "T", 2, 60).await.is_ok());
        assert!(gov.gate("A", "T", 2, 60).await.is_ok());
        let err = gov.gate("A", "T", 2, 60).await.unwrap_err();
        assert_eq!(err.to_string(), "Rate limit exceeded");
    }
}
