//! Broker-native DAG orchestration: the planner, orchestrator, agent
//! runtime, and governance layer described in `SPEC_FULL.md` §4.
//!
//! Every component here is generic over `Arc<dyn loom_broker::Broker>` --
//! there is no hidden global state. See the crate-level modules for the
//! piece each one owns:
//!
//! - [`model`] -- the `Plan`/`Task`/`TaskStatus`/`JobStatus` data model (§3).
//! - [`value`] -- the tagged-variant `Value` type, canonical JSON codec, and
//!   the legacy-ingress `robust_dict_parse` (§6/§9).
//! - [`dag`] -- plan-intake cycle detection and topological sort (§9).
//! - [`governance`] -- tool-access permissions and rate limiting (§4.2).
//! - [`agent`] -- the generic agent runtime loop and `TaskHandler` trait (§4.3).
//! - [`planner`] -- plan construction and job intake (§4.4).
//! - [`orchestrator`] -- dispatch, data-flow resolution, and completion
//!   detection (§4.5).

pub mod agent;
pub mod dag;
pub mod governance;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod value;

pub use agent::{run_agent_loop, EchoAgent, TaskHandler, UpperAgent};
pub use dag::{validate_acyclic, DagError};
pub use governance::{Governance, GovernanceError};
pub use model::{JobStatus, Plan, Task, TaskStatus};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use planner::{build_demo_plan, new_job_id, start_job, IntakeError};
pub use value::{robust_dict_parse, Value, ValueError};
