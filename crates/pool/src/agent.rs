//! External `Agent` contract the pool dispatches against (spec.md §6).
//!
//! Agent implementation — task execution, heartbeats — is out of scope for this subsystem; the
//! pool only needs a stable identifier, a liveness-queryable state, and a declared resource
//! demand. The pool holds `Arc<dyn Agent>` — a non-owning reference whose lifetime is the
//! caller's responsibility (spec.md §9, "Cross-boundary ownership of the Agent").

use serde::{Deserialize, Serialize};

/// Liveness state of an externally-owned agent. `Running` is the only state the default health
/// predicate treats as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Failed,
}

/// Declared per-agent resource demand, used both as the health loop's utilization contribution
/// and as the request sent to the `ResourceManager` when an agent joins a pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_millicores: u32,
    pub memory_megabytes: u32,
    pub max_tasks: u32,
}

pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn state(&self) -> AgentState;
    fn resources(&self) -> ResourceProfile;
}

/// Default health predicate used by the pool's health loop: healthy iff the agent is `Running`.
pub fn default_health_predicate(agent: &dyn Agent) -> bool {
    agent.state() == AgentState::Running
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// A bare-bones `Agent` for tests: a fixed id and resource profile, mutable state.
    pub struct StubAgent {
        id: String,
        state: AtomicU8,
        resources: ResourceProfile,
    }

    impl StubAgent {
        pub fn new(id: impl Into<String>) -> Self {
            Self::with_resources(
                id,
                ResourceProfile { cpu_millicores: 100, memory_megabytes: 128, max_tasks: 4 },
            )
        }

        pub fn with_resources(id: impl Into<String>, resources: ResourceProfile) -> Self {
            Self { id: id.into(), state: AtomicU8::new(AgentState::Running as u8), resources }
        }

        pub fn set_state(&self, state: AgentState) {
            self.state.store(state as u8, Ordering::SeqCst);
        }
    }

    impl Agent for StubAgent {
        fn id(&self) -> &str {
            &self.id
        }

        fn state(&self) -> AgentState {
            match self.state.load(Ordering::SeqCst) {
                0 => AgentState::Running,
                1 => AgentState::Starting,
                2 => AgentState::Stopping,
                3 => AgentState::Stopped,
                _ => AgentState::Failed,
            }
        }

        fn resources(&self) -> ResourceProfile {
            self.resources
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::StubAgent;
    use super::*;

    #[test]
    fn default_predicate_is_true_only_when_running() {
        let agent = StubAgent::new("a1");
        assert!(default_health_predicate(&agent));

        agent.set_state(AgentState::Failed);
        assert!(!default_health_predicate(&agent));
    }
}
