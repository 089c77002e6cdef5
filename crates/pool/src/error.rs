//! Error taxonomy for the agent pool subsystem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pool {0} not found")]
    PoolNotFound(String),

    #[error("pool {0} is at capacity")]
    PoolAtCapacity(String),

    #[error("pool {0} is stopped")]
    PoolStopped(String),

    #[error("pool {0} is not active")]
    PoolNotActive(String),

    #[error("pool name '{0}' is already in use")]
    PoolNameConflict(String),

    #[error("agent {agent_id} is already in pool {pool_id}")]
    AgentAlreadyInPool { pool_id: String, agent_id: String },

    #[error("agent {agent_id} is not in pool {pool_id}")]
    AgentNotInPool { pool_id: String, agent_id: String },

    #[error("no agents available in pool {0}")]
    NoAgentsAvailable(String),

    #[error("no healthy agents in pool {0}")]
    NoHealthyAgents(String),

    #[error("failed to create balancer for strategy {0:?}")]
    BalancerCreationFailure(String),

    #[error("balancer failure: {0}")]
    BalancerFailure(String),

    #[error("allocation denied on dimension '{dimension}': headroom {headroom}, recommendations: {recommendations:?}")]
    AllocationDenied {
        dimension: String,
        headroom: f64,
        recommendations: Vec<String>,
    },

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("persistence query failed: {0}")]
    PersistenceQueryFailure(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(String),
}

impl From<anyhow::Error> for PoolError {
    fn from(err: anyhow::Error) -> Self {
        PoolError::System(err.to_string())
    }
}

impl From<pool_store::Error> for PoolError {
    fn from(err: pool_store::Error) -> Self {
        match err {
            pool_store::Error::NotFound(key) => PoolError::PersistenceQueryFailure(format!("key not found: {key}")),
            pool_store::Error::Profile(msg) => PoolError::PersistenceUnavailable(msg),
            other => PoolError::PersistenceQueryFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
