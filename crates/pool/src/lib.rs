//! # Agent Pool
//!
//! Concurrent agent pooling, load balancing, and resource management for a fleet of externally
//! owned agents.
//!
//! ## Core Concepts
//!
//! - **Agent**: an external, minimally-described worker (stable id, liveness state, declared
//!   resource demand) that this crate never constructs or owns.
//! - **Pool**: a named, configurable membership of agents dispatched through a pluggable
//!   load-balancing strategy, with a background health loop keeping membership health current.
//! - **Load Balancer**: round-robin, least-connection, weighted round-robin, or random
//!   selection over a pool's currently healthy members.
//! - **Resource Manager**: tracks each pool's declared resource envelope against live demand and
//!   denies allocations that would exceed it.
//! - **Repository**: persists pool configuration, membership, and metrics history through a
//!   pluggable document store.
//! - **Manager**: the top-level entry point coordinating pools, resources, and persistence.

pub mod agent;
pub mod balancer;
pub mod error;
pub mod manager;
pub mod pool;
pub mod repository;
pub mod resource;

pub use agent::{Agent, AgentState, ResourceProfile};
pub use balancer::{BalancerFactory, LoadBalancer, Strategy};
pub use error::{PoolError, Result};
pub use manager::{Manager, ManagerConfig};
pub use pool::{AgentPool, AutoScalingConfig, DispatchGuard, Member, PoolConfig, PoolMetrics, PoolStatus, ResourceLimits};
pub use repository::{MembershipRecord, MetricsRecord, PoolRecord, Repository};
pub use resource::{Allocation, AllocationRequest, AllocationResult, ResourceManager, ResourceMonitor, ResourceOptimizer};

/// Agent identifier type. Agents are externally named (spec.md §3); this crate never mints ids.
pub type AgentId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manager_boots_with_no_pools() {
        let manager = Manager::new_memory_only(ManagerConfig::default()).await.unwrap();
        assert!(manager.list_pools().await.is_empty());
    }
}
