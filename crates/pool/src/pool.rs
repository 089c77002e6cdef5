//! Agent Pool (spec.md §4.3): membership, health loop, metrics, live dispatch surface.
//!
//! Restructured from the teacher's available/busy-queue pooling model (agents fungible,
//! created on demand) into the spec's membership-map model: agents are named, externally
//! owned, and admitted/removed explicitly. The health loop keeps the teacher's
//! `tokio::time::interval` + `tokio::spawn` shape from `start_maintenance_task`, evaluating
//! health via the external `Agent` contract instead of idle-timeout eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agent::{default_health_predicate, Agent};
use crate::balancer::{BalancerFactory, LoadBalancer, Strategy};
use crate::error::{PoolError, Result};

const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;
const EVENT_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Active,
    Paused,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millicores: u32,
    pub memory_megabytes: u32,
    pub max_tasks: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    pub scale_up_threshold_pct: f64,
    pub scale_down_threshold_pct: f64,
    pub cooldown: StdDuration,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold_pct: 80.0,
            scale_down_threshold_pct: 20.0,
            cooldown: StdDuration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub description: String,
    pub strategy: Strategy,
    pub min_agents: u32,
    pub max_agents: u32,
    pub health_check_interval: StdDuration,
    pub resource_limits: ResourceLimits,
    pub auto_scaling: AutoScalingConfig,
}

impl PoolConfig {
    /// Validates invariants from spec.md §3: `min ≤ max`, `max > 0`, zero/negative
    /// health-check interval coerces to the 30s default.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PoolError::InvalidConfiguration("pool name must not be empty".to_string()));
        }
        if self.max_agents == 0 {
            return Err(PoolError::InvalidConfiguration("max_agents must be greater than zero".to_string()));
        }
        if self.min_agents > self.max_agents {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_agents ({}) must not exceed max_agents ({})",
                self.min_agents, self.max_agents
            )));
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = StdDuration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_requests: u64,
    pub active_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub cpu_utilization_pct: f64,
    pub memory_utilization_pct: f64,
    pub task_utilization_pct: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A pool's record for one agent (spec.md §3 "Member").
#[derive(Clone)]
pub struct Member {
    agent: Arc<dyn Agent>,
    pub weight: u8,
    pub joined_at: DateTime<Utc>,
    pub active_connections: u32,
    pub last_health_check: DateTime<Utc>,
    pub healthy: bool,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("weight", &self.weight)
            .field("joined_at", &self.joined_at)
            .field("active_connections", &self.active_connections)
            .field("last_health_check", &self.last_health_check)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl Member {
    pub fn new(agent: Arc<dyn Agent>, weight: u8) -> Self {
        let now = Utc::now();
        Self {
            agent,
            weight: coerce_weight(weight),
            joined_at: now,
            active_connections: 0,
            last_health_check: now,
            healthy: true,
        }
    }

    pub fn agent_id(&self) -> &str {
        self.agent.id()
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }
}

fn coerce_weight(weight: u8) -> u8 {
    if weight == 0 || weight > 100 {
        1
    } else {
        weight
    }
}

/// A guard wrapping a dispatched agent handle. `ReleaseAgent` remains the primary,
/// spec-mandated release path; if a caller drops the guard without calling `release()`, the
/// guard's `Drop` impl best-effort releases the connection so a panicking or early-returning
/// caller cannot leak an `active_connections` slot forever (grounded on the teacher's
/// `PooledAgentHandle`, whose `Drop` impl returns the agent to the pool the same way).
pub struct DispatchGuard {
    pool: Weak<AgentPool>,
    agent_id: String,
    agent: Arc<dyn Agent>,
    released: AtomicBool,
}

impl std::fmt::Debug for DispatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGuard")
            .field("agent_id", &self.agent_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl DispatchGuard {
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Explicitly release the held connection. Idempotent with `ReleaseAgent` called directly
    /// on the pool (spec.md §8 property 3).
    pub async fn release(self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        if let Some(pool) = self.pool.upgrade() {
            pool.release_agent(&self.agent_id).await?;
        }
        Ok(())
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            let agent_id = self.agent_id.clone();
            tokio::spawn(async move {
                let _ = pool.release_agent(&agent_id).await;
            });
        }
    }
}

pub struct AgentPool {
    id: String,
    config: RwLock<PoolConfig>,
    status: RwLock<PoolStatus>,
    members: RwLock<HashMap<String, Member>>,
    member_order: RwLock<Vec<String>>,
    balancer: RwLock<Box<dyn LoadBalancer>>,
    metrics: RwLock<PoolMetrics>,
    created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
    events: RwLock<VecDeque<String>>,
    health_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl AgentPool {
    pub fn new(id: String, mut config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let balancer = BalancerFactory::build(config.strategy);
        let now = Utc::now();

        let pool = Arc::new(Self {
            id,
            status: RwLock::new(PoolStatus::Active),
            balancer: RwLock::new(balancer),
            config: RwLock::new(config),
            members: RwLock::new(HashMap::new()),
            member_order: RwLock::new(Vec::new()),
            metrics: RwLock::new(PoolMetrics::default()),
            created_at: now,
            updated_at: RwLock::new(now),
            events: RwLock::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
            health_task: std::sync::Mutex::new(None),
        });

        let handle = Self::start_health_loop(Arc::clone(&pool));
        *pool.health_task.lock().expect("health task mutex poisoned") = Some(handle);

        Ok(pool)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn record_event(&self, event: impl Into<String>) {
        let mut events = self.events.write().await;
        if events.len() == EVENT_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(event.into());
    }

    pub async fn recent_events(&self) -> Vec<String> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn status(&self) -> PoolStatus {
        *self.status.read().await
    }

    pub async fn config(&self) -> PoolConfig {
        self.config.read().await.clone()
    }

    pub async fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.read().await
    }

    async fn touch(&self) {
        *self.updated_at.write().await = Utc::now();
    }

    pub async fn add_agent(&self, agent: Arc<dyn Agent>, weight: u8) -> Result<()> {
        let status = *self.status.read().await;
        if status == PoolStatus::Stopped {
            return Err(PoolError::PoolStopped(self.id.clone()));
        }

        let agent_id = agent.id().to_string();
        let mut members = self.members.write().await;
        let max_agents = self.config.read().await.max_agents as usize;

        if members.len() >= max_agents {
            return Err(PoolError::PoolAtCapacity(self.id.clone()));
        }
        if members.contains_key(&agent_id) {
            return Err(PoolError::AgentAlreadyInPool { pool_id: self.id.clone(), agent_id });
        }

        members.insert(agent_id.clone(), Member::new(agent, weight));
        drop(members);
        self.member_order.write().await.push(agent_id.clone());

        self.touch().await;
        self.recompute_metrics().await;
        self.record_event(format!("agent {agent_id} added")).await;
        Ok(())
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        let mut members = self.members.write().await;
        let member = members
            .remove(agent_id)
            .ok_or_else(|| PoolError::AgentNotInPool { pool_id: self.id.clone(), agent_id: agent_id.to_string() })?;
        drop(members);

        if member.active_connections > 0 {
            tracing::warn!(
                pool_id = %self.id,
                agent_id,
                active_connections = member.active_connections,
                "removing agent with active connections"
            );
        }

        self.member_order.write().await.retain(|id| id != agent_id);
        self.touch().await;
        self.recompute_metrics().await;
        self.record_event(format!("agent {agent_id} removed")).await;
        Ok(())
    }

    async fn healthy_snapshot_ordered(&self) -> Vec<Member> {
        let members = self.members.read().await;
        let order = self.member_order.read().await;
        order
            .iter()
            .filter_map(|id| members.get(id))
            .filter(|m| m.healthy)
            .cloned()
            .collect()
    }

    /// Selects a member via the balancer and increments its `active_connections` under the
    /// pool write lock, so the increment is observed before the caller receives the agent
    /// (spec.md §4.3, §9 "Dispatch counter increment coupled with selection").
    pub async fn get_agent(self: &Arc<Self>) -> Result<DispatchGuard> {
        if *self.status.read().await != PoolStatus::Active {
            return Err(PoolError::PoolNotActive(self.id.clone()));
        }

        let mut members = self.members.write().await;
        if members.is_empty() {
            return Err(PoolError::NoAgentsAvailable(self.id.clone()));
        }

        let order = self.member_order.read().await;
        let healthy: Vec<Member> = order.iter().filter_map(|id| members.get(id)).filter(|m| m.healthy).cloned().collect();
        drop(order);

        let balancer = self.balancer.read().await;
        let selected = balancer.select(&healthy)?;
        let agent_id = selected.agent_id().to_string();
        let agent = selected.agent().clone();
        drop(balancer);

        let member = members.get_mut(&agent_id).expect("selected member exists under write lock");
        member.active_connections += 1;
        drop(members);

        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.active_requests += 1;
        metrics.last_updated = Some(Utc::now());
        drop(metrics);

        Ok(DispatchGuard {
            pool: Arc::downgrade(self),
            agent_id,
            agent,
            released: AtomicBool::new(false),
        })
    }

    pub async fn release_agent(&self, agent_id: &str) -> Result<()> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(agent_id)
            .ok_or_else(|| PoolError::AgentNotInPool { pool_id: self.id.clone(), agent_id: agent_id.to_string() })?;
        member.active_connections = member.active_connections.saturating_sub(1);
        drop(members);

        let mut metrics = self.metrics.write().await;
        metrics.active_requests = metrics.active_requests.saturating_sub(1);
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<Member> {
        let members = self.members.read().await;
        let order = self.member_order.read().await;
        order.iter().filter_map(|id| members.get(id)).cloned().collect()
    }

    pub async fn get_healthy_agents(&self) -> Vec<Member> {
        self.healthy_snapshot_ordered().await
    }

    pub async fn update_config(&self, mut new_config: PoolConfig) -> Result<()> {
        new_config.validate()?;

        let member_count = self.members.read().await.len();
        if member_count > new_config.max_agents as usize {
            return Err(PoolError::InvalidConfiguration(format!(
                "current membership ({member_count}) exceeds new max_agents ({})",
                new_config.max_agents
            )));
        }

        let previous_strategy = self.config.read().await.strategy;
        if previous_strategy != new_config.strategy {
            *self.balancer.write().await = BalancerFactory::build(new_config.strategy);
        }

        *self.config.write().await = new_config;
        self.touch().await;
        Ok(())
    }

    pub async fn get_metrics(&self) -> PoolMetrics {
        self.metrics.read().await.clone()
    }

    async fn recompute_metrics(&self) {
        let members = self.members.read().await;
        let config = self.config.read().await;

        let total_agents = members.len();
        let healthy_agents = members.values().filter(|m| m.healthy).count();

        let (cpu_demand, mem_demand, task_demand, active_sum) = members.values().fold(
            (0u64, 0u64, 0u64, 0u64),
            |(cpu, mem, tasks, active), member| {
                let res = member.agent().resources();
                (
                    cpu + res.cpu_millicores as u64,
                    mem + res.memory_megabytes as u64,
                    tasks + res.max_tasks as u64,
                    active + member.active_connections as u64,
                )
            },
        );

        let limits = config.resource_limits;
        let pct = |demand: u64, limit: u32| if limit == 0 { 0.0 } else { (demand as f64 / limit as f64) * 100.0 };

        let mut metrics = self.metrics.write().await;
        metrics.total_agents = total_agents;
        metrics.healthy_agents = healthy_agents;
        metrics.cpu_utilization_pct = pct(cpu_demand, limits.cpu_millicores);
        metrics.memory_utilization_pct = pct(mem_demand, limits.memory_megabytes);
        metrics.task_utilization_pct = pct(task_demand.max(active_sum), limits.max_tasks);
        metrics.last_updated = Some(Utc::now());
    }

    pub async fn stop(&self) {
        let mut status = self.status.write().await;
        if *status == PoolStatus::Stopped {
            return;
        }
        *status = PoolStatus::Stopped;
        drop(status);

        if let Some(handle) = self.health_task.lock().expect("health task mutex poisoned").take() {
            handle.abort();
        }
        self.touch().await;
        self.record_event("pool stopped").await;
    }

    fn start_health_loop(pool: Arc<AgentPool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = pool.config.read().await.health_check_interval;
                tokio::time::sleep(interval).await;

                if *pool.status.read().await == PoolStatus::Stopped {
                    break;
                }

                let decisions: Vec<(String, bool)> = {
                    let members = pool.members.read().await;
                    members
                        .values()
                        .map(|m| (m.agent_id().to_string(), default_health_predicate(m.agent().as_ref())))
                        .collect()
                };

                let mut members = pool.members.write().await;
                let now = Utc::now();
                for (agent_id, healthy) in decisions {
                    if let Some(member) = members.get_mut(&agent_id) {
                        if member.healthy != healthy {
                            tracing::info!(pool_id = %pool.id, agent_id, healthy, "agent health changed");
                        }
                        member.healthy = healthy;
                        member.last_health_check = now;
                    }
                }
                drop(members);

                pool.recompute_metrics().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_utils::StubAgent;
    use crate::agent::AgentState;

    fn test_config(max_agents: u32) -> PoolConfig {
        PoolConfig {
            name: "test-pool".to_string(),
            description: String::new(),
            strategy: Strategy::RoundRobin,
            min_agents: 0,
            max_agents,
            health_check_interval: StdDuration::from_secs(3600),
            resource_limits: ResourceLimits { cpu_millicores: 1000, memory_megabytes: 1024, max_tasks: 100 },
            auto_scaling: AutoScalingConfig::default(),
        }
    }

    #[tokio::test]
    async fn scenario_a_round_robin_cycling() {
        let pool = AgentPool::new("p1".to_string(), test_config(3)).unwrap();
        for id in ["a", "b", "c"] {
            pool.add_agent(Arc::new(StubAgent::new(id)), 1).await.unwrap();
        }

        let mut picks = Vec::new();
        for _ in 0..4 {
            let guard = pool.get_agent().await.unwrap();
            picks.push(guard.agent_id().to_string());
            guard.release().await.unwrap();
        }

        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn scenario_c_capacity_rejection() {
        let pool = AgentPool::new("p1".to_string(), test_config(2)).unwrap();
        pool.add_agent(Arc::new(StubAgent::new("a")), 1).await.unwrap();
        pool.add_agent(Arc::new(StubAgent::new("b")), 1).await.unwrap();

        let err = pool.add_agent(Arc::new(StubAgent::new("c")), 1).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolAtCapacity(_)));

        pool.remove_agent("a").await.unwrap();
        pool.add_agent(Arc::new(StubAgent::new("c")), 1).await.unwrap();

        for _ in 0..4 {
            let guard = pool.get_agent().await.unwrap();
            assert_ne!(guard.agent_id(), "a");
            guard.release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn scenario_d_release_idempotence() {
        let pool = AgentPool::new("p1".to_string(), test_config(1)).unwrap();
        pool.add_agent(Arc::new(StubAgent::new("a")), 1).await.unwrap();

        let guard = pool.get_agent().await.unwrap();
        assert_eq!(pool.list_agents().await[0].active_connections, 1);
        guard.release().await.unwrap();
        assert_eq!(pool.list_agents().await[0].active_connections, 0);

        pool.release_agent("a").await.unwrap();
        assert_eq!(pool.list_agents().await[0].active_connections, 0);
    }

    #[tokio::test]
    async fn scenario_f_stop_rejects_further_dispatch() {
        let pool = AgentPool::new("p1".to_string(), test_config(10)).unwrap();
        for i in 0..10 {
            pool.add_agent(Arc::new(StubAgent::new(format!("a{i}"))), 1).await.unwrap();
        }

        pool.stop().await;
        let err = pool.get_agent().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolNotActive(_)));
        assert_eq!(pool.list_agents().await.len(), 10);
    }

    #[tokio::test]
    async fn empty_pool_fails_with_no_agents_available() {
        let pool = AgentPool::new("p1".to_string(), test_config(1)).unwrap();
        let err = pool.get_agent().await.unwrap_err();
        assert!(matches!(err, PoolError::NoAgentsAvailable(_)));
    }

    #[tokio::test]
    async fn all_unhealthy_fails_with_no_healthy_agents() {
        let pool = AgentPool::new("p1".to_string(), test_config(1)).unwrap();
        let agent = Arc::new(StubAgent::new("a"));
        pool.add_agent(agent.clone(), 1).await.unwrap();
        agent.set_state(AgentState::Failed);

        {
            let mut members = pool.members.write().await;
            members.get_mut("a").unwrap().healthy = false;
        }

        let err = pool.get_agent().await.unwrap_err();
        assert!(matches!(err, PoolError::NoHealthyAgents(_)));
    }

    #[test]
    fn weight_coercion_out_of_range() {
        assert_eq!(coerce_weight(0), 1);
        assert_eq!(coerce_weight(101), 1);
        assert_eq!(coerce_weight(50), 50);
    }

    #[test]
    fn health_check_interval_zero_coerces_to_default() {
        let mut config = test_config(1);
        config.health_check_interval = StdDuration::ZERO;
        config.validate().unwrap();
        assert_eq!(config.health_check_interval, StdDuration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS));
    }
}
