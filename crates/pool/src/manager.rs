//! Manager (spec.md §4.5): the top-level entry point coordinating pools, their resource
//! envelopes, and their persisted state.
//!
//! Grounded on the teacher's `PoolManager` in `pool_manager.rs`: a name-keyed map of pools behind
//! an `RwLock`, a background `tokio::spawn` loop doing periodic housekeeping, and a startup
//! sequence that wires persistence in before anything else runs. The teacher's loop evicted idle
//! pools; this one only prunes metrics history and refreshes resource utilization, since
//! spec.md's pools are operator-managed and are never auto-evicted (spec.md §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;

use crate::agent::Agent;
use crate::error::{PoolError, Result};
use crate::pool::{AgentPool, DispatchGuard, Member, PoolConfig, PoolMetrics, PoolStatus};
use crate::repository::{MembershipRecord, MetricsRecord, PoolRecord, Repository};
use crate::resource::{Allocation, ResourceManager};

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub metrics_collection_interval: StdDuration,
    pub cleanup_interval: StdDuration,
    pub metrics_retention: chrono::Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            metrics_collection_interval: StdDuration::from_secs(30),
            cleanup_interval: StdDuration::from_secs(300),
            metrics_retention: chrono::Duration::hours(24),
        }
    }
}

impl From<&pool_settings::PoolSettings> for ManagerConfig {
    fn from(settings: &pool_settings::PoolSettings) -> Self {
        Self {
            metrics_collection_interval: StdDuration::from_secs(settings.metrics_interval_secs),
            cleanup_interval: StdDuration::from_secs(settings.cleanup_interval_secs),
            metrics_retention: chrono::Duration::seconds(settings.metrics_retention_secs as i64),
        }
    }
}

pub struct Manager {
    config: ManagerConfig,
    repository: Arc<Repository>,
    resource_manager: Arc<ResourceManager>,
    pools: tokio::sync::RwLock<HashMap<String, Arc<AgentPool>>>,
    metrics_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cleanup_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Manager {
    /// Startup sequence (spec.md §4.5): construct the repository, construct the resource
    /// manager, start the metrics-collection and cleanup loops, then reload any pools persisted
    /// from a previous run.
    pub async fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        let repository = Arc::new(Repository::new().await?);
        Self::start(config, repository, crate::resource::OptimizerConfig::default()).await
    }

    pub async fn new_memory_only(config: ManagerConfig) -> Result<Arc<Self>> {
        let repository = Arc::new(Repository::new_memory_only().await?);
        Self::start(config, repository, crate::resource::OptimizerConfig::default()).await
    }

    /// Builds both the manager's loop cadences and the resource optimizer's enable flag from a
    /// loaded `PoolSettings` (spec.md §1.3 of SPEC_FULL.md — settings feed the Manager's
    /// top-level configuration the same way `DeviceSettings.profiles` feeds the teacher's
    /// persistence layer).
    pub async fn new_with_settings(settings: &pool_settings::PoolSettings) -> Result<Arc<Self>> {
        let repository = Arc::new(Repository::new().await?);
        let optimizer_config = crate::resource::OptimizerConfig {
            enabled: settings.auto_scaling_enabled,
            interval: StdDuration::from_secs(settings.metrics_interval_secs),
        };
        Self::start(ManagerConfig::from(settings), repository, optimizer_config).await
    }

    async fn start(config: ManagerConfig, repository: Arc<Repository>, optimizer_config: crate::resource::OptimizerConfig) -> Result<Arc<Self>> {
        let resource_manager = Arc::new(ResourceManager::new());
        resource_manager.set_optimizer_config(optimizer_config).await;

        let manager = Arc::new(Self {
            config,
            repository,
            resource_manager,
            pools: tokio::sync::RwLock::new(HashMap::new()),
            metrics_task: std::sync::Mutex::new(None),
            cleanup_task: std::sync::Mutex::new(None),
        });

        manager.start_metrics_collection_loop();
        manager.start_cleanup_loop();
        manager.resource_manager.start_optimizer().await;
        manager.reload_persisted_pools().await?;

        Ok(manager)
    }

    async fn reload_persisted_pools(self: &Arc<Self>) -> Result<()> {
        for record in self.repository.list_pools().await? {
            if record.status == PoolStatus::Stopped {
                continue;
            }
            let pool = AgentPool::new(record.id.clone(), record.config.clone())?;
            self.resource_manager.register_pool(&record.id, record.config.resource_limits, record.config.auto_scaling).await;
            self.pools.write().await.insert(record.id.clone(), pool);
            tracing::info!(pool_id = %record.id, "reloaded persisted pool");
        }
        Ok(())
    }

    /// Creation-path persistence errors are not warn-and-swallow (spec.md §4.5, §7): the pool is
    /// constructed and registered in memory first, but if `StorePool` then fails, that in-memory
    /// state is removed and the error is returned. Resource Manager registration happens only
    /// after persistence succeeds, and is itself warn-only (spec.md §4.5).
    pub async fn create_pool(self: &Arc<Self>, config: PoolConfig) -> Result<String> {
        if self.repository.get_pool_by_name(&config.name).await?.is_some() {
            return Err(PoolError::PoolNameConflict(config.name));
        }

        let pool_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let pool = AgentPool::new(pool_id.clone(), config.clone())?;
        self.pools.write().await.insert(pool_id.clone(), Arc::clone(&pool));

        if let Err(err) = self
            .repository
            .store_pool(&PoolRecord {
                id: pool_id.clone(),
                name: config.name.clone(),
                config: config.clone(),
                status: PoolStatus::Active,
                created_at: now,
                updated_at: now,
            })
            .await
        {
            self.pools.write().await.remove(&pool_id);
            self.resource_manager.unregister_pool(&pool_id).await;
            pool.stop().await;
            return Err(err.into());
        }

        self.resource_manager.register_pool(&pool_id, config.resource_limits, config.auto_scaling).await;

        Ok(pool_id)
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Arc<AgentPool>> {
        self.pools.read().await.get(pool_id).cloned().ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))
    }

    pub async fn list_pools(&self) -> Vec<Arc<AgentPool>> {
        self.pools.read().await.values().cloned().collect()
    }

    pub async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        let pool = self.pools.write().await.remove(pool_id).ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))?;
        pool.stop().await;
        self.resource_manager.unregister_pool(pool_id).await;
        self.repository.delete_pool(pool_id).await?;
        Ok(())
    }

    /// Resource Manager admission is advisory at this layer (spec.md §9): a denial is logged,
    /// never rejected, since the current design has no enforcement path for it yet.
    pub async fn add_agent_to_pool(&self, pool_id: &str, agent: Arc<dyn Agent>, weight: u8) -> Result<()> {
        let pool = self.get_pool(pool_id).await?;
        let agent_id = agent.id().to_string();
        let resources = agent.resources();

        if let Err(err) = self
            .resource_manager
            .allocate_resources(
                pool_id,
                crate::resource::AllocationRequest {
                    cpu_millicores: resources.cpu_millicores,
                    memory_megabytes: resources.memory_megabytes,
                    max_tasks: resources.max_tasks,
                },
            )
            .await
        {
            tracing::warn!(pool_id, agent_id, %err, "resource allocation denied for new agent, admitting anyway");
        }

        pool.add_agent(agent, weight).await?;

        if let Err(err) = self
            .repository
            .store_membership(&MembershipRecord { pool_id: pool_id.to_string(), agent_id: agent_id.clone(), weight, joined_at: Utc::now() })
            .await
        {
            tracing::warn!(pool_id, agent_id, %err, "failed to persist pool membership");
        }
        Ok(())
    }

    pub async fn remove_agent_from_pool(&self, pool_id: &str, agent_id: &str) -> Result<()> {
        let pool = self.get_pool(pool_id).await?;
        let resources = pool.list_agents().await.into_iter().find(|m| m.agent_id() == agent_id).map(|m| m.agent().resources());

        pool.remove_agent(agent_id).await?;
        if let Err(err) = self.repository.remove_membership(pool_id, agent_id).await {
            tracing::warn!(pool_id, agent_id, %err, "failed to remove persisted pool membership");
        }

        if let Some(resources) = resources {
            let _ = self
                .resource_manager
                .deallocate_resources(
                    pool_id,
                    crate::resource::AllocationRequest {
                        cpu_millicores: resources.cpu_millicores,
                        memory_megabytes: resources.memory_megabytes,
                        max_tasks: resources.max_tasks,
                    },
                )
                .await;
        }
        Ok(())
    }

    pub async fn get_agent_from_pool(&self, pool_id: &str) -> Result<DispatchGuard> {
        let pool = self.get_pool(pool_id).await?;
        pool.get_agent().await
    }

    pub async fn release_agent(&self, pool_id: &str, agent_id: &str) -> Result<()> {
        let pool = self.get_pool(pool_id).await?;
        pool.release_agent(agent_id).await
    }

    pub async fn get_pool_metrics(&self, pool_id: &str) -> Result<PoolMetrics> {
        let pool = self.get_pool(pool_id).await?;
        Ok(pool.get_metrics().await)
    }

    pub async fn update_pool_config(&self, pool_id: &str, new_config: PoolConfig) -> Result<()> {
        let pool = self.get_pool(pool_id).await?;
        pool.update_config(new_config.clone()).await?;

        match self.repository.get_pool(pool_id).await {
            Ok(Some(mut record)) => {
                record.config = new_config;
                record.updated_at = Utc::now();
                if let Err(err) = self.repository.store_pool(&record).await {
                    tracing::warn!(pool_id, %err, "failed to persist updated pool config");
                }
            }
            Ok(None) => tracing::warn!(pool_id, "pool config updated in memory but no persisted record found"),
            Err(err) => tracing::warn!(pool_id, %err, "failed to load pool record to persist updated config"),
        }
        Ok(())
    }

    pub async fn get_resource_utilization(&self, pool_id: &str) -> Result<Allocation> {
        self.resource_manager.get_resource_utilization(pool_id).await
    }

    pub async fn list_pool_members(&self, pool_id: &str) -> Result<Vec<Member>> {
        let pool = self.get_pool(pool_id).await?;
        Ok(pool.list_agents().await)
    }

    /// Periodically snapshots every pool's metrics, persists them, and feeds live resource
    /// demand back into the `ResourceManager` (spec.md §4.5, grounded on the teacher's
    /// `start_cleanup_task` loop shape in `pool_manager.rs`).
    fn start_metrics_collection_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.metrics_collection_interval);
            loop {
                interval.tick().await;

                let pools: Vec<(String, Arc<AgentPool>)> =
                    manager.pools.read().await.iter().map(|(id, pool)| (id.clone(), Arc::clone(pool))).collect();

                for (pool_id, pool) in pools {
                    let metrics = pool.get_metrics().await;
                    if let Err(err) = manager
                        .repository
                        .store_metrics(&MetricsRecord { pool_id: pool_id.clone(), timestamp: Utc::now(), metrics: metrics.clone() })
                        .await
                    {
                        tracing::warn!(pool_id, %err, "failed to persist pool metrics snapshot");
                    }

                    let cpu_used = ((metrics.cpu_utilization_pct / 100.0)
                        * pool.config().await.resource_limits.cpu_millicores as f64) as u32;
                    let memory_used = ((metrics.memory_utilization_pct / 100.0)
                        * pool.config().await.resource_limits.memory_megabytes as f64) as u32;
                    let tasks_used = metrics.active_requests as u32;
                    let _ = manager.resource_manager.monitor().update_utilization(&pool_id, cpu_used, memory_used, tasks_used).await;
                }
            }
        });
        *self.metrics_task.lock().expect("metrics task mutex poisoned") = Some(handle);
    }

    fn start_cleanup_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.cleanup_interval);
            loop {
                interval.tick().await;

                let pool_ids: Vec<String> = manager.pools.read().await.keys().cloned().collect();
                for pool_id in pool_ids {
                    match manager.repository.cleanup_old_metrics(&pool_id, manager.config.metrics_retention).await {
                        Ok(removed) if removed > 0 => {
                            tracing::debug!(pool_id, removed, "pruned stale pool metrics history");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(pool_id, %err, "failed to prune pool metrics history"),
                    }
                }
            }
        });
        *self.cleanup_task.lock().expect("cleanup task mutex poisoned") = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.metrics_task.lock().expect("metrics task mutex poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.cleanup_task.lock().expect("cleanup task mutex poisoned").take() {
            handle.abort();
        }
        self.resource_manager.stop().await;

        let pools: Vec<Arc<AgentPool>> = self.pools.read().await.values().cloned().collect();
        for pool in pools {
            pool.stop().await;
        }
    }
}
