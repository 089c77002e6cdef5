//! Resource Manager, Monitor and Optimizer (spec.md §4.2).
//!
//! Grounded on the teacher's `registry.rs` `LoadMetrics`/`agent_load` map: a per-key metrics
//! table kept under an `RwLock<HashMap<..>>`, refreshed on a schedule. Generalized from a
//! per-agent load table into a per-pool allocation table, since aggregate resource accounting is
//! scoped to pools here, and extended with a recommendation-generating `Optimizer` the teacher
//! had no counterpart for (spec.md §9 "Resource Optimizer is observational, not enforcing").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PoolError, Result};
use crate::pool::{AutoScalingConfig, ResourceLimits};

const UTILIZATION_HIGH_WATERMARK_PCT: f64 = 80.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub cpu_millicores: u32,
    pub memory_megabytes: u32,
    pub max_tasks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub granted: bool,
    pub headroom_pct: f64,
}

/// A pool's currently registered resource envelope and live demand, tracked by the
/// `ResourceMonitor` (spec.md §4.2 "ResourceMonitor").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub pool_id: String,
    pub limits: ResourceLimits,
    pub scaling: AutoScalingConfig,
    pub cpu_used: u32,
    pub memory_used: u32,
    pub tasks_used: u32,
    pub last_updated: DateTime<Utc>,
}

impl Allocation {
    fn new(pool_id: String, limits: ResourceLimits, scaling: AutoScalingConfig) -> Self {
        Self { pool_id, limits, scaling, cpu_used: 0, memory_used: 0, tasks_used: 0, last_updated: Utc::now() }
    }

    fn utilization_pct(&self) -> (f64, f64, f64) {
        let pct = |used: u32, limit: u32| if limit == 0 { 0.0 } else { (used as f64 / limit as f64) * 100.0 };
        (pct(self.cpu_used, self.limits.cpu_millicores), pct(self.memory_used, self.limits.memory_megabytes), pct(self.tasks_used, self.limits.max_tasks))
    }
}

/// Tracks live per-pool resource allocations. Read/write access is a single `RwLock` over the
/// allocation table (spec.md §5: "Resource Manager: one `RwLock` over its allocation table").
pub struct ResourceMonitor {
    allocations: RwLock<HashMap<String, Allocation>>,
    collection_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self { allocations: RwLock::new(HashMap::new()), collection_task: std::sync::Mutex::new(None) }
    }

    pub async fn register_allocation(&self, pool_id: &str, limits: ResourceLimits, scaling: AutoScalingConfig) {
        let mut allocations = self.allocations.write().await;
        allocations.insert(pool_id.to_string(), Allocation::new(pool_id.to_string(), limits, scaling));
    }

    pub async fn unregister_allocation(&self, pool_id: &str) {
        self.allocations.write().await.remove(pool_id);
    }

    /// Periodic collection loop (spec.md §4.2): a no-op placeholder for a platform-specific
    /// metric source, left for an integrator to fill in. Cancellation is honored via `stop`,
    /// which aborts the loop so it exits within one cadence period.
    pub fn start_collection_loop(self: &Arc<Self>, interval: StdDuration) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let pool_count = monitor.allocations.read().await.len();
                tracing::debug!(pool_count, "resource monitor collection tick");
            }
        });
        *self.collection_task.lock().expect("collection task mutex poisoned") = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.collection_task.lock().expect("collection task mutex poisoned").take() {
            handle.abort();
        }
    }

    pub async fn update_utilization(&self, pool_id: &str, cpu_used: u32, memory_used: u32, tasks_used: u32) -> Result<()> {
        let mut allocations = self.allocations.write().await;
        let allocation = allocations
            .get_mut(pool_id)
            .ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))?;
        allocation.cpu_used = cpu_used;
        allocation.memory_used = memory_used;
        allocation.tasks_used = tasks_used;
        allocation.last_updated = Utc::now();
        Ok(())
    }

    pub async fn get_allocation(&self, pool_id: &str) -> Option<Allocation> {
        self.allocations.read().await.get(pool_id).cloned()
    }

    pub async fn get_all_allocations(&self) -> Vec<Allocation> {
        self.allocations.read().await.values().cloned().collect()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub interval: StdDuration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { enabled: false, interval: StdDuration::from_secs(60) }
    }
}

/// Evaluates a pool's current utilization and produces human-readable recommendations.
/// Observational only (spec.md §9): it never resizes a pool or touches membership, it only
/// reports what an operator or an external auto-scaler should do next.
pub struct ResourceOptimizer;

impl ResourceOptimizer {
    pub fn recommend(allocation: &Allocation) -> Vec<String> {
        let (cpu_pct, mem_pct, task_pct) = allocation.utilization_pct();
        let mut recommendations = Vec::new();

        if cpu_pct > UTILIZATION_HIGH_WATERMARK_PCT {
            recommendations.push("add agents to relieve CPU pressure".to_string());
        }
        if mem_pct > UTILIZATION_HIGH_WATERMARK_PCT {
            recommendations.push("raise memory limit or reduce per-agent memory usage".to_string());
        }
        if task_pct > UTILIZATION_HIGH_WATERMARK_PCT {
            recommendations.push("raise task capacity or add agents".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("pool is optimally allocated".to_string());
        }
        recommendations
    }
}

/// Observable scale-up hook (spec.md §4.2 `triggerScaleUp`): emits a structured log line
/// recording the decision and its inputs. No agent is created; an external auto-scaler is
/// expected to subscribe to this log line and act on it.
fn trigger_scale_up(pool_id: &str, cpu_utilization_pct: f64, threshold_pct: f64) {
    tracing::info!(pool_id, cpu_utilization_pct, threshold_pct, "scale-up triggered");
}

/// Observable scale-down hook (spec.md §4.2 `triggerScaleDown`): emits a structured log line
/// recording the decision and its inputs. No agent is removed.
fn trigger_scale_down(pool_id: &str, cpu_utilization_pct: f64, threshold_pct: f64) {
    tracing::info!(pool_id, cpu_utilization_pct, threshold_pct, "scale-down triggered");
}

/// Central coordinator for per-pool resource envelopes (spec.md §4.2 "ResourceManager").
pub struct ResourceManager {
    monitor: Arc<ResourceMonitor>,
    optimizer_config: RwLock<OptimizerConfig>,
    optimizer_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self { monitor: Arc::new(ResourceMonitor::new()), optimizer_config: RwLock::new(OptimizerConfig::default()), optimizer_task: std::sync::Mutex::new(None) }
    }

    pub fn monitor(&self) -> Arc<ResourceMonitor> {
        self.monitor.clone()
    }

    pub async fn register_pool(&self, pool_id: &str, limits: ResourceLimits, scaling: AutoScalingConfig) {
        self.monitor.register_allocation(pool_id, limits, scaling).await;
    }

    pub async fn unregister_pool(&self, pool_id: &str) {
        self.monitor.unregister_allocation(pool_id).await;
    }

    /// Evaluates a hypothetical allocation request against the pool's declared limits and
    /// current usage, denying the request with recommendations when it would push any
    /// dimension over its limit (spec.md §3 "AllocationResult", §7 "AllocationDenied").
    pub async fn allocate_resources(&self, pool_id: &str, request: AllocationRequest) -> Result<AllocationResult> {
        let allocation = self
            .monitor
            .get_allocation(pool_id)
            .await
            .ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))?;

        let projected_cpu = allocation.cpu_used + request.cpu_millicores;
        let projected_memory = allocation.memory_used + request.memory_megabytes;
        let projected_tasks = allocation.tasks_used + request.max_tasks;

        let over_limit = |used: u32, limit: u32| limit > 0 && used > limit;
        if over_limit(projected_cpu, allocation.limits.cpu_millicores) {
            return Err(PoolError::AllocationDenied {
                dimension: "cpu".to_string(),
                headroom: (allocation.limits.cpu_millicores as f64 - allocation.cpu_used as f64).max(0.0),
                recommendations: ResourceOptimizer::recommend(&allocation),
            });
        }
        if over_limit(projected_memory, allocation.limits.memory_megabytes) {
            return Err(PoolError::AllocationDenied {
                dimension: "memory".to_string(),
                headroom: (allocation.limits.memory_megabytes as f64 - allocation.memory_used as f64).max(0.0),
                recommendations: ResourceOptimizer::recommend(&allocation),
            });
        }
        if over_limit(projected_tasks, allocation.limits.max_tasks) {
            return Err(PoolError::AllocationDenied {
                dimension: "tasks".to_string(),
                headroom: (allocation.limits.max_tasks as f64 - allocation.tasks_used as f64).max(0.0),
                recommendations: ResourceOptimizer::recommend(&allocation),
            });
        }

        self.monitor.update_utilization(pool_id, projected_cpu, projected_memory, projected_tasks).await?;

        let headroom_pct = 100.0
            - [
                if allocation.limits.cpu_millicores > 0 { (projected_cpu as f64 / allocation.limits.cpu_millicores as f64) * 100.0 } else { 0.0 },
                if allocation.limits.memory_megabytes > 0 { (projected_memory as f64 / allocation.limits.memory_megabytes as f64) * 100.0 } else { 0.0 },
                if allocation.limits.max_tasks > 0 { (projected_tasks as f64 / allocation.limits.max_tasks as f64) * 100.0 } else { 0.0 },
            ]
            .into_iter()
            .fold(0.0_f64, f64::max);

        Ok(AllocationResult { granted: true, headroom_pct: headroom_pct.max(0.0) })
    }

    pub async fn deallocate_resources(&self, pool_id: &str, request: AllocationRequest) -> Result<()> {
        let allocation = self
            .monitor
            .get_allocation(pool_id)
            .await
            .ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))?;

        let cpu_used = allocation.cpu_used.saturating_sub(request.cpu_millicores);
        let memory_used = allocation.memory_used.saturating_sub(request.memory_megabytes);
        let tasks_used = allocation.tasks_used.saturating_sub(request.max_tasks);
        self.monitor.update_utilization(pool_id, cpu_used, memory_used, tasks_used).await
    }

    pub async fn get_resource_utilization(&self, pool_id: &str) -> Result<Allocation> {
        self.monitor.get_allocation(pool_id).await.ok_or_else(|| PoolError::PoolNotFound(pool_id.to_string()))
    }

    /// `OptimizeAllocations` (spec.md §4.2): for each registered pool, compares CPU utilization
    /// against that pool's own auto-scaling thresholds and fires the matching observable hook,
    /// then reports the usual watermark-based recommendations for the pool.
    pub async fn optimize_allocations(&self) -> HashMap<String, Vec<String>> {
        let allocations = self.monitor.get_all_allocations().await;
        let mut recommendations = HashMap::with_capacity(allocations.len());
        for allocation in allocations {
            let (cpu_pct, _, _) = allocation.utilization_pct();
            if cpu_pct > allocation.scaling.scale_up_threshold_pct {
                trigger_scale_up(&allocation.pool_id, cpu_pct, allocation.scaling.scale_up_threshold_pct);
            } else if cpu_pct < allocation.scaling.scale_down_threshold_pct {
                trigger_scale_down(&allocation.pool_id, cpu_pct, allocation.scaling.scale_down_threshold_pct);
            }
            recommendations.insert(allocation.pool_id.clone(), ResourceOptimizer::recommend(&allocation));
        }
        recommendations
    }

    pub async fn set_optimizer_config(&self, config: OptimizerConfig) {
        *self.optimizer_config.write().await = config;
    }

    /// Starts the background optimizer loop described in spec.md §4.2 "StartOptimizer". A no-op
    /// if the optimizer is disabled in config; logs recommendations rather than acting on them.
    pub async fn start_optimizer(self: &Arc<Self>) {
        let config = *self.optimizer_config.read().await;
        self.monitor.start_collection_loop(config.interval);
        if !config.enabled {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            loop {
                interval.tick().await;
                let recommendations = manager.optimize_allocations().await;
                for (pool_id, recs) in recommendations {
                    if !(recs.len() == 1 && recs[0] == "pool is optimally allocated") {
                        tracing::info!(pool_id, recommendations = ?recs, "resource optimizer recommendation");
                    }
                }
            }
        });
        *self.optimizer_task.lock().expect("optimizer task mutex poisoned") = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.optimizer_task.lock().expect("optimizer task mutex poisoned").take() {
            handle.abort();
        }
        self.monitor.stop().await;
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits { cpu_millicores: 1000, memory_megabytes: 1024, max_tasks: 10 }
    }

    #[tokio::test]
    async fn allocation_within_limits_is_granted() {
        let manager = ResourceManager::new();
        manager.register_pool("p1", limits(), AutoScalingConfig::default()).await;

        let result = manager
            .allocate_resources("p1", AllocationRequest { cpu_millicores: 100, memory_megabytes: 128, max_tasks: 2 })
            .await
            .unwrap();
        assert!(result.granted);
    }

    #[tokio::test]
    async fn allocation_over_limit_is_denied_with_recommendations() {
        let manager = ResourceManager::new();
        manager.register_pool("p1", limits(), AutoScalingConfig::default()).await;

        let err = manager
            .allocate_resources("p1", AllocationRequest { cpu_millicores: 2000, memory_megabytes: 0, max_tasks: 0 })
            .await
            .unwrap_err();

        match err {
            PoolError::AllocationDenied { dimension, recommendations, .. } => {
                assert_eq!(dimension, "cpu");
                assert!(!recommendations.is_empty());
            }
            other => panic!("expected AllocationDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deallocate_reduces_usage() {
        let manager = ResourceManager::new();
        manager.register_pool("p1", limits(), AutoScalingConfig::default()).await;
        manager
            .allocate_resources("p1", AllocationRequest { cpu_millicores: 500, memory_megabytes: 0, max_tasks: 0 })
            .await
            .unwrap();

        manager
            .deallocate_resources("p1", AllocationRequest { cpu_millicores: 300, memory_megabytes: 0, max_tasks: 0 })
            .await
            .unwrap();

        let allocation = manager.get_resource_utilization("p1").await.unwrap();
        assert_eq!(allocation.cpu_used, 200);
    }

    #[tokio::test]
    async fn unknown_pool_fails() {
        let manager = ResourceManager::new();
        let err = manager
            .allocate_resources("missing", AllocationRequest { cpu_millicores: 1, memory_megabytes: 1, max_tasks: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::PoolNotFound(_)));
    }

    #[test]
    fn recommend_flags_high_cpu_utilization() {
        let mut allocation = Allocation::new("p1".to_string(), limits(), AutoScalingConfig::default());
        allocation.cpu_used = 900;
        let recs = ResourceOptimizer::recommend(&allocation);
        assert!(recs.iter().any(|r| r.contains("CPU")));
    }

    #[test]
    fn recommend_reports_optimal_when_under_watermark() {
        let mut allocation = Allocation::new("p1".to_string(), limits(), AutoScalingConfig::default());
        allocation.cpu_used = 10;
        let recs = ResourceOptimizer::recommend(&allocation);
        assert_eq!(recs, vec!["pool is optimally allocated".to_string()]);
    }

    #[tokio::test]
    async fn optimize_allocations_reads_each_pool_own_thresholds() {
        let manager = ResourceManager::new();
        let scaling = AutoScalingConfig { enabled: true, scale_up_threshold_pct: 50.0, scale_down_threshold_pct: 10.0, ..AutoScalingConfig::default() };
        manager.register_pool("p1", limits(), scaling).await;
        manager.monitor().update_utilization("p1", 600, 0, 0).await.unwrap();

        // cpu_used=600 against cpu_millicores=1000 is 60%, above the pool's own 50% scale-up
        // threshold (and above the global 80% watermark is not required to trigger it).
        let recommendations = manager.optimize_allocations().await;
        assert!(recommendations.contains_key("p1"));
    }

    #[tokio::test]
    async fn resource_monitor_collection_loop_is_cancellable() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.start_collection_loop(StdDuration::from_millis(10));
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        monitor.stop().await;
    }
}
