//! Repository (spec.md §4.4): persisted pool/membership/metrics documents atop `pool_store`'s
//! `DocumentStore`.
//!
//! Collections and their indexes are declared once at construction and mirror the composite
//! keys spec.md §3 assigns each persisted document: pools are keyed and looked up by name,
//! memberships by the `(pool_id, agent_id)` pair, metrics snapshots by `(pool_id, timestamp)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use pool_store::{DocumentStore, IndexSpec, MemoryIndexedStore, Query, SortOrder};

use crate::error::Result;
use crate::pool::{PoolConfig, PoolMetrics, PoolStatus};

const POOLS_COLLECTION: &str = "agent_pools";
const MEMBERSHIPS_COLLECTION: &str = "agent_pool_memberships";
const METRICS_COLLECTION: &str = "agent_pool_metrics";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: String,
    pub name: String,
    pub config: PoolConfig,
    pub status: PoolStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub pool_id: String,
    pub agent_id: String,
    pub weight: u8,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: PoolMetrics,
}

pub struct Repository {
    store: MemoryIndexedStore,
}

impl Repository {
    pub async fn new() -> Result<Self> {
        let store = MemoryIndexedStore::new().await?;
        Self::from_store(store).await
    }

    pub async fn new_memory_only() -> Result<Self> {
        let store = MemoryIndexedStore::new_memory_only().await?;
        Self::from_store(store).await
    }

    async fn from_store(store: MemoryIndexedStore) -> Result<Self> {
        store
            .ensure_collection(POOLS_COLLECTION, &[IndexSpec::unique("name"), IndexSpec::secondary("status")])
            .await?;
        store
            .ensure_collection(
                MEMBERSHIPS_COLLECTION,
                &[IndexSpec::secondary("pool_id"), IndexSpec::secondary("agent_id")],
            )
            .await?;
        store
            .ensure_collection(METRICS_COLLECTION, &[IndexSpec::secondary("pool_id"), IndexSpec::secondary("timestamp")])
            .await?;
        Ok(Self { store })
    }

    pub async fn store_pool(&self, record: &PoolRecord) -> Result<()> {
        self.store.put(POOLS_COLLECTION, &record.id, serde_json::to_value(record)?).await?;
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Option<PoolRecord>> {
        match self.store.get(POOLS_COLLECTION, pool_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_pool_by_name(&self, name: &str) -> Result<Option<PoolRecord>> {
        let results = self.store.query(POOLS_COLLECTION, Query::new().filter("name", json!(name))).await?;
        match results.into_iter().next() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let results = self.store.query(POOLS_COLLECTION, Query::new()).await?;
        results.into_iter().map(|v| Ok(serde_json::from_value(v)?)).collect()
    }

    pub async fn delete_pool(&self, pool_id: &str) -> Result<()> {
        self.store.remove(POOLS_COLLECTION, pool_id).await?;
        Ok(())
    }

    pub async fn store_membership(&self, record: &MembershipRecord) -> Result<()> {
        let key = format!("{}:{}", record.pool_id, record.agent_id);
        self.store.put(MEMBERSHIPS_COLLECTION, &key, serde_json::to_value(record)?).await?;
        Ok(())
    }

    pub async fn get_memberships(&self, pool_id: &str) -> Result<Vec<MembershipRecord>> {
        let results = self
            .store
            .query(MEMBERSHIPS_COLLECTION, Query::new().filter("pool_id", json!(pool_id)))
            .await?;
        results.into_iter().map(|v| Ok(serde_json::from_value(v)?)).collect()
    }

    pub async fn remove_membership(&self, pool_id: &str, agent_id: &str) -> Result<()> {
        let key = format!("{pool_id}:{agent_id}");
        self.store.remove(MEMBERSHIPS_COLLECTION, &key).await?;
        Ok(())
    }

    pub async fn store_metrics(&self, record: &MetricsRecord) -> Result<()> {
        let key = format!("{}:{}", record.pool_id, record.timestamp.timestamp_millis());
        self.store.put(METRICS_COLLECTION, &key, serde_json::to_value(record)?).await?;
        Ok(())
    }

    pub async fn get_latest_metrics(&self, pool_id: &str) -> Result<Option<MetricsRecord>> {
        let results = self
            .store
            .query(
                METRICS_COLLECTION,
                Query::new().filter("pool_id", json!(pool_id)).sort("timestamp", SortOrder::Desc).limit(1),
            )
            .await?;
        match results.into_iter().next() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// `GetMetricsHistory(poolId, since, limit)` (spec.md §4.4): filters to `timestamp >= since`,
    /// sorted most-recent first, capped at `limit`. The store's `Query` only supports exact-match
    /// filters, so the `since` bound is applied in-process after the `pool_id` query, the same way
    /// `cleanup_old_metrics` applies its cutoff.
    pub async fn get_metrics_history(&self, pool_id: &str, since: DateTime<Utc>, limit: usize) -> Result<Vec<MetricsRecord>> {
        let results = self
            .store
            .query(METRICS_COLLECTION, Query::new().filter("pool_id", json!(pool_id)).sort("timestamp", SortOrder::Desc))
            .await?;

        let mut history = Vec::with_capacity(limit.min(results.len()));
        for value in results {
            let record: MetricsRecord = serde_json::from_value(value)?;
            if record.timestamp >= since {
                history.push(record);
                if history.len() == limit {
                    break;
                }
            }
        }
        Ok(history)
    }

    /// Removes metrics snapshots older than `retain_for` across all pools (spec.md §4.4
    /// "CleanupOldMetrics"). Grounded on the teacher's cleanup task in `pool_manager.rs`, which
    /// ran on a `tokio::time::interval` and removed stale entries from a tracked map; here it
    /// prunes history rather than evicting whole pools.
    pub async fn cleanup_old_metrics(&self, pool_id: &str, retain_for: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - retain_for;
        let all = self
            .store
            .query(METRICS_COLLECTION, Query::new().filter("pool_id", json!(pool_id)))
            .await?;

        let mut removed = 0;
        for value in all {
            let record: MetricsRecord = serde_json::from_value(value)?;
            if record.timestamp < cutoff {
                let key = format!("{}:{}", record.pool_id, record.timestamp.timestamp_millis());
                self.store.remove(METRICS_COLLECTION, &key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Strategy;
    use crate::pool::{AutoScalingConfig, ResourceLimits};
    use std::time::Duration as StdDuration;

    fn sample_config() -> PoolConfig {
        PoolConfig {
            name: "default".to_string(),
            description: String::new(),
            strategy: Strategy::RoundRobin,
            min_agents: 0,
            max_agents: 5,
            health_check_interval: StdDuration::from_secs(30),
            resource_limits: ResourceLimits { cpu_millicores: 1000, memory_megabytes: 1024, max_tasks: 10 },
            auto_scaling: AutoScalingConfig::default(),
        }
    }

    #[tokio::test]
    async fn stores_and_retrieves_pool_by_name() {
        let repo = Repository::new_memory_only().await.unwrap();
        let record = PoolRecord {
            id: "p1".to_string(),
            name: "default".to_string(),
            config: sample_config(),
            status: PoolStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.store_pool(&record).await.unwrap();

        let found = repo.get_pool_by_name("default").await.unwrap().unwrap();
        assert_eq!(found.id, "p1");
    }

    #[tokio::test]
    async fn memberships_scoped_by_pool() {
        let repo = Repository::new_memory_only().await.unwrap();
        repo.store_membership(&MembershipRecord {
            pool_id: "p1".to_string(),
            agent_id: "a1".to_string(),
            weight: 1,
            joined_at: Utc::now(),
        })
        .await
        .unwrap();
        repo.store_membership(&MembershipRecord {
            pool_id: "p2".to_string(),
            agent_id: "a2".to_string(),
            weight: 1,
            joined_at: Utc::now(),
        })
        .await
        .unwrap();

        let members = repo.get_memberships("p1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].agent_id, "a1");
    }

    #[tokio::test]
    async fn metrics_history_returns_most_recent_first() {
        let repo = Repository::new_memory_only().await.unwrap();
        let base = Utc::now();
        for i in 0..3 {
            repo.store_metrics(&MetricsRecord {
                pool_id: "p1".to_string(),
                timestamp: base + chrono::Duration::seconds(i),
                metrics: PoolMetrics::default(),
            })
            .await
            .unwrap();
        }

        let latest = repo.get_latest_metrics("p1").await.unwrap().unwrap();
        let history = repo.get_metrics_history("p1", base - chrono::Duration::seconds(1), 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, latest.timestamp);
    }

    #[tokio::test]
    async fn metrics_history_filters_by_since() {
        let repo = Repository::new_memory_only().await.unwrap();
        let base = Utc::now();
        for i in 0..5 {
            repo.store_metrics(&MetricsRecord {
                pool_id: "p1".to_string(),
                timestamp: base + chrono::Duration::seconds(i),
                metrics: PoolMetrics::default(),
            })
            .await
            .unwrap();
        }

        let history = repo.get_metrics_history("p1", base + chrono::Duration::seconds(3), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.timestamp >= base + chrono::Duration::seconds(3)));
    }
}
