//! Load Balancer (spec.md §4.1).
//!
//! Grounded on the teacher's `LoadBalancingStrategy` enum dispatch inline in
//! `AgentPool::get_available_agent`, generalized into per-strategy trait objects because
//! `GetStrategy`/`Reset` need per-instance state (a position counter, a WRR cursor) that an
//! inline match over a config enum cannot hold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::pool::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    RoundRobin,
    LeastConnection,
    Weighted,
    Random,
}

/// A strategy-specific selector over a pool's current healthy members.
///
/// Implementations must be safe under concurrent callers (spec.md §4.1); internal state is
/// either an atomic counter (round-robin) or a mutex-protected cursor (weighted). `select`
/// never mutates a member's `active_connections` — that increment is the caller's
/// responsibility, performed under the pool's write lock (spec.md §9).
pub trait LoadBalancer: Send + Sync {
    fn select<'a>(&self, healthy: &'a [Member]) -> Result<&'a Member>;
    fn strategy(&self) -> Strategy;
    fn reset(&self);
}

pub struct BalancerFactory;

impl BalancerFactory {
    pub fn build(strategy: Strategy) -> Box<dyn LoadBalancer> {
        match strategy {
            Strategy::RoundRobin => Box::new(RoundRobinBalancer::new()),
            Strategy::LeastConnection => Box::new(LeastConnectionBalancer),
            Strategy::Weighted => Box::new(WeightedBalancer::new()),
            Strategy::Random => Box::new(RandomBalancer),
        }
    }
}

fn require_healthy(healthy: &[Member]) -> Result<()> {
    if healthy.is_empty() {
        return Err(PoolError::NoHealthyAgents(String::new()));
    }
    Ok(())
}

/// A monotonic position counter advances atomically; index = position modulo list length.
pub struct RoundRobinBalancer {
    position: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self { position: AtomicUsize::new(0) }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select<'a>(&self, healthy: &'a [Member]) -> Result<&'a Member> {
        require_healthy(healthy)?;
        let pos = self.position.fetch_add(1, Ordering::SeqCst);
        Ok(&healthy[pos % healthy.len()])
    }

    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }

    fn reset(&self) {
        self.position.store(0, Ordering::SeqCst);
    }
}

/// Selects the healthy member with the lowest `active_connections`, ties broken by iteration
/// order (first-encountered).
pub struct LeastConnectionBalancer;

impl LoadBalancer for LeastConnectionBalancer {
    fn select<'a>(&self, healthy: &'a [Member]) -> Result<&'a Member> {
        require_healthy(healthy)?;
        Ok(healthy
            .iter()
            .min_by_key(|m| m.active_connections)
            .expect("healthy set checked non-empty above"))
    }

    fn strategy(&self) -> Strategy {
        Strategy::LeastConnection
    }

    fn reset(&self) {}
}

/// Uniform independent choice over the healthy set.
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select<'a>(&self, healthy: &'a [Member]) -> Result<&'a Member> {
        require_healthy(healthy)?;
        let idx = fastrand::usize(0..healthy.len());
        Ok(&healthy[idx])
    }

    fn strategy(&self) -> Strategy {
        Strategy::Random
    }

    fn reset(&self) {}
}

/// Classical interleaved weighted round-robin over the current healthy set. Weight statistics
/// (gcd, max weight) are recomputed whenever the healthy set's size or composition changes,
/// since the WRR cursor's meaning depends on them.
pub struct WeightedBalancer {
    cursor: Mutex<WrrCursor>,
}

#[derive(Default)]
struct WrrCursor {
    index: i64,
    current_weight: i64,
    last_signature: Vec<(String, i64)>,
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self { cursor: Mutex::new(WrrCursor { index: -1, current_weight: 0, last_signature: Vec::new() }) }
    }

    fn signature(healthy: &[Member]) -> Vec<(String, i64)> {
        healthy.iter().map(|m| (m.agent_id().to_string(), m.weight as i64)).collect()
    }

    fn gcd(a: i64, b: i64) -> i64 {
        if b == 0 {
            a
        } else {
            Self::gcd(b, a % b)
        }
    }
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedBalancer {
    fn select<'a>(&self, healthy: &'a [Member]) -> Result<&'a Member> {
        require_healthy(healthy)?;

        let weights: Vec<i64> = healthy.iter().map(|m| m.weight as i64).collect();
        let total_weight: i64 = weights.iter().sum();
        if total_weight <= 0 {
            return Err(PoolError::BalancerFailure("total weight must be positive".to_string()));
        }
        let max_weight = *weights.iter().max().expect("healthy set is non-empty");
        let gcd_weight = weights.iter().copied().fold(0, Self::gcd).max(1);

        let mut cursor = self.cursor.lock().expect("balancer mutex poisoned");
        let signature = Self::signature(healthy);
        if cursor.last_signature != signature {
            cursor.index = -1;
            cursor.current_weight = 0;
            cursor.last_signature = signature;
        }

        loop {
            cursor.index = (cursor.index + 1) % healthy.len() as i64;
            if cursor.index == 0 {
                cursor.current_weight -= gcd_weight;
                if cursor.current_weight <= 0 {
                    cursor.current_weight = max_weight;
                }
            }
            if weights[cursor.index as usize] >= cursor.current_weight {
                return Ok(&healthy[cursor.index as usize]);
            }
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Weighted
    }

    fn reset(&self) {
        let mut cursor = self.cursor.lock().expect("balancer mutex poisoned");
        cursor.index = -1;
        cursor.current_weight = 0;
        cursor.last_signature.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_utils::StubAgent;
    use std::sync::Arc;

    fn member(id: &str, weight: u8) -> Member {
        Member::new(Arc::new(StubAgent::new(id)), weight)
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let balancer = RoundRobinBalancer::new();
        let healthy = vec![member("a", 1), member("b", 1), member("c", 1)];

        let picks: Vec<&str> = (0..4).map(|_| balancer.select(&healthy).unwrap().agent_id()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn least_connection_picks_lowest_active() {
        let balancer = LeastConnectionBalancer;
        let mut healthy = vec![member("a", 1), member("b", 1)];
        healthy[0].active_connections = 3;
        healthy[1].active_connections = 1;

        assert_eq!(balancer.select(&healthy).unwrap().agent_id(), "b");
    }

    #[test]
    fn weighted_round_robin_distributes_by_weight() {
        let balancer = WeightedBalancer::new();
        let healthy = vec![member("a", 3), member("b", 1)];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..4 {
            let picked = balancer.select(&healthy).unwrap().agent_id().to_string();
            *counts.entry(picked).or_insert(0) += 1;
        }

        assert_eq!(counts.get("a").copied().unwrap_or(0), 3);
        assert_eq!(counts.get("b").copied().unwrap_or(0), 1);
    }

    #[test]
    fn empty_healthy_set_fails() {
        let balancer = RoundRobinBalancer::new();
        let err = balancer.select(&[]).unwrap_err();
        assert!(matches!(err, PoolError::NoHealthyAgents(_)));
    }
}
