use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

use pool::agent::test_utils::StubAgent;
use pool::balancer::{BalancerFactory, Strategy};
use pool::pool::{AgentPool, AutoScalingConfig, Member, PoolConfig, ResourceLimits};

fn test_config(strategy: Strategy, max_agents: u32) -> PoolConfig {
    PoolConfig {
        name: "bench-pool".to_string(),
        description: String::new(),
        strategy,
        min_agents: 0,
        max_agents,
        health_check_interval: std::time::Duration::from_secs(3600),
        resource_limits: ResourceLimits { cpu_millicores: 100_000, memory_megabytes: 100_000, max_tasks: 100_000 },
        auto_scaling: AutoScalingConfig::default(),
    }
}

fn members(count: usize) -> Vec<Member> {
    (0..count).map(|i| Member::new(Arc::new(StubAgent::new(format!("agent-{i}"))), (i % 5 + 1) as u8)).collect()
}

/// Benchmarks raw selection cost for each load-balancing strategy over a fixed healthy set,
/// independent of the pool's locking overhead.
fn bench_balancer_select(c: &mut Criterion) {
    let healthy = members(64);

    for strategy in [Strategy::RoundRobin, Strategy::LeastConnection, Strategy::Weighted, Strategy::Random] {
        let balancer = BalancerFactory::build(strategy);
        c.bench_with_input(BenchmarkId::new("balancer_select", format!("{strategy:?}")), &strategy, |b, _| {
            b.iter(|| black_box(balancer.select(&healthy).unwrap()))
        });
    }
}

/// Benchmarks the full `AgentPool::get_agent` / release round trip, including lock acquisition
/// and metrics bookkeeping.
fn bench_pool_dispatch_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = rt.block_on(async {
        let pool = AgentPool::new("bench".to_string(), test_config(Strategy::RoundRobin, 64)).unwrap();
        for i in 0..64 {
            pool.add_agent(Arc::new(StubAgent::new(format!("agent-{i}"))), 1).await.unwrap();
        }
        pool
    });

    c.bench_function("pool_dispatch_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let guard = pool.get_agent().await.unwrap();
                black_box(guard.agent_id());
                guard.release().await.unwrap();
            })
        })
    });
}

/// Benchmarks pool membership churn: adding and removing an agent under the same write lock
/// path used by `Manager::add_agent_to_pool`/`remove_agent_from_pool`.
fn bench_pool_membership_churn(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = rt.block_on(async { AgentPool::new("bench-churn".to_string(), test_config(Strategy::RoundRobin, 2)).unwrap() });

    c.bench_function("pool_membership_churn", |b| {
        b.iter(|| {
            rt.block_on(async {
                pool.add_agent(Arc::new(StubAgent::new("churner")), 1).await.unwrap();
                pool.remove_agent("churner").await.unwrap();
            })
        })
    });
}

criterion_group!(benches, bench_balancer_select, bench_pool_dispatch_round_trip, bench_pool_membership_churn);
criterion_main!(benches);
