//! Guarantees that hold whatever the input
//!
//! Tests for:
//! - Rule application being idempotent
//! - SSH ranges staying contiguous across scale operations
//! - The state machine rejecting conflicting workflows
//! - Planning never overcommitting a host

use std::net::{IpAddr, Ipv4Addr};

use uuid::Uuid;

use cluster_orchestrator::model::{node_name, ClusterEvent, ClusterNode, ClusterState, NodeRole};
use cluster_orchestrator::network::{NetworkRuleCoordinator, RuleSettings};
use cluster_orchestrator::planner::{plan_placement, units_for, PlacementConstraints};
use cluster_orchestrator::state::ClusterStore;
use cluster_orchestrator::workers::{add_nodes, create_cluster, scale_cluster, ScaleRequest};
use cluster_orchestrator::Error;

use super::cloud::{host, plenty, tenant_cluster, test_config, Cloud, Orchestrator};

fn members(count: u32) -> Vec<ClusterNode> {
    let cluster = Uuid::new_v4();
    (0..count)
        .map(|ordinal| {
            let role = if ordinal == 0 { NodeRole::Control } else { NodeRole::Worker };
            let index = if ordinal == 0 { 1 } else { ordinal };
            ClusterNode::new(
                cluster,
                format!("vm-{ordinal}"),
                node_name("prop", role, index),
                role,
                ordinal,
                "v1.29.0",
            )
            .with_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + ordinal as u8)))
        })
        .collect()
}

#[tokio::test]
async fn applying_the_same_membership_twice_changes_nothing() {
    let cloud = Cloud::isolated(plenty());
    let coordinator =
        NetworkRuleCoordinator::new(cloud.clone(), RuleSettings::from(&test_config()));
    let network = coordinator.network("net-1").await.unwrap();
    let nodes = members(4);

    coordinator.apply(&network, &nodes).await.unwrap();
    let first = cloud.rule_count();
    let ids: Vec<String> = cloud.forwards.lock().unwrap().iter().map(|r| r.id.clone()).collect();

    coordinator.apply(&network, &nodes).await.unwrap();
    assert_eq!(cloud.rule_count(), first);
    let again: Vec<String> = cloud.forwards.lock().unwrap().iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, again, "existing rules are kept, not recreated");
}

#[tokio::test]
async fn shrinking_membership_revokes_only_surplus_rules() {
    let cloud = Cloud::isolated(plenty());
    let coordinator = NetworkRuleCoordinator::new(cloud.clone(), RuleSettings::from(&test_config()));
    let network = coordinator.network("net-1").await.unwrap();

    coordinator.apply(&network, &members(5)).await.unwrap();
    coordinator.apply(&network, &members(2)).await.unwrap();
    assert_eq!(cloud.ssh_range(), Some((2222, 2223)));
    assert_eq!(cloud.forwarded_ports(), [2222, 2223]);

    coordinator.revoke_all(&network).await.unwrap();
    assert_eq!(cloud.rule_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn ssh_range_stays_contiguous_across_scaling() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = tenant_cluster("elastic");
    orch.register(&cluster).await;
    create_cluster(&orch.ctx, cluster.id).await.unwrap();

    for workers in [4, 1, 3, 0, 2] {
        let scaled = scale_cluster(
            &orch.ctx,
            cluster.id,
            ScaleRequest {
                worker_nodes: Some(workers),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let total = 1 + workers as u16;
        assert_eq!(scaled.node_count, u32::from(total));
        assert_eq!(orch.cloud.ssh_range(), Some((2222, 2222 + total - 1)), "{workers} workers");
        let expected: Vec<u16> = (2222..2222 + total).collect();
        assert_eq!(orch.cloud.forwarded_ports(), expected, "{workers} workers");

        let nodes = orch.store.list_nodes(cluster.id).await.unwrap();
        let ordinals: Vec<u32> = nodes.iter().map(|n| n.ssh_port_offset).collect();
        assert_eq!(ordinals, (0..u32::from(total)).collect::<Vec<_>>());
    }
}

#[tokio::test(start_paused = true)]
async fn workflows_are_rejected_while_destroying() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = tenant_cluster("doomed");
    orch.register(&cluster).await;
    create_cluster(&orch.ctx, cluster.id).await.unwrap();
    orch.store
        .transition(
            cluster.id,
            ClusterState::Running,
            ClusterState::Destroying,
            ClusterEvent::DestroyRequested,
            None,
        )
        .await
        .unwrap();
    let commands_before = orch.cloud.commands.lock().unwrap().len();

    let err = scale_cluster(
        &orch.ctx,
        cluster.id,
        ScaleRequest {
            worker_nodes: Some(5),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::IllegalStateTransition { .. }), "{err}");

    let err = add_nodes(&orch.ctx, cluster.id, Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::IllegalStateTransition { .. }), "{err}");

    let stored = orch.store.get_cluster(cluster.id).await.unwrap();
    assert_eq!(stored.state, ClusterState::Destroying);
    assert_eq!(stored.worker_nodes, 2);
    assert_eq!(orch.cloud.instance_count(), 3);
    assert_eq!(orch.cloud.commands.lock().unwrap().len(), commands_before);
}

#[test]
fn feasible_plans_never_exceed_overcommitted_capacity() {
    let mut hosts = vec![host("hv-1", 8, 16_384), host("hv-2", 4, 8_192), host("hv-3", 16, 12_288)];
    hosts[0].cpu_overcommit = 2.0;
    hosts[1].ram_overcommit = 1.5;
    hosts[2].used_cpu_mhz = 8_000;

    let cluster = tenant_cluster("pack");
    for workers in 0..40 {
        let units = units_for(&cluster, 1, 0, workers);
        let plan = plan_placement(&hosts, &units, &PlacementConstraints::default());
        if !plan.feasible {
            assert!(plan.reason.is_some());
            continue;
        }
        assert_eq!(plan.placed(), workers + 1);
        for h in &hosts {
            if let Some(r) = plan.reservations.get(&h.id) {
                assert!(h.used_cpu_mhz + r.cpu_mhz <= h.cpu_capacity_mhz(), "{} cpu", h.id);
                assert!(h.used_memory_mb + r.memory_mb <= h.memory_capacity_mb(), "{} memory", h.id);
            }
        }
    }
}

#[test]
fn planning_is_all_or_nothing() {
    let hosts = vec![host("hv-1", 4, 8_192)];
    let cluster = tenant_cluster("big");
    let units = units_for(&cluster, 1, 0, 2);
    let plan = plan_placement(&hosts, &units, &PlacementConstraints::default());

    assert!(!plan.feasible);
    assert_eq!(plan.requested, 3);
    assert!(plan.into_result("big").is_err());
}
