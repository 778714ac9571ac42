//! Stories of a tenant cluster's life
//!
//! Each story drives the public workflows against the in-memory cloud and
//! checks what an operator would see afterwards: the stored record, the
//! instances, the rules on the network and the transition history.

use std::net::{IpAddr, Ipv4Addr};

use cluster_orchestrator::model::{ClusterEvent, ClusterState, ManagedCluster, NodeRole};
use cluster_orchestrator::network::RulePurpose;
use cluster_orchestrator::provisioner::{InstanceInfo, PowerState};
use cluster_orchestrator::state::ClusterStore;
use cluster_orchestrator::workers::{
    add_nodes, collect_garbage, create_cluster, destroy_cluster, scale_cluster, start_cluster,
    stop_cluster, upgrade_cluster, DestroyRequest, ExternalNode, ScaleRequest, UpgradeRequest,
};
use cluster_orchestrator::{Error, DEFAULT_API_PORT};

use super::cloud::{host, plenty, tenant_cluster, version, Cloud, Orchestrator};

async fn running(orch: &Orchestrator, cluster: ManagedCluster) -> ManagedCluster {
    orch.register(&cluster).await;
    create_cluster(&orch.ctx, cluster.id).await.unwrap()
}

// =============================================================================
// Create
// =============================================================================

/// Story: A tenant creates a small cluster on an isolated network
///
/// The cluster comes up with one control node and two workers. Every node
/// is reachable on its own SSH port starting at 2222, the API is exposed
/// through a single load balancer and firewall rule, and the boot media is
/// gone once the nodes have joined.
#[tokio::test(start_paused = true)]
async fn story_create_small_cluster_on_isolated_network() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("shop")).await;

    assert_eq!(cluster.state, ClusterState::Running);
    assert_eq!(cluster.endpoint.as_deref(), Some("https://198.51.100.7:6443/"));
    assert_eq!(cluster.node_count, 3);

    let nodes = orch.store.list_nodes(cluster.id).await.unwrap();
    let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["shop-control-1", "shop-node-1", "shop-node-2"]);
    assert!(nodes.iter().all(|n| n.bootstrapped));

    let cloud = &orch.cloud;
    assert_eq!(cloud.ssh_range(), Some((2222, 2224)));
    assert_eq!(cloud.forwarded_ports(), [2222, 2223, 2224]);
    assert_eq!(cloud.balancers.lock().unwrap().len(), 1);
    let api_rules: Vec<_> = cloud
        .firewall
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.spec.purpose == RulePurpose::ApiAccess)
        .map(|r| (r.spec.port_start, r.spec.port_end))
        .collect();
    assert_eq!(api_rules, [(DEFAULT_API_PORT, DEFAULT_API_PORT)]);

    assert!(cloud.attached.lock().unwrap().is_empty());
    assert!(orch.store.cluster_config(cluster.id).await.unwrap().is_some());
}

/// Story: The zone cannot hold every requested node
///
/// Planning happens before anything is provisioned, so a shortage leaves
/// no instances and no membership records behind.
#[tokio::test(start_paused = true)]
async fn story_capacity_shortage_fails_before_provisioning() {
    // Room for three 2-vCPU nodes, the cluster asks for four
    let orch = Orchestrator::new(Cloud::isolated(vec![host("hv-small", 6, 65_536)]));
    let mut cluster = tenant_cluster("greedy");
    cluster.worker_nodes = 3;
    orch.register(&cluster).await;

    let err = create_cluster(&orch.ctx, cluster.id).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCapacity { .. }), "{err}");

    let stored = orch.store.get_cluster(cluster.id).await.unwrap();
    assert_eq!(stored.state, ClusterState::Error);
    assert!(stored.message.unwrap().contains("create failed"));
    assert_eq!(
        orch.store.history(cluster.id).last().map(|t| t.event),
        Some(ClusterEvent::CreateFailed)
    );
    assert!(orch.store.list_nodes(cluster.id).await.unwrap().is_empty());
    assert_eq!(orch.cloud.instance_count(), 0);
}

/// Story: Workers never report Ready
///
/// The create times out. The boot media comes off every node exactly once
/// and the instances stay for inspection.
#[tokio::test(start_paused = true)]
async fn story_nodes_that_never_join_time_out() {
    let cloud = Cloud::isolated(plenty());
    cloud
        .not_ready
        .lock()
        .unwrap()
        .extend(["late-node-1".to_string(), "late-node-2".to_string()]);
    let orch = Orchestrator::new(cloud);
    let cluster = tenant_cluster("late");
    orch.register(&cluster).await;

    let err = create_cluster(&orch.ctx, cluster.id).await.unwrap_err();
    assert!(matches!(err, Error::TimeoutExceeded { .. }), "{err}");

    let mut detaches = orch.cloud.detaches.lock().unwrap().clone();
    detaches.sort();
    assert_eq!(detaches, ["vm-1", "vm-2", "vm-3"]);
    assert!(orch.cloud.attached.lock().unwrap().is_empty());
    assert_eq!(orch.cloud.instance_count(), 3);

    let stored = orch.store.get_cluster(cluster.id).await.unwrap();
    assert_eq!(stored.state, ClusterState::Error);
}

// =============================================================================
// Scale
// =============================================================================

/// Story: A tenant scales a cluster down to its control node
///
/// The highest-ordinal workers go first, and the SSH range and forwards
/// shrink with them so no rule points at a deleted instance.
#[tokio::test(start_paused = true)]
async fn story_scale_down_to_control_node_only() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("lean")).await;
    let control = orch.store.list_nodes(cluster.id).await.unwrap()[0].clone();

    let scaled = scale_cluster(
        &orch.ctx,
        cluster.id,
        ScaleRequest {
            worker_nodes: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(scaled.state, ClusterState::Running);
    assert_eq!(scaled.node_count, 1);
    assert_eq!(scaled.cores, 2);

    let nodes = orch.store.list_nodes(cluster.id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].role, NodeRole::Control);
    assert_eq!(orch.cloud.instance_count(), 1);

    assert_eq!(orch.cloud.ssh_range(), Some((2222, 2222)));
    let forwards = orch.cloud.forwards.lock().unwrap().clone();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].spec.instance_id, control.instance_id);

    let commands = orch.cloud.commands.lock().unwrap().clone();
    let drain_2 = commands.iter().position(|c| c == "drain lean-node-2").unwrap();
    let drain_1 = commands.iter().position(|c| c == "drain lean-node-1").unwrap();
    assert!(drain_2 < drain_1, "highest ordinal drains first");
}

/// Story: Growing a cluster extends the SSH range without gaps
#[tokio::test(start_paused = true)]
async fn story_scale_up_extends_ssh_range() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("grow")).await;

    let scaled = scale_cluster(
        &orch.ctx,
        cluster.id,
        ScaleRequest {
            worker_nodes: Some(4),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(scaled.node_count, 5);
    assert_eq!(orch.cloud.ssh_range(), Some((2222, 2226)));
    assert_eq!(orch.cloud.forwarded_ports(), [2222, 2223, 2224, 2225, 2226]);
    let members = &orch.cloud.balancers.lock().unwrap()[0].spec.members;
    assert_eq!(members.len(), 1, "only control nodes serve the API");
}

// =============================================================================
// Upgrade
// =============================================================================

/// Story: A node of an HA control plane never reaches the new version
///
/// The first control node is upgraded and stays upgraded. The workflow
/// gives up on the second, leaves the cluster in Error and keeps the old
/// version on the record.
#[tokio::test(start_paused = true)]
async fn story_stuck_control_node_aborts_upgrade() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let mut cluster = tenant_cluster("ha");
    cluster.control_nodes = 2;
    cluster.worker_nodes = 0;
    let cluster = running(&orch, cluster).await;
    orch.cloud
        .frozen
        .lock()
        .unwrap()
        .push("ha-control-2".to_string());

    let err = upgrade_cluster(&orch.ctx, cluster.id, UpgradeRequest { version: version(30) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TimeoutExceeded { .. }), "{err}");

    let stored = orch.store.get_cluster(cluster.id).await.unwrap();
    assert_eq!(stored.state, ClusterState::Error);
    assert_eq!(stored.version.semantic_version.minor, 29);

    let nodes = orch.store.list_nodes(cluster.id).await.unwrap();
    let version_of = |name: &str| {
        nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.version.clone())
            .unwrap()
    };
    assert_eq!(version_of("ha-control-1"), "v1.30.0");
    assert_eq!(version_of("ha-control-2"), "v1.29.0");
    assert!(orch.cloud.attached.lock().unwrap().is_empty());
}

/// Story: A routine minor upgrade moves the whole cluster
#[tokio::test(start_paused = true)]
async fn story_minor_upgrade_moves_every_node() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("patch")).await;

    let upgraded = upgrade_cluster(&orch.ctx, cluster.id, UpgradeRequest { version: version(30) })
        .await
        .unwrap();
    assert_eq!(upgraded.state, ClusterState::Running);
    assert_eq!(upgraded.version.id, "k8s-1.30");

    let nodes = orch.store.list_nodes(cluster.id).await.unwrap();
    assert!(nodes.iter().all(|n| n.version == "v1.30.0"));
}

// =============================================================================
// Power and membership
// =============================================================================

/// Story: A stopped cluster comes back with its rules intact
#[tokio::test(start_paused = true)]
async fn story_stop_then_start() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("night")).await;
    let rules = orch.cloud.rule_count();

    let stopped = stop_cluster(&orch.ctx, cluster.id).await.unwrap();
    assert_eq!(stopped.state, ClusterState::Stopped);
    assert!(orch
        .cloud
        .instances
        .lock()
        .unwrap()
        .values()
        .all(|i| i.state == PowerState::Stopped));

    let started = start_cluster(&orch.ctx, cluster.id).await.unwrap();
    assert_eq!(started.state, ClusterState::Running);
    assert_eq!(orch.cloud.rule_count(), rules);
}

/// Story: A tenant brings their own instance into the cluster
#[tokio::test(start_paused = true)]
async fn story_external_worker_joins() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("byo")).await;
    orch.cloud.instances.lock().unwrap().insert(
        "tenant-vm".to_string(),
        InstanceInfo {
            id: "tenant-vm".to_string(),
            name: "gpu-box".to_string(),
            network_id: "net-1".to_string(),
            private_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200))),
            state: PowerState::Running,
        },
    );

    let outcome = add_nodes(
        &orch.ctx,
        cluster.id,
        vec![
            ExternalNode {
                instance_id: "tenant-vm".to_string(),
                login_user: Some("ubuntu".to_string()),
            },
            ExternalNode {
                instance_id: "no-such-vm".to_string(),
                login_user: None,
            },
        ],
    )
    .await
    .unwrap();

    assert_eq!(outcome.cluster.state, ClusterState::Running);
    assert_eq!(outcome.changed.len(), 1);
    assert!(outcome.changed[0].is_external);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].instance_id, "no-such-vm");

    // Reachable over SSH like any other member, but not counted as capacity
    assert_eq!(orch.cloud.ssh_range(), Some((2222, 2225)));
    assert_eq!(outcome.cluster.node_count, 4);
    assert_eq!(outcome.cluster.cores, 6);
}

// =============================================================================
// Destroy
// =============================================================================

/// Story: One instance refuses to go away during destroy
///
/// The destroy stops short of the rules and the record, flags the cluster
/// for garbage collection, and a later collection pass finishes the job.
#[tokio::test(start_paused = true)]
async fn story_stuck_instance_defers_destroy_to_gc() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("gone")).await;
    orch.cloud
        .undeletable
        .lock()
        .unwrap()
        .push("vm-2".to_string());

    let err = destroy_cluster(&orch.ctx, cluster.id, DestroyRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProvisioningFailure { .. }), "{err}");

    let stored = orch.store.get_cluster(cluster.id).await.unwrap();
    assert_eq!(stored.state, ClusterState::Error);
    assert!(stored.gc_pending);
    assert_eq!(orch.store.list_nodes(cluster.id).await.unwrap().len(), 3);
    assert_eq!(orch.cloud.instance_count(), 1);

    orch.cloud.undeletable.lock().unwrap().clear();
    let report = collect_garbage(&orch.ctx).await.unwrap();
    assert_eq!(report.collected, [cluster.id]);
    assert!(report.failed.is_empty());

    assert!(orch.store.get_cluster(cluster.id).await.is_err());
    assert_eq!(orch.store.get_any(cluster.id).unwrap().state, ClusterState::Destroyed);
    assert_eq!(orch.cloud.instance_count(), 0);
    assert_eq!(orch.cloud.rule_count(), 0);
}

/// Story: Destroying with network cleanup removes the network too
#[tokio::test(start_paused = true)]
async fn story_destroy_with_network_cleanup() {
    let orch = Orchestrator::new(Cloud::isolated(plenty()));
    let cluster = running(&orch, tenant_cluster("tidy")).await;

    let destroyed = destroy_cluster(
        &orch.ctx,
        cluster.id,
        DestroyRequest {
            cleanup_network: true,
        },
    )
    .await
    .unwrap();

    assert_eq!(destroyed.state, ClusterState::Destroyed);
    assert!(orch.cloud.network.lock().unwrap().is_none());
    assert_eq!(orch.store.node_record_count(), 0);
}
