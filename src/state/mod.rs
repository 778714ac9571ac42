//! Cluster state machine
//!
//! [`next_state`] is the authoritative transition table. Workers never
//! assign `ManagedCluster::state` themselves; they call
//! [`ClusterStateMachine::transition`], which persists the new state through
//! the store's compare-and-set primitive. If another worker moved the
//! cluster in the meantime the CAS fails and nothing is mutated.

mod store;

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{ClusterEvent, ClusterState, ManagedCluster};
use crate::Error;

pub use store::{ClusterStore, InMemoryClusterStore, TransitionRecord};

#[cfg(test)]
pub use store::MockClusterStore;

/// Target state for `event` fired in `state`, or `None` if not allowed
pub fn next_state(state: ClusterState, event: ClusterEvent) -> Option<ClusterState> {
    use ClusterEvent as E;
    use ClusterState as S;

    let next = match (state, event) {
        (S::Created, E::StartRequested) => S::Starting,
        (S::Starting, E::OperationSucceeded) => S::Running,
        (S::Starting, E::CreateFailed) => S::Error,
        (S::Starting, E::OperationFailed) => S::Alert,

        (S::Running, E::StopRequested) => S::Stopping,
        (S::Stopping, E::OperationSucceeded) => S::Stopped,
        (S::Stopping, E::OperationFailed) => S::Alert,
        (S::Stopped, E::StartRequested) => S::Starting,

        (S::Running | S::Alert, E::ScaleUpRequested)
        | (S::Running | S::Alert, E::ScaleDownRequested)
        | (S::Running | S::Alert, E::AutoscaleRequested) => S::Scaling,
        (S::Scaling, E::OperationSucceeded) => S::Running,
        (S::Scaling, E::OperationFailed) => S::Alert,

        (S::Running, E::UpgradeRequested) => S::Upgrading,
        (S::Upgrading, E::OperationSucceeded) => S::Running,
        (S::Upgrading, E::OperationFailed) => S::Error,

        (S::Running, E::FaultsDetected) => S::Alert,
        (S::Alert, E::Recovered) => S::Running,

        (S::Running | S::Stopped | S::Alert | S::Error, E::DestroyRequested) => S::Destroying,
        (S::Destroying, E::OperationSucceeded) => S::Destroyed,
        (S::Destroying, E::OperationFailed) => S::Error,

        _ => return None,
    };
    Some(next)
}

/// Guarded, persisted state transitions
#[derive(Clone)]
pub struct ClusterStateMachine {
    store: Arc<dyn ClusterStore>,
}

impl ClusterStateMachine {
    /// Create a state machine persisting through `store`
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    /// Check that `event` is allowed in the cluster's current state
    pub fn check(cluster: &ManagedCluster, event: ClusterEvent) -> Result<ClusterState, Error> {
        next_state(cluster.state, event)
            .ok_or_else(|| Error::illegal_transition(cluster.id.to_string(), cluster.state, event))
    }

    /// Fire `event` and persist the resulting state
    ///
    /// On success `cluster.state` and `cluster.message` reflect what was
    /// stored. On failure `cluster` is left untouched.
    pub async fn transition(
        &self,
        cluster: &mut ManagedCluster,
        event: ClusterEvent,
        reason: Option<String>,
    ) -> Result<ClusterState, Error> {
        let from = cluster.state;
        let to = match Self::check(cluster, event) {
            Ok(to) => to,
            Err(e) => {
                warn!(cluster = %cluster.name, state = %from, event = %event, "illegal transition rejected");
                return Err(e);
            }
        };

        let stored = self
            .store
            .transition(cluster.id, from, to, event, reason)
            .await?;

        info!(cluster = %cluster.name, from = %from, to = %to, event = %event, "cluster state changed");
        cluster.state = stored.state;
        cluster.message = stored.message;
        Ok(to)
    }

    /// Record a failure event, logging instead of failing if it is not allowed
    ///
    /// Used on error paths where the original error matters more than a
    /// secondary transition failure.
    pub async fn fail(
        &self,
        cluster: &mut ManagedCluster,
        event: ClusterEvent,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        if let Err(e) = self.transition(cluster, event, Some(reason.clone())).await {
            warn!(cluster = %cluster.name, event = %event, reason = %reason, error = %e, "failed to record failure transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::sample_cluster;

    mod table {
        use super::*;

        /// Story: Creation walks Created -> Starting -> Running
        #[test]
        fn story_create_path() {
            assert_eq!(
                next_state(ClusterState::Created, ClusterEvent::StartRequested),
                Some(ClusterState::Starting)
            );
            assert_eq!(
                next_state(ClusterState::Starting, ClusterEvent::OperationSucceeded),
                Some(ClusterState::Running)
            );
            assert_eq!(
                next_state(ClusterState::Starting, ClusterEvent::CreateFailed),
                Some(ClusterState::Error)
            );
        }

        /// Story: Stop and restart go through Stopping and Starting
        #[test]
        fn story_stop_start_cycle() {
            assert_eq!(
                next_state(ClusterState::Running, ClusterEvent::StopRequested),
                Some(ClusterState::Stopping)
            );
            assert_eq!(
                next_state(ClusterState::Stopping, ClusterEvent::OperationSucceeded),
                Some(ClusterState::Stopped)
            );
            assert_eq!(
                next_state(ClusterState::Stopped, ClusterEvent::StartRequested),
                Some(ClusterState::Starting)
            );
        }

        /// Story: Scaling a degraded cluster is allowed, upgrading it is not
        #[test]
        fn story_alert_cluster_can_scale_but_not_upgrade() {
            assert_eq!(
                next_state(ClusterState::Alert, ClusterEvent::ScaleUpRequested),
                Some(ClusterState::Scaling)
            );
            assert_eq!(
                next_state(ClusterState::Alert, ClusterEvent::UpgradeRequested),
                None
            );
        }

        /// Story: Failed upgrades land in Error, failed scaling in Alert
        #[test]
        fn story_failure_targets_differ_by_workflow() {
            assert_eq!(
                next_state(ClusterState::Upgrading, ClusterEvent::OperationFailed),
                Some(ClusterState::Error)
            );
            assert_eq!(
                next_state(ClusterState::Scaling, ClusterEvent::OperationFailed),
                Some(ClusterState::Alert)
            );
        }

        /// Story: Nothing leaves Destroyed and Destroying only finishes
        #[test]
        fn story_destroy_is_one_way() {
            for state in [
                ClusterState::Running,
                ClusterState::Stopped,
                ClusterState::Alert,
                ClusterState::Error,
            ] {
                assert_eq!(
                    next_state(state, ClusterEvent::DestroyRequested),
                    Some(ClusterState::Destroying)
                );
            }
            assert_eq!(
                next_state(ClusterState::Destroying, ClusterEvent::ScaleUpRequested),
                None
            );
            assert_eq!(
                next_state(ClusterState::Destroyed, ClusterEvent::StartRequested),
                None
            );
        }

        /// Story: Reconciliation flips Running and Alert
        #[test]
        fn story_reconcile_events() {
            assert_eq!(
                next_state(ClusterState::Running, ClusterEvent::FaultsDetected),
                Some(ClusterState::Alert)
            );
            assert_eq!(
                next_state(ClusterState::Alert, ClusterEvent::Recovered),
                Some(ClusterState::Running)
            );
            assert_eq!(next_state(ClusterState::Stopped, ClusterEvent::FaultsDetected), None);
        }
    }

    mod persisted {
        use super::*;

        async fn stored(state: ClusterState) -> (Arc<InMemoryClusterStore>, ManagedCluster) {
            let store = Arc::new(InMemoryClusterStore::new());
            let mut cluster = sample_cluster("sm");
            cluster.state = state;
            store.insert_cluster(&cluster).await.unwrap();
            (store, cluster)
        }

        /// Story: A scale request on a Destroying cluster changes nothing
        #[tokio::test]
        async fn story_scale_during_destroy_is_rejected() {
            let (store, mut cluster) = stored(ClusterState::Destroying).await;
            let sm = ClusterStateMachine::new(store.clone());

            let err = sm
                .transition(&mut cluster, ClusterEvent::ScaleUpRequested, None)
                .await
                .unwrap_err();

            assert!(matches!(err, Error::IllegalStateTransition { .. }));
            assert_eq!(cluster.state, ClusterState::Destroying);
            let persisted = store.get_cluster(cluster.id).await.unwrap();
            assert_eq!(persisted.state, ClusterState::Destroying);
            assert!(store.history(cluster.id).is_empty());
        }

        /// Story: A worker holding a stale copy loses the race
        #[tokio::test]
        async fn story_stale_copy_loses_cas() {
            let (store, cluster) = stored(ClusterState::Running).await;
            let sm = ClusterStateMachine::new(store.clone());

            let mut first = cluster.clone();
            let mut second = cluster.clone();
            sm.transition(&mut first, ClusterEvent::ScaleUpRequested, None)
                .await
                .unwrap();

            let err = sm
                .transition(&mut second, ClusterEvent::StopRequested, None)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::IllegalStateTransition {
                    state: ClusterState::Scaling,
                    ..
                }
            ));
            assert_eq!(second.state, ClusterState::Running);
            assert_eq!(
                store.get_cluster(cluster.id).await.unwrap().state,
                ClusterState::Scaling
            );
        }

        /// Story: Failure reasons are persisted with the transition
        #[tokio::test]
        async fn story_failure_reason_is_recorded() {
            let (store, mut cluster) = stored(ClusterState::Starting).await;
            let sm = ClusterStateMachine::new(store.clone());

            sm.fail(&mut cluster, ClusterEvent::CreateFailed, "no capacity")
                .await;

            assert_eq!(cluster.state, ClusterState::Error);
            assert_eq!(cluster.message.as_deref(), Some("no capacity"));
            let history = store.history(cluster.id);
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].event, ClusterEvent::CreateFailed);
        }

        /// Story: Persistence errors surface unchanged
        #[tokio::test]
        async fn story_store_failure_propagates() {
            let mut mock = MockClusterStore::new();
            mock.expect_transition()
                .returning(|_, _, _, _, _| Err(Error::persistence("db down")));
            let sm = ClusterStateMachine::new(Arc::new(mock));

            let mut cluster = sample_cluster("sm");
            cluster.state = ClusterState::Running;
            let err = sm
                .transition(&mut cluster, ClusterEvent::StopRequested, None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Persistence { .. }));
            assert_eq!(cluster.state, ClusterState::Running);
        }
    }
}
