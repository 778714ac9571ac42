//! Network rule coordination
//!
//! The coordinator owns every rule tagged with a [`RulePurpose`] on a
//! cluster's network. [`NetworkRuleCoordinator::apply`] reconciles the
//! service against [`desired_rules`]: matching rules are kept, stale ones
//! revoked and missing ones created. Nothing depends on ids remembered from
//! an earlier call, so re-running a half-finished workflow converges.

mod rules;
mod service;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::model::ClusterNode;
use crate::Error;

pub use rules::{
    cluster_access, desired_rules, ssh_span, AclAction, AclEntry, AclEntrySpec, ClusterAccess,
    DesiredRules, FirewallRule, FirewallRuleSpec, LoadBalancerRule, LoadBalancerSpec,
    NetworkInfo, NetworkKind, PortForward, PortForwardSpec, Rule, RulePurpose, RuleSettings,
    SshAccess,
};
pub use service::NetworkRuleService;

#[cfg(test)]
pub use service::MockNetworkRuleService;

/// A rule created during the current call, revoked again on rollback
#[derive(Debug)]
enum Created {
    Firewall(String),
    PortForward(String),
    LoadBalancer(String),
    Acl(String),
}

/// Split existing rules into kept and stale, and list the missing specs
///
/// Each desired spec claims at most one identical existing rule, so
/// duplicates left by an interrupted run are revoked.
fn diff<S: PartialEq + Clone>(existing: Vec<Rule<S>>, desired: &[S]) -> (Vec<S>, Vec<Rule<S>>) {
    let mut unclaimed = existing;
    let mut missing = Vec::new();
    for spec in desired {
        match unclaimed.iter().position(|r| &r.spec == spec) {
            Some(i) => {
                unclaimed.swap_remove(i);
            }
            None => missing.push(spec.clone()),
        }
    }
    (missing, unclaimed)
}

/// Derives and programs the reachability rules of clusters
pub struct NetworkRuleCoordinator {
    service: Arc<dyn NetworkRuleService>,
    settings: RuleSettings,
}

impl NetworkRuleCoordinator {
    /// Create a coordinator
    pub fn new(service: Arc<dyn NetworkRuleService>, settings: RuleSettings) -> Self {
        Self { service, settings }
    }

    /// Ports and sources used for every rule
    pub fn settings(&self) -> &RuleSettings {
        &self.settings
    }

    /// Describe a network
    pub async fn network(&self, network_id: &str) -> Result<NetworkInfo, Error> {
        self.service
            .get_network(network_id)
            .await
            .map_err(|e| rule_error(network_id, "describe network", e))
    }

    /// Bring the network up before any instance is created on it
    pub async fn implement(&self, network_id: &str) -> Result<NetworkInfo, Error> {
        let network = self
            .service
            .implement_network(network_id)
            .await
            .map_err(|e| rule_error(network_id, "implement network", e))?;
        info!(network = %network_id, kind = ?network.kind, public_address = ?network.public_address, "network implemented");
        Ok(network)
    }

    /// Delete the network outright
    pub async fn delete_network(&self, network_id: &str) -> Result<(), Error> {
        self.service
            .delete_network(network_id)
            .await
            .map_err(|e| rule_error(network_id, "delete network", e))
    }

    /// Access paths for the membership, failing if nothing is reachable
    pub fn access(
        &self,
        network: &NetworkInfo,
        members: &[ClusterNode],
    ) -> Result<ClusterAccess, Error> {
        cluster_access(network, members, &self.settings).ok_or_else(|| {
            Error::network_rule(
                &network.id,
                "no public address and no control node address to reach the cluster",
            )
        })
    }

    /// Reconcile the network's rules with the full membership
    ///
    /// Idempotent: a second call with the same inputs changes nothing.
    /// When a create or revoke fails, every rule created by this call is
    /// revoked again before `NetworkRuleFailure` is returned.
    #[instrument(skip(self, network, members), fields(network = %network.id, members = members.len()))]
    pub async fn apply(
        &self,
        network: &NetworkInfo,
        members: &[ClusterNode],
    ) -> Result<ClusterAccess, Error> {
        let desired = desired_rules(network, members, &self.settings);
        let mut created = Vec::new();

        match self.reconcile(network, &desired, &mut created).await {
            Ok(changes) => {
                info!(
                    rules = desired.len(),
                    created = created.len(),
                    revoked = changes,
                    "network rules applied"
                );
                self.access(network, members)
            }
            Err(e) => {
                warn!(error = %e, created = created.len(), "network rule apply failed, rolling back");
                self.rollback(created).await;
                Err(rule_error(&network.id, "apply rules", e))
            }
        }
    }

    async fn reconcile(
        &self,
        network: &NetworkInfo,
        desired: &DesiredRules,
        created: &mut Vec<Created>,
    ) -> Result<usize, Error> {
        let svc = &self.service;
        let mut revoked = 0;

        let (fw_missing, fw_stale) = diff(svc.list_firewall_rules(&network.id).await?, &desired.firewall);
        let (pf_missing, pf_stale) =
            diff(svc.list_port_forwards(&network.id).await?, &desired.port_forwards);
        let (acl_missing, acl_stale) = diff(svc.list_acl_entries(&network.id).await?, &desired.acl);

        // Stale rules go first so a narrowed range never overlaps the wider one
        for rule in fw_stale {
            debug!(purpose = %rule.spec.purpose, start = rule.spec.port_start, end = rule.spec.port_end, "revoking stale firewall rule");
            svc.revoke_firewall_rule(&rule.id).await?;
            revoked += 1;
        }
        for rule in pf_stale {
            debug!(port = rule.spec.public_port, instance = %rule.spec.instance_id, "revoking stale port forward");
            svc.revoke_port_forward(&rule.id).await?;
            revoked += 1;
        }
        for rule in acl_stale {
            svc.revoke_acl_entry(&rule.id).await?;
            revoked += 1;
        }

        for spec in &fw_missing {
            let rule = svc.create_firewall_rule(spec).await?;
            created.push(Created::Firewall(rule.id));
        }
        for spec in &pf_missing {
            let rule = svc.create_port_forward(spec).await?;
            created.push(Created::PortForward(rule.id));
        }
        for spec in &acl_missing {
            let rule = svc.create_acl_entry(spec).await?;
            created.push(Created::Acl(rule.id));
        }

        revoked += self
            .reconcile_load_balancers(network, &desired.load_balancers, created)
            .await?;
        Ok(revoked)
    }

    /// Load balancers are matched by port and get their members updated in
    /// place rather than being recreated
    async fn reconcile_load_balancers(
        &self,
        network: &NetworkInfo,
        desired: &[LoadBalancerSpec],
        created: &mut Vec<Created>,
    ) -> Result<usize, Error> {
        let mut existing = self.service.list_load_balancers(&network.id).await?;
        let mut revoked = 0;

        for spec in desired {
            let found = existing.iter().position(|r| {
                r.spec.purpose == spec.purpose
                    && r.spec.public_port == spec.public_port
                    && r.spec.private_port == spec.private_port
                    && r.spec.address == spec.address
            });
            match found {
                Some(i) => {
                    let rule = existing.swap_remove(i);
                    let mut current = rule.spec.members.clone();
                    current.sort();
                    if current != spec.members {
                        debug!(rule = %rule.id, members = ?spec.members, "updating load balancer members");
                        self.service
                            .set_load_balancer_members(&rule.id, spec.members.clone())
                            .await?;
                    }
                }
                None => {
                    let rule = self.service.create_load_balancer(spec).await?;
                    created.push(Created::LoadBalancer(rule.id));
                }
            }
        }

        for rule in existing {
            self.service.revoke_load_balancer(&rule.id).await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn rollback(&self, created: Vec<Created>) {
        for rule in created.into_iter().rev() {
            let result = match &rule {
                Created::Firewall(id) => self.service.revoke_firewall_rule(id).await,
                Created::PortForward(id) => self.service.revoke_port_forward(id).await,
                Created::LoadBalancer(id) => self.service.revoke_load_balancer(id).await,
                Created::Acl(id) => self.service.revoke_acl_entry(id).await,
            };
            if let Err(e) = result {
                warn!(rule = ?rule, error = %e, "failed to roll back network rule");
            }
        }
    }

    /// Revoke every rule the coordinator owns on the network
    ///
    /// Rules are found by listing, so the call is safe to repeat.
    #[instrument(skip(self, network), fields(network = %network.id))]
    pub async fn revoke_all(&self, network: &NetworkInfo) -> Result<usize, Error> {
        let svc = &self.service;
        let wrap = |e| rule_error(&network.id, "revoke rules", e);
        let mut revoked = 0;

        for rule in svc.list_port_forwards(&network.id).await.map_err(wrap)? {
            svc.revoke_port_forward(&rule.id).await.map_err(wrap)?;
            revoked += 1;
        }
        for rule in svc.list_load_balancers(&network.id).await.map_err(wrap)? {
            svc.revoke_load_balancer(&rule.id).await.map_err(wrap)?;
            revoked += 1;
        }
        for rule in svc.list_firewall_rules(&network.id).await.map_err(wrap)? {
            svc.revoke_firewall_rule(&rule.id).await.map_err(wrap)?;
            revoked += 1;
        }
        for rule in svc.list_acl_entries(&network.id).await.map_err(wrap)? {
            svc.revoke_acl_entry(&rule.id).await.map_err(wrap)?;
            revoked += 1;
        }

        info!(revoked, "network rules revoked");
        Ok(revoked)
    }

    /// Remove one node's rules and shrink the shared ones
    ///
    /// `remaining` is the membership without `released`. The node's port
    /// forwards are revoked; on isolated networks the SSH firewall range is
    /// re-provisioned for the smaller membership and load balancer members
    /// are updated.
    #[instrument(skip(self, network, remaining, released), fields(network = %network.id, node = %released.name))]
    pub async fn release_node(
        &self,
        network: &NetworkInfo,
        remaining: &[ClusterNode],
        released: &ClusterNode,
    ) -> Result<(), Error> {
        let svc = &self.service;
        let wrap = |e| rule_error(&network.id, "release node rules", e);

        for rule in svc.list_port_forwards(&network.id).await.map_err(wrap)? {
            if rule.spec.instance_id == released.instance_id {
                debug!(port = rule.spec.public_port, "revoking node port forward");
                svc.revoke_port_forward(&rule.id).await.map_err(wrap)?;
            }
        }

        if network.kind == NetworkKind::Isolated {
            let desired = desired_rules(network, remaining, &self.settings);
            let existing = svc.list_firewall_rules(&network.id).await.map_err(wrap)?;
            let (missing, stale) = diff(existing, &desired.firewall);
            for rule in stale {
                svc.revoke_firewall_rule(&rule.id).await.map_err(wrap)?;
            }
            for spec in &missing {
                svc.create_firewall_rule(spec).await.map_err(wrap)?;
            }
            let mut created = Vec::new();
            if let Err(e) = self
                .reconcile_load_balancers(network, &desired.load_balancers, &mut created)
                .await
            {
                self.rollback(created).await;
                return Err(wrap(e));
            }
        }
        Ok(())
    }
}

fn rule_error(network_id: &str, action: &str, e: Error) -> Error {
    match e {
        Error::NetworkRuleFailure { .. } => e,
        other => Error::network_rule(network_id, format!("{action}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeRole;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Rule service keeping rules in vectors
    #[derive(Default)]
    struct FakeRules {
        next: AtomicUsize,
        firewall: Mutex<Vec<FirewallRule>>,
        forwards: Mutex<Vec<PortForward>>,
        balancers: Mutex<Vec<LoadBalancerRule>>,
        acl: Mutex<Vec<AclEntry>>,
        fail_forward_port: Option<u16>,
    }

    impl FakeRules {
        fn id(&self) -> String {
            format!("r-{}", self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn count(&self) -> usize {
            self.firewall.lock().unwrap().len()
                + self.forwards.lock().unwrap().len()
                + self.balancers.lock().unwrap().len()
                + self.acl.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NetworkRuleService for FakeRules {
        async fn get_network(&self, _: &str) -> Result<NetworkInfo, Error> {
            Ok(isolated())
        }
        async fn implement_network(&self, _: &str) -> Result<NetworkInfo, Error> {
            Ok(isolated())
        }
        async fn delete_network(&self, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn list_firewall_rules(&self, _: &str) -> Result<Vec<FirewallRule>, Error> {
            Ok(self.firewall.lock().unwrap().clone())
        }
        async fn create_firewall_rule(&self, spec: &FirewallRuleSpec) -> Result<FirewallRule, Error> {
            let rule = Rule { id: self.id(), spec: spec.clone() };
            self.firewall.lock().unwrap().push(rule.clone());
            Ok(rule)
        }
        async fn revoke_firewall_rule(&self, id: &str) -> Result<(), Error> {
            self.firewall.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
        async fn list_port_forwards(&self, _: &str) -> Result<Vec<PortForward>, Error> {
            Ok(self.forwards.lock().unwrap().clone())
        }
        async fn create_port_forward(&self, spec: &PortForwardSpec) -> Result<PortForward, Error> {
            if self.fail_forward_port == Some(spec.public_port) {
                return Err(Error::network_rule(&spec.network_id, "port in use"));
            }
            let rule = Rule { id: self.id(), spec: spec.clone() };
            self.forwards.lock().unwrap().push(rule.clone());
            Ok(rule)
        }
        async fn revoke_port_forward(&self, id: &str) -> Result<(), Error> {
            self.forwards.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
        async fn list_load_balancers(&self, _: &str) -> Result<Vec<LoadBalancerRule>, Error> {
            Ok(self.balancers.lock().unwrap().clone())
        }
        async fn create_load_balancer(
            &self,
            spec: &LoadBalancerSpec,
        ) -> Result<LoadBalancerRule, Error> {
            let rule = Rule { id: self.id(), spec: spec.clone() };
            self.balancers.lock().unwrap().push(rule.clone());
            Ok(rule)
        }
        async fn set_load_balancer_members(
            &self,
            id: &str,
            members: Vec<String>,
        ) -> Result<(), Error> {
            for rule in self.balancers.lock().unwrap().iter_mut() {
                if rule.id == id {
                    rule.spec.members = members.clone();
                }
            }
            Ok(())
        }
        async fn revoke_load_balancer(&self, id: &str) -> Result<(), Error> {
            self.balancers.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
        async fn list_acl_entries(&self, _: &str) -> Result<Vec<AclEntry>, Error> {
            Ok(self.acl.lock().unwrap().clone())
        }
        async fn create_acl_entry(&self, spec: &AclEntrySpec) -> Result<AclEntry, Error> {
            let rule = Rule { id: self.id(), spec: spec.clone() };
            self.acl.lock().unwrap().push(rule.clone());
            Ok(rule)
        }
        async fn revoke_acl_entry(&self, id: &str) -> Result<(), Error> {
            self.acl.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }
    }

    fn settings() -> RuleSettings {
        RuleSettings::from(&crate::config::OrchestratorConfig::default())
    }

    fn isolated() -> NetworkInfo {
        NetworkInfo {
            id: "net-1".to_string(),
            kind: NetworkKind::Isolated,
            public_address: Some("203.0.113.10".parse().unwrap()),
            acl_id: None,
            acl_default_allow: false,
        }
    }

    fn members(workers: u32) -> Vec<ClusterNode> {
        let mut nodes = vec![ClusterNode::new(
            Uuid::nil(),
            "i-0",
            "c-control-1",
            NodeRole::Control,
            0,
            "v1",
        )];
        for w in 1..=workers {
            nodes.push(ClusterNode::new(
                Uuid::nil(),
                format!("i-{w}"),
                format!("c-node-{w}"),
                NodeRole::Worker,
                w,
                "v1",
            ));
        }
        nodes
    }

    fn ssh_range(fake: &FakeRules) -> (u16, u16) {
        let rules = fake.firewall.lock().unwrap();
        let ssh = rules
            .iter()
            .find(|r| r.spec.purpose == RulePurpose::SshAccess)
            .unwrap();
        (ssh.spec.port_start, ssh.spec.port_end)
    }

    /// Story: Applying twice yields the same rule set
    #[tokio::test]
    async fn story_apply_is_idempotent() {
        let fake = Arc::new(FakeRules::default());
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());
        let nodes = members(2);

        coordinator.apply(&isolated(), &nodes).await.unwrap();
        let first = fake.count();
        coordinator.apply(&isolated(), &nodes).await.unwrap();

        assert_eq!(first, 2 + 1 + 3);
        assert_eq!(fake.count(), first);
    }

    /// Story: Growing the cluster re-applies the whole range
    #[tokio::test]
    async fn story_scale_up_widens_range() {
        let fake = Arc::new(FakeRules::default());
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());

        coordinator.apply(&isolated(), &members(1)).await.unwrap();
        assert_eq!(ssh_range(&fake), (2222, 2223));
        coordinator.apply(&isolated(), &members(3)).await.unwrap();
        assert_eq!(ssh_range(&fake), (2222, 2225));
        assert_eq!(fake.firewall.lock().unwrap().len(), 2);
        assert_eq!(fake.forwards.lock().unwrap().len(), 4);
    }

    /// Story: Releasing a node removes its forward and narrows the firewall
    #[tokio::test]
    async fn story_release_node_shrinks_range() {
        let fake = Arc::new(FakeRules::default());
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());
        let nodes = members(2);
        coordinator.apply(&isolated(), &nodes).await.unwrap();

        coordinator
            .release_node(&isolated(), &nodes[..2], &nodes[2])
            .await
            .unwrap();

        assert_eq!(ssh_range(&fake), (2222, 2223));
        let forwards = fake.forwards.lock().unwrap();
        assert_eq!(forwards.len(), 2);
        assert!(forwards.iter().all(|f| f.spec.instance_id != "i-2"));
    }

    /// Story: A failed forward rolls back everything created in the call
    #[tokio::test]
    async fn story_failed_apply_rolls_back_created_rules() {
        let fake = Arc::new(FakeRules {
            fail_forward_port: Some(2224),
            ..Default::default()
        });
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());

        let err = coordinator.apply(&isolated(), &members(2)).await.unwrap_err();

        assert!(matches!(err, Error::NetworkRuleFailure { .. }));
        assert_eq!(fake.count(), 0);
    }

    /// Story: Revoking everything twice is harmless
    #[tokio::test]
    async fn story_revoke_all_is_repeatable() {
        let fake = Arc::new(FakeRules::default());
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());
        coordinator.apply(&isolated(), &members(2)).await.unwrap();

        assert_eq!(coordinator.revoke_all(&isolated()).await.unwrap(), 6);
        assert_eq!(coordinator.revoke_all(&isolated()).await.unwrap(), 0);
        assert_eq!(fake.count(), 0);
    }

    /// Story: Duplicates left by an interrupted run are cleaned up
    #[tokio::test]
    async fn story_duplicate_rules_are_revoked() {
        let fake = Arc::new(FakeRules::default());
        let coordinator = NetworkRuleCoordinator::new(fake.clone(), settings());
        let nodes = members(1);
        coordinator.apply(&isolated(), &nodes).await.unwrap();
        let dup = fake.forwards.lock().unwrap()[0].spec.clone();
        fake.create_port_forward(&dup).await.unwrap();

        coordinator.apply(&isolated(), &nodes).await.unwrap();
        assert_eq!(fake.forwards.lock().unwrap().len(), 2);
    }

    /// Story: Service errors are reported as NetworkRuleFailure
    #[tokio::test]
    async fn story_service_errors_become_rule_failures() {
        let mut mock = MockNetworkRuleService::new();
        mock.expect_implement_network()
            .returning(|_| Err(Error::persistence("api unavailable")));
        let coordinator = NetworkRuleCoordinator::new(Arc::new(mock), settings());

        let err = coordinator.implement("net-9").await.unwrap_err();
        assert!(matches!(err, Error::NetworkRuleFailure { ref network, .. } if network == "net-9"));
    }
}
