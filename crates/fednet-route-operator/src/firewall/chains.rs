//! Firewall chain manager
//!
//! Creates the custom chains, hooks them into the built-in chains and admits
//! the overlay's UDP traffic. Every step is create-if-missing, so it runs on
//! every reconcile.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::iptables::IptablesOps;
use super::{
    append_unique, insert_unique, FirewallError, IptablesRule, CUSTOM_CHAINS, FILTER_TABLE,
    INPUT_CHAIN,
};
use crate::store::RuleStore;

pub struct ChainManager {
    iptables: Arc<dyn IptablesOps>,
    store: Arc<RuleStore>,
    vxlan_port: u16,
}

impl ChainManager {
    pub fn new(iptables: Arc<dyn IptablesOps>, store: Arc<RuleStore>, vxlan_port: u16) -> Self {
        Self {
            iptables,
            store,
            vxlan_port,
        }
    }

    /// Allow rule for inbound overlay (VXLAN) traffic.
    ///
    /// Not tracked per cluster; it goes away with the chain flush at teardown.
    pub fn overlay_rule(&self) -> IptablesRule {
        let port = self.vxlan_port.to_string();
        IptablesRule::new(
            FILTER_TABLE,
            INPUT_CHAIN,
            ["-p", "udp", "-m", "udp", "--dport", port.as_str(), "-j", "ACCEPT"],
        )
    }

    /// Ensure every custom chain exists and is referenced from its built-in
    /// chain. The first failing kernel call aborts the whole step.
    #[instrument(skip(self))]
    pub async fn ensure_chains(&self) -> Result<(), FirewallError> {
        for custom in CUSTOM_CHAINS {
            let chain = custom.chain();
            let wrap = |source| FirewallError::Chain {
                chain: chain.clone(),
                source,
            };

            if !self
                .iptables
                .chain_exists(&chain.table, &chain.name)
                .await
                .map_err(wrap)?
            {
                self.iptables
                    .new_chain(&chain.table, &chain.name)
                    .await
                    .map_err(wrap)?;
                info!(chain = %chain, "Created iptables chain");
            }
            self.store.track_chain(chain.clone()).await;

            let jump = custom.jump_rule();
            if insert_unique(self.iptables.as_ref(), &jump, 1).await? {
                info!(rule = %jump, "Installed chain reference rule");
            }
            self.store.track_chain_ref(jump).await;
        }

        let overlay = self.overlay_rule();
        if append_unique(self.iptables.as_ref(), &overlay).await? {
            info!(rule = %overlay, "Installed overlay allow rule");
        }

        debug!("Custom chains in place");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::iptables::{IptablesError, MockIptablesOps};
    use crate::firewall::{NAT_TABLE, POSTROUTING_CHAIN};
    use crate::testing::FakeIptables;

    fn manager(ipt: Arc<dyn IptablesOps>, store: Arc<RuleStore>) -> ChainManager {
        ChainManager::new(ipt, store, 4789)
    }

    #[tokio::test]
    async fn test_ensure_chains_creates_and_hooks() {
        let ipt = Arc::new(FakeIptables::new());
        let store = Arc::new(RuleStore::new());
        manager(ipt.clone(), store.clone())
            .ensure_chains()
            .await
            .unwrap();

        for custom in CUSTOM_CHAINS {
            assert!(ipt.has_chain(custom.table, custom.name));
        }
        assert_eq!(
            ipt.rules("filter", "INPUT"),
            vec!["-p udp -m udp -j FEDNET-INPUT"]
        );
        assert_eq!(
            ipt.rules("nat", "POSTROUTING"),
            vec!["-j FEDNET-POSTROUTING"]
        );
        assert_eq!(
            ipt.rules("filter", "FEDNET-INPUT"),
            vec!["-p udp -m udp --dport 4789 -j ACCEPT"]
        );
        assert_eq!(store.chains().await.len(), 4);
        assert_eq!(store.chain_refs().await.len(), 4);
    }

    #[tokio::test]
    async fn test_ensure_chains_is_idempotent() {
        let ipt = Arc::new(FakeIptables::new());
        let store = Arc::new(RuleStore::new());
        let chains = manager(ipt.clone(), store.clone());

        chains.ensure_chains().await.unwrap();
        let first = ipt.snapshot();
        chains.ensure_chains().await.unwrap();

        assert_eq!(ipt.snapshot(), first);
        assert_eq!(store.chains().await.len(), 4);
        assert_eq!(store.chain_refs().await.len(), 4);
    }

    #[tokio::test]
    async fn test_jump_rule_goes_to_head_of_builtin() {
        let ipt = Arc::new(FakeIptables::new());
        ipt.seed_rule("filter", "FORWARD", "-j DOCKER-USER");
        let store = Arc::new(RuleStore::new());

        manager(ipt.clone(), store).ensure_chains().await.unwrap();

        assert_eq!(
            ipt.rules("filter", "FORWARD"),
            vec!["-j FEDNET-FORWARD", "-j DOCKER-USER"]
        );
    }

    #[tokio::test]
    async fn test_chain_creation_failure_aborts() {
        let mut ipt = MockIptablesOps::new();
        ipt.expect_chain_exists().times(1).returning(|_, _| Ok(false));
        ipt.expect_new_chain()
            .times(1)
            .returning(|_, _| Err(IptablesError::Command("Permission denied".to_string())));
        ipt.expect_insert().never();
        ipt.expect_append().never();

        let store = Arc::new(RuleStore::new());
        let err = manager(Arc::new(ipt), store.clone())
            .ensure_chains()
            .await
            .unwrap_err();

        match err {
            FirewallError::Chain { chain, .. } => {
                assert_eq!(chain.table, NAT_TABLE);
                assert_eq!(chain.name, POSTROUTING_CHAIN);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.chains().await.is_empty());
    }
}
