//! Proxy upgrades.
//!
//! An upgrade checks the candidate's storage layout against the active version before
//! touching the chain, then deploys the new implementation, redirects the proxy through
//! its own upgrade function and reads the implementation slot back.

use alloy_core::primitives::Address;

use crate::{
    ContractVersion, DeployError, DeployResult, SideEffects, Step,
    artifacts::ImplementationResolver,
    deployer::{ensure_same_chain, landed},
    layout::{LayoutReport, check_compatibility},
    network::NetworkProfile,
    proxy::{IMPLEMENTATION_SLOT, implementation_from_slot, is_authorization_failure, upgrade_calldata},
    registry::{DeploymentRecord, DeploymentRegistry, RegistryEntry, UpgradeTransaction, unix_now},
    rpc::ChainProvider,
    signer::TxSigner,
    tx::Transactor,
};

/// Compare the layouts of two versions of a contract.
///
/// Fails with [`DeployError::StorageLayoutIncompatible`] when `candidate` would corrupt the
/// storage written by `current`.
pub fn check_upgrade(
    current: &ContractVersion,
    candidate: &ContractVersion,
) -> DeployResult<LayoutReport> {
    let report = check_compatibility(&current.layout, &candidate.layout);
    if !report.is_compatible() {
        return Err(DeployError::StorageLayoutIncompatible {
            contract: candidate.name.clone(),
            from: current.version.clone(),
            to: candidate.version.clone(),
            violations: report.violations,
        });
    }

    for (old, new) in &report.renamed {
        tracing::warn!(contract = %candidate.name, from = %old, to = %new, "Storage variable renamed");
    }
    Ok(report)
}

/// Upgrades recorded proxies to new implementations.
pub struct UpgradeCoordinator<P, S> {
    transactor: Transactor<P, S>,
    registry: DeploymentRegistry,
    resolver: ImplementationResolver,
}

impl<P: ChainProvider, S: TxSigner> UpgradeCoordinator<P, S> {
    pub fn new(
        transactor: Transactor<P, S>,
        registry: DeploymentRegistry,
        resolver: ImplementationResolver,
    ) -> Self {
        Self {
            transactor,
            registry,
            resolver,
        }
    }

    pub fn transactor(&self) -> &Transactor<P, S> {
        &self.transactor
    }

    /// Upgrade `proxy` to `candidate` on `network`.
    ///
    /// Everything that can be checked offline or by reading state is checked before the
    /// first transaction; those failures leave no trace on-chain or in the registry.
    pub async fn upgrade(
        &self,
        proxy: Address,
        candidate: &ContractVersion,
        network: &NetworkProfile,
    ) -> DeployResult<UpgradeTransaction> {
        ensure_same_chain(&self.transactor, network)?;
        let lease = self.registry.lease(&network.name, &candidate.name)?;
        let record = self.registry.latest(&network.name, &candidate.name)?;

        if record.proxy_address != proxy {
            return Err(DeployError::ProxyMismatch {
                contract: candidate.name.clone(),
                given: proxy,
                recorded: record.proxy_address,
            });
        }
        if record.version == candidate.version {
            return Err(DeployError::SameVersion {
                contract: candidate.name.clone(),
                version: candidate.version.clone(),
            });
        }

        let current = self.resolver.resolve(&record.contract, &record.version)?;
        let report = check_upgrade(&current, candidate).inspect_err(|e| {
            tracing::warn!(error = %e, "Upgrade rejected by storage layout check");
        })?;

        let active = implementation_from_slot(
            self.transactor.storage_at(proxy, IMPLEMENTATION_SLOT).await?,
        );
        if active != record.implementation_address {
            return Err(DeployError::StateDrift {
                proxy,
                recorded: record.implementation_address,
                observed: active,
            });
        }

        tracing::info!(
            network = %network.name,
            contract = %candidate.name,
            %proxy,
            from = %record.version,
            to = %candidate.version,
            appended = report.appended.len(),
            "Deploying new implementation..."
        );
        let implementation = self
            .transactor
            .create(candidate.bytecode.clone())
            .await
            .map_err(|e| {
                let effects = landed(&e, None, None);
                e.at_step(Step::DeployImplementation, effects)
            })?;
        tracing::info!(%implementation, "Implementation deployed");

        tracing::info!(%proxy, %implementation, "Submitting upgrade...");
        let account = self.transactor.account();
        self.transactor
            .execute(Some(proxy), upgrade_calldata(&current.abi, implementation))
            .await
            .map_err(|e| {
                let effects = landed(&e, Some(implementation), None);
                let e = match e {
                    DeployError::TransactionReverted { reason } if is_authorization_failure(&reason) => {
                        DeployError::UnauthorizedUpgrader {
                            account,
                            proxy,
                            reason,
                        }
                    }
                    other => other,
                };
                e.at_step(Step::SubmitUpgrade, effects)
            })?;

        // From here on the upgrade is confirmed on-chain and must not be replayed.
        let observed = implementation_from_slot(
            self.transactor
                .storage_at(proxy, IMPLEMENTATION_SLOT)
                .await
                .map_err(|e| {
                    let effects = upgraded(&e, implementation, proxy);
                    e.at_step(Step::VerifyUpgrade, effects)
                })?,
        );
        if observed != implementation {
            tracing::warn!(%proxy, expected = %implementation, %observed, "Proxy does not report the new implementation");
            return Err(DeployError::UpgradeVerification {
                proxy,
                expected: implementation,
                observed,
            }
            .at_step(Step::VerifyUpgrade, SideEffects {
                implementation: Some(implementation),
                upgraded_proxy: Some(proxy),
                ..Default::default()
            }));
        }

        let timestamp = unix_now();
        let transaction = UpgradeTransaction {
            from_version: record.version.clone(),
            to_version: candidate.version.clone(),
            proxy_address: proxy,
            new_implementation_address: implementation,
            compatibility: report,
            timestamp,
        };
        let updated = DeploymentRecord {
            implementation_address: implementation,
            version: candidate.version.clone(),
            timestamp,
            ..record
        };

        self.registry
            .append(&lease, &RegistryEntry::Upgrade {
                record: updated,
                transaction: transaction.clone(),
            })
            .map_err(|e| {
                let effects = upgraded(&e, implementation, proxy);
                e.at_step(Step::RecordDeployment, effects)
            })?;

        tracing::info!(
            network = %network.name,
            contract = %candidate.name,
            %proxy,
            %implementation,
            version = %candidate.version,
            "Upgrade complete"
        );
        Ok(transaction)
    }
}

/// What exists on-chain once the upgrade of `proxy` to `implementation` is confirmed.
fn upgraded(err: &DeployError, implementation: Address, proxy: Address) -> SideEffects {
    SideEffects {
        upgraded_proxy: Some(proxy),
        ..landed(err, Some(implementation), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorKind,
        config::DEV_PRIVATE_KEY,
        test_utils::{DeployFixture, MockChain, OTHER_PRIVATE_KEY, deploy_fixture},
    };
    use tempdir::TempDir;

    async fn deployed(chain: MockChain, root: &std::path::Path) -> (DeployFixture, DeploymentRecord) {
        let fixture = deploy_fixture(chain, root).await;
        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();
        (fixture, record)
    }

    #[tokio::test]
    async fn test_compatible_upgrade_keeps_proxy_and_moves_implementation() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;

        let transaction = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2"), &fixture.network)
            .await
            .unwrap();

        let after = fixture.registry.latest("local", "Token").unwrap();
        assert_eq!(after.proxy_address, before.proxy_address);
        assert_eq!(after.version, "v2");
        assert_eq!(after.implementation_address, transaction.new_implementation_address);
        assert_ne!(after.implementation_address, before.implementation_address);
        assert_eq!(after.init_args_hash, before.init_args_hash);
        assert_eq!(transaction.from_version, "v1");
        assert_eq!(transaction.compatibility.appended.len(), 1);
        assert_eq!(
            fixture.chain.implementation_of(before.proxy_address),
            Some(after.implementation_address)
        );

        // v2 exposes `upgradeTo`, so the next upgrade takes the other entry point.
        coordinator
            .upgrade(before.proxy_address, &fixture.version("v3"), &fixture.network)
            .await
            .unwrap();
        assert_eq!(fixture.registry.history("local", "Token").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_incompatible_upgrade_has_no_side_effects() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;
        let contracts = fixture.chain.contract_count();

        let err = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2-removed"), &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StorageLayoutIncompatible);
        assert!(err.side_effects().is_empty());
        assert_eq!(fixture.registry.latest("local", "Token").unwrap(), before);
        assert_eq!(fixture.chain.contract_count(), contracts);
    }

    #[tokio::test]
    async fn test_upgrade_by_non_owner_is_unauthorized() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        let coordinator = fixture.coordinator(OTHER_PRIVATE_KEY).await;

        let err = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2"), &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnauthorizedUpgrader);
        assert_eq!(err.step(), Some(Step::SubmitUpgrade));
        assert!(err.side_effects().implementation.is_some());
        assert_eq!(fixture.registry.latest("local", "Token").unwrap(), before);
    }

    #[tokio::test]
    async fn test_unobserved_upgrade_fails_verification() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        fixture.chain.ignore_upgrades(true);
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;

        let err = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2"), &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpgradeVerification);
        assert_eq!(err.step(), Some(Step::VerifyUpgrade));
        assert!(err.requires_reconciliation());
        assert!(!err.is_retryable());
        assert_eq!(fixture.registry.latest("local", "Token").unwrap(), before);
    }

    #[tokio::test]
    async fn test_read_failure_after_upgrade_landed_requires_reconciliation() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        fixture.chain.fail_reads_after_upgrade(true);
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;

        let err = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2"), &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NetworkUnavailable);
        assert_eq!(err.step(), Some(Step::VerifyUpgrade));
        assert!(!err.is_retryable());
        assert!(err.requires_reconciliation());
        let effects = err.side_effects();
        assert_eq!(effects.upgraded_proxy, Some(before.proxy_address));

        // The chain moved on while the registry still records v1.
        let implementation = effects.implementation.unwrap();
        assert_eq!(
            fixture.chain.implementation_of(before.proxy_address),
            Some(implementation)
        );
        assert_eq!(fixture.registry.latest("local", "Token").unwrap(), before);
    }

    #[tokio::test]
    async fn test_drifted_proxy_is_not_upgraded() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let (fixture, before) = deployed(MockChain::new(), temp_dir.path()).await;
        fixture
            .chain
            .set_implementation(before.proxy_address, Address::repeat_byte(0x42));
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;
        let contracts = fixture.chain.contract_count();

        let err = coordinator
            .upgrade(before.proxy_address, &fixture.version("v2"), &fixture.network)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::StateDrift { observed, .. } if observed == Address::repeat_byte(0x42)));
        assert_eq!(fixture.chain.contract_count(), contracts);
    }

    #[tokio::test]
    async fn test_preconditions_against_the_registry() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;
        let coordinator = fixture.coordinator(DEV_PRIVATE_KEY).await;
        let v2 = fixture.version("v2");

        let err = coordinator
            .upgrade(Address::repeat_byte(0x11), &v2, &fixture.network)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();

        let err = coordinator
            .upgrade(Address::repeat_byte(0x11), &v2, &fixture.network)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProxyMismatch);

        let err = coordinator
            .upgrade(record.proxy_address, &fixture.v1, &fixture.network)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SameVersion);
    }

    #[test]
    fn test_check_upgrade_names_versions() {
        let temp_dir = TempDir::new("proxykit-upgrade").unwrap();
        let config = crate::test_utils::write_token_artifacts(temp_dir.path());
        let resolver = ImplementationResolver::new(&config).unwrap();
        let v1 = resolver.resolve("Token", "v1").unwrap();

        assert!(check_upgrade(&v1, &resolver.resolve("Token", "v3").unwrap()).is_ok());

        let err = check_upgrade(&v1, &resolver.resolve("Token", "v2-removed").unwrap()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Token v2-removed"), "{message}");
        assert!(message.contains("baseURI"), "{message}");
    }
}
