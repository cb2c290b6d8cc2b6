//! Proxy deployment.
//!
//! A deployment is two transactions issued in order by the same signer: the implementation,
//! then the proxy pointing at it. The proxy constructor runs the initializer, so no one can
//! initialize the proxy between its creation and ours. The record is only written once the
//! proxy creation is confirmed and the proxy reports the new implementation.

use alloy_core::primitives::Address;

use crate::{
    DeployError, DeployResult, SideEffects, Step,
    artifacts::{ContractVersion, ProxyArtifact},
    init_args::{DEFAULT_INITIALIZER, InitArgs},
    network::NetworkProfile,
    proxy::{IMPLEMENTATION_SLOT, implementation_from_slot, proxy_creation_code},
    registry::{DeploymentRecord, DeploymentRegistry, RegistryEntry, unix_now},
    rpc::ChainProvider,
    signer::TxSigner,
    tx::Transactor,
};

/// What may exist on-chain after `err`, given the contracts known to have landed.
pub(crate) fn landed(
    err: &DeployError,
    implementation: Option<Address>,
    proxy: Option<Address>,
) -> SideEffects {
    let pending_tx = match err.root() {
        DeployError::Timeout { tx_hash, .. } => Some(*tx_hash),
        _ => None,
    };
    SideEffects {
        implementation,
        proxy,
        pending_tx,
        upgraded_proxy: None,
    }
}

/// Fail unless the operation runs against the network the transactor is connected to.
pub(crate) fn ensure_same_chain<P: ChainProvider, S: TxSigner>(
    transactor: &Transactor<P, S>,
    network: &NetworkProfile,
) -> DeployResult<()> {
    if transactor.chain_id() != network.chain_id {
        return Err(DeployError::Config(format!(
            "network `{}` is chain {} but the signer is connected to chain {}",
            network.name,
            network.chain_id,
            transactor.chain_id()
        )));
    }
    Ok(())
}

/// Deploys a proxy with its first implementation, initializing it in the same transaction.
pub struct ProxyDeployer<P, S> {
    transactor: Transactor<P, S>,
    registry: DeploymentRegistry,
    proxy: ProxyArtifact,
    initializer: String,
}

impl<P: ChainProvider, S: TxSigner> ProxyDeployer<P, S> {
    pub fn new(
        transactor: Transactor<P, S>,
        registry: DeploymentRegistry,
        proxy: ProxyArtifact,
    ) -> Self {
        Self {
            transactor,
            registry,
            proxy,
            initializer: DEFAULT_INITIALIZER.to_string(),
        }
    }

    /// Use `name` instead of `initialize` as the initializer.
    pub fn with_initializer(mut self, name: impl Into<String>) -> Self {
        self.initializer = name.into();
        self
    }

    pub fn transactor(&self) -> &Transactor<P, S> {
        &self.transactor
    }

    /// Deploy `contract` behind a new proxy on `network` and record it.
    ///
    /// Holds the registry lease for the contract for the whole operation. A failure after
    /// the first transaction is a [`DeployError::StepFailed`] naming the step and the
    /// contracts already on-chain.
    pub async fn deploy(
        &self,
        contract: &ContractVersion,
        init_args: &InitArgs,
        network: &NetworkProfile,
    ) -> DeployResult<DeploymentRecord> {
        ensure_same_chain(&self.transactor, network)?;
        let lease = self.registry.lease(&network.name, &contract.name)?;

        match self.registry.latest(&network.name, &contract.name) {
            Ok(existing) => {
                return Err(DeployError::AlreadyDeployed {
                    network: network.name.clone(),
                    contract: contract.name.clone(),
                    proxy: existing.proxy_address,
                });
            }
            Err(DeployError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        // Encoding problems surface before anything is sent.
        let init_data = init_args.encode_call(&contract.abi, &self.initializer)?;

        tracing::info!(
            network = %network.name,
            contract = %contract.name,
            version = %contract.version,
            artifact = %contract.artifact,
            deployer = %self.transactor.account(),
            "Deploying implementation..."
        );
        let implementation = self
            .transactor
            .create(contract.bytecode.clone())
            .await
            .map_err(|e| {
                let effects = landed(&e, None, None);
                e.at_step(Step::DeployImplementation, effects)
            })?;
        tracing::info!(%implementation, "Implementation deployed");

        tracing::info!(initializer = %self.initializer, "Deploying and initializing proxy...");
        let proxy = self
            .transactor
            .create(proxy_creation_code(&self.proxy.bytecode, implementation, init_data))
            .await
            .map_err(|e| {
                let effects = landed(&e, Some(implementation), None);
                match e {
                    // A reverted proxy creation is the initializer reverting in the constructor.
                    DeployError::TransactionReverted { reason } => {
                        DeployError::InitializerRevert { reason }.at_step(Step::Initialize, effects)
                    }
                    other => other.at_step(Step::DeployProxy, effects),
                }
            })?;
        tracing::info!(%proxy, "Proxy deployed and initialized");

        let observed = self
            .transactor
            .storage_at(proxy, IMPLEMENTATION_SLOT)
            .await
            .map(implementation_from_slot)
            .and_then(|observed| {
                if observed == implementation {
                    Ok(observed)
                } else {
                    Err(DeployError::DeploymentVerification {
                        proxy,
                        expected: implementation,
                        observed,
                    })
                }
            })
            .map_err(|e| {
                let effects = landed(&e, Some(implementation), Some(proxy));
                e.at_step(Step::VerifyDeployment, effects)
            })?;

        let record = DeploymentRecord {
            network: network.name.clone(),
            contract: contract.name.clone(),
            proxy_address: proxy,
            implementation_address: observed,
            version: contract.version.clone(),
            init_args_hash: init_args.hash(),
            timestamp: unix_now(),
        };

        self.registry
            .append(&lease, &RegistryEntry::Deploy {
                record: record.clone(),
            })
            .map_err(|e| {
                let effects = landed(&e, Some(implementation), Some(proxy));
                e.at_step(Step::RecordDeployment, effects)
            })?;

        tracing::info!(
            network = %record.network,
            contract = %record.contract,
            proxy = %record.proxy_address,
            implementation = %record.implementation_address,
            version = %record.version,
            "Deployment complete"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorKind,
        test_utils::{MockChain, deploy_fixture},
    };
    use tempdir::TempDir;

    #[tokio::test]
    async fn test_deploy_records_proxy_and_implementation() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();

        assert_ne!(record.implementation_address, record.proxy_address);
        assert_eq!(record.version, "v1");
        assert_eq!(record.init_args_hash, fixture.init_args.hash());
        assert_eq!(fixture.registry.latest("local", "Token").unwrap(), record);
        assert_eq!(
            fixture.chain.implementation_of(record.proxy_address),
            Some(record.implementation_address)
        );
        assert_eq!(
            fixture.chain.owner_of(record.proxy_address),
            Some(fixture.deployer.transactor().account())
        );
    }

    #[tokio::test]
    async fn test_proxy_is_initialized_by_its_creation() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;
        let account = fixture.deployer.transactor().account();
        let nonce_before = fixture.chain.nonce(account).await.unwrap();

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();

        // Implementation and proxy creation, nothing else.
        assert_eq!(fixture.chain.nonce(account).await.unwrap(), nonce_before + 2);
        assert_eq!(fixture.chain.owner_of(record.proxy_address), Some(account));

        // Another account cannot take the proxy over afterwards.
        let intruder = crate::test_utils::transactor(
            &fixture.chain,
            &fixture.network,
            crate::test_utils::OTHER_PRIVATE_KEY,
        )
        .await;
        let data = fixture
            .init_args
            .encode_call(&fixture.v1.abi, DEFAULT_INITIALIZER)
            .unwrap();
        let err = intruder
            .execute(Some(record.proxy_address), data)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already initialized"), "{err}");
        assert_eq!(fixture.chain.owner_of(record.proxy_address), Some(account));
    }

    #[tokio::test]
    async fn test_initializer_runs_only_once() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();

        let data = fixture
            .init_args
            .encode_call(&fixture.v1.abi, DEFAULT_INITIALIZER)
            .unwrap();
        let err = fixture
            .deployer
            .transactor()
            .execute(Some(record.proxy_address), data)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already initialized"), "{err}");
    }

    #[tokio::test]
    async fn test_initializer_revert_reports_landed_contracts() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.revert_initializer("Token: invalid base URI");
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InitializerRevert);
        assert_eq!(err.step(), Some(Step::Initialize));
        let effects = err.side_effects();
        assert!(effects.implementation.is_some());
        // The reverted constructor leaves no proxy behind.
        assert!(effects.proxy.is_none());
        assert_eq!(fixture.chain.contract_count(), 1);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid base URI"), "{err}");

        // Nothing is recorded for a failed deployment.
        assert!(matches!(
            fixture.registry.latest("local", "Token"),
            Err(DeployError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_deploy_is_rejected() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let fixture = deploy_fixture(MockChain::new(), temp_dir.path()).await;

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();
        let deployed = fixture.chain.contract_count();

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::AlreadyDeployed { proxy, .. } if proxy == record.proxy_address
        ));
        assert_eq!(fixture.chain.contract_count(), deployed);
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_fatal_before_anything_lands() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.set_balance_exhausted(true);
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(err.step(), Some(Step::DeployImplementation));
        assert!(err.side_effects().is_empty());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.fail_next_sends(2);
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let record = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap();
        assert_eq!(record.version, "v1");
    }

    #[tokio::test]
    async fn test_proxy_reporting_another_implementation_fails_verification() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.report_implementation(Address::repeat_byte(0x42));
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeploymentVerification);
        assert_eq!(err.step(), Some(Step::VerifyDeployment));
        assert!(err.requires_reconciliation());
        assert!(!err.is_retryable());
        assert!(err.side_effects().proxy.is_some());
    }

    #[tokio::test]
    async fn test_read_failure_after_proxy_landed_requires_reconciliation() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.fail_storage_reads(true);
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NetworkUnavailable);
        assert_eq!(err.step(), Some(Step::VerifyDeployment));
        assert!(!err.is_retryable());
        assert!(err.requires_reconciliation());
        assert!(matches!(
            fixture.registry.latest("local", "Token"),
            Err(DeployError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_times_out() {
        let temp_dir = TempDir::new("proxykit-deploy").unwrap();
        let chain = MockChain::new();
        chain.withhold_receipts(true);
        let fixture = deploy_fixture(chain, temp_dir.path()).await;

        let err = fixture
            .deployer
            .deploy(&fixture.v1, &fixture.init_args, &fixture.network)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.requires_reconciliation());
        assert!(err.side_effects().pending_tx.is_some());
    }
}
