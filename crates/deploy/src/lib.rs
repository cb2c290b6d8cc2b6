//! proxykit-deploy - Deployment and upgrade orchestration for upgradeable contracts.
//!
//! This crate deploys versioned implementations behind ERC-1967 (UUPS) proxies, runs their
//! initializer exactly once, upgrades them after checking storage-layout compatibility, and
//! keeps an append-only registry of what is deployed where.

mod error;
pub use error::{DeployError, DeployResult, ErrorKind, SideEffects, Step};

pub mod config;
pub use config::{NetworkConfig, ProxykitConfig, Secrets};

pub mod network;
pub use network::{NetworkProfile, NetworkResolver, SignerAccount};

pub mod layout;
pub use layout::{
    LayoutReport, LayoutViolation, StorageLayout, StorageSlot, StorageType, TypeShape,
    check_compatibility,
};

pub mod artifacts;
pub use artifacts::{ArtifactStore, ContractVersion, ImplementationResolver, ProxyArtifact};

mod init_args;
pub use init_args::{DEFAULT_INITIALIZER, InitArgs};

pub mod proxy;

pub mod rpc;
pub use rpc::{ChainProvider, JsonRpcProvider, ProviderError, Receipt};

pub mod signer;
pub use signer::{LocalSigner, TxSigner};

mod tx;
pub use tx::{Transactor, TxSettings};

pub mod registry;
pub use registry::{
    DeploymentRecord, DeploymentRegistry, RegistryEntry, RegistryLease, UpgradeTransaction,
};

mod deployer;
pub use deployer::ProxyDeployer;

mod upgrade;
pub use upgrade::{UpgradeCoordinator, check_upgrade};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
