//! Network context resolution.
//!
//! Turns a network name into everything an operation needs to talk to that network:
//! endpoint, chain id and the ordered signer accounts. Resolution is a pure lookup over
//! the configuration and secrets it is given.

use std::{collections::BTreeMap, fmt};

use alloy_core::primitives::Address;
use url::Url;

use crate::{
    DeployError, DeployResult,
    config::{NetworkConfig, ProxykitConfig, Secrets},
    signer::{LocalSigner, TxSigner},
};

/// Placeholder in `rpc_url` replaced by the RPC credential.
pub const RPC_KEY_PLACEHOLDER: &str = "{rpc_key}";

/// A signer account of a network. The private key is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SignerAccount {
    pub address: Address,
    private_key: String,
}

impl SignerAccount {
    fn from_private_key(private_key: &str) -> DeployResult<Self> {
        let signer: LocalSigner = private_key.parse()?;
        Ok(Self {
            address: signer.address(),
            private_key: private_key.trim().to_string(),
        })
    }

    /// Build a signer for this account.
    pub fn signer(&self) -> DeployResult<LocalSigner> {
        self.private_key.parse()
    }
}

impl fmt::Debug for SignerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerAccount")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Everything known about a network for the duration of a run.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: String,
    pub rpc_url: Url,
    pub chain_id: u64,
    pub local: bool,
    /// Signer accounts; the first one is the deployer.
    pub accounts: Vec<SignerAccount>,
    pub verifier_key: Option<String>,
}

impl NetworkProfile {
    /// The account that signs deploy and upgrade transactions.
    pub fn deployer(&self) -> DeployResult<&SignerAccount> {
        self.accounts.first().ok_or_else(|| {
            DeployError::Config(format!("network `{}` has no signer accounts", self.name))
        })
    }
}

impl fmt::Debug for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkProfile")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("local", &self.local)
            .field("accounts", &self.accounts)
            .finish_non_exhaustive()
    }
}

/// Resolves network names against a fixed configuration.
#[derive(Debug, Clone)]
pub struct NetworkResolver {
    networks: BTreeMap<String, NetworkConfig>,
    secrets: Secrets,
}

impl NetworkResolver {
    pub fn new(config: &ProxykitConfig, secrets: Secrets) -> Self {
        Self {
            networks: config.networks.clone(),
            secrets,
        }
    }

    /// Names of all configured networks.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    /// Resolve `name` into a [`NetworkProfile`].
    ///
    /// Fails with [`DeployError::Config`] when the network is unknown, when a non-local
    /// network has no signer key, or when its endpoint needs an RPC credential that is
    /// missing.
    pub fn resolve(&self, name: &str) -> DeployResult<NetworkProfile> {
        let network = self.networks.get(name).ok_or_else(|| {
            DeployError::Config(format!(
                "unknown network `{name}` (known: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;

        let rpc_url = self.rpc_url(name, network)?;
        let accounts = self.accounts(name, network)?;

        Ok(NetworkProfile {
            name: name.to_string(),
            rpc_url,
            chain_id: network.chain_id,
            local: network.local,
            accounts,
            verifier_key: self.secrets.verifier_key.clone(),
        })
    }

    fn rpc_url(&self, name: &str, network: &NetworkConfig) -> DeployResult<Url> {
        let raw = if network.rpc_url.contains(RPC_KEY_PLACEHOLDER) {
            let key = self.secrets.rpc_key.as_deref().ok_or_else(|| {
                DeployError::Config(format!(
                    "network `{name}` needs an RPC credential (PROXYKIT_RPC_KEY)"
                ))
            })?;
            network.rpc_url.replace(RPC_KEY_PLACEHOLDER, key)
        } else {
            network.rpc_url.clone()
        };

        Url::parse(&raw).map_err(|e| {
            DeployError::Config(format!("network `{name}` has an invalid rpc_url: {e}"))
        })
    }

    fn accounts(&self, name: &str, network: &NetworkConfig) -> DeployResult<Vec<SignerAccount>> {
        // A configured key always comes first so it signs on any network.
        let mut keys: Vec<&str> = self.secrets.private_key.iter().map(String::as_str).collect();

        if network.local {
            keys.extend(network.accounts.iter().map(String::as_str));
        } else if !network.accounts.is_empty() {
            tracing::warn!(network = name, "Ignoring inline accounts on a non-local network");
        }

        if keys.is_empty() {
            return Err(DeployError::Config(format!(
                "network `{name}` needs a signer private key (PROXYKIT_PRIVATE_KEY)"
            )));
        }

        keys.into_iter().map(SignerAccount::from_private_key).collect()
    }
}
