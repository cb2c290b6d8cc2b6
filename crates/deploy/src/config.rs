//! Configuration file and secrets.
//!
//! The configuration is read from `proxykit.toml` merged with `PROXYKIT_`-prefixed
//! environment variables. Secrets are kept out of the file and handed in explicitly.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{DeployError, DeployResult};

/// The default name of the configuration file.
pub const CONFIG_FILENAME: &str = "proxykit.toml";

/// Prefix of environment variables that override configuration keys.
pub const ENV_PREFIX: &str = "PROXYKIT_";

/// Name of the network that is always available unless overridden.
pub const LOCAL_NETWORK: &str = "local";

/// First well-known development key of anvil and hardhat node.
pub const DEV_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

/// Connection settings of a single network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint. May contain a `{rpc_key}` placeholder.
    pub rpc_url: String,
    /// Expected chain identifier.
    pub chain_id: u64,
    /// Whether this is a local development chain. Local chains may carry inline keys.
    #[serde(default)]
    pub local: bool,
    /// Inline signer keys, only honoured for local networks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
}

impl NetworkConfig {
    pub fn local_default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545/".to_string(),
            chain_id: 31337,
            local: true,
            accounts: vec![DEV_PRIVATE_KEY.to_string()],
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxykitConfig {
    /// Root directory of the deployment registry.
    pub registry_dir: PathBuf,
    /// Root directory scanned for build artifacts.
    pub artifacts_dir: PathBuf,
    /// Artifact name of the ERC-1967 proxy contract.
    pub proxy_artifact: String,
    /// How long to wait for a receipt before giving up.
    pub confirmation_timeout_secs: u64,
    /// Interval between receipt polls.
    pub poll_interval_ms: u64,
    /// Retries for transient network failures.
    pub max_retries: usize,
    /// First backoff delay between retries; doubles on each attempt.
    pub retry_delay_ms: u64,
    /// Known networks, by name.
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Explicit artifact names: `contracts.<name>.<version> = "<artifact>"`.
    #[serde(default)]
    pub contracts: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ProxykitConfig {
    fn default() -> Self {
        Self {
            registry_dir: PathBuf::from("deployments"),
            artifacts_dir: PathBuf::from("out"),
            proxy_artifact: "ERC1967Proxy".to_string(),
            confirmation_timeout_secs: 120,
            poll_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 500,
            networks: BTreeMap::from([(LOCAL_NETWORK.to_string(), NetworkConfig::local_default())]),
            contracts: BTreeMap::new(),
        }
    }
}

impl ProxykitConfig {
    /// Load the configuration from a file (or a directory holding `proxykit.toml`),
    /// layered over the defaults and under `PROXYKIT_` environment overrides.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load(path: &Path) -> DeployResult<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&[
                "CONFIG",
                "VERBOSITY",
                "RPC_KEY",
                "PRIVATE_KEY",
                "VERIFIER_KEY",
            ]))
            .extract()
            .map_err(|e| {
                DeployError::Config(format!(
                    "failed to load configuration from {}: {e}",
                    config_path.display()
                ))
            })?;

        tracing::debug!(path = %config_path.display(), networks = config.networks.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string, layered over the defaults.
    pub fn from_toml_str(content: &str) -> DeployResult<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| DeployError::Config(format!("failed to parse configuration: {e}")))
    }

    /// Save the configuration as TOML.
    pub fn save_to_file(&self, path: &Path) -> DeployResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DeployError::Config(format!("failed to serialize configuration: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            DeployError::Config(format!("failed to write {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Credentials that never live in the configuration file.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    /// RPC provider credential, substituted into `{rpc_key}`.
    pub rpc_key: Option<String>,
    /// Signer private key for non-local networks.
    pub private_key: Option<String>,
    /// Block-explorer verification credential.
    pub verifier_key: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Secrets")
            .field("rpc_key", &redact(&self.rpc_key))
            .field("private_key", &redact(&self.private_key))
            .field("verifier_key", &redact(&self.verifier_key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_defaults_include_local_network() {
        let config = ProxykitConfig::default();
        let local = &config.networks[LOCAL_NETWORK];
        assert!(local.local);
        assert_eq!(local.chain_id, 31337);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = ProxykitConfig::from_toml_str(
            r#"
            artifacts_dir = "artifacts"
            confirmation_timeout_secs = 30

            [networks.goerli]
            rpc_url = "https://goerli.infura.io/v3/{rpc_key}"
            chain_id = 5

            [contracts.Token]
            v1 = "CustomERC721UpgradeableV1"
            "#,
        )
        .unwrap();

        assert_eq!(config.artifacts_dir, PathBuf::from("artifacts"));
        assert_eq!(config.confirmation_timeout_secs, 30);
        assert!(config.networks.contains_key(LOCAL_NETWORK));
        assert!(!config.networks["goerli"].local);
        assert_eq!(config.contracts["Token"]["v1"], "CustomERC721UpgradeableV1");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new("proxykit-config").unwrap();
        let path = temp_dir.path().join(CONFIG_FILENAME);

        let mut config = ProxykitConfig::default();
        config.max_retries = 7;
        config.save_to_file(&path).unwrap();

        let loaded = ProxykitConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.max_retries, 7);
        assert_eq!(loaded.networks, config.networks);
    }

    #[test]
    fn test_secrets_debug_is_redacted() {
        let secrets = Secrets {
            private_key: Some("0xdeadbeef".to_string()),
            ..Default::default()
        };
        let debug = format!("{secrets:?}");
        assert!(!debug.contains("deadbeef"));
        assert!(debug.contains("<redacted>"));
    }
}
