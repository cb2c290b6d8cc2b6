use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use proxykit_deploy::{Secrets, config::CONFIG_FILENAME};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "proxykit")]
#[command(
    author,
    version,
    about = "Deploy and upgrade proxied contracts across networks"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "PROXYKIT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or a directory holding `proxykit.toml`.
    #[arg(long, alias = "conf", env = "PROXYKIT_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Print results and errors as JSON on stdout.
    #[arg(long, env = "PROXYKIT_JSON")]
    pub json: bool,

    #[clap(flatten)]
    pub secrets: SecretArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Credentials. Only read from the environment so they stay out of shell history.
#[derive(Clone, Args)]
pub struct SecretArgs {
    /// RPC provider credential, substituted into `{rpc_key}` of a network's `rpc_url`.
    #[arg(long, env = "PROXYKIT_RPC_KEY", hide_env_values = true, hide = true)]
    pub rpc_key: Option<String>,

    /// Private key of the signer for non-local networks.
    #[arg(long, env = "PROXYKIT_PRIVATE_KEY", hide_env_values = true, hide = true)]
    pub private_key: Option<String>,

    /// Block-explorer verification credential.
    #[arg(long, env = "PROXYKIT_VERIFIER_KEY", hide_env_values = true, hide = true)]
    pub verifier_key: Option<String>,
}

impl From<SecretArgs> for Secrets {
    fn from(args: SecretArgs) -> Self {
        Self {
            rpc_key: args.rpc_key,
            private_key: args.private_key,
            verifier_key: args.verifier_key,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy a contract behind a new proxy and run its initializer.
    Deploy {
        #[arg(short, long)]
        network: String,

        #[arg(short, long)]
        contract: String,

        /// Version tag of the implementation, e.g. `v1`.
        #[arg(long = "version", id = "contract_version")]
        version: String,

        /// Initializer arguments as JSON: an array (positional) or an object (by name).
        #[arg(long, default_value = "[]")]
        init_args: String,

        /// Name of the initializer function.
        #[arg(long, default_value = proxykit_deploy::DEFAULT_INITIALIZER)]
        initializer: String,
    },

    /// Upgrade a recorded proxy to a new implementation version.
    Upgrade {
        #[arg(short, long)]
        network: String,

        #[arg(short, long)]
        proxy: Address,

        #[arg(short, long)]
        contract: String,

        /// Version tag of the new implementation.
        #[arg(long = "version", id = "contract_version")]
        version: String,
    },

    /// Show the latest deployment record of a contract.
    Latest(RegistryKey),

    /// Show every deployment and upgrade of a contract.
    History(RegistryKey),

    /// List the contracts recorded on a network.
    Contracts {
        #[arg(short, long)]
        network: String,
    },

    /// List the signer accounts of a network.
    Accounts {
        #[arg(short, long)]
        network: String,
    },

    /// Check offline whether one version can replace another without corrupting storage.
    CheckLayout {
        #[arg(short, long)]
        contract: String,

        /// The version currently deployed.
        #[arg(long)]
        from: String,

        /// The upgrade candidate.
        #[arg(long)]
        to: String,
    },

    /// Write the default configuration to the `--config` path.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Args)]
pub struct RegistryKey {
    #[arg(short, long)]
    pub network: String,

    #[arg(short, long)]
    pub contract: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upgrade() {
        let cli = Cli::try_parse_from([
            "proxykit",
            "--json",
            "upgrade",
            "--network",
            "goerli",
            "--proxy",
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "--contract",
            "Token",
            "--version",
            "v2",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Command::Upgrade {
                network,
                proxy,
                contract,
                version,
            } => {
                assert_eq!(network, "goerli");
                assert_eq!(
                    proxy,
                    "0x5FbDB2315678afecb367f032d93F642f64180aa3"
                        .parse::<Address>()
                        .unwrap()
                );
                assert_eq!(contract, "Token");
                assert_eq!(version, "v2");
            }
            _ => panic!("expected upgrade"),
        }
    }

    #[test]
    fn test_deploy_defaults() {
        let cli = Cli::try_parse_from([
            "proxykit", "deploy", "-n", "local", "-c", "Token", "--version", "v1",
        ])
        .unwrap();

        match cli.command {
            Command::Deploy {
                init_args,
                initializer,
                ..
            } => {
                assert_eq!(init_args, "[]");
                assert_eq!(initializer, "initialize");
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_parse_contracts_and_init() {
        let cli = Cli::try_parse_from(["proxykit", "contracts", "-n", "goerli"]).unwrap();
        assert!(matches!(cli.command, Command::Contracts { network } if network == "goerli"));

        let cli = Cli::try_parse_from(["proxykit", "--config", "deploy", "init", "--force"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("deploy"));
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn test_rejects_malformed_proxy_address() {
        let result = Cli::try_parse_from([
            "proxykit", "upgrade", "-n", "local", "-p", "0x1234", "-c", "Token", "--version",
            "v2",
        ]);
        assert!(result.is_err());
    }
}
