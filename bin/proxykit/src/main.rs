//! proxykit deploys contracts behind upgradeable proxies and upgrades them safely.

mod cli;

use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result, bail};
use clap::Parser;
use comfy_table::Table;
use serde_json::{Value, json};

use cli::{Cli, Command, RegistryKey};
use proxykit_deploy::{
    DeployError, DeploymentRegistry, ImplementationResolver, InitArgs, JsonRpcProvider,
    LocalSigner, NetworkProfile, NetworkResolver, ProxyDeployer, ProxykitConfig, RegistryEntry,
    Transactor, TxSettings, TxSigner, UpgradeCoordinator, check_upgrade, config::CONFIG_FILENAME,
};

/// What a command prints: JSON for `--json`, text otherwise.
struct Output {
    json: Value,
    human: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger. Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(std::io::stderr)
        .init();

    let json_mode = cli.json;
    let result = run(cli).await;
    match &result {
        Ok(output) => {
            if json_mode {
                println!("{}", json!({ "ok": true, "result": output.json }));
            } else {
                println!("{}", output.human);
            }
        }
        Err(err) => report_error(err, json_mode),
    }
    ExitCode::from(exit_status(&result))
}

/// 0 on success, 1 on any failure.
fn exit_status<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

async fn run(cli: Cli) -> Result<Output> {
    let config = ProxykitConfig::load(&cli.config)?;
    let networks = NetworkResolver::new(&config, cli.secrets.into());
    let registry = DeploymentRegistry::new(&config.registry_dir);

    match cli.command {
        Command::Deploy {
            network,
            contract,
            version,
            init_args,
            initializer,
        } => {
            let init_args: InitArgs = init_args.parse()?;
            let profile = networks.resolve(&network)?;
            let resolver = ImplementationResolver::new(&config)?;
            let implementation = resolver.resolve(&contract, &version)?;
            let proxy = resolver.resolve_proxy()?;

            let deployer = ProxyDeployer::new(connect(&profile, &config).await?, registry, proxy)
                .with_initializer(initializer);
            let record = deployer
                .deploy(&implementation, &init_args, &profile)
                .await?;

            Ok(Output {
                human: format!(
                    "Deployed {} {} on {}\n  proxy:          {}\n  implementation: {}",
                    record.contract,
                    record.version,
                    record.network,
                    record.proxy_address,
                    record.implementation_address
                ),
                json: serde_json::to_value(&record)?,
            })
        }

        Command::Upgrade {
            network,
            proxy,
            contract,
            version,
        } => {
            let profile = networks.resolve(&network)?;
            let resolver = ImplementationResolver::new(&config)?;
            let candidate = resolver.resolve(&contract, &version)?;

            let coordinator =
                UpgradeCoordinator::new(connect(&profile, &config).await?, registry, resolver);
            let upgrade = coordinator.upgrade(proxy, &candidate, &profile).await?;

            let mut human = format!(
                "Upgraded {} on {} from {} to {}\n  proxy:          {}\n  implementation: {}",
                contract,
                network,
                upgrade.from_version,
                upgrade.to_version,
                upgrade.proxy_address,
                upgrade.new_implementation_address
            );
            for slot in &upgrade.compatibility.appended {
                human.push_str(&format!("\n  appended: {slot}"));
            }
            Ok(Output {
                human,
                json: serde_json::to_value(&upgrade)?,
            })
        }

        Command::Latest(RegistryKey { network, contract }) => {
            let record = registry.latest(&network, &contract)?;
            Ok(Output {
                human: format!(
                    "{} {} on {}\n  proxy:          {}\n  implementation: {}\n  init args hash: {}\n  recorded:       {}",
                    record.contract,
                    record.version,
                    record.network,
                    record.proxy_address,
                    record.implementation_address,
                    record.init_args_hash,
                    format_timestamp(record.timestamp)
                ),
                json: serde_json::to_value(&record)?,
            })
        }

        Command::History(RegistryKey { network, contract }) => {
            let history = registry.history(&network, &contract)?;
            if history.is_empty() {
                return Err(DeployError::NotFound { network, contract }.into());
            }

            let mut table = Table::new();
            table.set_header(vec!["#", "kind", "version", "implementation", "recorded"]);
            for (index, entry) in history.iter().enumerate() {
                let kind = match entry {
                    RegistryEntry::Deploy { .. } => "deploy",
                    RegistryEntry::Upgrade { .. } => "upgrade",
                };
                let record = entry.record();
                table.add_row(vec![
                    index.to_string(),
                    kind.to_string(),
                    record.version.clone(),
                    record.implementation_address.to_string(),
                    format_timestamp(record.timestamp),
                ]);
            }

            Ok(Output {
                human: format!("{contract} on {network}\n{table}"),
                json: serde_json::to_value(&history)?,
            })
        }

        Command::Contracts { network } => {
            let contracts = registry.contracts(&network)?;
            Ok(Output {
                human: if contracts.is_empty() {
                    format!("No contracts recorded on {network}")
                } else {
                    contracts.join("\n")
                },
                json: json!(contracts),
            })
        }

        Command::Accounts { network } => {
            let profile = networks.resolve(&network)?;
            let addresses: Vec<String> = profile
                .accounts
                .iter()
                .map(|account| account.address.to_string())
                .collect();
            Ok(Output {
                human: addresses.join("\n"),
                json: json!(addresses),
            })
        }

        Command::CheckLayout { contract, from, to } => {
            let resolver = ImplementationResolver::new(&config)?;
            let current = resolver.resolve(&contract, &from)?;
            let candidate = resolver.resolve(&contract, &to)?;
            let report = check_upgrade(&current, &candidate)?;

            let mut human = format!("{contract} {to} is layout-compatible with {from}");
            for slot in &report.appended {
                human.push_str(&format!("\n  appended: {slot}"));
            }
            for (old, new) in &report.renamed {
                human.push_str(&format!("\n  renamed:  {old} -> {new}"));
            }
            Ok(Output {
                human,
                json: serde_json::to_value(&report)?,
            })
        }

        Command::Init { force } => init(&cli.config, force),
    }
}

/// Write the default configuration to `path`, or to `proxykit.toml` inside it when it is a
/// directory.
fn init(path: &Path, force: bool) -> Result<Output> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    };
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }

    ProxykitConfig::default().save_to_file(&path)?;
    Ok(Output {
        human: format!("Wrote default configuration to {}", path.display()),
        json: json!({ "path": path }),
    })
}

/// Connect the network's deployer account to its RPC endpoint.
async fn connect(
    profile: &NetworkProfile,
    config: &ProxykitConfig,
) -> Result<Transactor<JsonRpcProvider, LocalSigner>> {
    let provider = JsonRpcProvider::new(profile.rpc_url.clone())
        .map_err(|e| DeployError::NetworkUnavailable(e.to_string()))?;
    let signer = profile.deployer()?.signer()?;

    tracing::info!(
        network = %profile.name,
        chain_id = profile.chain_id,
        account = %signer.address(),
        "Connecting to network..."
    );
    let transactor = Transactor::connect(provider, signer, profile, TxSettings::from(config))
        .await
        .with_context(|| format!("failed to connect to network `{}`", profile.name))?;
    Ok(transactor)
}

fn format_timestamp(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

fn deploy_error(err: &anyhow::Error) -> Option<&DeployError> {
    err.chain().find_map(|e| e.downcast_ref::<DeployError>())
}

/// The `error` object printed in `--json` mode.
fn error_json(err: &anyhow::Error) -> Value {
    match deploy_error(err) {
        Some(e) => json!({
            "kind": e.kind(),
            "message": format!("{err:#}"),
            "retryable": e.is_retryable(),
            "reconcile": e.requires_reconciliation(),
            "step": e.step(),
            "side_effects": e.side_effects(),
        }),
        None => json!({
            "kind": "internal",
            "message": format!("{err:#}"),
            "retryable": false,
            "reconcile": false,
            "step": null,
            "side_effects": {},
        }),
    }
}

fn report_error(err: &anyhow::Error, json_mode: bool) {
    if json_mode {
        println!("{}", json!({ "ok": false, "error": error_json(err) }));
        return;
    }

    match deploy_error(err) {
        Some(e) => eprintln!("error[{}]: {err:#}", e.kind()),
        None => eprintln!("error: {err:#}"),
    }
}
