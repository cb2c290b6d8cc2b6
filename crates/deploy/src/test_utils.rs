//! In-memory chain and fixtures for exercising deploys and upgrades without a node.
//!
//! [`MockChain`] models just enough of an EVM chain for UUPS proxies: contract addresses
//! derived from sender and nonce, an ERC-1967 implementation slot, a proxy constructor
//! that delegates its init data to the implementation, an initializer that runs once and
//! records the caller as owner, and owner-gated upgrades. Failures can be
//! injected to drive error paths.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use alloy_core::{
    primitives::{Address, B256, Bytes, Selector, TxHash, U64, keccak256},
    sol_types::{Revert, SolCall, SolError, SolValue},
};

use crate::{
    ContractVersion, DeploymentRegistry, ImplementationResolver, InitArgs, LocalSigner,
    NetworkProfile, NetworkResolver, ProxyDeployer, ProxykitConfig, Secrets, Transactor,
    TxSettings, UpgradeCoordinator,
    config::LOCAL_NETWORK,
    proxy::{IMPLEMENTATION_SLOT, upgradeToAndCallCall, upgradeToCall},
    rpc::{CallRequest, ChainProvider, ProviderError, Receipt},
    signer::SignedTx,
};

/// Creation code the mock treats as the ERC-1967 proxy.
pub const PROXY_CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0x52, 0x34, 0x80, 0x15, 0x61];

/// A funded key that never initializes anything in the fixtures.
pub const OTHER_PRIVATE_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

const GAS_PRICE: u128 = 1_000_000_000;

#[derive(Debug, Clone)]
enum Contract {
    Implementation,
    Proxy {
        implementation: Address,
        initialized: bool,
        owner: Option<Address>,
    },
}

#[derive(Debug, Clone)]
struct ChainState {
    chain_id: u64,
    block: u64,
    nonces: HashMap<Address, u64>,
    contracts: HashMap<Address, Contract>,
    receipts: HashMap<TxHash, Receipt>,
    accepted: HashSet<TxHash>,
    initializer: Selector,
    initializer_revert: Option<String>,
    balance_exhausted: bool,
    transient_sends: usize,
    withhold_receipts: bool,
    ignore_upgrades: bool,
    storage_unavailable: bool,
    fail_reads_after_upgrade: bool,
    reported_implementation: Option<Address>,
}

/// Result of executing a message: the created contract, or a revert reason.
type Outcome = Result<Option<Address>, String>;

impl ChainState {
    fn execute(&mut self, from: Address, to: Option<Address>, data: &[u8]) -> Outcome {
        let Some(to) = to else {
            let nonce = self.nonces.get(&from).copied().unwrap_or_default();
            let address = from.create(nonce);
            let constructor_args = data
                .strip_prefix(PROXY_CODE)
                .and_then(|args| <(Address, Bytes)>::abi_decode_params(args, true).ok());
            let contract = match constructor_args {
                Some((implementation, init_data)) => {
                    let mut initialized = false;
                    let mut owner = None;
                    // The constructor delegates `init_data` to the implementation.
                    if init_data.starts_with(self.initializer.as_slice()) {
                        if let Some(reason) = &self.initializer_revert {
                            return Err(reason.clone());
                        }
                        initialized = true;
                        owner = Some(from);
                    }
                    Contract::Proxy {
                        implementation,
                        initialized,
                        owner,
                    }
                }
                None => Contract::Implementation,
            };
            self.contracts.insert(address, contract);
            return Ok(Some(address));
        };

        let contract_addresses: HashSet<Address> = self
            .contracts
            .iter()
            .filter(|(_, c)| matches!(c, Contract::Implementation))
            .map(|(a, _)| *a)
            .collect();

        let Some(Contract::Proxy {
            implementation,
            initialized,
            owner,
        }) = self.contracts.get_mut(&to)
        else {
            return Ok(None);
        };

        let new_implementation = if data.starts_with(&upgradeToCall::SELECTOR) {
            upgradeToCall::abi_decode(data, true)
                .map(|call| Some(call.newImplementation))
                .map_err(|e| e.to_string())?
        } else if data.starts_with(&upgradeToAndCallCall::SELECTOR) {
            upgradeToAndCallCall::abi_decode(data, true)
                .map(|call| Some(call.newImplementation))
                .map_err(|e| e.to_string())?
        } else {
            None
        };

        if let Some(new_implementation) = new_implementation {
            if *owner != Some(from) {
                return Err("Ownable: caller is not the owner".to_string());
            }
            if !contract_addresses.contains(&new_implementation) {
                return Err("ERC1967: new implementation is not a contract".to_string());
            }
            if !self.ignore_upgrades {
                *implementation = new_implementation;
            }
            if self.fail_reads_after_upgrade {
                self.storage_unavailable = true;
            }
            return Ok(None);
        }

        if data.starts_with(self.initializer.as_slice()) {
            if *initialized {
                return Err("Initializable: contract is already initialized".to_string());
            }
            if let Some(reason) = &self.initializer_revert {
                return Err(reason.clone());
            }
            *initialized = true;
            *owner = Some(from);
        }

        Ok(None)
    }

    /// Execute against a copy of the state.
    fn dry_run(&self, request: &CallRequest) -> Outcome {
        self.clone().execute(request.from, request.to, &request.data)
    }
}

fn revert_error(reason: &str) -> ProviderError {
    ProviderError::Rpc {
        code: 3,
        message: format!("execution reverted: {reason}"),
        data: Some(
            Revert {
                reason: reason.to_string(),
            }
            .abi_encode()
            .into(),
        ),
    }
}

/// An in-memory chain. Clones share state.
#[derive(Debug, Clone)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let initializer = Selector::from_slice(&keccak256("initialize(string)")[..4]);

        Self {
            state: Arc::new(Mutex::new(ChainState {
                chain_id: 31337,
                block: 0,
                nonces: HashMap::new(),
                contracts: HashMap::new(),
                receipts: HashMap::new(),
                accepted: HashSet::new(),
                initializer,
                initializer_revert: None,
                balance_exhausted: false,
                transient_sends: 0,
                withhold_receipts: false,
                ignore_upgrades: false,
                storage_unavailable: false,
                fail_reads_after_upgrade: false,
                reported_implementation: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
    }

    /// Make the initializer revert with `reason`.
    pub fn revert_initializer(&self, reason: &str) {
        self.state().initializer_revert = Some(reason.to_string());
    }

    /// Reject every transaction for lack of funds.
    pub fn set_balance_exhausted(&self, exhausted: bool) {
        self.state().balance_exhausted = exhausted;
    }

    /// Accept the next `count` transactions but drop the response, as a flaky endpoint would.
    pub fn fail_next_sends(&self, count: usize) {
        self.state().transient_sends = count;
    }

    /// Keep accepted transactions pending forever.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.state().withhold_receipts = withhold;
    }

    /// Accept upgrade calls without changing the implementation slot.
    pub fn ignore_upgrades(&self, ignore: bool) {
        self.state().ignore_upgrades = ignore;
    }

    /// Make every storage read fail as if the endpoint went away.
    pub fn fail_storage_reads(&self, fail: bool) {
        self.state().storage_unavailable = fail;
    }

    /// Apply the next upgrade, then fail every storage read.
    pub fn fail_reads_after_upgrade(&self, fail: bool) {
        self.state().fail_reads_after_upgrade = fail;
    }

    /// Answer implementation-slot reads of every proxy with `implementation`.
    pub fn report_implementation(&self, implementation: Address) {
        self.state().reported_implementation = Some(implementation);
    }

    /// Point a proxy somewhere else behind the registry's back.
    pub fn set_implementation(&self, proxy: Address, new_implementation: Address) {
        if let Some(Contract::Proxy { implementation, .. }) = self.state().contracts.get_mut(&proxy)
        {
            *implementation = new_implementation;
        }
    }

    pub fn implementation_of(&self, proxy: Address) -> Option<Address> {
        match self.state().contracts.get(&proxy) {
            Some(Contract::Proxy { implementation, .. }) => Some(*implementation),
            _ => None,
        }
    }

    pub fn owner_of(&self, proxy: Address) -> Option<Address> {
        match self.state().contracts.get(&proxy) {
            Some(Contract::Proxy { owner, .. }) => *owner,
            _ => None,
        }
    }

    /// Number of contracts created so far.
    pub fn contract_count(&self) -> usize {
        self.state().contracts.len()
    }
}

impl ChainProvider for MockChain {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(self.state().chain_id)
    }

    async fn nonce(&self, account: Address) -> Result<u64, ProviderError> {
        Ok(self.state().nonces.get(&account).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        Ok(GAS_PRICE)
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, ProviderError> {
        let state = self.state();
        if state.balance_exhausted {
            return Err(ProviderError::rpc(
                -32000,
                "insufficient funds for gas * price + value",
            ));
        }
        state
            .dry_run(request)
            .map(|_| 21_000 + 16 * request.data.len() as u64)
            .map_err(|reason| revert_error(&reason))
    }

    async fn send_transaction(&self, tx: &SignedTx) -> Result<TxHash, ProviderError> {
        // Let other tasks run between submission and inclusion.
        tokio::task::yield_now().await;

        let mut state = self.state();
        if state.accepted.contains(&tx.hash) {
            return Err(ProviderError::rpc(-32000, "already known"));
        }
        if tx.request.chain_id != state.chain_id {
            return Err(ProviderError::rpc(-32000, "invalid chain id for signer"));
        }
        let expected = state.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.request.nonce != expected {
            return Err(ProviderError::rpc(
                -32000,
                format!("nonce mismatch: expected {expected}, got {}", tx.request.nonce),
            ));
        }

        let outcome = state.execute(tx.from, tx.request.to, &tx.request.data);
        state.nonces.insert(tx.from, expected + 1);
        state.block += 1;

        let (status, contract_address) = match outcome {
            Ok(created) => (1u64, created),
            Err(_) => (0u64, None),
        };
        let receipt = Receipt {
            transaction_hash: tx.hash,
            status: U64::from(status),
            block_number: Some(U64::from(state.block)),
            contract_address,
            gas_used: U64::from(21_000u64),
        };
        state.receipts.insert(tx.hash, receipt);
        state.accepted.insert(tx.hash);

        if state.transient_sends > 0 {
            state.transient_sends -= 1;
            return Err(ProviderError::Transport("connection reset by peer".to_string()));
        }
        Ok(tx.hash)
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError> {
        let state = self.state();
        if state.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ProviderError> {
        let state = self.state();
        if state.storage_unavailable {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        match state.contracts.get(&address) {
            Some(Contract::Proxy { implementation, .. }) if slot == IMPLEMENTATION_SLOT => {
                Ok(state.reported_implementation.unwrap_or(*implementation).into_word())
            }
            _ => Ok(B256::ZERO),
        }
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ProviderError> {
        self.state()
            .dry_run(request)
            .map(|_| Bytes::new())
            .map_err(|reason| revert_error(&reason))
    }
}

/// Fast timings for tests.
pub fn test_settings() -> TxSettings {
    TxSettings {
        confirmation_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(5),
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
    }
}

/// Connect a transactor for `private_key` to `chain`.
pub async fn transactor(
    chain: &MockChain,
    network: &NetworkProfile,
    private_key: &str,
) -> Transactor<MockChain, LocalSigner> {
    let signer: LocalSigner = private_key.parse().expect("valid private key");
    Transactor::connect(chain.clone(), signer, network, test_settings())
        .await
        .expect("mock chain serves the local chain id")
}

fn initialize_abi(extra: &[&str]) -> serde_json::Value {
    let mut abi = vec![
        serde_json::json!({
            "type": "function",
            "name": "initialize",
            "inputs": [{ "name": "baseURI", "type": "string", "internalType": "string" }],
            "outputs": [],
            "stateMutability": "nonpayable"
        }),
        serde_json::json!({
            "type": "function",
            "name": "upgradeToAndCall",
            "inputs": [
                { "name": "newImplementation", "type": "address", "internalType": "address" },
                { "name": "data", "type": "bytes", "internalType": "bytes" }
            ],
            "outputs": [],
            "stateMutability": "payable"
        }),
    ];
    for name in extra {
        abi.push(serde_json::json!({
            "type": "function",
            "name": name,
            "inputs": [{ "name": "newImplementation", "type": "address", "internalType": "address" }],
            "outputs": [],
            "stateMutability": "nonpayable"
        }));
    }
    serde_json::Value::Array(abi)
}

fn storage_layout(entries: &[(&str, u64, &str)]) -> serde_json::Value {
    let mut types = serde_json::Map::new();
    let storage: Vec<_> = entries
        .iter()
        .map(|(label, slot, type_label)| {
            let type_id = format!("t_{}", type_label.replace(|c: char| !c.is_alphanumeric(), "_"));
            types.insert(
                type_id.clone(),
                serde_json::json!({ "encoding": "inplace", "label": type_label, "numberOfBytes": "32" }),
            );
            serde_json::json!({
                "astId": slot + 1,
                "contract": "src/Token.sol:Token",
                "label": label,
                "offset": 0,
                "slot": slot.to_string(),
                "type": type_id
            })
        })
        .collect();
    serde_json::json!({ "storage": storage, "types": types })
}

fn write_artifact(dir: &Path, name: &str, value: serde_json::Value) {
    let path = dir.join(format!("{name}.sol")).join(format!("{name}.json"));
    std::fs::create_dir_all(path.parent().expect("artifact has a parent directory"))
        .expect("create artifact directory");
    std::fs::write(&path, value.to_string()).expect("write artifact");
}

const V1_LAYOUT: &[(&str, u64, &str)] = &[
    ("_owner", 0, "address"),
    ("baseURI", 1, "string"),
    ("balances", 2, "mapping(address => uint256)"),
];

/// Write a Foundry-style `out/` directory with `Token` versions and the proxy:
///
/// - `v1`: the initial layout
/// - `v2`: appends `merkleRoot`
/// - `v3`: appends `paused` on top of `v2`
/// - `v2-removed`: drops `baseURI`
pub fn write_token_artifacts(dir: &Path) -> ProxykitConfig {
    let mut v2_layout = V1_LAYOUT.to_vec();
    v2_layout.push(("merkleRoot", 3, "bytes32"));
    let mut v3_layout = v2_layout.clone();
    v3_layout.push(("paused", 4, "bool"));
    let removed_layout = [("_owner", 0, "address"), ("balances", 1, "mapping(address => uint256)")];

    let implementations: [(&str, u8, &[&str], &[(&str, u64, &str)]); 4] = [
        ("TokenV1", 0x01, &[], V1_LAYOUT),
        ("TokenV2", 0x02, &["upgradeTo"], v2_layout.as_slice()),
        ("TokenV3", 0x03, &["upgradeTo"], v3_layout.as_slice()),
        ("TokenV2Removed", 0x04, &[], &removed_layout[..]),
    ];
    for (name, tag, extra, layout) in implementations {
        write_artifact(
            dir,
            name,
            serde_json::json!({
                "abi": initialize_abi(extra),
                "bytecode": { "object": format!("0x608060405260{tag:02x}") },
                "storageLayout": storage_layout(layout),
            }),
        );
    }

    write_artifact(
        dir,
        "ERC1967Proxy",
        serde_json::json!({
            "abi": [],
            "bytecode": { "object": format!("0x{}", hex::encode(PROXY_CODE)) },
        }),
    );

    let mut config = ProxykitConfig {
        artifacts_dir: dir.to_path_buf(),
        ..Default::default()
    };
    config.contracts.insert(
        "Token".to_string(),
        [
            ("v1", "TokenV1"),
            ("v2", "TokenV2"),
            ("v3", "TokenV3"),
            ("v2-removed", "TokenV2Removed"),
        ]
        .into_iter()
        .map(|(version, artifact)| (version.to_string(), artifact.to_string()))
        .collect(),
    );
    config
}

/// Everything a deploy/upgrade test needs, wired to one [`MockChain`].
pub struct DeployFixture {
    pub chain: MockChain,
    pub config: ProxykitConfig,
    pub network: NetworkProfile,
    pub registry: DeploymentRegistry,
    pub resolver: ImplementationResolver,
    pub deployer: ProxyDeployer<MockChain, LocalSigner>,
    pub v1: ContractVersion,
    pub init_args: InitArgs,
}

impl DeployFixture {
    pub fn version(&self, version: &str) -> ContractVersion {
        self.resolver
            .resolve("Token", version)
            .expect("fixture artifact exists")
    }

    /// An upgrade coordinator signing with `private_key`.
    pub async fn coordinator(&self, private_key: &str) -> UpgradeCoordinator<MockChain, LocalSigner> {
        UpgradeCoordinator::new(
            transactor(&self.chain, &self.network, private_key).await,
            self.registry.clone(),
            self.resolver.clone(),
        )
    }
}

/// Build a [`DeployFixture`] with artifacts and registry under `root`.
pub async fn deploy_fixture(chain: MockChain, root: &Path) -> DeployFixture {
    let mut config = write_token_artifacts(&root.join("out"));
    config.registry_dir = root.join("deployments");

    let network = NetworkResolver::new(&config, Secrets::default())
        .resolve(LOCAL_NETWORK)
        .expect("local network resolves");
    let deployer_key = crate::config::DEV_PRIVATE_KEY;

    let registry = DeploymentRegistry::new(&config.registry_dir);
    let resolver = ImplementationResolver::new(&config).expect("artifacts scan");
    let proxy = resolver.resolve_proxy().expect("proxy artifact exists");
    let deployer = ProxyDeployer::new(
        transactor(&chain, &network, deployer_key).await,
        registry.clone(),
        proxy,
    );
    let v1 = resolver.resolve("Token", "v1").expect("v1 artifact exists");
    let init_args: InitArgs = r#"{"baseURI": "https://x/"}"#.parse().expect("valid init args");

    DeployFixture {
        chain,
        config,
        network,
        registry,
        resolver,
        deployer,
        v1,
        init_args,
    }
}
