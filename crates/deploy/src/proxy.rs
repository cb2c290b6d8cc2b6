//! ERC-1967 proxy calldata and storage.

use alloy_core::{
    json_abi::JsonAbi,
    primitives::{Address, B256, Bytes, b256},
    sol,
    sol_types::{SolCall, SolValue},
};

/// `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// Selector of OpenZeppelin's `OwnableUnauthorizedAccount(address)` error.
const OWNABLE_UNAUTHORIZED_SELECTOR: &str = "118cdaa7";

sol! {
    /// Upgrade entry points of a UUPS implementation.
    interface IUUPSUpgradeable {
        function upgradeTo(address newImplementation) external;
        function upgradeToAndCall(address newImplementation, bytes data) external payable;
    }
}

pub use IUUPSUpgradeable::{upgradeToAndCallCall, upgradeToCall};

/// Creation code of a proxy pointing at `implementation`.
///
/// The proxy constructor delegatecalls `init_data` into the implementation, so the proxy
/// is initialized in the same transaction that creates it.
pub fn proxy_creation_code(
    proxy_bytecode: &Bytes,
    implementation: Address,
    init_data: Bytes,
) -> Bytes {
    let mut code = proxy_bytecode.to_vec();
    code.extend((implementation, init_data).abi_encode_params());
    code.into()
}

/// Calldata that points a proxy at `new_implementation`.
///
/// Uses `upgradeTo` when the active implementation exposes it, `upgradeToAndCall` with
/// empty data otherwise (OpenZeppelin 5 dropped `upgradeTo`).
pub fn upgrade_calldata(active_abi: &JsonAbi, new_implementation: Address) -> Bytes {
    if active_abi.function("upgradeTo").is_some() {
        upgradeToCall {
            newImplementation: new_implementation,
        }
        .abi_encode()
        .into()
    } else {
        upgradeToAndCallCall {
            newImplementation: new_implementation,
            data: Bytes::new(),
        }
        .abi_encode()
        .into()
    }
}

/// Decode the implementation address held in the ERC-1967 slot.
pub fn implementation_from_slot(word: B256) -> Address {
    Address::from_word(word)
}

/// Whether a revert reason reports that the caller may not perform the upgrade.
pub fn is_authorization_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    ["owner", "unauthorized", "not authorized", "access control", "accesscontrol"]
        .iter()
        .any(|needle| lower.contains(needle))
        || lower.contains(OWNABLE_UNAUTHORIZED_SELECTOR)
}
