//! Local transaction signer.
//!
//! Produces EIP-155 replay-protected legacy transactions signed with a secp256k1 key.

use std::{fmt, str::FromStr};

use alloy_core::{
    primitives::{Address, B256, Bytes, TxHash, U256, keccak256},
    rlp::{self, Encodable, Header},
};
use k256::ecdsa::SigningKey;

use crate::{DeployError, DeployResult};

/// Fields of a transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// A transaction together with its signed wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub request: TxRequest,
    pub from: Address,
    pub raw: Bytes,
    pub hash: TxHash,
}

/// Produces signatures for a single account.
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    fn sign_transaction(&self, request: TxRequest) -> DeployResult<SignedTx>;
}

/// A signer backed by an in-memory private key.
#[derive(Clone)]
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl FromStr for LocalSigner {
    type Err = DeployError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(key.trim().trim_start_matches("0x"))
            .map_err(|e| DeployError::Config(format!("private key is not valid hex: {e}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| DeployError::Config(format!("invalid secp256k1 private key: {e}")))?;
        Ok(Self::new(key))
    }
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = address_of(&key);
        Self { key, address }
    }

    fn sign_hash(&self, hash: B256) -> DeployResult<(U256, U256, u8)> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| DeployError::Config(format!("failed to sign transaction: {e}")))?;
        let bytes = signature.to_bytes();
        let r = U256::from_be_slice(&bytes[..32]);
        let s = U256::from_be_slice(&bytes[32..]);
        Ok((r, s, recovery_id.to_byte()))
    }
}

impl TxSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_transaction(&self, request: TxRequest) -> DeployResult<SignedTx> {
        let chain_id = U256::from(request.chain_id);
        let unsigned = encode_legacy(&request, (chain_id, U256::ZERO, U256::ZERO));
        let (r, s, parity) = self.sign_hash(keccak256(&unsigned))?;

        let v = U256::from(parity as u64 + 35 + request.chain_id * 2);
        let raw = encode_legacy(&request, (v, r, s));
        let hash = keccak256(&raw);

        Ok(SignedTx {
            request,
            from: self.address,
            raw: raw.into(),
            hash,
        })
    }
}

/// Derive the account address of a private key.
pub fn address_of(key: &SigningKey) -> Address {
    // Uncompressed SEC1 point: 0x04 prefix followed by the 64-byte public key.
    let point = key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// RLP encoding of `[nonce, gasPrice, gas, to, value, data, v, r, s]`.
fn encode_legacy(tx: &TxRequest, (v, r, s): (U256, U256, U256)) -> Vec<u8> {
    let to_length = match &tx.to {
        Some(to) => to.length(),
        None => 1,
    };
    let payload_length = tx.nonce.length()
        + tx.gas_price.length()
        + tx.gas_limit.length()
        + to_length
        + tx.value.length()
        + tx.data.length()
        + v.length()
        + r.length()
        + s.length();

    let mut out = Vec::with_capacity(payload_length + 4);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    tx.nonce.encode(&mut out);
    tx.gas_price.encode(&mut out);
    tx.gas_limit.encode(&mut out);
    match &tx.to {
        Some(to) => to.encode(&mut out),
        None => out.push(rlp::EMPTY_STRING_CODE),
    }
    tx.value.encode(&mut out);
    tx.data.encode(&mut out);
    v.encode(&mut out);
    r.encode(&mut out);
    s.encode(&mut out);
    out
}
