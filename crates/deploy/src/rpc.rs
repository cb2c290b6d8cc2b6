//! Network provider interface and its Ethereum JSON-RPC implementation.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, TxHash, U64, U128, U256};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use url::Url;

use crate::signer::SignedTx;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure reported by a [`ChainProvider`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The endpoint could not be reached or answered with garbage.
    #[error("transport error: {0}")]
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Bytes>,
    },
}

impl ProviderError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A read-only call or gas estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
}

/// Transaction receipt, reduced to what deploys and upgrades look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub status: U64,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub gas_used: U64,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == U64::from(1)
    }
}

/// The operations deploys and upgrades need from a network.
///
/// Implementations must be safe to share between the steps of one operation; they do not
/// hold signing keys.
#[allow(async_fn_in_trait)]
pub trait ChainProvider: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ProviderError>;

    /// Next nonce of `account`, counting pending transactions.
    async fn nonce(&self, account: Address) -> Result<u64, ProviderError>;

    async fn gas_price(&self) -> Result<u128, ProviderError>;

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, ProviderError>;

    /// Submit a signed transaction and return its hash.
    async fn send_transaction(&self, tx: &SignedTx) -> Result<TxHash, ProviderError>;

    /// Receipt of a mined transaction, or `None` while it is pending or unknown.
    async fn receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError>;

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ProviderError>;

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ProviderError>;
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Transport(format!("failed to create HTTP client: {e}")))
}

/// [`ChainProvider`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcProvider {
    client: reqwest::Client,
    url: Url,
}

impl JsonRpcProvider {
    pub fn new(url: Url) -> Result<Self, ProviderError> {
        Ok(Self {
            client: create_client()?,
            url,
        })
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ProviderError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to send {method}: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transport(format!(
                "{method} returned HTTP {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to parse {method} response: {e}")))?;

        if let Some(error) = body.get("error") {
            return Err(parse_rpc_error(error));
        }

        let result = body.get("result").cloned().unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| ProviderError::Transport(format!("malformed {method} result: {e}")))
    }
}

/// Parse a JSON-RPC error object, keeping revert data when the node includes it.
fn parse_rpc_error(error: &Value) -> ProviderError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    // Nodes put revert data either directly under `data` or one level deeper.
    let data = error
        .get("data")
        .and_then(|d| d.as_str().or_else(|| d.get("data").and_then(Value::as_str)))
        .and_then(|hex| hex.parse::<Bytes>().ok());

    ProviderError::Rpc {
        code,
        message,
        data,
    }
}

impl ChainProvider for JsonRpcProvider {
    async fn chain_id(&self) -> Result<u64, ProviderError> {
        let id: U64 = self.request("eth_chainId", vec![]).await?;
        Ok(id.to())
    }

    async fn nonce(&self, account: Address) -> Result<u64, ProviderError> {
        let nonce: U64 = self
            .request(
                "eth_getTransactionCount",
                vec![serde_json::json!(account), serde_json::json!("pending")],
            )
            .await?;
        Ok(nonce.to())
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        let price: U128 = self.request("eth_gasPrice", vec![]).await?;
        Ok(price.to())
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, ProviderError> {
        let gas: U64 = self
            .request("eth_estimateGas", vec![serde_json::json!(request)])
            .await?;
        Ok(gas.to())
    }

    async fn send_transaction(&self, tx: &SignedTx) -> Result<TxHash, ProviderError> {
        self.request("eth_sendRawTransaction", vec![serde_json::json!(tx.raw)])
            .await
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError> {
        self.request("eth_getTransactionReceipt", vec![serde_json::json!(hash)])
            .await
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ProviderError> {
        self.request(
            "eth_getStorageAt",
            vec![
                serde_json::json!(address),
                serde_json::json!(slot),
                serde_json::json!("latest"),
            ],
        )
        .await
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ProviderError> {
        self.request(
            "eth_call",
            vec![serde_json::json!(request), serde_json::json!("latest")],
        )
        .await
    }
}
