//! Transaction submission and confirmation.
//!
//! A [`Transactor`] is the single writer for one signer on one network. It hands out
//! nonces itself so that transactions of an operation land in the order they were issued.

use std::time::Duration;

use alloy_core::{
    primitives::{Address, B256, Bytes, TxHash, U256},
    sol_types::decode_revert_reason,
};
use backon::{ExponentialBuilder, Retryable};
use tokio::sync::Mutex;

use crate::{
    DeployError, DeployResult,
    config::ProxykitConfig,
    network::NetworkProfile,
    rpc::{CallRequest, ChainProvider, ProviderError, Receipt},
    signer::{TxRequest, TxSigner},
};

/// Gas estimates are padded by this percentage.
const GAS_ESTIMATE_BUFFER_PERCENT: u64 = 20;

/// Timing and retry policy for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSettings {
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for TxSettings {
    fn default() -> Self {
        Self::from(&ProxykitConfig::default())
    }
}

impl From<&ProxykitConfig> for TxSettings {
    fn from(config: &ProxykitConfig) -> Self {
        Self {
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Map a provider failure to the error taxonomy.
pub(crate) fn classify(err: ProviderError, account: Address) -> DeployError {
    match err {
        ProviderError::Transport(message) => DeployError::NetworkUnavailable(message),
        ProviderError::Rpc {
            code,
            message,
            data,
        } => {
            let lower = message.to_lowercase();
            if lower.contains("insufficient funds") {
                DeployError::InsufficientFunds {
                    account,
                    detail: message,
                }
            } else if data.is_some() || lower.contains("revert") {
                DeployError::TransactionReverted {
                    reason: revert_reason(data.as_ref().map(|d| &d[..]), &message),
                }
            } else if lower.contains("rate limit") || lower.contains("timeout") {
                DeployError::NetworkUnavailable(message)
            } else {
                DeployError::Rpc { code, message }
            }
        }
    }
}

/// Best-effort human-readable revert reason.
pub(crate) fn revert_reason(data: Option<&[u8]>, message: &str) -> String {
    if let Some(reason) = data.and_then(decode_revert_reason) {
        return reason
            .strip_prefix("revert: ")
            .map(str::to_string)
            .unwrap_or(reason);
    }
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        return format!("custom error 0x{}", hex::encode(data));
    }
    let reason = message
        .trim_start_matches("execution reverted")
        .trim_start_matches(':')
        .trim();
    if reason.is_empty() {
        "reverted without a reason".to_string()
    } else {
        reason.to_string()
    }
}

/// Submits transactions for one signer and waits for their receipts.
pub struct Transactor<P, S> {
    provider: P,
    signer: S,
    chain_id: u64,
    settings: TxSettings,
    next_nonce: Mutex<Option<u64>>,
}

impl<P: ChainProvider, S: TxSigner> Transactor<P, S> {
    /// Create a transactor after checking the endpoint serves the expected chain.
    pub async fn connect(
        provider: P,
        signer: S,
        profile: &NetworkProfile,
        settings: TxSettings,
    ) -> DeployResult<Self> {
        let transactor = Self {
            provider,
            signer,
            chain_id: profile.chain_id,
            settings,
            next_nonce: Mutex::new(None),
        };

        let chain_id = transactor
            .with_retry("eth_chainId", || transactor.provider.chain_id())
            .await?;
        if chain_id != profile.chain_id {
            return Err(DeployError::Config(format!(
                "network `{}` expects chain id {} but {} serves chain id {}",
                profile.name, profile.chain_id, profile.rpc_url, chain_id
            )));
        }

        tracing::debug!(
            network = %profile.name,
            chain_id,
            account = %transactor.signer.address(),
            "Connected to network"
        );
        Ok(transactor)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Run a provider call, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> DeployResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let account = self.signer.address();
        let mut op = op;
        (|| {
            let fut = op();
            async move { fut.await.map_err(|e| classify(e, account)) }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(self.settings.retry_delay)
                .with_max_times(self.settings.max_retries),
        )
        .when(|e: &DeployError| matches!(e, DeployError::NetworkUnavailable(_)))
        .notify(|err: &DeployError, delay: Duration| {
            tracing::warn!(request = what, error = %err, ?delay, "Network unavailable, retrying");
        })
        .await
    }

    /// Read a storage word of `address`.
    pub async fn storage_at(&self, address: Address, slot: B256) -> DeployResult<B256> {
        self.with_retry("eth_getStorageAt", || self.provider.storage_at(address, slot))
            .await
    }

    /// Sign and submit a transaction. Returns as soon as the node accepted it.
    ///
    /// The nonce is only consumed when the node accepts the transaction. Resubmitting
    /// the same signed bytes after a transient failure is idempotent.
    pub async fn submit(&self, to: Option<Address>, data: Bytes) -> DeployResult<TxHash> {
        let from = self.signer.address();
        let call = CallRequest {
            from,
            to,
            data: data.clone(),
            value: U256::ZERO,
        };

        let gas = self
            .with_retry("eth_estimateGas", || self.provider.estimate_gas(&call))
            .await?;
        let gas_limit = gas + gas * GAS_ESTIMATE_BUFFER_PERCENT / 100;
        let gas_price = self
            .with_retry("eth_gasPrice", || self.provider.gas_price())
            .await?;

        // Held until the node accepted the transaction so nonces are issued in order.
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => {
                self.with_retry("eth_getTransactionCount", || self.provider.nonce(from))
                    .await?
            }
        };

        let signed = self.signer.sign_transaction(TxRequest {
            chain_id: self.chain_id,
            nonce,
            gas_price,
            gas_limit,
            to,
            value: U256::ZERO,
            data,
        })?;

        let hash = self
            .with_retry("eth_sendRawTransaction", || async {
                match self.provider.send_transaction(&signed).await {
                    Err(ProviderError::Rpc { message, .. })
                        if message.to_lowercase().contains("already known") =>
                    {
                        Ok(signed.hash)
                    }
                    other => other,
                }
            })
            .await?;

        *next_nonce = Some(nonce + 1);

        tracing::debug!(tx_hash = %hash, nonce, gas_limit, ?to, "Transaction submitted");
        Ok(hash)
    }

    /// Wait for a receipt until the confirmation timeout elapses.
    ///
    /// A [`DeployError::Timeout`] does not mean the transaction failed; it may still land.
    pub async fn confirm(&self, hash: TxHash) -> DeployResult<Receipt> {
        let account = self.signer.address();
        let wait = async {
            loop {
                match self.provider.receipt(hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {}
                    Err(ProviderError::Transport(e)) => {
                        tracing::warn!(tx_hash = %hash, error = %e, "Failed to poll receipt, retrying");
                    }
                    Err(e) => return Err(classify(e, account)),
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };

        let waited = self.settings.confirmation_timeout;
        match tokio::time::timeout(waited, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(tx_hash = %hash, ?waited, "Timed out waiting for confirmation");
                Err(DeployError::Timeout {
                    tx_hash: hash,
                    waited,
                })
            }
        }
    }

    /// Submit, confirm, and require success.
    ///
    /// A reverted receipt is replayed with `eth_call` to recover the revert reason.
    pub async fn execute(&self, to: Option<Address>, data: Bytes) -> DeployResult<Receipt> {
        let hash = self.submit(to, data.clone()).await?;
        let receipt = self.confirm(hash).await?;

        if receipt.succeeded() {
            tracing::debug!(tx_hash = %hash, gas_used = %receipt.gas_used, "Transaction confirmed");
            return Ok(receipt);
        }

        let call = CallRequest {
            from: self.signer.address(),
            to,
            data,
            value: U256::ZERO,
        };
        let reason = match self.provider.call(&call).await {
            Err(ProviderError::Rpc { message, data, .. }) => {
                revert_reason(data.as_ref().map(|d| &d[..]), &message)
            }
            _ => "reverted without a reason".to_string(),
        };

        tracing::warn!(tx_hash = %hash, %reason, "Transaction reverted");
        Err(DeployError::TransactionReverted { reason })
    }

    /// Submit a contract creation and return the created address.
    pub async fn create(&self, code: Bytes) -> DeployResult<Address> {
        let receipt = self.execute(None, code).await?;
        receipt.contract_address.ok_or_else(|| DeployError::Rpc {
            code: 0,
            message: format!(
                "receipt of {} has no contract address",
                receipt.transaction_hash
            ),
        })
    }
}
