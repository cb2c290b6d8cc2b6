//! Error taxonomy for deploy and upgrade operations.
//!
//! Every failure a caller can observe is a [`DeployError`]. The [`ErrorKind`] tag is the
//! stable, machine-readable name of the failure class and is what automation should match on.

use std::{path::PathBuf, time::Duration};

use alloy_core::primitives::{Address, TxHash};
use serde::Serialize;

use crate::layout::LayoutViolation;

/// Result alias used throughout the crate.
pub type DeployResult<T> = Result<T, DeployError>;

/// The step of a deploy or upgrade operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    DeployImplementation,
    DeployProxy,
    Initialize,
    VerifyDeployment,
    SubmitUpgrade,
    VerifyUpgrade,
    RecordDeployment,
}

/// On-chain state that may already exist when an operation fails part-way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SideEffects {
    /// Implementation contract that landed on-chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
    /// Proxy contract that landed on-chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Address>,
    /// A transaction whose outcome is unknown (submitted, never confirmed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tx: Option<TxHash>,
    /// Proxy whose upgrade transaction was confirmed. It already serves the new
    /// implementation even though the operation did not complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgraded_proxy: Option<Address>,
}

impl SideEffects {
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether anything may exist on-chain.
    pub fn is_empty(&self) -> bool {
        self.implementation.is_none()
            && self.proxy.is_none()
            && self.pending_tx.is_none()
            && self.upgraded_proxy.is_none()
    }
}

/// Stable tag for each failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    NetworkUnavailable,
    InsufficientFunds,
    InitializerRevert,
    StorageLayoutIncompatible,
    UnauthorizedUpgrader,
    UpgradeVerification,
    DeploymentVerification,
    RegistryBusy,
    ArtifactNotFound,
    AmbiguousArtifact,
    InvalidArtifact,
    Timeout,
    NotFound,
    AlreadyDeployed,
    ProxyMismatch,
    StateDrift,
    SameVersion,
    InvalidInitArgs,
    TransactionReverted,
    Rpc,
    Registry,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("insufficient funds for account {account}: {detail}")]
    InsufficientFunds { account: Address, detail: String },

    #[error("initializer reverted: {reason}")]
    InitializerRevert { reason: String },

    #[error("storage layout of {contract} {to} is incompatible with {from}: {}", format_violations(.violations))]
    StorageLayoutIncompatible {
        contract: String,
        from: String,
        to: String,
        violations: Vec<LayoutViolation>,
    },

    #[error("account {account} is not authorized to upgrade proxy {proxy}: {reason}")]
    UnauthorizedUpgrader {
        account: Address,
        proxy: Address,
        reason: String,
    },

    #[error(
        "proxy {proxy} reports implementation {observed} after upgrade, expected {expected}; re-read state before retrying"
    )]
    UpgradeVerification {
        proxy: Address,
        expected: Address,
        observed: Address,
    },

    #[error(
        "new proxy {proxy} reports implementation {observed}, expected {expected}; re-read state before retrying"
    )]
    DeploymentVerification {
        proxy: Address,
        expected: Address,
        observed: Address,
    },

    #[error("registry key {network}/{contract} is locked by another operation")]
    RegistryBusy { network: String, contract: String },

    #[error("no artifact found for {name} {version} (looked for `{artifact}`)")]
    ArtifactNotFound {
        name: String,
        version: String,
        artifact: String,
    },

    #[error("artifact `{artifact}` for {name} {version} is ambiguous: {}", display_paths(.candidates))]
    AmbiguousArtifact {
        name: String,
        version: String,
        artifact: String,
        candidates: Vec<PathBuf>,
    },

    #[error("invalid artifact {}: {reason}", .path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error(
        "transaction {tx_hash} not confirmed within {waited:?}; it may still land, reconcile before retrying"
    )]
    Timeout { tx_hash: TxHash, waited: Duration },

    #[error("no deployment recorded for {network}/{contract}")]
    NotFound { network: String, contract: String },

    #[error("{network}/{contract} already has proxy {proxy}")]
    AlreadyDeployed {
        network: String,
        contract: String,
        proxy: Address,
    },

    #[error("proxy {given} is not the recorded proxy {recorded} of {contract}")]
    ProxyMismatch {
        contract: String,
        given: Address,
        recorded: Address,
    },

    #[error(
        "proxy {proxy} points at {observed} on-chain but the registry records {recorded}; reconcile the registry first"
    )]
    StateDrift {
        proxy: Address,
        recorded: Address,
        observed: Address,
    },

    #[error("{contract} is already at version {version}")]
    SameVersion { contract: String, version: String },

    #[error("invalid initializer arguments: {0}")]
    InvalidInitArgs(String),

    #[error("transaction reverted: {reason}")]
    TransactionReverted { reason: String },

    #[error("node rejected request ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("{step} failed ({}): {source}", describe_side_effects(.side_effects))]
    StepFailed {
        step: Step,
        side_effects: SideEffects,
        #[source]
        source: Box<DeployError>,
    },
}

impl DeployError {
    /// Wrap an error with the step that failed and what may already exist on-chain.
    pub fn at_step(self, step: Step, side_effects: SideEffects) -> Self {
        DeployError::StepFailed {
            step,
            side_effects,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`DeployError::StepFailed`].
    pub fn root(&self) -> &DeployError {
        match self {
            DeployError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Taxonomy tag of the underlying failure.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            DeployError::Config(_) => ErrorKind::Config,
            DeployError::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            DeployError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            DeployError::InitializerRevert { .. } => ErrorKind::InitializerRevert,
            DeployError::StorageLayoutIncompatible { .. } => ErrorKind::StorageLayoutIncompatible,
            DeployError::UnauthorizedUpgrader { .. } => ErrorKind::UnauthorizedUpgrader,
            DeployError::UpgradeVerification { .. } => ErrorKind::UpgradeVerification,
            DeployError::DeploymentVerification { .. } => ErrorKind::DeploymentVerification,
            DeployError::RegistryBusy { .. } => ErrorKind::RegistryBusy,
            DeployError::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            DeployError::AmbiguousArtifact { .. } => ErrorKind::AmbiguousArtifact,
            DeployError::InvalidArtifact { .. } => ErrorKind::InvalidArtifact,
            DeployError::Timeout { .. } => ErrorKind::Timeout,
            DeployError::NotFound { .. } => ErrorKind::NotFound,
            DeployError::AlreadyDeployed { .. } => ErrorKind::AlreadyDeployed,
            DeployError::ProxyMismatch { .. } => ErrorKind::ProxyMismatch,
            DeployError::StateDrift { .. } => ErrorKind::StateDrift,
            DeployError::SameVersion { .. } => ErrorKind::SameVersion,
            DeployError::InvalidInitArgs(_) => ErrorKind::InvalidInitArgs,
            DeployError::TransactionReverted { .. } => ErrorKind::TransactionReverted,
            DeployError::Rpc { .. } => ErrorKind::Rpc,
            DeployError::Registry(_) => ErrorKind::Registry,
            DeployError::StepFailed { source, .. } => source.kind(),
        }
    }

    /// Whether the same call may be retried later without reconciling state first.
    ///
    /// Never true once something may exist on-chain: replaying the call would deploy or
    /// upgrade a second time.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NetworkUnavailable | ErrorKind::RegistryBusy)
            && self.side_effects().is_empty()
    }

    /// Whether the outcome is ambiguous and chain/registry state must be re-read first.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::UpgradeVerification
                | ErrorKind::DeploymentVerification
                | ErrorKind::StateDrift
        ) || self.side_effects().upgraded_proxy.is_some()
            || matches!(
                self.step(),
                Some(Step::VerifyDeployment | Step::RecordDeployment)
            )
    }

    /// The failed step, if the error came out of a multi-step operation.
    pub fn step(&self) -> Option<Step> {
        match self {
            DeployError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// What may already exist on-chain. Empty for errors raised before any submission.
    pub fn side_effects(&self) -> SideEffects {
        match self {
            DeployError::StepFailed { side_effects, .. } => side_effects.clone(),
            _ => SideEffects::none(),
        }
    }

    pub(crate) fn registry(context: &str, err: impl std::fmt::Display) -> Self {
        DeployError::Registry(format!("{context}: {err}"))
    }
}

fn format_violations(violations: &[LayoutViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_side_effects(effects: &SideEffects) -> String {
    if effects.is_empty() {
        return "no on-chain side effects".to_string();
    }

    let mut parts = Vec::new();
    if let Some(implementation) = effects.implementation {
        parts.push(format!("implementation {implementation} landed"));
    }
    if let Some(proxy) = effects.proxy {
        parts.push(format!("proxy {proxy} landed"));
    }
    if let Some(tx) = effects.pending_tx {
        parts.push(format!("transaction {tx} may still land"));
    }
    if let Some(proxy) = effects.upgraded_proxy {
        parts.push(format!("proxy {proxy} was upgraded"));
    }
    format!("on-chain state exists: {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_step_failures() {
        let err = DeployError::InitializerRevert {
            reason: "already initialized".to_string(),
        }
        .at_step(
            Step::Initialize,
            SideEffects {
                implementation: Some(Address::repeat_byte(0x11)),
                proxy: Some(Address::repeat_byte(0x22)),
                ..Default::default()
            },
        );

        assert_eq!(err.kind(), ErrorKind::InitializerRevert);
        assert_eq!(err.step(), Some(Step::Initialize));
        assert!(!err.side_effects().is_empty());
        assert!(!err.is_retryable());

        let message = err.to_string();
        assert!(message.contains("initialize failed"), "{message}");
        assert!(message.contains("proxy"), "{message}");
    }

    #[test]
    fn test_retry_and_reconcile_classes() {
        let busy = DeployError::RegistryBusy {
            network: "local".to_string(),
            contract: "Token".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(!busy.requires_reconciliation());

        let timeout = DeployError::Timeout {
            tx_hash: TxHash::ZERO,
            waited: Duration::from_secs(1),
        };
        assert!(!timeout.is_retryable());
        assert!(timeout.requires_reconciliation());
    }

    #[test]
    fn test_transient_failure_after_upgrade_landed_is_not_retryable() {
        let proxy = Address::repeat_byte(0x22);
        let err = DeployError::NetworkUnavailable("connection reset".to_string()).at_step(
            Step::VerifyUpgrade,
            SideEffects {
                implementation: Some(Address::repeat_byte(0x33)),
                upgraded_proxy: Some(proxy),
                ..Default::default()
            },
        );

        assert_eq!(err.kind(), ErrorKind::NetworkUnavailable);
        assert!(!err.is_retryable());
        assert!(err.requires_reconciliation());
        assert!(err.to_string().contains("was upgraded"), "{err}");

        // The same failure before anything was sent stays retryable.
        let early = DeployError::NetworkUnavailable("connection reset".to_string())
            .at_step(Step::DeployImplementation, SideEffects::none());
        assert!(early.is_retryable());
        assert!(!early.requires_reconciliation());
    }

    #[test]
    fn test_verification_failures_require_reconciliation() {
        let mismatch = DeployError::DeploymentVerification {
            proxy: Address::repeat_byte(0x22),
            expected: Address::repeat_byte(0x11),
            observed: Address::ZERO,
        };
        assert_eq!(mismatch.kind(), ErrorKind::DeploymentVerification);
        assert!(!mismatch.is_retryable());
        assert!(mismatch.requires_reconciliation());

        let upgrade = DeployError::UpgradeVerification {
            proxy: Address::repeat_byte(0x22),
            expected: Address::repeat_byte(0x11),
            observed: Address::ZERO,
        };
        assert!(!upgrade.is_retryable());
        assert!(upgrade.requires_reconciliation());
    }

    #[test]
    fn test_kind_tags_are_kebab_case() {
        assert_eq!(
            ErrorKind::StorageLayoutIncompatible.to_string(),
            "storage-layout-incompatible"
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::RegistryBusy).unwrap(),
            serde_json::json!("registry-busy")
        );
    }
}
