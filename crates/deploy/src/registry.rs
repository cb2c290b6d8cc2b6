//! Deployment registry.
//!
//! History is stored per network and contract as `<root>/<network>/<contract>.jsonl`, one
//! [`RegistryEntry`] per line. Files are only ever appended to; the latest record of a key
//! is the record carried by its last line.
//!
//! Mutations of a key require a [`RegistryLease`], an exclusive advisory lock on
//! `<root>/<network>/<contract>.lock`. A second attempt to lease a held key fails
//! immediately with [`DeployError::RegistryBusy`].

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{DeployError, DeployResult, layout::LayoutReport};

const HISTORY_EXTENSION: &str = "jsonl";
const LOCK_EXTENSION: &str = "lock";

/// Current time as unix seconds.
pub(crate) fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// The current state of a deployed proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub network: String,
    pub contract: String,
    pub proxy_address: Address,
    pub implementation_address: Address,
    pub version: String,
    /// SHA-256 of the canonical initializer arguments.
    pub init_args_hash: String,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

/// A completed upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeTransaction {
    pub from_version: String,
    pub to_version: String,
    pub proxy_address: Address,
    pub new_implementation_address: Address,
    pub compatibility: LayoutReport,
    pub timestamp: u64,
}

/// A line of registry history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RegistryEntry {
    Deploy {
        record: DeploymentRecord,
    },
    Upgrade {
        record: DeploymentRecord,
        transaction: UpgradeTransaction,
    },
}

impl RegistryEntry {
    /// The record as of this entry.
    pub fn record(&self) -> &DeploymentRecord {
        match self {
            RegistryEntry::Deploy { record } | RegistryEntry::Upgrade { record, .. } => record,
        }
    }
}

/// An exclusive hold on one registry key. Released on drop.
#[derive(Debug)]
pub struct RegistryLease {
    network: String,
    contract: String,
    root: PathBuf,
    file: File,
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                network = %self.network,
                contract = %self.contract,
                error = %e,
                "Failed to release registry lease"
            );
            return;
        }
        tracing::debug!(network = %self.network, contract = %self.contract, "Registry lease released");
    }
}

/// File-backed registry of deployments.
#[derive(Debug, Clone)]
pub struct DeploymentRegistry {
    root: PathBuf,
}

impl DeploymentRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, network: &str, contract: &str, extension: &str) -> DeployResult<PathBuf> {
        for part in [network, contract] {
            let valid = !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                && !part.starts_with('.');
            if !valid {
                return Err(DeployError::Config(format!(
                    "`{part}` is not a valid network or contract name"
                )));
            }
        }
        Ok(self
            .root
            .join(network)
            .join(format!("{contract}.{extension}")))
    }

    /// Take the exclusive lease on `(network, contract)` without waiting.
    pub fn lease(&self, network: &str, contract: &str) -> DeployResult<RegistryLease> {
        let path = self.key_path(network, contract, LOCK_EXTENSION)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DeployError::registry(&format!("failed to create {}", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DeployError::registry(&format!("failed to open {}", path.display()), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                tracing::info!(network, contract, "Registry key is busy");
                return Err(DeployError::RegistryBusy {
                    network: network.to_string(),
                    contract: contract.to_string(),
                });
            }
            Err(e) => {
                return Err(DeployError::registry(
                    &format!("failed to lock {}", path.display()),
                    e,
                ));
            }
        }

        tracing::debug!(network, contract, "Registry lease acquired");
        Ok(RegistryLease {
            network: network.to_string(),
            contract: contract.to_string(),
            root: self.root.clone(),
            file,
        })
    }

    /// Append an entry. The lease must hold the entry's key.
    pub fn append(&self, lease: &RegistryLease, entry: &RegistryEntry) -> DeployResult<()> {
        let record = entry.record();
        if lease.root != self.root
            || lease.network != record.network
            || lease.contract != record.contract
        {
            return Err(DeployError::Registry(format!(
                "lease on {}/{} does not cover {}/{}",
                lease.network, lease.contract, record.network, record.contract
            )));
        }

        let path = self.key_path(&record.network, &record.contract, HISTORY_EXTENSION)?;
        truncate_torn_tail(&path)
            .map_err(|e| DeployError::registry(&format!("failed to repair {}", path.display()), e))?;
        let mut line = serde_json::to_string(entry)
            .map_err(|e| DeployError::registry("failed to serialize entry", e))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DeployError::registry(&format!("failed to open {}", path.display()), e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| DeployError::registry(&format!("failed to write {}", path.display()), e))?;

        tracing::info!(
            network = %record.network,
            contract = %record.contract,
            proxy = %record.proxy_address,
            implementation = %record.implementation_address,
            version = %record.version,
            "Registry updated"
        );
        Ok(())
    }

    /// Full history of a key, oldest first. Empty when nothing was recorded.
    pub fn history(&self, network: &str, contract: &str) -> DeployResult<Vec<RegistryEntry>> {
        let path = self.key_path(network, contract, HISTORY_EXTENSION)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DeployError::registry(
                    &format!("failed to read {}", path.display()),
                    e,
                ));
            }
        };

        let mut entries = Vec::new();
        for (index, line) in content.split_inclusive('\n').enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line.trim_end()) {
                Ok(entry) => entries.push(entry),
                // An unterminated last line is an append that never completed.
                Err(e) if !line.ends_with('\n') => {
                    tracing::warn!(
                        path = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Ignoring torn registry entry"
                    );
                }
                Err(e) => {
                    return Err(DeployError::registry(
                        &format!("corrupt entry at {}:{}", path.display(), index + 1),
                        e,
                    ));
                }
            }
        }
        Ok(entries)
    }

    /// Latest record of a key.
    pub fn latest(&self, network: &str, contract: &str) -> DeployResult<DeploymentRecord> {
        self.history(network, contract)?
            .pop()
            .map(|entry| entry.record().clone())
            .ok_or_else(|| DeployError::NotFound {
                network: network.to_string(),
                contract: contract.to_string(),
            })
    }

    /// Contracts with recorded history on a network, sorted by name.
    pub fn contracts(&self, network: &str) -> DeployResult<Vec<String>> {
        let dir = self.root.join(network);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(DeployError::registry(
                    &format!("failed to read {}", dir.display()),
                    e,
                ));
            }
        };

        let mut contracts = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| DeployError::registry(&format!("failed to read {}", dir.display()), e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) == Some(HISTORY_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    contracts.push(stem.to_string());
                }
            }
        }
        contracts.sort();
        Ok(contracts)
    }
}

/// Cut a trailing partial line left by an interrupted append, so the next entry starts
/// on a line of its own.
fn truncate_torn_tail(path: &Path) -> std::io::Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if bytes.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }

    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "Dropping torn registry entry"
    );
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)
}
