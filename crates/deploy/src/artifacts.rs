//! Build artifact store and implementation resolution.
//!
//! The artifacts directory is scanned once and indexed by artifact name (the file stem of
//! each contract JSON). A `(name, version)` pair maps to an artifact name either through an
//! explicit `contracts.<name>.<version>` entry or the `<name><Version>` convention.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::{json_abi::JsonAbi, primitives::Bytes};
use serde::Deserialize;

use crate::{
    DeployError, DeployResult,
    config::ProxykitConfig,
    layout::{SolcStorageLayout, StorageLayout},
};

/// Directories that hold compiler metadata rather than contract artifacts.
const SKIPPED_DIRS: &[&str] = &["build-info", "cache"];

/// A contract implementation resolved for a specific version.
#[derive(Debug, Clone)]
pub struct ContractVersion {
    /// Logical contract name, used as the registry key.
    pub name: String,
    pub version: String,
    /// Name of the build artifact backing this version.
    pub artifact: String,
    pub abi: JsonAbi,
    /// Creation bytecode.
    pub bytecode: Bytes,
    pub layout: StorageLayout,
}

/// The proxy contract used for every deployment.
#[derive(Debug, Clone)]
pub struct ProxyArtifact {
    pub artifact: String,
    pub bytecode: Bytes,
}

/// A parsed artifact file.
#[derive(Debug, Clone)]
struct Artifact {
    abi: JsonAbi,
    bytecode: Bytes,
    layout: Option<StorageLayout>,
}

/// Raw artifact JSON. Foundry nests the bytecode under `object`, Hardhat stores it as a string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    abi: JsonAbi,
    bytecode: RawBytecode,
    #[serde(default)]
    storage_layout: Option<SolcStorageLayout>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

impl RawBytecode {
    fn as_hex(&self) -> &str {
        match self {
            RawBytecode::Hex(hex) | RawBytecode::Object { object: hex } => hex,
        }
    }
}

/// Index of artifact files under a root directory, by artifact name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    index: BTreeMap<String, Vec<PathBuf>>,
}

impl ArtifactStore {
    /// Scan `root` recursively. A missing directory yields an empty store.
    pub fn scan(root: &Path) -> DeployResult<Self> {
        let mut store = Self::default();

        if !root.exists() {
            tracing::warn!(path = %root.display(), "Artifacts directory does not exist");
            return Ok(store);
        }

        store.scan_dir(root)?;
        for paths in store.index.values_mut() {
            paths.sort();
        }

        tracing::debug!(
            path = %root.display(),
            artifacts = store.index.len(),
            "Scanned artifacts"
        );
        Ok(store)
    }

    fn scan_dir(&mut self, dir: &Path) -> DeployResult<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            DeployError::Config(format!("failed to read artifacts directory {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry
                .map_err(|e| {
                    DeployError::Config(format!("failed to read entry of {}: {e}", dir.display()))
                })?
                .path();

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();

            if path.is_dir() {
                if !SKIPPED_DIRS.contains(&file_name) {
                    self.scan_dir(&path)?;
                }
                continue;
            }

            if !file_name.ends_with(".json") || file_name.ends_with(".dbg.json") {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                self.index.entry(stem.to_string()).or_default().push(path.clone());
            }
        }

        Ok(())
    }

    /// Paths of all files indexed under `artifact`.
    pub fn candidates(&self, artifact: &str) -> &[PathBuf] {
        self.index.get(artifact).map(Vec::as_slice).unwrap_or_default()
    }

    fn load(path: &Path) -> DeployResult<Artifact> {
        let invalid = |reason: String| DeployError::InvalidArtifact {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let raw: RawArtifact =
            serde_json::from_str(&content).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

        let hex = raw.bytecode.as_hex();
        if hex.contains("__$") {
            return Err(invalid("bytecode has unlinked library references".to_string()));
        }
        let bytecode: Bytes = hex
            .parse()
            .map_err(|e| invalid(format!("bytecode is not valid hex: {e}")))?;
        if bytecode.is_empty() {
            return Err(invalid(
                "no creation bytecode (abstract contract or interface?)".to_string(),
            ));
        }

        let layout = raw
            .storage_layout
            .map(StorageLayout::from_solc)
            .transpose()
            .map_err(invalid)?;

        Ok(Artifact {
            abi: raw.abi,
            bytecode,
            layout,
        })
    }
}

/// Maps `(name, version)` to typed artifacts.
#[derive(Debug, Clone)]
pub struct ImplementationResolver {
    store: ArtifactStore,
    contracts: BTreeMap<String, BTreeMap<String, String>>,
    proxy_artifact: String,
}

impl ImplementationResolver {
    /// Scan the configured artifacts directory.
    pub fn new(config: &ProxykitConfig) -> DeployResult<Self> {
        let store = ArtifactStore::scan(&config.artifacts_dir)?;
        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: ArtifactStore, config: &ProxykitConfig) -> Self {
        Self {
            store,
            contracts: config.contracts.clone(),
            proxy_artifact: config.proxy_artifact.clone(),
        }
    }

    /// Artifact name for a contract version: the explicit mapping if configured,
    /// otherwise `<name><Version>` (`Token` + `v2` becomes `TokenV2`).
    pub fn artifact_name(&self, name: &str, version: &str) -> String {
        if let Some(artifact) = self.contracts.get(name).and_then(|v| v.get(version)) {
            return artifact.clone();
        }

        let mut chars = version.chars();
        let suffix: String = chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect())
            .unwrap_or_default();
        format!("{name}{}", suffix.replace(['.', '-'], "_"))
    }

    /// Resolve a contract version to its ABI, bytecode and storage layout.
    ///
    /// Fails with [`DeployError::ArtifactNotFound`] when nothing matches,
    /// [`DeployError::AmbiguousArtifact`] when several files match, and
    /// [`DeployError::InvalidArtifact`] when the artifact lacks a storage layout.
    pub fn resolve(&self, name: &str, version: &str) -> DeployResult<ContractVersion> {
        let artifact_name = self.artifact_name(name, version);
        let path = match self.store.candidates(&artifact_name) {
            [] => {
                return Err(DeployError::ArtifactNotFound {
                    name: name.to_string(),
                    version: version.to_string(),
                    artifact: artifact_name,
                });
            }
            [path] => path,
            candidates => {
                return Err(DeployError::AmbiguousArtifact {
                    name: name.to_string(),
                    version: version.to_string(),
                    artifact: artifact_name,
                    candidates: candidates.to_vec(),
                });
            }
        };

        let artifact = ArtifactStore::load(path)?;
        let layout = artifact.layout.ok_or_else(|| DeployError::InvalidArtifact {
            path: path.clone(),
            reason: "no storageLayout; compile with storage layout output enabled".to_string(),
        })?;

        tracing::debug!(
            contract = name,
            version,
            artifact = %artifact_name,
            slots = layout.len(),
            "Resolved implementation"
        );

        Ok(ContractVersion {
            name: name.to_string(),
            version: version.to_string(),
            artifact: artifact_name,
            abi: artifact.abi,
            bytecode: artifact.bytecode,
            layout,
        })
    }

    /// Resolve the proxy contract artifact.
    pub fn resolve_proxy(&self) -> DeployResult<ProxyArtifact> {
        let path = match self.store.candidates(&self.proxy_artifact) {
            [path] => path,
            [] => {
                return Err(DeployError::ArtifactNotFound {
                    name: self.proxy_artifact.clone(),
                    version: "proxy".to_string(),
                    artifact: self.proxy_artifact.clone(),
                });
            }
            candidates => {
                return Err(DeployError::AmbiguousArtifact {
                    name: self.proxy_artifact.clone(),
                    version: "proxy".to_string(),
                    artifact: self.proxy_artifact.clone(),
                    candidates: candidates.to_vec(),
                });
            }
        };

        let artifact = ArtifactStore::load(path)?;
        Ok(ProxyArtifact {
            artifact: self.proxy_artifact.clone(),
            bytecode: artifact.bytecode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn write(root: &Path, relative: &str, value: serde_json::Value) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    fn foundry_artifact(layout: bool) -> serde_json::Value {
        let mut artifact = serde_json::json!({
            "abi": [{
                "type": "function",
                "name": "initialize",
                "inputs": [{ "name": "baseURI", "type": "string", "internalType": "string" }],
                "outputs": [],
                "stateMutability": "nonpayable"
            }],
            "bytecode": { "object": "0x6080604052", "linkReferences": {} }
        });
        if layout {
            artifact["storageLayout"] = serde_json::json!({
                "storage": [
                    { "astId": 3, "contract": "src/Token.sol:TokenV1", "label": "_owner", "offset": 0, "slot": "0", "type": "t_address" },
                    { "astId": 5, "contract": "src/Token.sol:TokenV1", "label": "baseURI", "offset": 0, "slot": "1", "type": "t_string_storage" }
                ],
                "types": {
                    "t_address": { "encoding": "inplace", "label": "address", "numberOfBytes": "20" },
                    "t_string_storage": { "encoding": "bytes", "label": "string", "numberOfBytes": "32" }
                }
            });
        }
        artifact
    }

    fn resolver(root: &Path) -> ImplementationResolver {
        let config = ProxykitConfig {
            artifacts_dir: root.to_path_buf(),
            ..Default::default()
        };
        ImplementationResolver::new(&config).unwrap()
    }

    #[test]
    fn test_resolves_foundry_artifact_by_convention() {
        let temp_dir = TempDir::new("proxykit-artifacts").unwrap();
        write(temp_dir.path(), "Token.sol/TokenV1.json", foundry_artifact(true));
        write(temp_dir.path(), "build-info/abc.json", serde_json::json!({}));

        let resolved = resolver(temp_dir.path()).resolve("Token", "v1").unwrap();
        assert_eq!(resolved.artifact, "TokenV1");
        assert_eq!(resolved.bytecode, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]));
        assert!(resolved.abi.function("initialize").is_some());
        assert_eq!(resolved.layout.len(), 2);
        assert_eq!(resolved.layout[1].ty.label, "string");
    }

    #[test]
    fn test_explicit_mapping_and_hardhat_format() {
        let temp_dir = TempDir::new("proxykit-artifacts").unwrap();
        let mut artifact = foundry_artifact(true);
        artifact["bytecode"] = serde_json::json!("0x6080");
        write(
            temp_dir.path(),
            "contracts/Custom.sol/CustomERC721UpgradeableV1.json",
            artifact,
        );
        write(
            temp_dir.path(),
            "contracts/Custom.sol/CustomERC721UpgradeableV1.dbg.json",
            serde_json::json!({ "buildInfo": "../../build-info/abc.json" }),
        );

        let config = ProxykitConfig::from_toml_str(&format!(
            r#"
            artifacts_dir = "{}"
            [contracts.Token]
            v1 = "CustomERC721UpgradeableV1"
            "#,
            temp_dir.path().display()
        ))
        .unwrap();
        let resolver = ImplementationResolver::new(&config).unwrap();

        let resolved = resolver.resolve("Token", "v1").unwrap();
        assert_eq!(resolved.artifact, "CustomERC721UpgradeableV1");
        assert_eq!(resolved.name, "Token");
    }

    #[test]
    fn test_missing_and_ambiguous_artifacts() {
        let temp_dir = TempDir::new("proxykit-artifacts").unwrap();
        write(temp_dir.path(), "A.sol/TokenV2.json", foundry_artifact(true));
        write(temp_dir.path(), "B.sol/TokenV2.json", foundry_artifact(true));

        let resolver = resolver(temp_dir.path());

        let err = resolver.resolve("Token", "v3").unwrap_err();
        assert!(matches!(err, DeployError::ArtifactNotFound { ref artifact, .. } if artifact == "TokenV3"));

        let err = resolver.resolve("Token", "v2").unwrap_err();
        match err {
            DeployError::AmbiguousArtifact { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_implementation_requires_storage_layout() {
        let temp_dir = TempDir::new("proxykit-artifacts").unwrap();
        write(temp_dir.path(), "Token.sol/TokenV1.json", foundry_artifact(false));
        write(temp_dir.path(), "ERC1967Proxy.sol/ERC1967Proxy.json", foundry_artifact(false));

        let resolver = resolver(temp_dir.path());
        let err = resolver.resolve("Token", "v1").unwrap_err();
        assert!(matches!(err, DeployError::InvalidArtifact { .. }));

        // The proxy has no layout requirement.
        let proxy = resolver.resolve_proxy().unwrap();
        assert_eq!(proxy.artifact, "ERC1967Proxy");
    }

    #[test]
    fn test_artifact_name_convention() {
        let resolver = ImplementationResolver::with_store(
            ArtifactStore::default(),
            &ProxykitConfig::default(),
        );
        assert_eq!(resolver.artifact_name("Token", "v2"), "TokenV2");
        assert_eq!(resolver.artifact_name("Token", "v1.1"), "TokenV1_1");
    }
}
