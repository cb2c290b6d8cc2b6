//! Storage-layout descriptors and the upgrade compatibility check.
//!
//! A layout is the ordered list of persistent variables a contract declares, as emitted by
//! solc under `storageLayout`. An upgrade is safe when every existing variable keeps its type
//! and position and new variables are only appended after the existing ones. Types are
//! compared structurally: struct members, mapping keys and values and array elements follow
//! the same rules as top-level variables.

use std::{collections::BTreeMap, fmt};

use derive_more::Deref;
use serde::{Deserialize, Serialize};

/// The type of a persistent variable, resolved from solc's type table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageType {
    /// Human-readable type, e.g. `uint256` or `mapping(address => struct Token.Info)`.
    pub label: String,
    /// Bytes taken in place. Mappings and dynamic arrays take a single slot.
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "TypeShape::is_value")]
    pub shape: TypeShape,
}

/// How a type is laid out beyond its own slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TypeShape {
    /// Elementary types, `string`, `bytes`, enums and contracts. Compared by label.
    #[default]
    Value,
    Mapping {
        key: Box<StorageType>,
        value: Box<StorageType>,
    },
    /// Static or dynamic array of `base`.
    Array { base: Box<StorageType> },
    Struct { members: StorageLayout },
}

impl TypeShape {
    fn is_value(&self) -> bool {
        matches!(self, TypeShape::Value)
    }

    fn kind(&self) -> &'static str {
        match self {
            TypeShape::Value => "value",
            TypeShape::Mapping { .. } => "mapping",
            TypeShape::Array { .. } => "array",
            TypeShape::Struct { .. } => "struct",
        }
    }
}

impl StorageType {
    /// A type compared by label only.
    pub fn value(label: impl Into<String>, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            shape: TypeShape::Value,
        }
    }

    /// Whether the two types differ before looking inside them: a different kind of
    /// type, or a different elementary type.
    fn differs_shallowly(&self, other: &StorageType) -> bool {
        self.shape.kind() != other.shape.kind()
            || (self.shape.is_value() && self.label != other.label)
    }
}

/// A single persistent variable of a contract, or a member of a struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageSlot {
    pub label: String,
    pub slot: u64,
    pub offset: u32,
    #[serde(rename = "type")]
    pub ty: StorageType,
}

impl StorageSlot {
    fn position(&self) -> (u64, u32) {
        (self.slot, self.offset)
    }
}

impl fmt::Display for StorageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ slot {}+{}",
            self.ty.label, self.label, self.slot, self.offset
        )
    }
}

/// Ordered storage layout of a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Deref)]
pub struct StorageLayout(Vec<StorageSlot>);

/// The solc `storageLayout` output object.
#[derive(Debug, Deserialize)]
pub(crate) struct SolcStorageLayout {
    #[serde(default)]
    storage: Vec<SolcStorageEntry>,
    #[serde(default)]
    types: Option<BTreeMap<String, SolcStorageType>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SolcStorageEntry {
    label: String,
    slot: String,
    offset: u32,
    #[serde(rename = "type")]
    type_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolcStorageType {
    label: String,
    #[serde(default)]
    number_of_bytes: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    members: Option<Vec<SolcStorageEntry>>,
}

/// Resolves solc type ids into [`StorageType`]s.
struct TypeTable {
    types: BTreeMap<String, SolcStorageType>,
    /// Type ids being resolved, to cut recursion through self-referencing structs.
    resolving: Vec<String>,
}

impl TypeTable {
    fn entries(&mut self, entries: &[SolcStorageEntry]) -> Result<Vec<StorageSlot>, String> {
        entries
            .iter()
            .map(|entry| {
                let slot = entry.slot.parse::<u64>().map_err(|e| {
                    format!("invalid slot `{}` for {}: {e}", entry.slot, entry.label)
                })?;
                Ok(StorageSlot {
                    label: entry.label.clone(),
                    slot,
                    offset: entry.offset,
                    ty: self.resolve(&entry.type_id)?,
                })
            })
            .collect()
    }

    fn resolve(&mut self, id: &str) -> Result<StorageType, String> {
        let Some(raw) = self.types.get(id) else {
            return Ok(StorageType::value(id, 0));
        };
        let label = raw.label.clone();
        let size = match &raw.number_of_bytes {
            Some(bytes) => bytes
                .parse::<u64>()
                .map_err(|e| format!("invalid numberOfBytes `{bytes}` for {label}: {e}"))?,
            None => 0,
        };
        if self.resolving.iter().any(|r| r == id) {
            return Ok(StorageType::value(label, size));
        }

        let key = raw.key.clone();
        let value = raw.value.clone();
        let base = raw.base.clone();
        let members = raw.members.clone();

        self.resolving.push(id.to_string());
        let shape = match (key, value, base, members) {
            (Some(key), Some(value), _, _) => Ok(TypeShape::Mapping {
                key: Box::new(self.resolve(&key)?),
                value: Box::new(self.resolve(&value)?),
            }),
            (_, _, Some(base), _) => Ok(TypeShape::Array {
                base: Box::new(self.resolve(&base)?),
            }),
            (_, _, _, Some(members)) => self
                .entries(&members)
                .map(|members| TypeShape::Struct {
                    members: StorageLayout::new(members),
                }),
            _ => Ok(TypeShape::Value),
        };
        self.resolving.pop();

        Ok(StorageType {
            label,
            size,
            shape: shape?,
        })
    }
}

impl StorageLayout {
    pub fn new(mut slots: Vec<StorageSlot>) -> Self {
        slots.sort_by_key(StorageSlot::position);
        Self(slots)
    }

    /// Build a layout from solc output, resolving type ids through its type table.
    pub(crate) fn from_solc(solc: SolcStorageLayout) -> Result<Self, String> {
        let mut table = TypeTable {
            types: solc.types.unwrap_or_default(),
            resolving: Vec::new(),
        };
        Ok(Self::new(table.entries(&solc.storage)?))
    }

    pub fn slots(&self) -> &[StorageSlot] {
        &self.0
    }
}

/// A rule broken by a candidate layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "kebab-case")]
pub enum LayoutViolation {
    /// An existing variable has no counterpart in the candidate.
    Removed { existing: StorageSlot },
    /// The variable at an existing position changed type.
    TypeChanged {
        existing: StorageSlot,
        candidate: StorageSlot,
    },
    /// The variable at an existing index sits at a different slot/offset.
    Moved {
        existing: StorageSlot,
        candidate: StorageSlot,
    },
    /// The variable kept its kind of type but something inside it changed: a struct
    /// member, a mapping key or value, or an array element.
    NestedChanged {
        existing: StorageSlot,
        changes: Vec<String>,
    },
}

impl fmt::Display for LayoutViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed { existing } => write!(f, "removed `{existing}`"),
            Self::TypeChanged {
                existing,
                candidate,
            } => write!(
                f,
                "`{}` changed type from {} to {}",
                existing.label, existing.ty.label, candidate.ty.label
            ),
            Self::Moved {
                existing,
                candidate,
            } => write!(
                f,
                "`{}` moved from slot {}+{} to {}+{}",
                existing.label, existing.slot, existing.offset, candidate.slot, candidate.offset
            ),
            Self::NestedChanged { existing, changes } => write!(
                f,
                "`{}` ({}) changed inside: {}",
                existing.label,
                existing.ty.label,
                changes.join("; ")
            ),
        }
    }
}

/// Outcome of comparing a deployed layout with an upgrade candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutReport {
    pub violations: Vec<LayoutViolation>,
    /// Variables added after the end of the existing layout.
    pub appended: Vec<StorageSlot>,
    /// `(old, new)` labels of variables renamed in place.
    pub renamed: Vec<(String, String)>,
}

impl LayoutReport {
    pub fn is_compatible(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Incompatible differences between two types of the same kind.
///
/// `room` says whether the type may grow: a struct can take new trailing members when
/// nothing is laid out right after it (a mapping value), or when any overlap shows up as a
/// moved variable anyway (a variable or struct member). Array elements never have room.
fn nested_changes(existing: &StorageType, candidate: &StorageType, room: bool) -> Vec<String> {
    if existing.differs_shallowly(candidate) {
        return vec![format!(
            "type changed from {} to {}",
            existing.label, candidate.label
        )];
    }

    match (&existing.shape, &candidate.shape) {
        (
            TypeShape::Mapping { key, value },
            TypeShape::Mapping {
                key: new_key,
                value: new_value,
            },
        ) => {
            let mut changes: Vec<String> = nested_changes(key, new_key, false)
                .into_iter()
                .map(|c| format!("mapping key: {c}"))
                .collect();
            changes.extend(
                nested_changes(value, new_value, true)
                    .into_iter()
                    .map(|c| format!("mapping value: {c}")),
            );
            changes
        }
        (TypeShape::Array { base }, TypeShape::Array { base: new_base }) => {
            let mut changes: Vec<String> = nested_changes(base, new_base, false)
                .into_iter()
                .map(|c| format!("array element: {c}"))
                .collect();
            if existing.size != candidate.size {
                changes.push(format!(
                    "array changed from {} to {}",
                    existing.label, candidate.label
                ));
            }
            changes
        }
        (TypeShape::Struct { members }, TypeShape::Struct { members: new_members }) => {
            let report = check_compatibility(members, new_members);
            let mut changes: Vec<String> = report
                .violations
                .iter()
                .map(|v| format!("member {v}"))
                .collect();
            if candidate.size > existing.size && !room {
                changes.push(format!(
                    "{} grows from {} to {} bytes with no room after it",
                    existing.label, existing.size, candidate.size
                ));
            } else if candidate.size < existing.size && changes.is_empty() {
                changes.push(format!(
                    "{} shrinks from {} to {} bytes",
                    existing.label, existing.size, candidate.size
                ));
            }
            changes
        }
        _ => Vec::new(),
    }
}

/// Compare `current` against `candidate`.
///
/// Variables are matched by index: the n-th variable of `candidate` must have the same
/// type and slot/offset as the n-th variable of `current`. Anything past the end of
/// `current` is an append, and must not overlap the existing variables.
pub fn check_compatibility(current: &StorageLayout, candidate: &StorageLayout) -> LayoutReport {
    let mut report = LayoutReport::default();

    for (index, existing) in current.iter().enumerate() {
        let Some(new) = candidate.get(index) else {
            let violation = match candidate.iter().find(|s| s.label == existing.label) {
                Some(found) => LayoutViolation::Moved {
                    existing: existing.clone(),
                    candidate: found.clone(),
                },
                None => LayoutViolation::Removed {
                    existing: existing.clone(),
                },
            };
            report.violations.push(violation);
            continue;
        };

        if existing.ty.differs_shallowly(&new.ty) {
            // A different variable at this index is either a deletion or an insertion.
            let still_declared = candidate.iter().any(|s| s.label == existing.label);
            if new.label != existing.label && !still_declared {
                report.violations.push(LayoutViolation::Removed {
                    existing: existing.clone(),
                });
            } else {
                report.violations.push(LayoutViolation::TypeChanged {
                    existing: existing.clone(),
                    candidate: new.clone(),
                });
            }
            continue;
        }

        let changes = nested_changes(&existing.ty, &new.ty, true);
        if !changes.is_empty() {
            report.violations.push(LayoutViolation::NestedChanged {
                existing: existing.clone(),
                changes,
            });
        } else if new.position() != existing.position() {
            report.violations.push(LayoutViolation::Moved {
                existing: existing.clone(),
                candidate: new.clone(),
            });
        } else if new.label != existing.label {
            report
                .renamed
                .push((existing.label.clone(), new.label.clone()));
        }
    }

    let end = current.last().map(StorageSlot::position);
    for new in candidate.iter().skip(current.len()) {
        if let Some(end) = end {
            if new.position() <= end {
                report.violations.push(LayoutViolation::Moved {
                    existing: current[current.len() - 1].clone(),
                    candidate: new.clone(),
                });
                continue;
            }
        }
        report.appended.push(new.clone());
    }

    report
}
