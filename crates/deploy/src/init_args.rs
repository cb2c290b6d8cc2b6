//! Initializer arguments.
//!
//! Arguments are JSON, either positional (`["https://x/", 5]`) or keyed by parameter
//! name (`{"baseURI": "https://x/"}`). Each value is coerced to the ABI type of the
//! matching initializer parameter.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{Function, JsonAbi},
    primitives::Bytes,
};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{DeployError, DeployResult};

/// Name of the initializer function when none is given.
pub const DEFAULT_INITIALIZER: &str = "initialize";

/// Arguments for a proxy's one-time initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    value: Value,
}

impl Default for InitArgs {
    fn default() -> Self {
        Self {
            value: Value::Array(Vec::new()),
        }
    }
}

impl std::str::FromStr for InitArgs {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| DeployError::InvalidInitArgs(format!("not valid JSON: {e}")))?;
        Self::from_json(value)
    }
}

impl InitArgs {
    pub fn from_json(value: Value) -> DeployResult<Self> {
        match value {
            Value::Array(_) | Value::Object(_) => Ok(Self { value }),
            Value::Null => Ok(Self::default()),
            other => Err(DeployError::InvalidInitArgs(format!(
                "expected a JSON array or object, got `{other}`"
            ))),
        }
    }

    pub fn as_json(&self) -> &Value {
        &self.value
    }

    /// SHA-256 of the canonical JSON form, hex-encoded.
    ///
    /// Object keys are sorted first, so the hash does not depend on how the caller
    /// ordered them.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical(&self.value).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// ABI-encode a call to `initializer` of `abi` with these arguments.
    pub fn encode_call(&self, abi: &JsonAbi, initializer: &str) -> DeployResult<Bytes> {
        let function = self.select(abi, initializer)?;
        let values = self.ordered_values(function)?;

        let coerced = function
            .inputs
            .iter()
            .zip(values)
            .map(|(param, value)| {
                let ty: DynSolType = param.resolve().map_err(|e| {
                    DeployError::InvalidInitArgs(format!(
                        "unsupported type `{}` of `{}`: {e}",
                        param.ty, param.name
                    ))
                })?;
                coerce(&ty, value).map_err(|e| {
                    DeployError::InvalidInitArgs(format!(
                        "`{}` is not a valid {}: {e}",
                        param.name, param.ty
                    ))
                })
            })
            .collect::<DeployResult<Vec<DynSolValue>>>()?;

        let data = function.abi_encode_input(&coerced).map_err(|e| {
            DeployError::InvalidInitArgs(format!("failed to encode {initializer}: {e}"))
        })?;
        Ok(data.into())
    }

    fn len(&self) -> usize {
        match &self.value {
            Value::Array(values) => values.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        }
    }

    /// Pick the overload of `name` whose arity matches the arguments.
    fn select<'a>(&self, abi: &'a JsonAbi, name: &str) -> DeployResult<&'a Function> {
        let overloads = abi.function(name).ok_or_else(|| {
            DeployError::InvalidInitArgs(format!("the ABI has no function `{name}`"))
        })?;

        let matching: Vec<&Function> = overloads
            .iter()
            .filter(|f| f.inputs.len() == self.len())
            .collect();

        match matching.as_slice() {
            [function] => Ok(*function),
            [] => Err(DeployError::InvalidInitArgs(format!(
                "`{name}` takes {} argument(s), {} given",
                overloads
                    .iter()
                    .map(|f| f.inputs.len().to_string())
                    .collect::<Vec<_>>()
                    .join(" or "),
                self.len()
            ))),
            _ => Err(DeployError::InvalidInitArgs(format!(
                "`{name}` has several overloads taking {} argument(s)",
                self.len()
            ))),
        }
    }

    /// Arguments in parameter order.
    fn ordered_values<'a>(&'a self, function: &Function) -> DeployResult<Vec<&'a Value>> {
        match &self.value {
            Value::Array(values) => Ok(values.iter().collect()),
            Value::Object(map) => function
                .inputs
                .iter()
                .map(|param| {
                    map.get(&param.name).ok_or_else(|| {
                        DeployError::InvalidInitArgs(format!(
                            "missing argument `{}` of {}",
                            param.name,
                            function.signature()
                        ))
                    })
                })
                .collect(),
            _ => Ok(Vec::new()),
        }
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn coerce(ty: &DynSolType, value: &Value) -> Result<DynSolValue, String> {
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items))
        | (DynSolType::FixedArray(inner, _), Value::Array(items)) => {
            let values = items
                .iter()
                .map(|item| coerce(inner, item))
                .collect::<Result<Vec<_>, _>>()?;
            match ty {
                DynSolType::FixedArray(_, len) if *len != values.len() => {
                    Err(format!("expected {len} elements, got {}", values.len()))
                }
                DynSolType::FixedArray(..) => Ok(DynSolValue::FixedArray(values)),
                _ => Ok(DynSolValue::Array(values)),
            }
        }
        (DynSolType::Tuple(types), Value::Array(items)) if types.len() == items.len() => types
            .iter()
            .zip(items)
            .map(|(ty, item)| coerce(ty, item))
            .collect::<Result<Vec<_>, _>>()
            .map(DynSolValue::Tuple),
        (_, Value::String(s)) => ty.coerce_str(s).map_err(|e| e.to_string()),
        (_, Value::Number(_) | Value::Bool(_)) => {
            ty.coerce_str(&value.to_string()).map_err(|e| e.to_string())
        }
        _ => Err(format!("cannot convert `{value}`")),
    }
}
