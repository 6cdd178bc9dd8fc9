//! Cache key derivation.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Version of the canonical document layout fed to the hash.
const KEY_FORMAT_VERSION: u32 = 1;

/// Canonical key identifying one logical prompt request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives fingerprints from (prompt identity, rendered inputs, model, call parameters).
///
/// Inputs and parameters are canonicalized before hashing: object keys are sorted at every
/// depth, so two maps holding the same pairs in different insertion order hash identically.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    salt: Option<String>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self { salt: None }
    }

    /// Namespace every derived key, keeping applications that share a cache directory apart.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn derive<I, P>(
        &self,
        identity: &str,
        rendered_inputs: &I,
        model: &str,
        params: &P,
    ) -> Result<Fingerprint>
    where
        I: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        let mut doc = Map::new();
        doc.insert("v".into(), Value::from(KEY_FORMAT_VERSION));
        doc.insert("identity".into(), Value::from(identity));
        doc.insert("inputs".into(), canonical_value(rendered_inputs, "inputs")?);
        doc.insert("model".into(), Value::from(model));
        doc.insert("params".into(), canonical_value(params, "params")?);
        if let Some(ref s) = self.salt {
            doc.insert("salt".into(), Value::from(s.as_str()));
        }
        let canonical = serde_json::to_string(&canonicalize(Value::Object(doc))).map_err(|e| {
            Error::configuration_with_context(
                format!("cache key is not canonically encodable: {}", e),
                ErrorContext::new().with_source("key_deriver"),
            )
        })?;
        Ok(Fingerprint(sha256_hex(canonical.as_bytes())))
    }
}

/// Derive a fingerprint with the default (unsalted) deriver.
pub fn derive_fingerprint<I, P>(
    identity: &str,
    rendered_inputs: &I,
    model: &str,
    params: &P,
) -> Result<Fingerprint>
where
    I: Serialize + ?Sized,
    P: Serialize + ?Sized,
{
    KeyDeriver::new().derive(identity, rendered_inputs, model, params)
}

fn canonical_value<T: Serialize + ?Sized>(value: &T, field: &str) -> Result<Value> {
    reject_non_finite(value, field)?;
    serde_json::to_value(value).map(canonicalize).map_err(|e| {
        Error::configuration_with_context(
            format!("value is not representable as a cache key: {}", e),
            ErrorContext::new()
                .with_field_path(field)
                .with_source("key_deriver"),
        )
    })
}

/// serde_json encodes NaN and infinities as `null`, which would alias them with absent
/// values. serde_yaml keeps them, so the value is inspected through its YAML form first.
fn reject_non_finite<T: Serialize + ?Sized>(value: &T, field: &str) -> Result<()> {
    let yaml = serde_yaml::to_value(value).map_err(|e| {
        Error::configuration_with_context(
            format!("value is not representable as a cache key: {}", e),
            ErrorContext::new()
                .with_field_path(field)
                .with_source("key_deriver"),
        )
    })?;
    if has_non_finite(&yaml) {
        return Err(Error::configuration_with_context(
            "NaN and infinite numbers cannot be part of a cache key",
            ErrorContext::new()
                .with_field_path(field)
                .with_source("key_deriver"),
        ));
    }
    Ok(())
}

fn has_non_finite(value: &serde_yaml::Value) -> bool {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::Number(n) => n.is_nan() || n.is_infinite(),
        Yaml::Sequence(items) => items.iter().any(has_non_finite),
        Yaml::Mapping(map) => map
            .iter()
            .any(|(k, v)| has_non_finite(k) || has_non_finite(v)),
        Yaml::Tagged(tagged) => has_non_finite(&tagged.value),
        Yaml::Null | Yaml::Bool(_) | Yaml::String(_) => false,
    }
}

/// Rebuild objects with sorted keys so the encoding is independent of the map
/// implementation serde_json was compiled with (`preserve_order` keeps insertion order).
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(String, Value)> = map.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
