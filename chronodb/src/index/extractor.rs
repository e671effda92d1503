//! Index value extractors.
//!
//! An extractor turns a stored value into the set of strings it is indexed
//! under. Extractors are user-supplied at index registration, so only their
//! descriptor -- a tagged builtin kind, or a registered name plus parameters
//! -- is ever persisted. Resolution back to runnable code goes through the
//! registry; a serialized closure never touches disk.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Extracts the indexed values of a stored value. Multi-valued extraction is
/// the norm: a value may be indexed under several strings at once.
pub trait ValueExtractor: Send + Sync {
    fn extract(&self, value: &[u8]) -> BTreeSet<String>;
}

/// Creates extractor instances for one registered name from persisted
/// parameters.
pub trait ExtractorFactory: Send + Sync {
    fn create(&self, params: &serde_json::Value) -> CResult<Arc<dyn ValueExtractor>>;
}

/// The persisted shape of an extractor: builtins as tagged variants, custom
/// extractors by registered name and parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExtractorKind {
    /// Reads one field out of a JSON value. A string, number, or bool field
    /// yields one value; an array of scalars yields one value per element;
    /// anything else (including non-JSON values) yields none.
    JsonField { field: String },
    /// Indexes the whole value as UTF-8 text.
    Utf8,
    /// A named extractor resolved against the registry at runtime.
    Named {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

struct JsonFieldExtractor {
    field: String,
}

impl ValueExtractor for JsonFieldExtractor {
    fn extract(&self, value: &[u8]) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(value) else {
            return values;
        };
        match parsed.get(&self.field) {
            Some(serde_json::Value::String(s)) => {
                values.insert(s.clone());
            }
            Some(serde_json::Value::Number(n)) => {
                values.insert(n.to_string());
            }
            Some(serde_json::Value::Bool(b)) => {
                values.insert(b.to_string());
            }
            Some(serde_json::Value::Array(elements)) => {
                for element in elements {
                    match element {
                        serde_json::Value::String(s) => {
                            values.insert(s.clone());
                        }
                        serde_json::Value::Number(n) => {
                            values.insert(n.to_string());
                        }
                        serde_json::Value::Bool(b) => {
                            values.insert(b.to_string());
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        values
    }
}

struct Utf8Extractor;

impl ValueExtractor for Utf8Extractor {
    fn extract(&self, value: &[u8]) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        values.insert(String::from_utf8_lossy(value).into_owned());
        values
    }
}

/// The runtime registry of named extractor factories. Builtin kinds resolve
/// without registration.
pub struct ExtractorRegistry {
    named: RwLock<HashMap<String, Arc<dyn ExtractorFactory>>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self { named: RwLock::new(HashMap::new()) }
    }

    /// Registers a named extractor factory, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn ExtractorFactory>) {
        self.named
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), factory);
    }

    /// Resolves a persisted descriptor to a runnable extractor.
    pub fn resolve(&self, kind: &ExtractorKind) -> CResult<Arc<dyn ValueExtractor>> {
        match kind {
            ExtractorKind::JsonField { field } => {
                Ok(Arc::new(JsonFieldExtractor { field: field.clone() }))
            }
            ExtractorKind::Utf8 => Ok(Arc::new(Utf8Extractor)),
            ExtractorKind::Named { name, params } => {
                let factory = self
                    .named
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(name)
                    .cloned();
                match factory {
                    Some(factory) => factory.create(params),
                    None => Err(Error::Internal(format!(
                        "extractor {:?} is not registered in this process",
                        name
                    ))),
                }
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(kind: &ExtractorKind, value: &[u8]) -> BTreeSet<String> {
        ExtractorRegistry::new().resolve(kind).unwrap().extract(value)
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn json_field_scalars_and_arrays() {
        let kind = ExtractorKind::JsonField { field: "tags".to_string() };
        assert_eq!(extract(&kind, br#"{"tags": "blue"}"#), set(&["blue"]));
        assert_eq!(extract(&kind, br#"{"tags": 42}"#), set(&["42"]));
        assert_eq!(extract(&kind, br#"{"tags": true}"#), set(&["true"]));
        assert_eq!(
            extract(&kind, br#"{"tags": ["blue", "green", "blue"]}"#),
            set(&["blue", "green"])
        );
        // Missing field, nested object, non-JSON: nothing indexed.
        assert_eq!(extract(&kind, br#"{"other": 1}"#), set(&[]));
        assert_eq!(extract(&kind, br#"{"tags": {"a": 1}}"#), set(&[]));
        assert_eq!(extract(&kind, b"\xff\xfe"), set(&[]));
    }

    #[test]
    fn utf8_extracts_whole_value() {
        assert_eq!(extract(&ExtractorKind::Utf8, b"hello"), set(&["hello"]));
    }

    #[test]
    fn named_extractors_resolve_through_registry() -> CResult<()> {
        struct Upper;
        impl ValueExtractor for Upper {
            fn extract(&self, value: &[u8]) -> BTreeSet<String> {
                let mut values = BTreeSet::new();
                values.insert(String::from_utf8_lossy(value).to_uppercase());
                values
            }
        }
        struct UpperFactory;
        impl ExtractorFactory for UpperFactory {
            fn create(&self, _params: &serde_json::Value) -> CResult<Arc<dyn ValueExtractor>> {
                Ok(Arc::new(Upper))
            }
        }

        let registry = ExtractorRegistry::new();
        let kind = ExtractorKind::Named {
            name: "upper".to_string(),
            params: serde_json::Value::Null,
        };
        assert!(registry.resolve(&kind).is_err());

        registry.register("upper", Arc::new(UpperFactory));
        let extractor = registry.resolve(&kind)?;
        assert_eq!(extractor.extract(b"abc"), set(&["ABC"]));
        Ok(())
    }

    #[test]
    fn descriptors_round_trip_as_json() -> CResult<()> {
        let kinds = vec![
            ExtractorKind::JsonField { field: "name".to_string() },
            ExtractorKind::Utf8,
            ExtractorKind::Named {
                name: "custom".to_string(),
                params: serde_json::json!({"limit": 3}),
            },
        ];
        let encoded = serde_json::to_string(&kinds)?;
        let decoded: Vec<ExtractorKind> = serde_json::from_str(&encoded)?;
        assert_eq!(decoded, kinds);
        Ok(())
    }
}
