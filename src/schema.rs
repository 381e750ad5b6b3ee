//! Schema node tree and the type-directed codec between user values and
//! the backend's stored form.
//!
//! The tree is a plain recursive sum type; as the design notes insist, the
//! codec is a single recursive function over it rather than virtual methods
//! hung off each variant.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// Field names no user schema may declare.
pub const RESERVED_FIELDS: &[&str] = &["id", "createdAt", "updatedAt"];

/// A recursive, tagged schema tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// A short string.
    String,
    /// Unbounded text.
    Text,
    /// A number (stored as f64).
    Number,
    /// A boolean.
    Boolean,
    /// A timestamp, stored as milliseconds since epoch.
    Date,
    /// Raw bytes, base64 on the wire.
    Bytes,
    /// `inner`, or absent.
    Optional(Box<Schema>),
    /// A homogeneous array.
    Array(Box<Schema>),
    /// A string-keyed map with homogeneous values.
    Record(Box<Schema>),
    /// A fixed set of named properties.
    Object(Vec<(String, Schema)>),
    /// A single fixed value.
    Literal(Value),
    /// One of several alternative shapes.
    Union(Vec<Schema>),
}

impl Schema {
    /// Validates `value` against this schema, returning a human-readable
    /// mismatch reason on failure.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match (self, value) {
            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::Text, Value::String(_)) => Ok(()),
            (Schema::Number, Value::Number(_)) => Ok(()),
            (Schema::Boolean, Value::Bool(_)) => Ok(()),
            (Schema::Date, Value::Number(_)) => Ok(()),
            (Schema::Date, Value::String(_)) => Ok(()),
            (Schema::Bytes, Value::String(_)) => Ok(()),
            (Schema::Optional(_), Value::Null) => Ok(()),
            (Schema::Optional(inner), v) => inner.validate(v),
            (Schema::Array(inner), Value::Array(items)) => {
                for item in items {
                    inner.validate(item)?;
                }
                Ok(())
            }
            (Schema::Record(inner), Value::Object(map)) => {
                for v in map.values() {
                    inner.validate(v)?;
                }
                Ok(())
            }
            (Schema::Object(props), Value::Object(map)) => {
                for (name, schema) in props {
                    match map.get(name) {
                        Some(v) => schema.validate(v)?,
                        None => {
                            if !matches!(schema, Schema::Optional(_)) {
                                return Err(format!("missing field {name:?}"));
                            }
                        }
                    }
                }
                Ok(())
            }
            (Schema::Literal(expected), actual) if expected == actual => Ok(()),
            (Schema::Union(variants), v) => {
                if variants.iter().any(|s| s.validate(v).is_ok()) {
                    Ok(())
                } else {
                    Err("value matches no union variant".into())
                }
            }
            (schema, actual) => Err(format!("expected {schema:?}, got {actual:?}")),
        }
    }

    /// Collects every reserved field name this schema declares at its top
    /// level, used when validating a collection definition.
    pub fn reserved_violations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Schema::Object(props) = self {
            let reserved: BTreeSet<&str> = RESERVED_FIELDS.iter().copied().collect();
            for (name, _) in props {
                if reserved.contains(name.as_str()) {
                    out.push(name.clone());
                }
            }
        }
        out
    }
}

/// A single entry in a collection's schema-version chain.
pub struct SchemaVersion {
    /// The version number this entry describes; versions are 1-indexed.
    pub version: u32,
    /// The shape data must conform to under this version.
    pub schema: Schema,
    /// Upgrades a record's data from the *previous* version to this one.
    /// Mandatory for every version after the first.
    pub migrate: Option<Box<dyn Fn(Value) -> Value + Send + Sync>>,
}

/// An ordered, validated chain of schema versions for one collection.
pub struct SchemaChain {
    versions: Vec<SchemaVersion>,
}

impl SchemaChain {
    /// Builds a chain, checking that every non-first version carries a
    /// `migrate` function and that no declared object schema uses a
    /// reserved field name.
    pub fn new(collection: &str, versions: Vec<SchemaVersion>) -> Result<Self> {
        if versions.is_empty() {
            return Err(Error::SchemaMismatch {
                collection: collection.to_string(),
                reason: "collection must declare at least one schema version".into(),
            });
        }
        for (i, v) in versions.iter().enumerate() {
            if i > 0 && v.migrate.is_none() {
                return Err(Error::SchemaMismatch {
                    collection: collection.to_string(),
                    reason: format!("version {} is missing a migrate function", v.version),
                });
            }
            let bad = v.schema.reserved_violations();
            if let Some(field) = bad.into_iter().next() {
                return Err(Error::ReservedField {
                    collection: collection.to_string(),
                    field,
                });
            }
        }
        Ok(Self { versions })
    }

    /// The highest declared version; the canonical current shape.
    pub fn current_version(&self) -> u32 {
        self.versions.last().map(|v| v.version).unwrap_or(1)
    }

    /// The schema for the current (highest) version.
    pub fn current_schema(&self) -> &Schema {
        &self.versions.last().expect("non-empty by construction").schema
    }

    /// Applies the chain of `migrate` functions starting just after
    /// `from_version`, returning the upgraded value at `current_version`.
    pub fn migrate(&self, from_version: u32, mut data: Value) -> Value {
        for v in &self.versions {
            if v.version > from_version {
                if let Some(migrate) = &v.migrate {
                    data = migrate(data);
                }
            }
        }
        data
    }
}

/// Kind discriminant used by computed/field indexes when comparing keys
/// that may originate from different JSON types.
pub fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(format!("s:{s}")),
        Value::Number(n) => Some(format!("n:{n}")),
        Value::Bool(b) => Some(format!("b:{b}")),
        other => Some(format!("j:{other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_object_schema() {
        let schema = Schema::Object(vec![
            ("name".into(), Schema::String),
            ("age".into(), Schema::Optional(Box::new(Schema::Number))),
        ]);
        assert!(schema.validate(&json!({"name": "Alice"})).is_ok());
        assert!(schema.validate(&json!({"name": "Alice", "age": 30})).is_ok());
        assert!(schema.validate(&json!({"age": 30})).is_err());
    }

    #[test]
    fn rejects_reserved_fields() {
        let schema = Schema::Object(vec![("id".into(), Schema::String)]);
        assert_eq!(schema.reserved_violations(), vec!["id".to_string()]);
    }

    #[test]
    fn migration_chain_requires_migrate_after_v1() {
        let versions = vec![
            SchemaVersion {
                version: 1,
                schema: Schema::Object(vec![("name".into(), Schema::String)]),
                migrate: None,
            },
            SchemaVersion {
                version: 2,
                schema: Schema::Object(vec![
                    ("name".into(), Schema::String),
                    ("displayName".into(), Schema::String),
                ]),
                migrate: None,
            },
        ];
        assert!(SchemaChain::new("users", versions).is_err());
    }

    #[test]
    fn migration_upgrades_value() {
        let versions = vec![
            SchemaVersion {
                version: 1,
                schema: Schema::Object(vec![("name".into(), Schema::String)]),
                migrate: None,
            },
            SchemaVersion {
                version: 2,
                schema: Schema::Object(vec![
                    ("name".into(), Schema::String),
                    ("displayName".into(), Schema::String),
                ]),
                migrate: Some(Box::new(|mut d| {
                    let name = d.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_uppercase();
                    d.as_object_mut().unwrap().insert("displayName".into(), json!(name));
                    d
                })),
            },
        ];
        let chain = SchemaChain::new("users", versions).unwrap();
        let migrated = chain.migrate(1, json!({"name": "alice"}));
        assert_eq!(migrated["displayName"], json!("ALICE"));
    }
}
