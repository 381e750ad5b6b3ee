//! Collection definitions: the value-only blueprint consumed by the engine
//! at database open.
//!
//! The staged builder follows a "builder chains with evolving type state"
//! shape: a pre-version builder exposes only `v1`, a post-version builder
//! additionally exposes `v`, `index`, `computed`, `build`. The blueprint
//! stays a plain value, materialized only when the database opens —
//! schemas remain inert data until joined into a live document.

use crate::error::{Error, Result};
use crate::schema::{Schema, SchemaChain, SchemaVersion};
use serde_json::Value;
use std::sync::Arc;

/// A field index: `{fields, unique?, sparse?, name?}`.
pub struct FieldIndex {
    /// Display/lookup name; defaults to the joined field path list.
    pub name: String,
    /// Dot-separated field paths making up the index key.
    pub fields: Vec<String>,
    /// Whether at most one live record may share a key.
    pub unique: bool,
    /// Whether records missing any indexed field are simply omitted
    /// instead of indexed under a null key.
    pub sparse: bool,
}

/// A computed index: a deterministic pure function from record data to an
/// index key.
pub struct ComputedIndex {
    /// Index name.
    pub name: String,
    /// Pure function from record data to a scalar key, or `None` to omit
    /// the record from the index.
    pub compute: Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>,
    /// Whether at most one live record may share a computed key.
    pub unique: bool,
    /// Whether `compute` returning `None` simply omits the record from the
    /// index rather than erroring.
    pub sparse: bool,
}

/// An index declared on a collection: either a field index or a computed one.
pub enum IndexDef {
    /// See [`FieldIndex`].
    Field(FieldIndex),
    /// See [`ComputedIndex`].
    Computed(ComputedIndex),
}

impl IndexDef {
    /// The index's lookup name.
    pub fn name(&self) -> &str {
        match self {
            IndexDef::Field(f) => &f.name,
            IndexDef::Computed(c) => &c.name,
        }
    }

    /// Whether the index enforces uniqueness.
    pub fn is_unique(&self) -> bool {
        match self {
            IndexDef::Field(f) => f.unique,
            IndexDef::Computed(c) => c.unique,
        }
    }
}

/// A materialized collection definition: name, schema chain, and indexes.
pub struct CollectionDef {
    /// Unique collection name; names starting with `__` are library-reserved.
    pub name: String,
    /// Ordered schema-version chain.
    pub schema: SchemaChain,
    /// Declared indexes.
    pub indexes: Vec<IndexDef>,
}

impl CollectionDef {
    /// The highest declared schema version.
    pub fn current_version(&self) -> u32 {
        self.schema.current_version()
    }
}

/// Entry point for defining a collection: `CollectionBuilder::new("users").v1(schema)`.
pub struct CollectionBuilder {
    name: String,
}

impl CollectionBuilder {
    /// Starts defining a collection named `name`.
    ///
    /// # Errors
    /// Returns an error immediately if `name` is reserved (starts with `__`).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.starts_with("__") {
            return Err(Error::InvalidName(name));
        }
        Ok(Self { name })
    }

    /// Declares the first schema version. Returns a builder that can add
    /// further versions, indexes, and finally be built.
    pub fn v1(self, schema: Schema) -> VersionedCollectionBuilder {
        VersionedCollectionBuilder {
            name: self.name,
            versions: vec![SchemaVersion {
                version: 1,
                schema,
                migrate: None,
            }],
            indexes: Vec::new(),
        }
    }
}

/// A collection builder that has at least one schema version declared.
pub struct VersionedCollectionBuilder {
    name: String,
    versions: Vec<SchemaVersion>,
    indexes: Vec<IndexDef>,
}

impl VersionedCollectionBuilder {
    /// Declares schema version `version`, with a mandatory `migrate`
    /// function upgrading from the previous version's shape.
    pub fn v(
        mut self,
        version: u32,
        schema: Schema,
        migrate: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.versions.push(SchemaVersion {
            version,
            schema,
            migrate: Some(Box::new(migrate)),
        });
        self
    }

    /// Declares a field index.
    pub fn index(mut self, fields: &[&str], unique: bool, sparse: bool) -> Self {
        let name = fields.join(",");
        self.indexes.push(IndexDef::Field(FieldIndex {
            name,
            fields: fields.iter().map(|s| s.to_string()).collect(),
            unique,
            sparse,
        }));
        self
    }

    /// Declares a computed index.
    pub fn computed(
        mut self,
        name: impl Into<String>,
        unique: bool,
        sparse: bool,
        compute: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.indexes.push(IndexDef::Computed(ComputedIndex {
            name: name.into(),
            compute: Arc::new(compute),
            unique,
            sparse,
        }));
        self
    }

    /// Materializes the blueprint into a `CollectionDef`, validating the
    /// schema chain (reserved fields, mandatory migrations).
    pub fn build(self) -> Result<CollectionDef> {
        let schema = SchemaChain::new(&self.name, self.versions)?;
        Ok(CollectionDef {
            name: self.name,
            schema,
            indexes: self.indexes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn builds_a_simple_collection() {
        let def = CollectionBuilder::new("users")
            .unwrap()
            .v1(Schema::Object(vec![
                ("name".into(), Schema::String),
                ("email".into(), Schema::String),
            ]))
            .index(&["email"], true, false)
            .build()
            .unwrap();
        assert_eq!(def.current_version(), 1);
        assert_eq!(def.indexes.len(), 1);
    }

    #[test]
    fn rejects_reserved_collection_names() {
        assert!(CollectionBuilder::new("__internal").is_err());
    }
}
