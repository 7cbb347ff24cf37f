//! Schema registry.
//!
//! Declares every collection the store knows about, how each one is keyed,
//! and which secondary indices it carries. Each collection and index records
//! the schema version that introduced it, so the registry can answer what the
//! store looks like at any version up to [`SCHEMA_VERSION`].
//!
//! Adding a field to a record type never needs a version bump. Adding a
//! collection or an index does.

use crate::SchemaVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current schema version of the store.
pub const SCHEMA_VERSION: SchemaVersion = 2;

/// The fixed set of collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionName {
    Activities,
    Inventory,
    Sales,
    Expenses,
    Labour,
    Weather,
    TaxRecords,
}

impl CollectionName {
    /// Every collection, in declaration order.
    pub const ALL: [CollectionName; 7] = [
        CollectionName::Activities,
        CollectionName::Inventory,
        CollectionName::Sales,
        CollectionName::Expenses,
        CollectionName::Labour,
        CollectionName::Weather,
        CollectionName::TaxRecords,
    ];

    /// The stored name of this collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Activities => "activities",
            CollectionName::Inventory => "inventory",
            CollectionName::Sales => "sales",
            CollectionName::Expenses => "expenses",
            CollectionName::Labour => "labour",
            CollectionName::Weather => "weather",
            CollectionName::TaxRecords => "tax-records",
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown collection: {s}"))
    }
}

/// How primary keys are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Sequential integer keys assigned by the store
    Generated,
    /// Keys read from the record's key path
    Supplied,
}

/// A secondary lookup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name used in lookups
    pub name: &'static str,
    /// Record field the index is built over
    pub key_path: &'static str,
    /// Whether two records may share a value
    pub unique: bool,
    /// Schema version that introduced the index
    pub since: SchemaVersion,
}

impl IndexDef {
    const fn new(name: &'static str, key_path: &'static str, since: SchemaVersion) -> Self {
        Self {
            name,
            key_path,
            unique: false,
            since,
        }
    }

    const fn unique(name: &'static str, key_path: &'static str, since: SchemaVersion) -> Self {
        Self {
            name,
            key_path,
            unique: true,
            since,
        }
    }
}

/// Declaration of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionDef {
    pub name: CollectionName,
    /// Field holding the primary key
    pub key_path: &'static str,
    pub key_mode: KeyMode,
    pub indices: &'static [IndexDef],
    /// Schema version that introduced the collection
    pub since: SchemaVersion,
}

impl CollectionDef {
    /// Indices that exist at the given schema version.
    pub fn indices_at(&self, version: SchemaVersion) -> impl Iterator<Item = &'static IndexDef> {
        self.indices.iter().filter(move |index| index.since <= version)
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&'static IndexDef> {
        self.indices.iter().find(|index| index.name == name)
    }
}

const COLLECTIONS: &[CollectionDef] = &[
    CollectionDef {
        name: CollectionName::Activities,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[IndexDef::new("date", "date", 1), IndexDef::new("type", "type", 1)],
        since: 1,
    },
    CollectionDef {
        name: CollectionName::Inventory,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[
            IndexDef::unique("name", "name", 1),
            IndexDef::new("category", "category", 2),
        ],
        since: 1,
    },
    CollectionDef {
        name: CollectionName::Sales,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[
            IndexDef::new("date", "date", 1),
            IndexDef::new("product", "product", 1),
        ],
        since: 1,
    },
    CollectionDef {
        name: CollectionName::Expenses,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[
            IndexDef::new("date", "date", 1),
            IndexDef::new("category", "category", 1),
        ],
        since: 1,
    },
    CollectionDef {
        name: CollectionName::Labour,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[
            IndexDef::new("date", "date", 2),
            IndexDef::new("workerName", "workerName", 2),
        ],
        since: 2,
    },
    CollectionDef {
        name: CollectionName::Weather,
        key_path: "date",
        key_mode: KeyMode::Supplied,
        indices: &[IndexDef::new("location", "location", 2)],
        since: 2,
    },
    CollectionDef {
        name: CollectionName::TaxRecords,
        key_path: "id",
        key_mode: KeyMode::Generated,
        indices: &[IndexDef::new("taxYear", "taxYear", 2)],
        since: 2,
    },
];

/// The declared layout of the store at one schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registry {
    version: SchemaVersion,
    collections: &'static [CollectionDef],
}

impl Registry {
    /// The registry at [`SCHEMA_VERSION`].
    pub const fn current() -> Self {
        Self {
            version: SCHEMA_VERSION,
            collections: COLLECTIONS,
        }
    }

    /// The same declarations viewed at an earlier version.
    ///
    /// Returns `None` if `version` is newer than this registry or zero.
    pub fn at_version(self, version: SchemaVersion) -> Option<Self> {
        (version >= 1 && version <= self.version).then_some(Self {
            version,
            collections: self.collections,
        })
    }

    /// The schema version this registry describes.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Collections that exist at this registry's version.
    pub fn collections(&self) -> impl Iterator<Item = &'static CollectionDef> {
        let version = self.version;
        self.collections
            .iter()
            .filter(move |def| def.since <= version)
    }

    /// Look up a collection declared at this registry's version.
    pub fn collection(&self, name: CollectionName) -> Option<&'static CollectionDef> {
        self.collections().find(|def| def.name == name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::current()
    }
}
