//! Error types for the record store.

use crate::{CollectionName, Key, SchemaVersion};
use std::fmt;
use thiserror::Error;

/// Boxed cause carried by [`StoreError::Storage`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The store operation an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Open,
    Add,
    Get,
    GetAll,
    Update,
    Remove,
    Clear,
    Export,
    Import,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Open => "open",
            Op::Add => "add",
            Op::Get => "get",
            Op::GetAll => "getAll",
            Op::Update => "update",
            Op::Remove => "remove",
            Op::Clear => "clear",
            Op::Export => "export",
            Op::Import => "import",
        };
        f.write_str(name)
    }
}

/// Why the structured store could not be opened or upgraded.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("structured store unavailable: {0}")]
    Unavailable(String),

    #[error("schema upgrade to version {version} blocked: {reason}")]
    UpgradeBlocked {
        version: SchemaVersion,
        reason: String,
    },

    #[error("stored schema version {stored} is newer than requested version {requested}")]
    VersionTooNew {
        stored: SchemaVersion,
        requested: SchemaVersion,
    },

    #[error("registry does not declare schema version {requested} (latest is {latest})")]
    UnknownVersion {
        requested: SchemaVersion,
        latest: SchemaVersion,
    },

    #[error("failed to open structured store: {0}")]
    Open(#[source] sqlx::Error),
}

/// All errors surfaced by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// `collection` is `None` for whole-store operations such as export.
    #[error("{op}{} attempted before the store was opened", on_collection(.collection))]
    NotInitialized {
        collection: Option<CollectionName>,
        op: Op,
    },

    #[error("{op} on '{collection}': collection does not exist at the open schema version")]
    UnknownCollection { collection: CollectionName, op: Op },

    #[error("{op} on '{collection}': no record with key {key}")]
    NotFound {
        collection: CollectionName,
        op: Op,
        key: Key,
    },

    #[error("{op} on '{collection}' violates a uniqueness constraint: {detail}")]
    Constraint {
        collection: CollectionName,
        op: Op,
        detail: String,
    },

    #[error("{op} on '{collection}': stored data could not be decoded")]
    Serialization {
        collection: CollectionName,
        op: Op,
        #[source]
        source: serde_json::Error,
    },

    #[error("{op} on '{collection}' failed in the storage engine")]
    Storage {
        collection: CollectionName,
        op: Op,
        #[source]
        source: BoxError,
    },

    #[error("update on '{collection}' may not change '{field}'")]
    ImmutableField {
        collection: CollectionName,
        field: String,
    },

    #[error("{op} on '{collection}': invalid record: {reason}")]
    InvalidRecord {
        collection: CollectionName,
        op: Op,
        reason: String,
    },

    #[error("'{collection}' has no index named '{index}'")]
    UnknownIndex {
        collection: CollectionName,
        index: String,
    },

    #[error("invalid export document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub(crate) fn storage(
        collection: CollectionName,
        op: Op,
        source: impl Into<BoxError>,
    ) -> Self {
        StoreError::Storage {
            collection,
            op,
            source: source.into(),
        }
    }

    /// The collection the failing operation targeted, if any.
    pub fn collection(&self) -> Option<CollectionName> {
        match self {
            StoreError::NotInitialized { collection, .. } => *collection,
            StoreError::UnknownCollection { collection, .. }
            | StoreError::NotFound { collection, .. }
            | StoreError::Constraint { collection, .. }
            | StoreError::Serialization { collection, .. }
            | StoreError::Storage { collection, .. }
            | StoreError::ImmutableField { collection, .. }
            | StoreError::InvalidRecord { collection, .. }
            | StoreError::UnknownIndex { collection, .. } => Some(*collection),
            StoreError::Connection(_) | StoreError::InvalidDocument(_) => None,
        }
    }
}

fn on_collection(collection: &Option<CollectionName>) -> String {
    collection.map_or_else(String::new, |c| format!(" on '{c}'"))
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
