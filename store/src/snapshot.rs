//! Backup documents.
//!
//! An [`ExportDocument`] is one JSON object holding every collection's
//! records under the collection's name, plus `timestamp` and
//! `schemaVersion`:
//!
//! ```json
//! {
//!   "activities": [ { "id": 1, "date": "2024-01-15", "createdAt": "..." } ],
//!   "sales": [],
//!   "timestamp": "2024-01-15T10:00:00.000Z",
//!   "schemaVersion": 2
//! }
//! ```
//!
//! Documents are produced by
//! [`RecordStore::export_all`](crate::RecordStore::export_all) and restored by
//! [`RecordStore::import_all`](crate::RecordStore::import_all).

use crate::{error::Result, CollectionName, Record, SchemaVersion, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const TIMESTAMP: &str = "timestamp";
const SCHEMA_VERSION: &str = "schemaVersion";

/// Every collection's records at export time.
///
/// Collections are read one after another, not as one atomic snapshot, so
/// writes made during an export may show up in some collections and not in
/// others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct ExportDocument {
    /// Records by collection, each array in the collection's stored order
    #[serde(flatten)]
    pub collections: BTreeMap<CollectionName, Vec<Record>>,
    /// When the export was taken
    pub timestamp: String,
    /// Schema version of the store that produced the document
    pub schema_version: SchemaVersion,
}

impl ExportDocument {
    pub fn new(timestamp: impl Into<String>, schema_version: SchemaVersion) -> Self {
        Self {
            collections: BTreeMap::new(),
            timestamp: timestamp.into(),
            schema_version,
        }
    }

    /// Records of one collection, if the document carries it.
    pub fn records(&self, collection: CollectionName) -> Option<&[Record]> {
        self.collections.get(&collection).map(Vec::as_slice)
    }

    /// Count records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }

    /// Parse and validate a document.
    ///
    /// Unknown top-level keys are ignored. Every known collection present
    /// must be an array of objects.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::InvalidDocument(e.to_string()))
    }
}

impl TryFrom<Value> for ExportDocument {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err("document must be a JSON object".to_string());
        };

        let timestamp = fields
            .get(TIMESTAMP)
            .and_then(Value::as_str)
            .ok_or("missing string field 'timestamp'")?
            .to_string();
        let schema_version = fields
            .get(SCHEMA_VERSION)
            .and_then(Value::as_u64)
            .and_then(|v| SchemaVersion::try_from(v).ok())
            .ok_or("missing integer field 'schemaVersion'")?;

        let mut collections = BTreeMap::new();
        for (name, value) in fields {
            let Ok(collection) = name.parse::<CollectionName>() else {
                continue;
            };
            let Value::Array(items) = value else {
                return Err(format!("collection '{name}' is not an array"));
            };
            let records = items
                .into_iter()
                .map(|item| {
                    Record::from_value(item)
                        .ok_or_else(|| format!("collection '{name}' holds a non-object record"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            collections.insert(collection, records);
        }

        Ok(Self {
            collections,
            timestamp,
            schema_version,
        })
    }
}

/// Outcome of an import.
///
/// Collections are restored in order and the import stops at the first
/// failure. Collections listed in `restored` were replaced; the failed one
/// may be partly restored; later ones were not touched.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub restored: Vec<CollectionName>,
    pub failed: Option<(CollectionName, StoreError)>,
}

impl ImportReport {
    /// Whether every collection in the document was restored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}
