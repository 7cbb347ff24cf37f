//! # Farmlog Store
//!
//! Local persistence for an offline farm record-keeping application.
//!
//! Every feature (activities, inventory, sales, expenses, labour, weather
//! snapshots and tax records) keeps its data through the same typed CRUD
//! surface. The store opens and upgrades a schema-versioned database,
//! maintains derived fields on every write, and can export the whole
//! database to one JSON document and restore it again.
//!
//! ## Core Concepts
//!
//! ### Collections and the Registry
//!
//! A [`Registry`] declares the named collections, how each one is keyed and
//! which secondary indices it carries. Every collection and index records
//! the [`SchemaVersion`] that introduced it. Opening the store at a newer
//! version creates whatever is missing and leaves existing data alone.
//!
//! ### Records
//!
//! A [`Record`] is a JSON object. Besides its own fields every stored record
//! carries its primary key, `createdAt` and `updatedAt`. Keys are either
//! generated by the store (strictly increasing integers) or supplied by the
//! caller, per collection.
//!
//! ### Derived Fields
//!
//! Some fields are functions of others: a sale's `total` is
//! `quantity * pricePerUnit` and a labour entry's `totalPay` is
//! `hoursWorked * hourlyRate`. They are recomputed from the merged record on
//! every `add` and `update` and never taken from input.
//!
//! ### Backends
//!
//! The structured backend keeps each collection in its own SQLite table
//! with real indices and transactions. When that cannot run, the flat
//! fallback keeps each collection as one JSON blob in a namespaced key
//! space. Both honour the same [`RecordStore`] contract; the fallback's
//! weaker guarantees are listed in [`flat`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use farmlog_store::{CollectionName, Record, RecordStore, StoreConfig};
//!
//! # async fn run() -> farmlog_store::Result<()> {
//! let store = RecordStore::from_config(&StoreConfig::in_memory()).await?;
//!
//! let key = store
//!     .add(
//!         CollectionName::Sales,
//!         Record::new()
//!             .with("date", "2024-01-15")
//!             .with("product", "Tomatoes")
//!             .with("quantity", 50)
//!             .with("pricePerUnit", 2.5),
//!     )
//!     .await?;
//!
//! let sale = store.get(CollectionName::Sales, &key).await?;
//! assert_eq!(sale.and_then(|s| s.get_f64("total")), Some(125.0));
//!
//! let backup = store.export_all().await?.to_json()?;
//! # let _ = backup;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod derived;
pub mod error;
pub mod flat;
pub mod models;
pub mod query;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod store;
mod structured;

// Re-export main types at crate root
pub use config::{BackendKind, ConfigError, StoreConfig};
pub use connection::{ConnectOptions, Connection, ConnectionManager};
pub use error::{ConnectionError, Op, Result, StoreError};
pub use flat::{ErrorHandler, FileStorage, FlatStorage, FlatStore, MemoryStorage};
pub use models::Model;
pub use query::KeyRange;
pub use record::{Clock, Key, ManualClock, Record, SystemClock};
pub use schema::{CollectionDef, CollectionName, IndexDef, KeyMode, Registry, SCHEMA_VERSION};
pub use snapshot::{ExportDocument, ImportReport};
pub use store::{Backend, RecordStore};

/// Version number of the store layout.
pub type SchemaVersion = u32;
