//! Record store - the single entry point for persisted data.
//!
//! Every feature reads and writes through a [`RecordStore`]. It stamps
//! `createdAt`/`updatedAt`, keeps derived fields consistent, guards the
//! immutable fields and hands the result to whichever backend was selected
//! at startup.
//!
//! Backups go through [`RecordStore::export_all`] and
//! [`RecordStore::import_all`].
//!
//! Nothing here retries. A failed operation is returned to the caller with
//! its cause, and the caller decides whether to try again. `remove` and
//! `clear` are idempotent; `add` is not.

use crate::{
    derived,
    error::Result,
    flat::{FileStorage, FlatStorage, FlatStore, MemoryStorage},
    models::{self, Model},
    record::{format_timestamp, parse_timestamp, CREATED_AT, UPDATED_AT},
    snapshot::{ExportDocument, ImportReport},
    structured, BackendKind, Clock, CollectionDef, CollectionName, ConnectOptions, Connection,
    ConnectionManager, IndexDef, Key, KeyMode, KeyRange, Op, Record, Registry, StoreConfig,
    StoreError, SystemClock,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The storage engine behind a [`RecordStore`], chosen once at startup.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Transactional SQLite store with real indices
    Structured(Arc<ConnectionManager>),
    /// Serialized blobs in a flat key space
    Flat(Arc<FlatStore>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Structured(_) => BackendKind::Structured,
            Backend::Flat(_) => BackendKind::Flat,
        }
    }
}

/// A backend resolved for one operation.
enum Target {
    Structured(Connection),
    Flat(Arc<FlatStore>),
}

impl Target {
    fn registry(&self) -> Registry {
        match self {
            Target::Structured(conn) => conn.registry(),
            Target::Flat(flat) => flat.registry(),
        }
    }

    async fn insert(
        &self,
        def: &CollectionDef,
        key: Option<&Key>,
        record: Record,
        op: Op,
    ) -> Result<Key> {
        match self {
            Target::Structured(conn) => structured::insert(conn, def, key, &record, op).await,
            Target::Flat(flat) => flat.insert(def, key, record, op).await,
        }
    }

    async fn fetch(&self, def: &CollectionDef, key: &Key, op: Op) -> Result<Option<Record>> {
        match self {
            Target::Structured(conn) => structured::fetch(conn, def, key, op).await,
            Target::Flat(flat) => flat.fetch(def, key, op).await,
        }
    }

    async fn fetch_all(
        &self,
        def: &CollectionDef,
        range: Option<&KeyRange>,
        index: Option<&IndexDef>,
        op: Op,
    ) -> Result<Vec<Record>> {
        match self {
            Target::Structured(conn) => structured::fetch_all(conn, def, range, index, op).await,
            Target::Flat(flat) => flat.fetch_all(def, range, index, op).await,
        }
    }

    async fn modify<F>(&self, def: &CollectionDef, key: &Key, op: Op, change: F) -> Result<Record>
    where
        F: FnOnce(Record) -> Result<Record> + Send,
    {
        match self {
            Target::Structured(conn) => structured::modify(conn, def, key, op, change).await,
            Target::Flat(flat) => flat.modify(def, key, op, change).await,
        }
    }

    async fn delete(&self, def: &CollectionDef, key: &Key, op: Op) -> Result<()> {
        match self {
            Target::Structured(conn) => structured::delete(conn, def, key, op).await,
            Target::Flat(flat) => flat.delete(def, key, op).await,
        }
    }

    async fn clear(&self, def: &CollectionDef, op: Op) -> Result<()> {
        match self {
            Target::Structured(conn) => structured::clear(conn, def, op).await,
            Target::Flat(flat) => flat.clear(def, op).await,
        }
    }
}

/// Typed CRUD over the named collections.
///
/// Cheap to clone; clones share the same backend.
#[derive(Debug, Clone)]
pub struct RecordStore {
    backend: Backend,
    clock: Arc<dyn Clock>,
}

impl RecordStore {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
        }
    }

    /// A store over the structured backend. Operations fail with
    /// [`StoreError::NotInitialized`] until `manager` has been opened.
    pub fn structured(manager: Arc<ConnectionManager>) -> Self {
        Self::new(Backend::Structured(manager))
    }

    pub fn flat(store: FlatStore) -> Self {
        Self::new(Backend::Flat(Arc::new(store)))
    }

    /// Use a different time source for record timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a ready store from configuration.
    ///
    /// With [`BackendKind::Auto`] the structured store is used whenever the
    /// environment can host it. A structured store that is available but
    /// fails to open is an error, not a reason to fall back.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let registry = Registry::current();
        let backend = match config.backend {
            BackendKind::Flat => flat_backend(config, registry),
            BackendKind::Structured => structured_backend(config, registry).await?,
            BackendKind::Auto => {
                if ConnectOptions::from_config(config).probe() {
                    structured_backend(config, registry).await?
                } else {
                    tracing::warn!(
                        dir = ?config.database_dir,
                        "structured store unavailable, using flat fallback"
                    );
                    flat_backend(config, registry)
                }
            }
        };
        Ok(Self::new(backend))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Declarations in force, or `None` if the structured store is not open.
    pub async fn registry(&self) -> Option<Registry> {
        match &self.backend {
            Backend::Structured(manager) => manager.connection().await.map(|c| c.registry()),
            Backend::Flat(flat) => Some(flat.registry()),
        }
    }

    async fn target(
        &self,
        collection: CollectionName,
        op: Op,
    ) -> Result<(Target, &'static CollectionDef)> {
        let target = match &self.backend {
            Backend::Structured(manager) => Target::Structured(
                manager
                    .connection()
                    .await
                    .ok_or(StoreError::NotInitialized {
                        collection: Some(collection),
                        op,
                    })?,
            ),
            Backend::Flat(flat) => Target::Flat(flat.clone()),
        };
        let def = target
            .registry()
            .collection(collection)
            .ok_or(StoreError::UnknownCollection { collection, op })?;
        Ok((target, def))
    }

    /// Insert a new record and return its key.
    ///
    /// In generated-key collections any key on `record` is discarded. In
    /// supplied-key collections the key must be present.
    pub async fn add(&self, collection: CollectionName, mut record: Record) -> Result<Key> {
        let (target, def) = self.target(collection, Op::Add).await?;

        let key = match def.key_mode {
            KeyMode::Generated => {
                record.remove(def.key_path);
                None
            }
            KeyMode::Supplied => Some(supplied_key(def, &record, Op::Add)?),
        };

        let now = format_timestamp(self.clock.now());
        record.insert(CREATED_AT, now.clone());
        record.insert(UPDATED_AT, now);
        derived::apply(collection, &mut record);

        let key = target.insert(def, key.as_ref(), record, Op::Add).await?;
        tracing::debug!(%collection, %key, "record added");
        Ok(key)
    }

    /// Insert a record from a backup, keeping its key and timestamps when
    /// they are usable.
    async fn restore(&self, collection: CollectionName, mut record: Record) -> Result<Key> {
        let (target, def) = self.target(collection, Op::Import).await?;

        let key = match def.key_mode {
            KeyMode::Generated => record
                .remove(def.key_path)
                .as_ref()
                .and_then(Key::from_value)
                .filter(|key| key.as_int().is_some()),
            KeyMode::Supplied => Some(supplied_key(def, &record, Op::Import)?),
        };

        let now = self.clock.now();
        let created = record
            .created_at()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        let updated = record
            .updated_at()
            .and_then(parse_timestamp)
            .unwrap_or(now)
            .max(created);
        record.insert(CREATED_AT, format_timestamp(created));
        record.insert(UPDATED_AT, format_timestamp(updated));
        derived::apply(collection, &mut record);

        target.insert(def, key.as_ref(), record, Op::Import).await
    }

    /// Fetch one record. A missing key is `Ok(None)`.
    pub async fn get(&self, collection: CollectionName, key: &Key) -> Result<Option<Record>> {
        let (target, def) = self.target(collection, Op::Get).await?;
        target.fetch(def, key, Op::Get).await
    }

    /// Fetch every record, or those matching `query` on the primary key or
    /// on the index named `index`.
    ///
    /// Plain listings come back in insertion order, key ranges in key order
    /// and index lookups in index-value order.
    pub async fn get_all(
        &self,
        collection: CollectionName,
        query: Option<&KeyRange>,
        index: Option<&str>,
    ) -> Result<Vec<Record>> {
        let (target, def) = self.target(collection, Op::GetAll).await?;
        let version = target.registry().version();
        let index = index
            .map(|name| {
                def.index(name)
                    .filter(|index| index.since <= version)
                    .ok_or_else(|| StoreError::UnknownIndex {
                        collection,
                        index: name.to_string(),
                    })
            })
            .transpose()?;

        target.fetch_all(def, query, index, Op::GetAll).await
    }

    /// Merge `changes` into an existing record and return the result.
    ///
    /// Derived fields are recomputed from the merged record, so changing one
    /// input keeps the stored value of the other. The key and `createdAt`
    /// cannot be changed; `updatedAt` in `changes` is ignored.
    pub async fn update(
        &self,
        collection: CollectionName,
        key: &Key,
        changes: Record,
    ) -> Result<Record> {
        let (target, def) = self.target(collection, Op::Update).await?;

        if let Some(value) = changes.get(def.key_path) {
            if Key::from_value(value).as_ref() != Some(key) {
                return Err(StoreError::ImmutableField {
                    collection,
                    field: def.key_path.to_string(),
                });
            }
        }

        let recomputed: Vec<&str> = derived::rules_for(collection)
            .filter(|rule| rule.is_affected_by(&changes))
            .map(|rule| rule.target)
            .collect();
        let now = self.clock.now();
        let merged = target
            .modify(def, key, Op::Update, move |existing| {
                merge(collection, existing, changes, now)
            })
            .await?;

        tracing::debug!(%collection, %key, ?recomputed, "record updated");
        Ok(merged)
    }

    /// Delete a record. Removing an absent key succeeds.
    pub async fn remove(&self, collection: CollectionName, key: &Key) -> Result<()> {
        let (target, def) = self.target(collection, Op::Remove).await?;
        target.delete(def, key, Op::Remove).await?;
        tracing::debug!(%collection, %key, "record removed");
        Ok(())
    }

    /// Delete every record in a collection.
    pub async fn clear(&self, collection: CollectionName) -> Result<()> {
        let (target, def) = self.target(collection, Op::Clear).await?;
        target.clear(def, Op::Clear).await?;
        tracing::debug!(%collection, "collection cleared");
        Ok(())
    }

    /// Insert a typed model.
    pub async fn add_model<M: Model>(&self, model: &M) -> Result<Key> {
        let record = models::to_record(model, Op::Add)?;
        self.add(M::COLLECTION, record).await
    }

    /// Fetch a typed model.
    pub async fn get_model<M: Model>(&self, key: &Key) -> Result<Option<M>> {
        self.get(M::COLLECTION, key)
            .await?
            .map(|record| models::from_record(record, Op::Get))
            .transpose()
    }

    /// Fetch every record of a model's collection, in insertion order.
    pub async fn get_all_models<M: Model>(&self) -> Result<Vec<M>> {
        self.get_all(M::COLLECTION, None, None)
            .await?
            .into_iter()
            .map(|record| models::from_record(record, Op::GetAll))
            .collect()
    }

    /// Snapshot every collection into one document.
    ///
    /// Each collection is read on its own, so the result is not an atomic
    /// view across collections.
    pub async fn export_all(&self) -> Result<ExportDocument> {
        let registry = self
            .registry()
            .await
            .ok_or(StoreError::NotInitialized {
                collection: None,
                op: Op::Export,
            })?;

        let mut document =
            ExportDocument::new(format_timestamp(self.clock.now()), registry.version());
        for name in registry.collections().map(|def| def.name) {
            let (target, def) = self.target(name, Op::Export).await?;
            let records = target.fetch_all(def, None, None, Op::Export).await?;
            document.collections.insert(def.name, records);
        }

        tracing::info!(
            records = document.record_count(),
            version = document.schema_version,
            "export complete"
        );
        Ok(document)
    }

    /// Replace collections with the contents of a backup document.
    ///
    /// Each collection present in the document is cleared and refilled in
    /// array order; collections absent from it are left alone. There is no
    /// transaction across collections: the import stops at the first
    /// collection that fails and the report says how far it got.
    pub async fn import_all(&self, document: ExportDocument) -> Result<ImportReport> {
        let registry = self
            .registry()
            .await
            .ok_or(StoreError::NotInitialized {
                collection: None,
                op: Op::Import,
            })?;
        if document.schema_version > registry.version() {
            return Err(StoreError::InvalidDocument(format!(
                "document schema version {} is newer than store version {}",
                document.schema_version,
                registry.version()
            )));
        }

        let mut report = ImportReport::default();
        for (collection, records) in document.collections {
            let count = records.len();
            match self.restore_collection(collection, records).await {
                Ok(()) => {
                    tracing::info!(%collection, count, "collection restored");
                    report.restored.push(collection);
                }
                Err(err) => {
                    tracing::error!(%collection, error = %err, "import stopped");
                    report.failed = Some((collection, err));
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn restore_collection(
        &self,
        collection: CollectionName,
        records: Vec<Record>,
    ) -> Result<()> {
        let (target, def) = self.target(collection, Op::Import).await?;
        target.clear(def, Op::Import).await?;
        for record in records {
            self.restore(collection, record).await?;
        }
        Ok(())
    }
}

fn supplied_key(def: &CollectionDef, record: &Record, op: Op) -> Result<Key> {
    record
        .key(def.key_path)
        .ok_or_else(|| StoreError::InvalidRecord {
            collection: def.name,
            op,
            reason: format!("missing key '{}'", def.key_path),
        })
}

fn merge(
    collection: CollectionName,
    mut record: Record,
    changes: Record,
    now: DateTime<Utc>,
) -> Result<Record> {
    if let Some(created) = changes.get(CREATED_AT) {
        if record.get(CREATED_AT) != Some(created) {
            return Err(StoreError::ImmutableField {
                collection,
                field: CREATED_AT.to_string(),
            });
        }
    }

    let previous = record.updated_at().and_then(parse_timestamp);
    for (field, value) in changes {
        if field != UPDATED_AT {
            record.insert(field, value);
        }
    }
    derived::apply(collection, &mut record);

    // Never step backwards, even if the clock does.
    let updated = previous.map_or(now, |previous| previous.max(now));
    record.insert(UPDATED_AT, format_timestamp(updated));
    Ok(record)
}

async fn structured_backend(config: &StoreConfig, registry: Registry) -> Result<Backend> {
    let manager = Arc::new(ConnectionManager::new(
        ConnectOptions::from_config(config),
        registry,
    ));
    manager
        .open(&config.database_name, registry.version())
        .await?;
    Ok(Backend::Structured(manager))
}

fn flat_backend(config: &StoreConfig, registry: Registry) -> Backend {
    let storage: Arc<dyn FlatStorage> = match &config.flat_dir {
        Some(dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };
    Backend::Flat(Arc::new(FlatStore::new(
        storage,
        config.namespace.clone(),
        registry,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn at(ts: &str) -> DateTime<Utc> {
        parse_timestamp(ts).unwrap()
    }

    #[test]
    fn merge_keeps_other_operand() {
        let existing = record(json!({
            "id": 1, "quantity": 50, "pricePerUnit": 2.5, "total": 125.0,
            "createdAt": "2024-01-15T10:00:00.000Z", "updatedAt": "2024-01-15T10:00:00.000Z"
        }));
        let merged = merge(
            CollectionName::Sales,
            existing,
            record(json!({"quantity": 30})),
            at("2024-01-16T09:00:00Z"),
        )
        .unwrap();

        assert_eq!(merged.get_f64("total"), Some(75.0));
        assert_eq!(merged.get_f64("pricePerUnit"), Some(2.5));
        assert_eq!(merged.updated_at(), Some("2024-01-16T09:00:00.000Z"));
        assert_eq!(merged.created_at(), Some("2024-01-15T10:00:00.000Z"));
    }

    #[test]
    fn merge_rejects_changed_created_at() {
        let existing = record(json!({"createdAt": "2024-01-15T10:00:00.000Z"}));
        let err = merge(
            CollectionName::Expenses,
            existing.clone(),
            record(json!({"createdAt": "2020-01-01T00:00:00.000Z"})),
            at("2024-01-16T09:00:00Z"),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::ImmutableField { field, .. } if field == "createdAt"));

        // Restating the same value is fine.
        assert!(merge(
            CollectionName::Expenses,
            existing,
            record(json!({"createdAt": "2024-01-15T10:00:00.000Z"})),
            at("2024-01-16T09:00:00Z"),
        )
        .is_ok());
    }

    #[test]
    fn merge_never_moves_updated_at_backwards() {
        let existing = record(json!({
            "createdAt": "2024-01-15T10:00:00.000Z", "updatedAt": "2024-03-01T00:00:00.000Z"
        }));
        let merged = merge(
            CollectionName::Activities,
            existing,
            record(json!({"notes": "weeded", "updatedAt": "1999-01-01T00:00:00.000Z"})),
            at("2024-02-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(merged.updated_at(), Some("2024-03-01T00:00:00.000Z"));
        assert_eq!(merged.get_str("notes"), Some("weeded"));
    }

    #[tokio::test]
    async fn structured_store_before_open_is_not_initialized() {
        let manager = Arc::new(ConnectionManager::new(
            ConnectOptions::in_memory(),
            Registry::current(),
        ));
        let store = RecordStore::structured(manager.clone());

        let err = store
            .add(CollectionName::Sales, record(json!({"product": "Kale"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotInitialized {
                collection: Some(CollectionName::Sales),
                op: Op::Add
            }
        ));
        assert!(store.registry().await.is_none());

        manager.open("farmlog", 2).await.unwrap();
        assert!(store
            .add(CollectionName::Sales, record(json!({"product": "Kale"})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn collection_missing_at_open_version() {
        let manager = Arc::new(ConnectionManager::new(
            ConnectOptions::in_memory(),
            Registry::current(),
        ));
        manager.open("farmlog", 1).await.unwrap();
        let store = RecordStore::structured(manager);

        let err = store.clear(CollectionName::Labour).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection { .. }));

        let err = store
            .get_all(CollectionName::Inventory, None, Some("category"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownIndex { .. }));
    }

    #[tokio::test]
    async fn timestamps_come_from_the_clock() {
        let clock = Arc::new(ManualClock::starting_at(at("2024-01-15T10:00:00Z")));
        let store = RecordStore::flat(FlatStore::in_memory("test")).with_clock(clock.clone());

        let key = store
            .add(CollectionName::Expenses, record(json!({"category": "Seed"})))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(5));
        let updated = store
            .update(CollectionName::Expenses, &key, record(json!({"amount": 40})))
            .await
            .unwrap();

        assert_eq!(updated.created_at(), Some("2024-01-15T10:00:00.000Z"));
        assert_eq!(updated.updated_at(), Some("2024-01-15T10:05:00.000Z"));
    }

    #[tokio::test]
    async fn auto_config_falls_back_when_directory_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let config = StoreConfig::default().with_database_dir(&file);
        let store = RecordStore::from_config(&config).await.unwrap();
        assert_eq!(store.backend().kind(), BackendKind::Flat);

        let config = config.with_backend(BackendKind::Structured);
        let err = RecordStore::from_config(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn auto_config_prefers_structured() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default().with_database_dir(dir.path());
        let store = RecordStore::from_config(&config).await.unwrap();
        assert_eq!(store.backend().kind(), BackendKind::Structured);
        assert!(dir.path().join("farmlog.sqlite3").exists());
    }
}
