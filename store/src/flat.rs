//! Flat fallback store.
//!
//! Used when the structured store cannot run. Every collection is one
//! serialized JSON array held under its own key in a namespaced flat key
//! space (`<namespace>:<collection>`); generated keys come from a sequence
//! value under `<namespace>:<collection>:seq`.
//!
//! # Limitations
//!
//! - Every mutation reads the whole array, changes it in memory and writes
//!   the whole array back. Overlapping mutations of the same collection are
//!   not isolated: the last write wins and can discard an earlier one. The
//!   fallback assumes one writer at a time.
//! - Secondary indices are not maintained. Index lookups and unique checks
//!   scan the array.
//! - A blob that cannot be decoded is treated as an empty collection. The
//!   failure goes to the store's error handler instead of the caller.

use crate::{
    error::Result, query::IndexValue, CollectionDef, CollectionName, IndexDef, Key, KeyMode,
    KeyRange, Op, Record, Registry, StoreError,
};
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// A flat string key space, in the manner of browser local storage.
pub trait FlatStorage: Send + Sync + fmt::Debug {
    fn get_item(&self, key: &str) -> io::Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> io::Result<()>;
    fn remove_item(&self, key: &str) -> io::Result<()>;
}

/// Flat storage held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlatStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.items.get(key).map(|v| v.value().clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> io::Result<()> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> io::Result<()> {
        self.items.remove(key);
        Ok(())
    }
}

/// Flat storage with one file per key under a directory.
///
/// The directory is created on first write. Each value is written to a
/// temporary file and renamed into place. Calls block, so [`FlatStore`]
/// makes them from tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '.',
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl FlatStorage for FileStorage {
    fn get_item(&self, key: &str) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)
    }

    fn remove_item(&self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Receives errors the fallback store recovers from on its own.
pub type ErrorHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

fn log_recovered(err: &StoreError) {
    tracing::warn!(error = %err, "recovered from unreadable fallback data");
}

/// The record store contract over a [`FlatStorage`].
#[derive(Clone)]
pub struct FlatStore {
    storage: Arc<dyn FlatStorage>,
    namespace: String,
    registry: Registry,
    on_error: ErrorHandler,
}

impl fmt::Debug for FlatStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatStore")
            .field("storage", &self.storage)
            .field("namespace", &self.namespace)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl FlatStore {
    pub fn new(storage: Arc<dyn FlatStorage>, namespace: impl Into<String>, registry: Registry) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            registry,
            on_error: Arc::new(log_recovered),
        }
    }

    /// A flat store kept in memory.
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStorage::new()), namespace, Registry::current())
    }

    /// Replace the handler that receives recovered errors.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    pub fn registry(&self) -> Registry {
        self.registry
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn collection_key(&self, collection: CollectionName) -> String {
        format!("{}:{}", self.namespace, collection)
    }

    fn sequence_key(&self, collection: CollectionName) -> String {
        format!("{}:{}:seq", self.namespace, collection)
    }

    /// Run a storage call on the blocking pool. File-backed storage does
    /// synchronous I/O.
    async fn blocking<T, F>(&self, call: F) -> io::Result<T>
    where
        F: FnOnce(&dyn FlatStorage) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || call(storage.as_ref()))
            .await
            .map_err(io::Error::other)?
    }

    async fn read_item(&self, def: &CollectionDef, op: Op, key: String) -> Result<Option<String>> {
        self.blocking(move |storage| storage.get_item(&key))
            .await
            .map_err(|e| StoreError::storage(def.name, op, e))
    }

    async fn write_item(&self, def: &CollectionDef, op: Op, key: String, value: String) -> Result<()> {
        self.blocking(move |storage| storage.set_item(&key, &value))
            .await
            .map_err(|e| StoreError::storage(def.name, op, e))
    }

    async fn load(&self, def: &CollectionDef, op: Op) -> Result<Vec<Record>> {
        let raw = self.read_item(def, op, self.collection_key(def.name)).await?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(records) => Ok(records),
            Err(source) => {
                (self.on_error)(&StoreError::Serialization {
                    collection: def.name,
                    op,
                    source,
                });
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, def: &CollectionDef, op: Op, records: &[Record]) -> Result<()> {
        let raw = serde_json::to_string(records).map_err(|source| StoreError::Serialization {
            collection: def.name,
            op,
            source,
        })?;
        self.write_item(def, op, self.collection_key(def.name), raw).await
    }

    /// Next generated key: past both the stored sequence and every key in
    /// the collection, so restored keys are never handed out again.
    async fn next_key(&self, def: &CollectionDef, op: Op, records: &[Record]) -> Result<i64> {
        let stored = self.read_item(def, op, self.sequence_key(def.name)).await?;
        let last = match stored {
            Some(raw) => match serde_json::from_str::<i64>(&raw) {
                Ok(last) => last,
                Err(source) => {
                    (self.on_error)(&StoreError::Serialization {
                        collection: def.name,
                        op,
                        source,
                    });
                    0
                }
            },
            None => 0,
        };
        let highest = records
            .iter()
            .filter_map(|r| r.key(def.key_path).and_then(|k| k.as_int()))
            .max()
            .unwrap_or(0);
        Ok(last.max(highest) + 1)
    }

    async fn save_sequence(&self, def: &CollectionDef, op: Op, last: i64) -> Result<()> {
        self.write_item(def, op, self.sequence_key(def.name), last.to_string())
            .await
    }

    /// Reject `candidate` if it repeats a unique index value held by any
    /// record other than the one at `skip`.
    fn check_unique(
        &self,
        def: &CollectionDef,
        op: Op,
        records: &[Record],
        candidate: &Record,
        skip: Option<usize>,
    ) -> Result<()> {
        for index in def.indices_at(self.registry.version()).filter(|i| i.unique) {
            let Some(value) = candidate.get(index.key_path).and_then(IndexValue::from_json) else {
                continue;
            };
            let taken = records.iter().enumerate().any(|(i, r)| {
                Some(i) != skip
                    && r.get(index.key_path).and_then(IndexValue::from_json).as_ref()
                        == Some(&value)
            });
            if taken {
                return Err(StoreError::Constraint {
                    collection: def.name,
                    op,
                    detail: format!("unique index '{}' already holds this value", index.name),
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn insert(
        &self,
        def: &CollectionDef,
        key: Option<&Key>,
        mut record: Record,
        op: Op,
    ) -> Result<Key> {
        let mut records = self.load(def, op).await?;
        self.check_unique(def, op, &records, &record, None)?;

        let key = match key {
            Some(key) => {
                if records.iter().any(|r| r.key(def.key_path).as_ref() == Some(key)) {
                    return Err(StoreError::Constraint {
                        collection: def.name,
                        op,
                        detail: format!("key {key} already exists"),
                    });
                }
                if let (KeyMode::Generated, Some(last)) = (def.key_mode, key.as_int()) {
                    let next = self.next_key(def, op, &records).await?;
                    self.save_sequence(def, op, last.max(next - 1)).await?;
                }
                key.clone()
            }
            None => {
                let next = self.next_key(def, op, &records).await?;
                self.save_sequence(def, op, next).await?;
                Key::Int(next)
            }
        };

        record.insert(def.key_path, key.to_value());
        records.push(record);
        self.save(def, op, &records).await?;
        Ok(key)
    }

    pub(crate) async fn fetch(&self, def: &CollectionDef, key: &Key, op: Op) -> Result<Option<Record>> {
        Ok(self
            .load(def, op)
            .await?
            .into_iter()
            .find(|r| r.key(def.key_path).as_ref() == Some(key)))
    }

    pub(crate) async fn fetch_all(
        &self,
        def: &CollectionDef,
        range: Option<&KeyRange>,
        index: Option<&IndexDef>,
        op: Op,
    ) -> Result<Vec<Record>> {
        let records = self.load(def, op).await?;
        let key_path = index.map_or(def.key_path, |index| index.key_path);
        if index.is_none() && range.is_none() {
            return Ok(records);
        }

        let mut matched: Vec<(IndexValue, Record)> = records
            .into_iter()
            .filter_map(|r| {
                let value = r.get(key_path).and_then(IndexValue::from_json)?;
                range
                    .map_or(true, |range| range.includes(&value))
                    .then_some((value, r))
            })
            .collect();
        // Stable sort keeps insertion order among equal values.
        matched.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(matched.into_iter().map(|(_, r)| r).collect())
    }

    pub(crate) async fn modify<F>(&self, def: &CollectionDef, key: &Key, op: Op, change: F) -> Result<Record>
    where
        F: FnOnce(Record) -> Result<Record> + Send,
    {
        let mut records = self.load(def, op).await?;
        let position = records
            .iter()
            .position(|r| r.key(def.key_path).as_ref() == Some(key))
            .ok_or_else(|| StoreError::NotFound {
                collection: def.name,
                op,
                key: key.clone(),
            })?;

        let updated = change(records[position].clone())?;
        self.check_unique(def, op, &records, &updated, Some(position))?;
        records[position] = updated.clone();
        self.save(def, op, &records).await?;
        Ok(updated)
    }

    pub(crate) async fn delete(&self, def: &CollectionDef, key: &Key, op: Op) -> Result<()> {
        let mut records = self.load(def, op).await?;
        let before = records.len();
        records.retain(|r| r.key(def.key_path).as_ref() != Some(key));
        if records.len() != before {
            self.save(def, op, &records).await?;
        }
        Ok(())
    }

    pub(crate) async fn clear(&self, def: &CollectionDef, op: Op) -> Result<()> {
        let key = self.collection_key(def.name);
        self.blocking(move |storage| storage.remove_item(&key))
            .await
            .map_err(|e| StoreError::storage(def.name, op, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn def(name: CollectionName) -> &'static CollectionDef {
        Registry::current().collection(name).unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn generated_keys_increase_across_clear() {
        let store = FlatStore::in_memory("test");
        let sales = def(CollectionName::Sales);

        let first = store.insert(sales, None, record(json!({"product": "Kale"})), Op::Add).await.unwrap();
        let second = store.insert(sales, None, record(json!({"product": "Leek"})), Op::Add).await.unwrap();
        assert_eq!(first, Key::Int(1));
        assert_eq!(second, Key::Int(2));

        store.clear(sales, Op::Clear).await.unwrap();
        let third = store.insert(sales, None, record(json!({"product": "Beet"})), Op::Add).await.unwrap();
        assert_eq!(third, Key::Int(3));
    }

    #[tokio::test]
    async fn blobs_live_under_namespaced_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let store = FlatStore::new(storage.clone(), "farm", Registry::current());
        let sales = def(CollectionName::Sales);
        store.insert(sales, None, record(json!({"product": "Kale"})), Op::Add).await.unwrap();

        let raw = storage.get_item("farm:sales").unwrap().unwrap();
        let stored: Vec<Record> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored[0].get_str("product"), Some("Kale"));
        assert_eq!(storage.get_item("farm:sales:seq").unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn corrupt_blob_reads_as_empty_and_is_reported() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("farm:inventory", "{not json").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let store = FlatStore::new(storage, "farm", Registry::current()).with_error_handler(
            Arc::new(move |err: &StoreError| sink.lock().unwrap().push(err.to_string())),
        );

        let inventory = def(CollectionName::Inventory);
        let all = store.fetch_all(inventory, None, None, Op::GetAll).await.unwrap();
        assert!(all.is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("getAll on 'inventory'"));
    }

    #[tokio::test]
    async fn supplied_keys_stay_unique() {
        let store = FlatStore::in_memory("test");
        let weather = def(CollectionName::Weather);
        let key = Key::from("2024-01-15");

        store
            .insert(weather, Some(&key), record(json!({"date": "2024-01-15", "tempC": 4})), Op::Add)
            .await
            .unwrap();
        let err = store
            .insert(weather, Some(&key), record(json!({"date": "2024-01-15", "tempC": 5})), Op::Add)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
    }

    #[tokio::test]
    async fn unique_index_is_checked_by_scan() {
        let store = FlatStore::in_memory("test");
        let inventory = def(CollectionName::Inventory);

        store.insert(inventory, None, record(json!({"name": "Hoe"})), Op::Add).await.unwrap();
        let spade = store.insert(inventory, None, record(json!({"name": "Spade"})), Op::Add).await.unwrap();

        let err = store
            .insert(inventory, None, record(json!({"name": "Hoe"})), Op::Add)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { op: Op::Add, .. }));

        let err = store
            .modify(inventory, &spade, Op::Update, |mut r| {
                r.insert("name", "Hoe");
                Ok(r)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { op: Op::Update, .. }));

        // Rewriting a record's own value is not a clash.
        store
            .modify(inventory, &spade, Op::Update, |mut r| {
                r.insert("quantity", 3);
                Ok(r)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn index_lookup_scans_and_sorts() {
        let store = FlatStore::in_memory("test");
        let sales = def(CollectionName::Sales);
        for (date, product) in [("2024-02-01", "Kale"), ("2024-01-15", "Leek"), ("2024-01-20", "Kale")] {
            store
                .insert(sales, None, record(json!({"date": date, "product": product})), Op::Add)
                .await
                .unwrap();
        }
        store.insert(sales, None, record(json!({"product": "Undated"})), Op::Add).await.unwrap();

        let by_date = store
            .fetch_all(sales, None, sales.index("date"), Op::GetAll)
            .await
            .unwrap();
        let dates: Vec<_> = by_date.iter().filter_map(|r| r.get_str("date")).collect();
        assert_eq!(dates, vec!["2024-01-15", "2024-01-20", "2024-02-01"]);

        let kale = store
            .fetch_all(sales, Some(&KeyRange::only("Kale")), sales.index("product"), Op::GetAll)
            .await
            .unwrap();
        assert_eq!(kale.len(), 2);
        assert_eq!(kale[0].key("id"), Some(Key::Int(1)));
        assert_eq!(kale[1].key("id"), Some(Key::Int(3)));
    }

    #[tokio::test]
    async fn file_backed_store_on_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatStore::new(
            Arc::new(FileStorage::new(dir.path())),
            "farm",
            Registry::current(),
        );
        let sales = def(CollectionName::Sales);

        let key = store.insert(sales, None, record(json!({"product": "Kale"})), Op::Add).await.unwrap();
        let found = store.fetch(sales, &key, Op::Get).await.unwrap().unwrap();
        assert_eq!(found.get_str("product"), Some("Kale"));
        assert!(dir.path().join("farm.sales.seq.json").exists());

        store.clear(sales, Op::Clear).await.unwrap();
        assert!(!dir.path().join("farm.sales.json").exists());
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("blobs"));

        assert_eq!(storage.get_item("farm:sales").unwrap(), None);
        storage.set_item("farm:sales", "[]").unwrap();
        assert_eq!(storage.get_item("farm:sales").unwrap().as_deref(), Some("[]"));
        assert!(dir.path().join("blobs/farm.sales.json").exists());

        storage.remove_item("farm:sales").unwrap();
        storage.remove_item("farm:sales").unwrap();
        assert_eq!(storage.get_item("farm:sales").unwrap(), None);
    }
}
