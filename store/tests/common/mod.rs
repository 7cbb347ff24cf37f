//! Shared helpers for the integration tests.

#![allow(dead_code)]

use farmlog_store::{FlatStore, Record, RecordStore, StoreConfig};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Route store logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farmlog_store=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A structured store on a private in-memory database.
pub async fn structured_store() -> RecordStore {
    init_tracing();
    RecordStore::from_config(&StoreConfig::in_memory())
        .await
        .expect("in-memory store opens")
}

/// A flat fallback store in process memory.
pub fn flat_store() -> RecordStore {
    init_tracing();
    RecordStore::flat(FlatStore::in_memory("test"))
}

/// One fresh store per backend, labelled for assertion messages.
pub async fn backends() -> Vec<(&'static str, RecordStore)> {
    vec![("structured", structured_store().await), ("flat", flat_store())]
}

pub fn record(value: Value) -> Record {
    Record::from_value(value).expect("record literal is an object")
}

pub fn tomatoes() -> Record {
    record(json!({
        "date": "2024-01-15",
        "product": "Tomatoes",
        "quantity": 50,
        "pricePerUnit": 2.50,
        "customer": "Local Market"
    }))
}

/// Strip the fields the store assigns.
pub fn without_store_fields(mut record: Record, key_path: &str) -> Record {
    record.remove(key_path);
    record.remove("createdAt");
    record.remove("updatedAt");
    record
}
