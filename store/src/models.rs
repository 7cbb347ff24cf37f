//! Typed views over stored records.
//!
//! Records are plain JSON objects, so any collection can be used untyped
//! through [`Record`]. The types here give features a checked shape for the
//! common collections. Unknown fields are dropped when a record is read into
//! a model, so a model should only be written back with `update`, never
//! used to replace a record wholesale.

use crate::{error::Result, CollectionName, Op, Record, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type bound to one collection.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: CollectionName;
}

pub(crate) fn to_record<M: Model>(model: &M, op: Op) -> Result<Record> {
    let value = serde_json::to_value(model).map_err(|source| StoreError::Serialization {
        collection: M::COLLECTION,
        op,
        source,
    })?;
    Record::from_value(value).ok_or_else(|| StoreError::InvalidRecord {
        collection: M::COLLECTION,
        op,
        reason: "model did not serialize to an object".to_string(),
    })
}

pub(crate) fn from_record<M: Model>(record: Record, op: Op) -> Result<M> {
    serde_json::from_value(record.into_value()).map_err(|source| StoreError::Serialization {
        collection: M::COLLECTION,
        op,
        source,
    })
}

/// A field activity such as planting, spraying or harvesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for Activity {
    const COLLECTION: CollectionName = CollectionName::Activities;
}

/// A stock item. `name` is unique across the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub category: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_unit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_stock: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for InventoryItem {
    const COLLECTION: CollectionName = CollectionName::Inventory;
}

/// A sale line item. `total` is computed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: String,
    pub product: String,
    pub quantity: f64,
    pub price_per_unit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for Sale {
    const COLLECTION: CollectionName = CollectionName::Sales;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: String,
    pub category: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for Expense {
    const COLLECTION: CollectionName = CollectionName::Expenses;
}

/// Hours worked by one person on one day. `total_pay` is computed by the
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabourEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: String,
    pub worker_name: String,
    pub hours_worked: f64,
    pub hourly_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for LabourEntry {
    const COLLECTION: CollectionName = CollectionName::Labour;
}

/// A weather snapshot, keyed by its date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    pub date: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rainfall: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for WeatherSnapshot {
    const COLLECTION: CollectionName = CollectionName::Weather;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub tax_year: i32,
    pub description: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Model for TaxRecord {
    const COLLECTION: CollectionName = CollectionName::TaxRecords;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sale_uses_camel_case_fields() {
        let sale = Sale {
            id: None,
            date: "2024-01-15".into(),
            product: "Tomatoes".into(),
            quantity: 50.0,
            price_per_unit: 2.5,
            total: None,
            customer: Some("Market".into()),
            notes: None,
            created_at: None,
            updated_at: None,
        };
        let record = to_record(&sale, Op::Add).unwrap();
        assert_eq!(
            record.into_value(),
            json!({
                "date": "2024-01-15",
                "product": "Tomatoes",
                "quantity": 50.0,
                "pricePerUnit": 2.5,
                "customer": "Market"
            })
        );
    }

    #[test]
    fn activity_type_field() {
        let record = Record::from_value(json!({
            "id": 3, "date": "2024-03-01", "type": "planting", "extra": true
        }))
        .unwrap();
        let activity: Activity = from_record(record, Op::Get).unwrap();
        assert_eq!(activity.kind, "planting");
        assert_eq!(activity.id, Some(3));
    }

    #[test]
    fn mismatched_record_is_a_serialization_error() {
        let record = Record::from_value(json!({"name": "Hoe"})).unwrap();
        let err = from_record::<InventoryItem>(record, Op::Get).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Serialization {
                collection: CollectionName::Inventory,
                ..
            }
        ));
    }
}
