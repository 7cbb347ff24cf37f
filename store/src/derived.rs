//! Derived fields.
//!
//! A derived field is a strict function of other fields on the same record.
//! It is always recomputed from the merged record state and never taken from
//! caller input.

use crate::{CollectionName, Record};
use serde_json::{Number, Value};

/// One derived field and the rule that computes it.
#[derive(Debug, Clone, Copy)]
pub struct DerivedRule {
    pub collection: CollectionName,
    /// Field that receives the computed value
    pub target: &'static str,
    /// Fields the value is computed from
    pub inputs: [&'static str; 2],
    compute: fn(f64, f64) -> f64,
}

impl DerivedRule {
    /// Compute the derived value from a record, or `None` if an input is
    /// missing or not numeric.
    pub fn evaluate(&self, record: &Record) -> Option<f64> {
        let [a, b] = self.inputs;
        let value = (self.compute)(record.get_f64(a)?, record.get_f64(b)?);
        value.is_finite().then_some(value)
    }

    /// Whether a partial record touches this rule's inputs or target.
    pub fn is_affected_by(&self, partial: &Record) -> bool {
        partial.contains(self.target) || self.inputs.iter().any(|f| partial.contains(f))
    }
}

fn product(a: f64, b: f64) -> f64 {
    a * b
}

/// Every derived field in the store.
pub const RULES: &[DerivedRule] = &[
    DerivedRule {
        collection: CollectionName::Sales,
        target: "total",
        inputs: ["quantity", "pricePerUnit"],
        compute: product,
    },
    DerivedRule {
        collection: CollectionName::Labour,
        target: "totalPay",
        inputs: ["hoursWorked", "hourlyRate"],
        compute: product,
    },
];

/// Rules that apply to a collection.
pub fn rules_for(collection: CollectionName) -> impl Iterator<Item = &'static DerivedRule> {
    RULES.iter().filter(move |rule| rule.collection == collection)
}

/// Recompute every derived field of `record` in place.
///
/// `record` must be the complete post-merge state. A derived field whose
/// inputs are missing is removed rather than left at a caller-supplied value.
pub fn apply(collection: CollectionName, record: &mut Record) {
    for rule in rules_for(collection) {
        match rule.evaluate(record).and_then(Number::from_f64) {
            Some(value) => {
                record.insert(rule.target, Value::Number(value));
            }
            None => {
                record.remove(rule.target);
            }
        }
    }
}
