use genmix_client::domain::FuelType;
use serde_json::{Map, Value};

/// A loosely typed source record in long form: one fuel type per record.
///
/// Field names: `timestamp` (or `settlement_date` + `settlement_period`),
/// `fuel_type`, `generation_mw`, `mix_percentage`, `record_id`, and the
/// optional `ingestion_version` and `total_generation_mw`. Nothing is checked
/// here; typing happens in the normalizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Field value, treating JSON `null` as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        // `_id` is the datastore's row id.
        if !fields.contains_key("record_id") {
            if let Some(id) = fields.remove("_id") {
                fields.insert("record_id".to_string(), id);
            }
        }
        Self { fields }
    }
}

const WIDE_TIMESTAMP: &str = "DATETIME";
const WIDE_TOTAL: &str = "GENERATION";

/// Turn one source row into long-form records.
///
/// Wide rows (`_id, DATETIME, GAS, GAS_perc, ..., GENERATION`) are unpivoted
/// into one record per fuel column present; every other row is taken as a
/// long-form record.
pub fn explode_source_row(row: Map<String, Value>) -> Vec<RawRecord> {
    if !row.contains_key(WIDE_TIMESTAMP) {
        return vec![RawRecord::from(row)];
    }

    let mut out = Vec::with_capacity(FuelType::ALL.len());
    for fuel in FuelType::ALL {
        let label = fuel.source_label();
        let Some(mw) = row.get(label) else {
            continue;
        };

        let mut record = RawRecord::new()
            .with("timestamp", row[WIDE_TIMESTAMP].clone())
            .with("fuel_type", label)
            .with("generation_mw", mw.clone())
            .with(
                "mix_percentage",
                row.get(&format!("{label}_perc")).cloned().unwrap_or(Value::Null),
            );
        if let Some(id) = row.get("_id") {
            record = record.with("record_id", id.clone());
        }
        if let Some(total) = row.get(WIDE_TOTAL) {
            record = record.with("total_generation_mw", total.clone());
        }
        out.push(record);
    }
    out
}
