use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// One row of a snapshot: field names to JSON values, in delivery order.
pub type Record = serde_json::Map<String, Value>;

/// Identity of a record, taken from its `id_property` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("record has no '{0}' field")]
    Missing(String),
    #[error("field '{field}' cannot be used as an identity: {value}")]
    Unusable { field: String, value: String },
}

impl StateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Resolve the identity of `record`. Strings are used as-is and integers in
    /// their decimal form; any other value cannot address state.
    pub fn from_record(record: &Record, id_property: &str) -> Result<Self, IdentityError> {
        match record.get(id_property) {
            None => Err(IdentityError::Missing(id_property.to_owned())),
            Some(Value::String(s)) => Ok(Self(s.clone())),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Self(n.to_string())),
            Some(other) => Err(IdentityError::Unusable {
                field: id_property.to_owned(),
                value: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of field names seen across a snapshot.
pub fn columns(records: &[Record]) -> BTreeSet<String> {
    records
        .iter()
        .flat_map(|record| record.keys().cloned())
        .collect()
}

/// Remove exact duplicate records, keeping the first occurrence.
pub fn drop_duplicates(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(fingerprint(record, None)))
        .collect()
}

/// Remove the listed columns from every record.
pub fn drop_columns(records: &mut [Record], dropped: &[String]) {
    if dropped.is_empty() {
        return;
    }
    for record in records.iter_mut() {
        for column in dropped {
            record.shift_remove(column);
        }
    }
}

/// Key every record by identity. A repeated key keeps the position of its first
/// occurrence and the value of its last.
pub fn index_by_key(
    records: Vec<Record>,
    id_property: &str,
) -> Result<Vec<(StateKey, Record)>, IdentityError> {
    let mut positions: HashMap<StateKey, usize> = HashMap::with_capacity(records.len());
    let mut keyed: Vec<(StateKey, Record)> = Vec::with_capacity(records.len());
    for record in records {
        let key = StateKey::from_record(&record, id_property)?;
        match positions.get(&key) {
            Some(&position) => keyed[position].1 = record,
            None => {
                positions.insert(key.clone(), keyed.len());
                keyed.push((key, record));
            }
        }
    }
    Ok(keyed)
}

/// A canonical text form of `record`, optionally restricted to `columns`, usable
/// as a hash key for full-field equality. Absent columns render as null.
pub fn fingerprint(record: &Record, columns: Option<&BTreeSet<String>>) -> String {
    let projected: Vec<(&str, &Value)> = match columns {
        Some(columns) => columns
            .iter()
            .map(|c| (c.as_str(), record.get(c).unwrap_or(&Value::Null)))
            .collect(),
        None => {
            let mut all: Vec<(&str, &Value)> =
                record.iter().map(|(k, v)| (k.as_str(), v)).collect();
            all.sort_by(|a, b| a.0.cmp(b.0));
            all
        }
    };
    // Serializing a Vec of (&str, &Value) cannot fail.
    serde_json::to_string(&projected).unwrap_or_default()
}
