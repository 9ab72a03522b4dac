//! Data dictionaries backing `dict_labels` and `dict_values`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// A named lookup table. `keys` identify a record; `values` are the remaining
/// columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDict {
    pub name: String,
    /// Whether the key columns identify at most one record.
    pub unique_key: bool,
    pub keys: Vec<String>,
    pub values: Vec<String>,
    pub records: Vec<BTreeMap<String, String>>,
}

impl DataDict {
    /// Records whose key columns equal `key_values`, in key column order.
    pub fn records_by_key(&self, key_values: &[&str]) -> Vec<&BTreeMap<String, String>> {
        self.records
            .iter()
            .filter(|record| {
                self.keys.len() == key_values.len()
                    && self
                        .keys
                        .iter()
                        .zip(key_values)
                        .all(|(key, value)| record.get(key).map(String::as_str) == Some(*value))
            })
            .collect()
    }
}

pub trait DataDictionaries: Send + Sync {
    fn dict_by_name(&self, name: &str) -> Option<Arc<DataDict>>;
}

#[derive(Debug, Default)]
pub struct InMemoryDataDictionaries {
    dicts: RwLock<HashMap<String, Arc<DataDict>>>,
}

impl InMemoryDataDictionaries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, dict: DataDict) {
        let mut dicts = self.dicts.write().unwrap_or_else(PoisonError::into_inner);
        dicts.insert(dict.name.clone(), Arc::new(dict));
    }

    pub fn remove(&self, name: &str) {
        let mut dicts = self.dicts.write().unwrap_or_else(PoisonError::into_inner);
        dicts.remove(name);
    }
}

impl DataDictionaries for InMemoryDataDictionaries {
    fn dict_by_name(&self, name: &str) -> Option<Arc<DataDict>> {
        let dicts = self.dicts.read().unwrap_or_else(PoisonError::into_inner);
        dicts.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_records_by_key() {
        let dict = DataDict {
            name: "hosts".to_string(),
            unique_key: false,
            keys: vec!["ip".to_string()],
            values: vec!["owner".to_string()],
            records: vec![
                record(&[("ip", "10.0.0.1"), ("owner", "alice")]),
                record(&[("ip", "10.0.0.2"), ("owner", "bob")]),
                record(&[("ip", "10.0.0.1"), ("owner", "carol")]),
            ],
        };
        let found = dict.records_by_key(&["10.0.0.1"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].get("owner").map(String::as_str), Some("carol"));
        assert!(dict.records_by_key(&["10.0.0.9"]).is_empty());
    }

    #[test]
    fn test_upsert_and_remove() {
        let dicts = InMemoryDataDictionaries::new();
        dicts.upsert(DataDict {
            name: "d".to_string(),
            ..Default::default()
        });
        assert!(dicts.dict_by_name("d").is_some());
        dicts.remove("d");
        assert!(dicts.dict_by_name("d").is_none());
    }
}
