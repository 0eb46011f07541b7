use crate::protocol::StoreAs;
use serde_json::{Map, Value};

/// Session-local cache of in-flight edits, keyed by application store key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropStore {
    values: Map<String, Value>,
}

impl PropStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Writes the fields `store_as` selects out of `source` and returns the
    /// keys written. Fields missing from `source` are skipped.
    pub fn capture(&mut self, store_as: &StoreAs, source: &Map<String, Value>) -> Vec<String> {
        match store_as {
            StoreAs::Key(key) => match source.get("value") {
                Some(value) => {
                    self.set(key.clone(), value.clone());
                    vec![key.clone()]
                }
                None => Vec::new(),
            },
            StoreAs::Fields(fields) => fields
                .iter()
                .filter_map(|(field, key)| {
                    let value = source.get(field)?;
                    self.set(key.clone(), value.clone());
                    Some(key.clone())
                })
                .collect(),
        }
    }

    /// The listed keys that currently hold a value, in list order.
    pub fn select(&self, keys: &[String]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|key| Some((key.clone(), self.values.get(key)?.clone())))
            .collect()
    }
}
