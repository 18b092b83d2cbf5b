//! Run-scoped key/value store.

use crate::errors::DataConflictError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Parameters and stage outputs of a single run.
///
/// Every key is written at most once. Stage outputs are committed as a unit:
/// a reader sees either none or all of the keys a stage produced.
#[derive(Debug, Default)]
pub struct RunContext {
    data: RwLock<HashMap<String, Value>>,
}

impl RunContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context seeded with initial parameters.
    #[must_use]
    pub fn from_params(params: HashMap<String, Value>) -> Self {
        Self {
            data: RwLock::new(params),
        }
    }

    /// Gets a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// Returns true if the key exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Returns all keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the context holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copies a subset of keys. Missing keys are left out.
    #[must_use]
    pub fn select<'a, I>(&self, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let data = self.data.read();
        keys.into_iter()
            .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    /// Returns an ordered copy of the whole context.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Commits the outputs of one stage.
    ///
    /// Nothing is written if any key already exists.
    ///
    /// # Errors
    ///
    /// Returns `DataConflictError` naming the first key that is already present.
    pub fn commit(&self, outputs: HashMap<String, Value>) -> Result<(), DataConflictError> {
        let mut data = self.data.write();
        let mut keys: Vec<_> = outputs.keys().collect();
        keys.sort();
        if let Some(existing) = keys.into_iter().find(|key| data.contains_key(*key)) {
            return Err(DataConflictError::new(existing.clone()));
        }
        data.extend(outputs);
        Ok(())
    }
}

impl From<BTreeMap<String, Value>> for RunContext {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::from_params(map.into_iter().collect())
    }
}
