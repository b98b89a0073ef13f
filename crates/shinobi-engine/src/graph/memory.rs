use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

type Scope = Arc<RwLock<HashMap<String, Value>>>;

/// Key/value store partitioned into independent scopes.
///
/// Each scope has its own lock, so writers in different scopes never
/// contend. Reads hand out copies; no lock outlives a call.
#[derive(Debug, Default)]
pub struct Memory {
    scopes: DashMap<String, Scope>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, scope: &str) -> Scope {
        if let Some(existing) = self.scopes.get(scope) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.scopes.entry(scope.to_string()).or_default().value())
    }

    pub fn get(&self, scope: &str, key: &str) -> Option<Value> {
        let entries = self.scopes.get(scope).map(|s| Arc::clone(s.value()))?;
        let value = entries.read().get(key).cloned();
        value
    }

    /// Returns the previous value, if any.
    pub fn set(&self, scope: &str, key: impl Into<String>, value: Value) -> Option<Value> {
        self.scope(scope).write().insert(key.into(), value)
    }

    pub fn remove(&self, scope: &str, key: &str) -> Option<Value> {
        let entries = self.scopes.get(scope).map(|s| Arc::clone(s.value()))?;
        let removed = entries.write().remove(key);
        removed
    }

    /// Read-modify-write of one key under the scope's write lock.
    pub fn update<F>(&self, scope: &str, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let entries = self.scope(scope);
        let mut guard = entries.write();
        let next = f(guard.get(key));
        let _ = guard.insert(key.to_string(), next.clone());
        next
    }

    /// Copy of one scope, ordered by key. Empty for unknown scopes.
    pub fn snapshot(&self, scope: &str) -> BTreeMap<String, Value> {
        match self.scopes.get(scope).map(|s| Arc::clone(s.value())) {
            Some(entries) => {
                let copy: BTreeMap<String, Value> = entries
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                copy
            }
            None => BTreeMap::new(),
        }
    }

    pub fn clear(&self, scope: &str) {
        let _ = self.scopes.remove(scope);
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
