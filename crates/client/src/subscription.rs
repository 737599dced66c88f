//! Cache of subscribed nodes, keyed by path.
//!
//! Write notifications carry only the fields that changed. The cache keeps
//! the full property record captured at subscribe time so partial changes
//! can be expanded before they reach the application.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::trace;

#[derive(Clone, Default)]
pub(crate) struct SubscriptionCache {
    entries: Arc<RwLock<HashMap<String, Map<String, Value>>>>,
}

fn path_of(record: &Map<String, Value>) -> Option<&str> {
    record.get("path").and_then(Value::as_str)
}

impl SubscriptionCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores subscribe result rows. Rows without a string `path` are ignored.
    pub(crate) fn store(&self, rows: &[Value]) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        for row in rows {
            if let Some(record) = row.as_object()
                && let Some(path) = path_of(record)
            {
                trace!(path, "caching subscribed node");
                entries.insert(path.to_string(), record.clone());
            }
        }
    }

    /// Removes the given paths.
    pub(crate) fn remove<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        for path in paths {
            entries.remove(path);
        }
    }

    /// Expands a partial change onto the cached record for its path.
    ///
    /// Changed fields override cached ones. Returns `None` when the path is
    /// not cached (the change is for a node this client no longer follows).
    pub(crate) fn merge(&self, change: &Map<String, Value>) -> Option<Map<String, Value>> {
        let path = path_of(change)?;
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut merged = entries.get(path)?.clone();
        merged.extend(change.iter().map(|(k, v)| (k.clone(), v.clone())));
        Some(merged)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, path: &str) -> Option<Map<String, Value>> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, path: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(path)
    }
}
