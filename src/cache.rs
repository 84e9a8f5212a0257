//! Descriptor and branch-result caches. Both are owned by the app instance
//! and shared across requests behind locks held only for map access.

use crate::content::ContentReader;
use crate::descriptor::{create_trunk, Trunk};
use crate::error::BuildError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Built descriptors by API path. Build failures are returned, never
/// cached, so a fixed template is picked up on the next request.
#[derive(Default)]
pub struct DescriptorCache {
    trunks: RwLock<HashMap<String, Arc<Trunk>>>,
}

impl DescriptorCache {
    pub fn new() -> DescriptorCache {
        DescriptorCache::default()
    }

    pub fn get_or_build(
        &self,
        path: &str,
        reader: &dyn ContentReader,
    ) -> Result<Arc<Trunk>, BuildError> {
        if let Ok(trunks) = self.trunks.read() {
            if let Some(trunk) = trunks.get(path) {
                return Ok(trunk.clone());
            }
        }
        let trunk = Arc::new(create_trunk(path, reader)?);
        if let Ok(mut trunks) = self.trunks.write() {
            trunks.insert(path.to_string(), trunk.clone());
        }
        Ok(trunk)
    }

    pub fn invalidate(&self, path: &str) {
        if let Ok(mut trunks) = self.trunks.write() {
            trunks.remove(path);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut trunks) = self.trunks.write() {
            trunks.clear();
        }
    }
}

/// Rows of branches marked `cache: true` in their output model, keyed by
/// path and dotted branch method.
#[derive(Default)]
pub struct ResultCache {
    rows: RwLock<HashMap<String, Vec<Value>>>,
}

impl ResultCache {
    pub fn new() -> ResultCache {
        ResultCache::default()
    }

    fn key(path: &str, method: &str) -> String {
        format!("{path}::{method}")
    }

    pub fn get(&self, path: &str, method: &str) -> Option<Vec<Value>> {
        self.rows
            .read()
            .ok()?
            .get(&Self::key(path, method))
            .cloned()
    }

    pub fn put(&self, path: &str, method: &str, rows: Vec<Value>) {
        if let Ok(mut map) = self.rows.write() {
            map.insert(Self::key(path, method), rows);
        }
    }

    /// Drop all cached rows under one path.
    pub fn invalidate(&self, path: &str) {
        let prefix = format!("{path}::");
        if let Ok(mut map) = self.rows.write() {
            map.retain(|k, _| !k.starts_with(&prefix));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.rows.write() {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_cache_is_scoped_by_path() {
        let cache = ResultCache::new();
        cache.put("a/get", "$.items", vec![json!({"id": 1})]);
        cache.put("b/get", "$.items", vec![json!({"id": 2})]);

        assert_eq!(cache.get("a/get", "$.items"), Some(vec![json!({"id": 1})]));
        cache.invalidate("a/get");
        assert_eq!(cache.get("a/get", "$.items"), None);
        assert_eq!(cache.get("b/get", "$.items"), Some(vec![json!({"id": 2})]));
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = ResultCache::new();
        cache.put("a/get", "$", vec![]);
        cache.clear();
        assert_eq!(cache.get("a/get", "$"), None);
    }
}
