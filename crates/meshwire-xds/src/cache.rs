//! Cache of generated resources
//!
//! Keys embed the push context version, so a new push generation never hits
//! stale entries; old generations age out by capacity.

use std::sync::Arc;

use moka::sync::Cache;

use crate::generator::ResourceData;
use crate::xds::ResourceType;

#[derive(Clone)]
pub struct XdsCache {
    entries: Cache<String, Arc<Vec<ResourceData>>>,
}

impl XdsCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    pub fn key(resource_type: ResourceType, discriminator: &str, version_prefix: &str) -> String {
        format!(
            "{}/{}/{}",
            resource_type.short_name(),
            discriminator,
            version_prefix
        )
    }

    pub fn get_or_build<E>(
        &self,
        key: String,
        build: impl FnOnce() -> Result<Vec<ResourceData>, E>,
    ) -> Result<Arc<Vec<ResourceData>>, E> {
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit);
        }
        let built = Arc::new(build()?);
        self.entries.insert(key, built.clone());
        Ok(built)
    }

    /// Cached keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|(k, _)| (*k).clone()).collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
