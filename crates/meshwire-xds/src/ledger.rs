//! Version ledger
//!
//! Remembers, for recent push generations, the revision of every config the
//! generation was built from. Any nonce can then be traced back to the config
//! revisions a proxy has applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use moka::sync::Cache;

use crate::context::{PushContext, version_prefix};

#[derive(Clone)]
pub struct Ledger {
    generations: Cache<String, Arc<BTreeMap<String, u64>>>,
}

impl Ledger {
    pub fn new(capacity: u64) -> Self {
        Self {
            generations: Cache::new(capacity),
        }
    }

    pub fn record(&self, push: &PushContext) {
        self.generations.insert(
            push.version_prefix().to_string(),
            Arc::new(push.revisions().clone()),
        );
    }

    /// Revision of `key` in the generation that produced `nonce`
    pub fn previous_value(&self, nonce: &str, key: &str) -> Option<u64> {
        let prefix = version_prefix(nonce)?;
        self.generations.get(prefix)?.get(key).copied()
    }

    pub fn len(&self) -> u64 {
        self.generations.run_pending_tasks();
        self.generations.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
