use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::endpoint::Authority;

/// Servers known to mishandle pipelined requests.
///
/// Entries are only ever added. Clones share the same set, so one set can
/// be handed to several pools.
#[derive(Debug, Clone, Default)]
pub struct PipelineBlacklist {
    inner: Arc<RwLock<HashSet<Authority>>>,
}

impl PipelineBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `authority`. Returns true if it was not listed before.
    pub fn insert(&self, authority: Authority) -> bool {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(authority)
    }

    pub fn contains(&self, authority: &Authority) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(authority)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
