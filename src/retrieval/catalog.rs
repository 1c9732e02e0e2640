//! Cached file catalog
//!
//! Directory scans only run on the retrieval worker. The command callback
//! validates file references against the last published snapshot.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::storage::naming::ChunkName;
use crate::storage::store::ChunkInfo;

/// One retrievable chunk as last seen by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: ChunkName,
    pub size: u32,
}

impl CatalogEntry {
    pub fn file_tag(&self) -> u32 {
        self.name.file_tag()
    }
}

impl From<ChunkInfo> for CatalogEntry {
    fn from(info: ChunkInfo) -> Self {
        Self {
            name: info.name,
            size: info.size.min(u32::MAX as u64) as u32,
        }
    }
}

#[derive(Debug, Default)]
struct CatalogInner {
    entries: RwLock<Arc<Vec<CatalogEntry>>>,
    generation: AtomicU64,
}

/// Shared catalog snapshot, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    inner: Arc<CatalogInner>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh scan
    pub fn replace(&self, chunks: Vec<ChunkInfo>) {
        let entries: Vec<CatalogEntry> = chunks.into_iter().map(CatalogEntry::from).collect();
        tracing::debug!("Catalog rebuilt with {} entries", entries.len());
        *self.inner.entries.write() = Arc::new(entries);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Arc<Vec<CatalogEntry>> {
        self.inner.entries.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<CatalogEntry> {
        self.inner.entries.read().get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rebuilds so far
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_replace_publishes_snapshot() {
        let catalog = CatalogCache::new();
        assert!(catalog.is_empty());

        let name = ChunkName::new(NaiveTime::from_hms_opt(0, 0, 9).unwrap(), 1);
        let held = catalog.snapshot();
        catalog.replace(vec![ChunkInfo { name, size: 12 }]);

        assert!(held.is_empty());
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(0), Some(CatalogEntry { name, size: 12 }));
        assert_eq!(catalog.get(0).unwrap().file_tag(), 9);
        assert_eq!(catalog.get(1), None);
        assert_eq!(catalog.generation(), 1);
    }
}
