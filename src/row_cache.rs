//! Row-granularity cache of shaped GPU cells.
//!
//! Rebuilding a frame re-shapes only rows that changed; everything else is
//! cloned out of this LRU. Keys carry the per-row selection state so
//! toggling a selection does not evict the unselected rendering — both
//! coexist until capacity pressure ages one out.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::gpu_types::GpuCell;
use crate::terminal::{ScreenKind, Selection};

/// Identity of one cached row rendering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RowKey {
    /// Selection intersecting the row at shape time, if any.
    pub selection: Option<Selection>,
    pub screen: ScreenKind,
    pub row_id: u64,
}

/// LRU of shaped rows. Values store `grid_row` normalized to 0; the
/// rebuilder re-stamps the current viewport row on hit.
pub struct RowCache {
    cache: LruCache<RowKey, Vec<GpuCell>>,
}

impl RowCache {
    /// Capacity floor; small grids still keep a useful amount of history.
    const MIN_CAPACITY: usize = 80;

    pub fn new(rows: usize) -> Self {
        Self { cache: LruCache::new(Self::capacity_for(rows)) }
    }

    fn capacity_for(rows: usize) -> NonZeroUsize {
        NonZeroUsize::new(Self::MIN_CAPACITY.max(rows * 10))
            .unwrap_or(NonZeroUsize::new(Self::MIN_CAPACITY).unwrap())
    }

    /// Grows or shrinks with the grid. Shrinking evicts oldest entries.
    pub fn set_rows(&mut self, rows: usize) {
        self.cache.resize(Self::capacity_for(rows));
    }

    pub fn get(&mut self, key: &RowKey) -> Option<&Vec<GpuCell>> {
        self.cache.get(key)
    }

    /// Inserts a shaped row. The evicted value, if any, is dropped here;
    /// nothing else holds a reference to cached lists.
    pub fn put(&mut self, key: RowKey, cells: Vec<GpuCell>) {
        self.cache.put(key, cells);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
