/// Limits enforced by [`super::LocalCache::trim`]. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicies {
    pub max_size_bytes: u64,
    pub max_items: usize,
}

impl CachePolicies {
    pub fn new(max_size_bytes: u64, max_items: usize) -> Self {
        Self {
            max_size_bytes,
            max_items,
        }
    }

    /// Whether a cache holding `items` entries totalling `total_bytes` is over
    /// either limit
    pub fn exceeded(&self, items: usize, total_bytes: u64) -> bool {
        (self.max_items > 0 && items > self.max_items)
            || (self.max_size_bytes > 0 && total_bytes > self.max_size_bytes)
    }
}

/// What a trim pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub evicted: usize,
    pub freed_bytes: u64,
    pub stale_temp_files: usize,
}
