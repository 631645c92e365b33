//! Cache discarder registry.
//!
//! Allocation failure is survivable: before giving up, callers may ask the
//! registered caches (neighbour entries, TCP reassembly queues) to release
//! state one unit at a time.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

/// A cache willing to shed entries under memory pressure
pub trait CacheDiscarder: Send + Sync {
    /// Discard one cached item; returns false if nothing could be freed
    fn discard(&self) -> bool;
}

static DISCARDERS: RwLock<Vec<Arc<dyn CacheDiscarder>>> = RwLock::new(Vec::new());

/// Register a discarder
pub fn register_discarder(discarder: Arc<dyn CacheDiscarder>) {
    DISCARDERS.write().push(discarder);
}

/// Ask each discarder in turn to free one item
///
/// Returns the number of items actually discarded (at most one per
/// registered cache per call).
pub fn discard_cached() -> usize {
    let snapshot: Vec<Arc<dyn CacheDiscarder>> = DISCARDERS.read().clone();
    snapshot.iter().filter(|d| d.discard()).count()
}
