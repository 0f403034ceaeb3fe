//! Size bound for partitions: oldest-inserted entries go first.

use tracing::{debug, warn};

use super::namespace::NamespaceManager;

/// Trim `partition` down to `max_entries`, deleting in insertion order.
/// Reads never reorder entries, so this is FIFO rather than LRU.
///
/// Returns the number of entries removed. Store failures are logged and
/// reported as zero removals.
pub async fn enforce_limit(manager: &NamespaceManager, partition: &str, max_entries: usize) -> usize {
  let keys = match manager.keys(partition).await {
    Ok(keys) => keys,
    Err(e) => {
      warn!(%partition, "Eviction skipped, cannot list keys: {:#}", e);
      return 0;
    }
  };

  if keys.len() <= max_entries {
    return 0;
  }

  let excess = keys.len() - max_entries;
  let mut removed = 0;
  for key in keys.iter().take(excess) {
    match manager.delete(partition, key).await {
      Ok(true) => removed += 1,
      // Already gone, e.g. a concurrent eviction pass
      Ok(false) => {}
      Err(e) => warn!(%partition, %key, "Eviction delete failed: {:#}", e),
    }
  }

  debug!(%partition, removed, max_entries, "Evicted oldest entries");
  removed
}
