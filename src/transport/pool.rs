//! Upstream links shared by all client sessions.
//!
//! Each slot holds at most one link and is guarded by an async mutex, so a
//! link carries one query at a time. Client transaction IDs are remapped to
//! pool-unique IDs before they go upstream; the correlation table maps
//! every local ID back to the session and ID it stands for.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use super::tls::{UpstreamConnector, UpstreamLink};

/// An outstanding query, keyed by its pool-local ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    pub session: u64,
    pub original_id: u16,
}

/// Correlation table of pool-local transaction IDs.
#[derive(Debug, Default)]
pub struct IdMap {
    inner: Mutex<IdMapInner>,
}

#[derive(Debug, Default)]
struct IdMapInner {
    next: u16,
    pending: FxHashMap<u16, PendingQuery>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a local ID for `query`. `None` when all 65536 are taken.
    pub fn reserve(&self, query: PendingQuery) -> Option<u16> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.pending.len() > u16::MAX as usize {
            return None;
        }

        loop {
            let candidate = inner.next;
            inner.next = inner.next.wrapping_add(1);
            if !inner.pending.contains_key(&candidate) {
                inner.pending.insert(candidate, query);
                return Some(candidate);
            }
        }
    }

    /// Free a local ID, returning what it stood for.
    pub fn release(&self, local_id: u16) -> Option<PendingQuery> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.remove(&local_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.pending.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed set of link slots shared across sessions.
pub struct LinkPool {
    connector: UpstreamConnector,
    slots: Vec<AsyncMutex<Option<UpstreamLink>>>,
    next_slot: AtomicUsize,
    ids: IdMap,
}

impl LinkPool {
    pub fn new(connector: UpstreamConnector, size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| AsyncMutex::new(None)).collect();

        Self {
            connector,
            slots,
            next_slot: AtomicUsize::new(0),
            ids: IdMap::new(),
        }
    }

    pub fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    pub fn ids(&self) -> &IdMap {
        &self.ids
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Take exclusive use of a slot. Prefers a free slot; when every slot is
    /// busy, waits on the next one in round-robin order.
    pub async fn acquire(&self) -> MutexGuard<'_, Option<UpstreamLink>> {
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let n = self.slots.len();

        for i in 0..n {
            if let Ok(guard) = self.slots[(start + i) % n].try_lock() {
                return guard;
            }
        }

        self.slots[start % n].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::{UpstreamConfig, Verification};

    fn query(session: u64, original_id: u16) -> PendingQuery {
        PendingQuery {
            session,
            original_id,
        }
    }

    fn pool(size: usize) -> LinkPool {
        let connector = UpstreamConnector::new(UpstreamConfig {
            verification: Verification::Insecure,
            ..Default::default()
        })
        .unwrap();
        LinkPool::new(connector, size)
    }

    #[test]
    fn same_client_id_gets_distinct_local_ids() {
        let ids = IdMap::new();

        let a = ids.reserve(query(1, 0x1234)).unwrap();
        let b = ids.reserve(query(2, 0x1234)).unwrap();

        assert_ne!(a, b);
        assert_eq!(ids.release(a), Some(query(1, 0x1234)));
        assert_eq!(ids.release(b), Some(query(2, 0x1234)));
        assert!(ids.is_empty());
    }

    #[test]
    fn release_unknown_id() {
        let ids = IdMap::new();

        assert_eq!(ids.release(42), None);
    }

    #[test]
    fn skips_ids_in_use_after_wrap() {
        let ids = IdMap::new();
        let held = ids.reserve(query(1, 1)).unwrap();

        for _ in 0..u16::MAX {
            let id = ids.reserve(query(2, 2)).unwrap();
            ids.release(id);
        }

        let next = ids.reserve(query(3, 3)).unwrap();
        assert_ne!(next, held);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn exhausted_table() {
        let ids = IdMap::new();

        for i in 0..=u16::MAX {
            assert!(ids.reserve(query(1, i)).is_some());
        }

        assert_eq!(ids.reserve(query(1, 0)), None);
    }

    #[test]
    fn zero_size_pool_has_one_slot() {
        assert_eq!(pool(0).size(), 1);
    }

    #[tokio::test]
    async fn acquire_prefers_free_slot() {
        let pool = pool(2);

        let first = pool.acquire().await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(100), pool.acquire())
            .await
            .expect("a free slot should be handed out without waiting");

        drop(first);
        drop(second);
    }
}
