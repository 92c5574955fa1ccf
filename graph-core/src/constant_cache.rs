//! Process-wide constant-tensor cache.
//!
//! A concurrent map from key to a promise/future cell lets the first
//! caller for a key become the producer while every other concurrent
//! caller for the *same* key awaits the same cell instead of
//! recomputing, generalized from a fixed memory-descriptor key to an
//! opaque [`CacheKey`] hash.

use crate::engine::DeviceBuffer;
use crate::error::{GraphError, Result};
use async_cell::sync::AsyncCell;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Content-hash key: `blake3(partition_id || persistent_mem_desc_digest
/// || input_signature_digest)`. Two partitions that constant-fold to
/// byte-identical persistent memory from byte-identical inputs collapse
/// to the same cache entry.
pub type CacheKey = [u8; 32];

pub fn compute_cache_key(partition_id: u64, persistent_digest: &[u8], input_signature_digest: &[u8]) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&partition_id.to_le_bytes());
    hasher.update(persistent_digest);
    hasher.update(input_signature_digest);
    *hasher.finalize().as_bytes()
}

type CacheValue = std::result::Result<DeviceBuffer, String>;
type CacheSlot = Arc<AsyncCell<CacheValue>>;

struct LruState {
    order: VecDeque<CacheKey>,
    sizes: std::collections::HashMap<CacheKey, usize>,
    used_bytes: usize,
}

/// A process-wide, size-bounded cache of constant-folded device buffers,
/// keyed by [`CacheKey`]. Safe to share across concurrently executing
/// partitions via a single `Arc<ConstantTensorCache>`.
pub struct ConstantTensorCache {
    entries: DashMap<CacheKey, CacheSlot>,
    lru: parking_lot::Mutex<LruState>,
    capacity_bytes: usize,
}

impl ConstantTensorCache {
    pub fn new(capacity_bytes: usize) -> Self {
        ConstantTensorCache {
            entries: DashMap::new(),
            lru: parking_lot::Mutex::new(LruState {
                order: VecDeque::new(),
                sizes: std::collections::HashMap::new(),
                used_bytes: 0,
            }),
            capacity_bytes,
        }
    }

    /// Returns the cached buffer for `key`, producing it via `produce`
    /// if this is the first caller to ask for it. Concurrent callers for
    /// the same key block on the same [`AsyncCell`] rather than each
    /// running `produce`. If the elected producer's `produce` fails,
    /// every waiter observes [`GraphError::CacheProducerFailure`] and
    /// the entry is removed so a later caller may retry.
    pub fn get_or_insert_with(
        &self,
        key: CacheKey,
        size: usize,
        produce: impl FnOnce() -> Result<DeviceBuffer>,
    ) -> Result<DeviceBuffer> {
        let (slot, is_producer) = match self.entries.entry(key) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(AsyncCell::new());
                vacant.insert(slot.clone());
                (slot, true)
            }
        };

        if is_producer {
            self.record_insert(key, size);
            match produce() {
                Ok(buf) => {
                    slot.set(Ok(buf.clone()));
                    self.evict_if_over_capacity();
                    Ok(buf)
                }
                Err(e) => {
                    let message = e.to_string();
                    slot.set(Err(message.clone()));
                    self.entries.remove(&key);
                    self.record_remove(key);
                    Err(GraphError::CacheProducerFailure(message))
                }
            }
        } else {
            self.touch(key);
            futures::executor::block_on(slot.get()).map_err(GraphError::CacheProducerFailure)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record_insert(&self, key: CacheKey, size: usize) {
        let mut lru = self.lru.lock();
        lru.order.push_back(key);
        lru.sizes.insert(key, size);
        lru.used_bytes += size;
    }

    fn record_remove(&self, key: CacheKey) {
        let mut lru = self.lru.lock();
        if let Some(size) = lru.sizes.remove(&key) {
            lru.used_bytes = lru.used_bytes.saturating_sub(size);
        }
        lru.order.retain(|&k| k != key);
    }

    fn touch(&self, key: CacheKey) {
        let mut lru = self.lru.lock();
        if lru.order.iter().any(|&k| k == key) {
            lru.order.retain(|&k| k != key);
            lru.order.push_back(key);
        }
    }

    /// Evicts least-recently-used entries until the cache is back under
    /// its byte budget. The entry that triggered the eviction (just
    /// inserted, at the back of the order) is never evicted by this
    /// call even if it alone exceeds capacity — a single
    /// larger-than-capacity constant still gets served once.
    fn evict_if_over_capacity(&self) {
        loop {
            let victim = {
                let lru = self.lru.lock();
                if lru.used_bytes <= self.capacity_bytes || lru.order.len() <= 1 {
                    None
                } else {
                    lru.order.front().copied()
                }
            };
            let Some(victim) = victim else { break };
            self.entries.remove(&victim);
            self.record_remove(victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_caller_reuses_first_producer_result() {
        let cache = ConstantTensorCache::new(1 << 20);
        let key = compute_cache_key(1, b"desc", b"input");
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let buf1 = cache
            .get_or_insert_with(key, 16, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(DeviceBuffer::zeroed(16))
            })
            .unwrap();
        let buf2 = cache
            .get_or_insert_with(key, 16, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(DeviceBuffer::zeroed(16))
            })
            .unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(buf1.len(), buf2.len());
    }

    #[test]
    fn sixteen_concurrent_callers_collapse_onto_one_producer() {
        let cache = Arc::new(ConstantTensorCache::new(1 << 20));
        let key = compute_cache_key(3, b"desc", b"input");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_insert_with(key, 16, || {
                            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            // Give other threads a chance to queue up behind
                            // the producer before it finishes.
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(DeviceBuffer::zeroed(16))
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_producer_is_observed_and_entry_is_retryable() {
        let cache = ConstantTensorCache::new(1 << 20);
        let key = compute_cache_key(2, b"desc", b"input");

        let err = cache
            .get_or_insert_with(key, 16, || Err(GraphError::OutOfMemory("no room".into())))
            .unwrap_err();
        assert!(matches!(err, GraphError::CacheProducerFailure(_)));
        assert!(cache.is_empty());

        let ok = cache.get_or_insert_with(key, 16, || Ok(DeviceBuffer::zeroed(16)));
        assert!(ok.is_ok());
    }
}
