//! Duplicate packet suppression
//!
//! Radios replay recent packets from their store after every handshake,
//! and packets relayed along two paths can arrive twice. The
//! [`DuplicateCache`] remembers recently seen packets so the dispatcher
//! surfaces each one once.
//!
//! # Key
//!
//! Packets are identified by `(sender_node_num, packet_id)`. Packet ids are
//! only unique per sender, so the sender is part of the key.
//!
//! Entries expire after a TTL (lazily, on lookup) and the least recently
//! used entry is evicted once the cache is full.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default number of remembered packets
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default time a packet stays remembered
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Key for cache entries
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct PacketKey {
    pub from: u32,
    pub packet_id: u32,
}

impl PacketKey {
    pub fn new(from: u32, packet_id: u32) -> Self {
        Self { from, packet_id }
    }
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}:{:08x}", self.from, self.packet_id)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    first_seen: Instant,
    seen_count: u32,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total packets checked
    pub total_checks: u64,
    /// Packets dropped as duplicates
    pub duplicates_blocked: u64,
    /// Packets that passed through
    pub new_packets: u64,
    /// Entries expired by TTL
    pub ttl_expirations: u64,
    /// Entries evicted by LRU
    pub lru_evictions: u64,
}

impl CacheStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_blocked as f64 / self.total_checks as f64
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<PacketKey, CacheEntry>,
    stats: CacheStats,
}

/// LRU-based duplicate cache with TTL expiration
///
/// Clones share the same underlying entries.
#[derive(Debug, Clone)]
pub struct DuplicateCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl DuplicateCache {
    /// Create with default capacity and TTL
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    /// Create with custom capacity and TTL
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(cap),
                stats: CacheStats::default(),
            })),
            ttl,
        }
    }

    /// Check whether a packet was already seen, recording it if not
    ///
    /// Returns `true` for a duplicate.
    pub fn check_and_insert(&self, from: u32, packet_id: u32) -> bool {
        self.check_at(PacketKey::new(from, packet_id), Instant::now())
    }

    fn check_at(&self, key: PacketKey, now: Instant) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.total_checks += 1;

        if let Some(entry) = inner.entries.get_mut(&key) {
            if now.saturating_duration_since(entry.first_seen) > self.ttl {
                trace!(key = %key, "Cache entry expired, treating as new");
                entry.first_seen = now;
                entry.seen_count = 1;
                inner.stats.ttl_expirations += 1;
                inner.stats.new_packets += 1;
                return false;
            }

            entry.seen_count += 1;
            let seen_count = entry.seen_count;
            inner.stats.duplicates_blocked += 1;
            debug!(key = %key, seen_count, "Duplicate packet dropped");
            return true;
        }

        if inner.entries.push(key, CacheEntry { first_seen: now, seen_count: 1 }).is_some() {
            inner.stats.lru_evictions += 1;
        }
        inner.stats.new_packets += 1;
        false
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Get the configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for DuplicateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_then_duplicate() {
        let cache = DuplicateCache::new();

        assert!(!cache.check_and_insert(0x12345678, 1));
        assert!(cache.check_and_insert(0x12345678, 1));
        assert!(cache.check_and_insert(0x12345678, 1));

        let stats = cache.stats();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.new_packets, 1);
        assert_eq!(stats.duplicates_blocked, 2);
    }

    #[test]
    fn test_sender_is_part_of_key() {
        let cache = DuplicateCache::new();

        assert!(!cache.check_and_insert(0x12345678, 1));
        assert!(!cache.check_and_insert(0x12345678, 2));
        assert!(!cache.check_and_insert(0x87654321, 1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = DuplicateCache::with_capacity_and_ttl(3, DEFAULT_TTL);

        cache.check_and_insert(1, 1);
        cache.check_and_insert(2, 2);
        cache.check_and_insert(3, 3);
        cache.check_and_insert(4, 4);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().lru_evictions, 1);
        // Oldest entry was evicted
        assert!(!cache.check_and_insert(1, 1));
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = DuplicateCache::with_capacity_and_ttl(10, Duration::from_secs(300));
        let key = PacketKey::new(5, 5);
        let start = Instant::now();

        assert!(!cache.check_at(key, start));
        assert!(cache.check_at(key, start + Duration::from_secs(299)));
        assert!(!cache.check_at(key, start + Duration::from_secs(301)));
        assert_eq!(cache.stats().ttl_expirations, 1);
    }

    #[test]
    fn test_clone_shares_entries() {
        let cache = DuplicateCache::new();
        cache.check_and_insert(7, 7);

        let other = cache.clone();
        assert!(other.check_and_insert(7, 7));
        assert_eq!(cache.len(), other.len());
    }

    #[test]
    fn test_duplicate_rate_and_clear() {
        let cache = DuplicateCache::new();
        cache.check_and_insert(1, 1);
        cache.check_and_insert(1, 1);
        assert!((cache.stats().duplicate_rate() - 0.5).abs() < 0.01);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(PacketKey::new(0xAB, 0x10).to_string(), "000000ab:00000010");
    }
}
