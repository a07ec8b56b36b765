/*!
Bounded-staleness read cache.

Holds a single snapshot value stamped with the time it was stored. Readers
get the value only while it is younger than the TTL. There is no single-flight
on a miss: two readers racing past expiry both query the backend.

Every write bumps a generation counter. A reader records the generation
before it queries the backend and may only fill the cache if no write landed
in between, so a slow read can never replace a newer written set.
*/

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct Entry<T> {
    value: Arc<T>,
    stored_at: Instant,
}

struct Slot<T> {
    entry: Option<Entry<T>>,
    generation: u64,
}

/// Token taken before a backend read, see [`ReadCache::fill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTicket(u64);

/// TTL cache over one value
pub struct ReadCache<T> {
    ttl: Duration,
    slot: Mutex<Slot<T>>,
}

impl<T> ReadCache<T> {
    /// Create an empty cache; a zero `ttl` disables caching entirely
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(Slot {
                entry: None,
                generation: 0,
            }),
        }
    }

    /// The cached value, if one exists and is younger than the TTL
    pub fn get_fresh(&self) -> Option<Arc<T>> {
        let slot = self.lock();
        slot.entry
            .as_ref()
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Mark the start of a backend read
    pub fn begin_read(&self) -> ReadTicket {
        ReadTicket(self.lock().generation)
    }

    /// Store a value read from the backend, unless a write landed since `ticket`
    pub fn fill(&self, ticket: ReadTicket, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut slot = self.lock();
        if slot.generation == ticket.0 && !self.ttl.is_zero() {
            slot.entry = Some(Entry {
                value: Arc::clone(&value),
                stored_at: Instant::now(),
            });
        }
        value
    }

    /// Write-through: replace the cached value with freshly written data
    pub fn put(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut slot = self.lock();
        slot.generation += 1;
        slot.entry = (!self.ttl.is_zero()).then(|| Entry {
            value: Arc::clone(&value),
            stored_at: Instant::now(),
        });
        value
    }

    /// Drop the cached value after a write whose result is not known in full
    pub fn invalidate(&self) {
        let mut slot = self.lock();
        slot.generation += 1;
        slot.entry = None;
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_value_expires_after_ttl() {
        let cache = ReadCache::new(Duration::from_millis(500));
        assert!(cache.get_fresh().is_none());

        cache.put(vec![1, 2, 3]);
        tokio::time::advance(Duration::from_millis(499)).await;
        assert_eq!(cache.get_fresh().as_deref(), Some(&vec![1, 2, 3]));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get_fresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_restarts_ttl() {
        let cache = ReadCache::new(Duration::from_millis(100));
        cache.put("old");
        tokio::time::advance(Duration::from_millis(80)).await;
        cache.put("new");
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(cache.get_fresh().as_deref(), Some(&"new"));
    }

    #[test]
    fn test_invalidate_and_zero_ttl() {
        let cache = ReadCache::new(Duration::from_secs(60));
        cache.put(1u8);
        cache.invalidate();
        assert!(cache.get_fresh().is_none());

        let disabled = ReadCache::new(Duration::ZERO);
        let returned = disabled.put(7u8);
        assert_eq!(*returned, 7);
        assert!(disabled.get_fresh().is_none());
    }

    #[test]
    fn test_fill_without_intervening_write() {
        let cache = ReadCache::new(Duration::from_secs(60));
        let ticket = cache.begin_read();
        cache.fill(ticket, "loaded");

        assert_eq!(cache.get_fresh().as_deref(), Some(&"loaded"));
    }

    #[test]
    fn test_slow_read_does_not_replace_newer_write() {
        let cache = ReadCache::new(Duration::from_secs(60));

        let ticket = cache.begin_read();
        cache.put("written");
        let returned = cache.fill(ticket, "stale");

        assert_eq!(*returned, "stale");
        assert_eq!(cache.get_fresh().as_deref(), Some(&"written"));

        let ticket = cache.begin_read();
        cache.invalidate();
        cache.fill(ticket, "stale");
        assert!(cache.get_fresh().is_none());
    }
}
