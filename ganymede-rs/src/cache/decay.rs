#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use linked_hash_map::LinkedHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// An entry as kept in the recency structure.
///
/// The timestamp is recorded once at insertion and never mutated. Together with the key
/// it forms the identity of the entry: a later insertion of the same key creates a new
/// entry with a fresh timestamp.
struct Entry<V> {
    timestamp: Instant,
    value: V,
}

/// A record in the reaper log.
///
/// One record is appended per insertion, therefore a key may occur several times. The
/// log is consumed strictly from the front and its timestamps are non-decreasing, as
/// records are appended under the same critical section which stamps them.
struct LogRecord {
    key: String,
    timestamp: Instant,
}

/// The mutable core of the cache.
///
/// The recency map orders entries from least recently used (front) to most recently used
/// (back) and simultaneously serves as the key index. Both it and the log are only ever
/// touched while the surrounding mutex is held.
struct Inner<V> {
    entries: LinkedHashMap<String, Entry<V>>,
    log: VecDeque<LogRecord>,
}

/// Keeps the handle on a running reaper task so it can be shut down again.
struct Reaper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Provides a capacity bounded LRU cache whose entries additionally expire after a
/// wall-clock TTL.
///
/// The cache behaves just like a map as long as there is no shortage in storage. Once
/// the configured capacity is reached, the least recently used entry is evicted - hence
/// the name LRU cache. Independently of recency, no entry older than the TTL is ever
/// returned: a lookup which encounters an over-age entry removes it and reports a miss,
/// and the background reaper (see [start](DecayingLruCache::start)) removes expired
/// entries even if nobody asks for them.
///
/// The reaper does not scan the whole cache. Every insertion appends a (key, timestamp)
/// record to an internal time-ordered log; on each wake the reaper walks this log from
/// the front and stops at the first record which hasn't reached its expiry yet. Since a
/// key which was re-inserted leaves older records behind in the log, the removal re-reads
/// the authoritative timestamp from the recency map and refuses to delete an entry which
/// is younger than the record suggested.
///
/// All operations are internally synchronized, so the cache can be shared between the
/// connection tasks and the reaper via an `Arc`.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use ganymede::cache::DecayingLruCache;
/// // A cache for up to two entries whose entries expire after five minutes.
/// let cache = DecayingLruCache::new(2, Duration::from_millis(100), Duration::from_secs(300)).unwrap();
///
/// cache.add("ganymede".to_owned(), "moon".to_owned());
/// assert_eq!(cache.get("ganymede"), Some("moon".to_owned()));
///
/// // Filling the cache beyond its capacity drops the least recently used entry...
/// cache.add("io".to_owned(), "moon".to_owned());
/// cache.add("jupiter".to_owned(), "planet".to_owned());
/// assert_eq!(cache.get("ganymede"), None);
/// assert_eq!(cache.get("io"), Some("moon".to_owned()));
/// assert_eq!(cache.get("jupiter"), Some("planet".to_owned()));
/// ```
pub struct DecayingLruCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    period: Duration,
    ttl: Duration,
    reaper: Mutex<Option<Reaper>>,
}

impl<V> DecayingLruCache<V> {
    /// Creates a new cache which stores up to **capacity** entries for at most **ttl**.
    ///
    /// The reaper, once started, wakes every **period**. A period of zero disables the
    /// reaper entirely - entries then only leave the cache when they are replaced,
    /// explicitly removed, evicted by capacity or encountered over-age by a lookup.
    ///
    /// # Errors
    /// Fails if **capacity** is zero, as such a cache could never hold an entry.
    pub fn new(capacity: usize, period: Duration, ttl: Duration) -> anyhow::Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("The cache capacity must be a positive number!"));
        }

        Ok(DecayingLruCache {
            inner: Mutex::new(Inner {
                entries: LinkedHashMap::with_capacity(capacity),
                log: VecDeque::new(),
            }),
            capacity,
            period,
            ttl,
            reaper: Mutex::new(None),
        })
    }

    /// Inserts or replaces the value for the given key.
    ///
    /// The entry is stamped with the current time, becomes the most recently used one
    /// and is recorded in the reaper log. If the insertion grows the cache beyond its
    /// capacity, the least recently used entry is evicted.
    pub fn add(&self, key: String, value: V) {
        let mut inner = self.inner.lock().unwrap();
        let timestamp = Instant::now();

        log::debug!("Caching {}...", key);
        inner.log.push_back(LogRecord {
            key: key.clone(),
            timestamp,
        });

        // LinkedHashMap::insert moves a replaced key to the back, so this updates the
        // payload, the timestamp and the recency in one go.
        let _ = inner.entries.insert(key, Entry { timestamp, value });

        if inner.entries.len() > self.capacity {
            if let Some((lru_key, _)) = inner.entries.pop_front() {
                log::debug!("Evicting {} (capacity reached).", lru_key);
            }
        }
    }

    /// Returns the value stored for the given key, refreshing its recency.
    ///
    /// An entry older than the TTL is never returned. Instead of waiting for the reaper,
    /// the lookup removes such an entry right away and reports a miss.
    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let expired = match inner.entries.get_refresh(key) {
            Some(entry) if now <= entry.timestamp + self.ttl => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            log::debug!("Evicting {} (expired on read).", key);
            let _ = inner.entries.remove(key);
        }

        None
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(key).is_some() {
            log::debug!("Removing {}.", key);
        }
    }

    /// Removes the entry for the given key iff it has expired as of the given instant.
    ///
    /// This is the only path by which the reaper mutates the cache. The decision is made
    /// against the timestamp currently stored in the recency map - not against the log
    /// record which triggered the call - so a key which was re-inserted in the meantime
    /// survives the reaping of its stale log records.
    pub fn remove_if_expired(&self, key: &str, as_of: Instant) {
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.entries.get(key) {
            Some(entry) => as_of > entry.timestamp + self.ttl,
            None => false,
        };

        if expired {
            log::debug!("Evicting {} (expired).", key);
            let _ = inner.entries.remove(key);
        }
    }

    /// Performs one reaper pass as of the given instant.
    ///
    /// Walks the log from the front: each record which has reached its expiry is popped
    /// and handed to [remove_if_expired](DecayingLruCache::remove_if_expired); the walk
    /// stops at the first record which hasn't, as the log is ordered by time. The lock
    /// is re-acquired per record, so foreground operations make progress between
    /// records even when a large batch expires at once.
    pub fn reap(&self, now: Instant) {
        loop {
            let record = {
                let mut inner = self.inner.lock().unwrap();
                let expired = match inner.log.front() {
                    Some(record) => now > record.timestamp + self.ttl,
                    None => false,
                };

                if expired {
                    inner.log.pop_front()
                } else {
                    None
                }
            };

            match record {
                Some(record) => self.remove_if_expired(&record.key, now),
                None => return,
            }
        }
    }

    /// Launches the background reaper.
    ///
    /// The reaper wakes every **period** (as given to the constructor) and performs a
    /// [reap](DecayingLruCache::reap) pass. If the period is zero, this is a no-op and
    /// TTL enforcement is left to the lookups.
    pub fn start(self: &Arc<Self>)
    where
        V: Send + 'static,
    {
        if self.period.is_zero() {
            log::info!("The reaper is disabled (period is zero).");
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let cache = Arc::clone(self);
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.reap(Instant::now()),
                    _ = stopped.changed() => return,
                }
            }
        });

        log::info!(
            "Reaper started (period: {} ms, ttl: {} ms).",
            self.period.as_millis(),
            self.ttl.as_millis()
        );

        *self.reaper.lock().unwrap() = Some(Reaper { stop, task });
    }

    /// Shuts the background reaper down.
    ///
    /// Returns once the reaper task has observed the stop signal and exited. Calling
    /// this without a running reaper (never started, period zero, or already stopped)
    /// is a no-op.
    pub async fn stop(&self) {
        let reaper = { self.reaper.lock().unwrap().take() };

        if let Some(reaper) = reaper {
            let _ = reaper.stop.send(true);
            let _ = reaper.task.await;
            log::info!("Reaper stopped.");
        }
    }

    /// Returns the number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Returns the overall capacity (max number of entries) of this cache.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reports the number of records in the reaper log.
    #[cfg(test)]
    pub(crate) fn log_len(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mock_instant::{Instant, MockClock};

    use crate::cache::DecayingLruCache;

    fn cache(capacity: usize, ttl: Duration) -> DecayingLruCache<String> {
        DecayingLruCache::new(capacity, Duration::from_millis(100), ttl).unwrap()
    }

    #[test]
    fn a_zero_capacity_is_rejected() {
        let result =
            DecayingLruCache::<String>::new(0, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(result.is_err(), true);
    }

    #[test]
    fn values_can_be_added_fetched_and_removed() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(4, Duration::from_secs(60));

        lru.add("Hello".to_owned(), "World".to_owned());
        assert_eq!(lru.get("Hello"), Some("World".to_owned()));
        assert_eq!(lru.get("unknown"), None);
        assert_eq!(lru.len(), 1);

        lru.remove("Hello");
        assert_eq!(lru.get("Hello"), None);
        assert_eq!(lru.is_empty(), true);

        // Removing an absent key is a no-op...
        lru.remove("Hello");
    }

    #[test]
    fn replacing_a_key_keeps_the_entry_count() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(4, Duration::from_secs(60));

        lru.add("Foo".to_owned(), "Bar".to_owned());
        lru.add("Foo".to_owned(), "Baz".to_owned());

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("Foo"), Some("Baz".to_owned()));

        // ...but both insertions left their record in the log.
        assert_eq!(lru.log_len(), 2);
    }

    #[test]
    fn capacity_is_enforced_in_recency_order() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(4, Duration::from_secs(60));

        lru.add("Hello".to_owned(), "World".to_owned());
        lru.add("Hello1".to_owned(), "World1".to_owned());
        lru.add("Hello2".to_owned(), "World2".to_owned());
        lru.add("Hello3".to_owned(), "World3".to_owned());
        assert_eq!(lru.len(), 4);

        // Another entry pushes out the least recently used one...
        lru.add("Hello4".to_owned(), "World4".to_owned());
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.get("Hello"), None);
        assert_eq!(lru.get("Hello1"), Some("World1".to_owned()));

        // "Using" an entry protects it from the next eviction...
        let _ = lru.get("Hello2");
        lru.add("Hello5".to_owned(), "World5".to_owned());
        assert_eq!(lru.get("Hello2"), Some("World2".to_owned()));
        assert_eq!(lru.get("Hello3"), None);
    }

    #[test]
    fn a_capacity_of_one_replaces_on_every_add() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(1, Duration::from_secs(60));

        lru.add("a".to_owned(), "1".to_owned());
        lru.add("b".to_owned(), "2".to_owned());

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("a"), None);
        assert_eq!(lru.get("b"), Some("2".to_owned()));
    }

    #[test]
    fn an_expired_entry_is_a_miss_and_gets_removed() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(4, Duration::from_secs(1));

        lru.add("1".to_owned(), "x".to_owned());
        assert_eq!(lru.get("1"), Some("x".to_owned()));

        MockClock::advance(Duration::from_secs(2));
        assert_eq!(lru.get("1"), None);

        // The read already removed the entry, not just hid it...
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn an_entry_at_exactly_ttl_age_is_still_served() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(4, Duration::from_secs(1));

        lru.add("1".to_owned(), "x".to_owned());
        MockClock::advance(Duration::from_secs(1));

        assert_eq!(lru.get("1"), Some("x".to_owned()));
    }

    #[test]
    fn reaping_removes_expired_entries_and_drains_the_log() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(8, Duration::from_secs(1));

        lru.add("old1".to_owned(), "x".to_owned());
        lru.add("old2".to_owned(), "x".to_owned());
        MockClock::advance(Duration::from_secs(2));
        lru.add("fresh".to_owned(), "x".to_owned());

        lru.reap(Instant::now());

        assert_eq!(lru.get("old1"), None);
        assert_eq!(lru.get("old2"), None);
        assert_eq!(lru.get("fresh"), Some("x".to_owned()));

        // The walk stopped at the first fresh record, which therefore remains queued...
        assert_eq!(lru.log_len(), 1);
    }

    #[test]
    fn a_reinserted_key_survives_reaping_of_its_stale_records() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(8, Duration::from_secs(1));

        // Re-add the same key over and over, each time shortly before the previous
        // insertion would expire...
        for _ in 0..5 {
            lru.add("Foo".to_owned(), "Bar".to_owned());
            MockClock::advance(Duration::from_millis(900));
            lru.reap(Instant::now());
        }

        // The stale log records have been worked off without harming the entry, as its
        // authoritative timestamp is younger than each reaped record...
        assert_eq!(lru.get("Foo"), Some("Bar".to_owned()));
        assert_eq!(lru.log_len(), 1);

        // Only once the TTL elapses without a re-add, the entry is reaped...
        MockClock::advance(Duration::from_secs(2));
        lru.reap(Instant::now());
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.log_len(), 0);
    }

    #[test]
    fn remove_if_expired_consults_the_authoritative_timestamp() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let lru = cache(8, Duration::from_secs(1));

        lru.add("Foo".to_owned(), "Bar".to_owned());
        let stale_deadline = Instant::now();

        // A fresh entry is not removed, even when probed with a time by which an older
        // incarnation would have expired...
        lru.remove_if_expired("Foo", stale_deadline);
        assert_eq!(lru.get("Foo"), Some("Bar".to_owned()));

        MockClock::advance(Duration::from_secs(2));
        lru.remove_if_expired("Foo", Instant::now());
        assert_eq!(lru.get("Foo"), None);
    }
}
