//! Property based tests for the decaying LRU cache.
//!
//! These drive the cache through random sequences of add, get, remove and clock-advance
//! operations and verify the structural invariants after every single step: the entry
//! count never exceeds the capacity, a lookup never observes anything but the most
//! recently stored value, and no lookup ever returns an entry older than the TTL.

use std::collections::HashMap;
use std::time::Duration;

use mock_instant::{Instant, MockClock};
use proptest::prelude::*;

use crate::cache::DecayingLruCache;

const CAPACITY: usize = 8;
const TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum CacheOp {
    Add { key: String, value: String },
    Get { key: String },
    Remove { key: String },
    Advance { millis: u64 },
}

/// Generates keys from a deliberately small alphabet, so that sequences revisit keys
/// often enough to exercise replacement, recency refreshes and stale log records.
fn key_strategy() -> impl Strategy<Value = String> {
    (0u8..12).prop_map(|index| format!("key{}", index))
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,16}".prop_map(|value| value)
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| CacheOp::Add { key, value }),
        4 => key_strategy().prop_map(|key| CacheOp::Get { key }),
        1 => key_strategy().prop_map(|key| CacheOp::Remove { key }),
        2 => (0u64..12_000).prop_map(|millis| CacheOp::Advance { millis }),
    ]
}

/// Tracks what the cache *must* report, without modelling eviction order: a key the
/// model knows about may legally be absent (capacity eviction), but a key the model
/// considers expired or removed must never surface, and a surfaced value must be the
/// most recently written one.
struct Model {
    entries: HashMap<String, (String, Duration)>,
    now: Duration,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operation_sequences_maintain_the_invariants(
        ops in prop::collection::vec(cache_op_strategy(), 1..60)
    ) {
        // The mocked clock is process global, therefore these cases must not interleave
        // with other clock manipulating tests...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let cache = DecayingLruCache::new(CAPACITY, Duration::from_millis(100), TTL).unwrap();
        let mut model = Model {
            entries: HashMap::new(),
            now: Duration::ZERO,
        };

        for op in ops {
            match op {
                CacheOp::Add { key, value } => {
                    let len_before = cache.len();

                    cache.add(key.clone(), value.clone());

                    // An insertion is immediately observable...
                    prop_assert_eq!(cache.get(&key), Some(value.clone()));

                    // ...and grows the cache by at most one entry (replacements and
                    // evictions keep the count level).
                    prop_assert!(cache.len() <= len_before + 1);

                    let _ = model.entries.insert(key, (value, model.now));
                }
                CacheOp::Get { key } => {
                    let result = cache.get(&key);
                    match model.entries.get(&key) {
                        Some((value, written_at)) => {
                            if model.now > *written_at + TTL {
                                // Expired entries are reported as misses, reaped or not.
                                prop_assert_eq!(result, None);
                            } else if let Some(found) = result {
                                // A hit always delivers the latest written value.
                                prop_assert_eq!(&found, value);
                            }
                        }
                        None => prop_assert_eq!(result, None),
                    }
                }
                CacheOp::Remove { key } => {
                    cache.remove(&key);
                    let _ = model.entries.remove(&key);
                    prop_assert_eq!(cache.get(&key), None);
                }
                CacheOp::Advance { millis } => {
                    MockClock::advance(Duration::from_millis(millis));
                    model.now += Duration::from_millis(millis);
                    cache.reap(Instant::now());
                }
            }

            // The cache never holds more entries than its capacity permits.
            prop_assert!(cache.len() <= CAPACITY);
        }
    }

    #[test]
    fn expired_entries_never_survive_a_reap(
        keys in prop::collection::vec(key_strategy(), 1..20),
        advance_millis in 10_001u64..60_000
    ) {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        MockClock::set_time(Duration::ZERO);

        let cache = DecayingLruCache::new(CAPACITY, Duration::from_millis(100), TTL).unwrap();
        for key in &keys {
            cache.add(key.clone(), "value".to_owned());
        }

        MockClock::advance(Duration::from_millis(advance_millis));
        cache.reap(Instant::now());

        // Everything was inserted before the jump past the TTL, so the reap pass must
        // leave the cache (and its work log) empty.
        prop_assert_eq!(cache.len(), 0);
        prop_assert_eq!(cache.log_len(), 0);
    }
}
