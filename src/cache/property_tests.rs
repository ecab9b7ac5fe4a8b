//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the container against a plain map model and to
//! verify the trimming rules.

use proptest::prelude::*;
use std::collections::HashMap;

use crate::cache::{
    CacheContainer, CachePolicy, ContainerSettings, Priority, MIN_TRIM_OCCUPANCY,
};

fn container() -> CacheContainer<u32> {
    CacheContainer::with_runtime(ContainerSettings::default(), None)
}

// == Strategies ==
/// Keys drawn from a small alphabet so operations collide often
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-h]{1,2}".prop_map(|s| s)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: String, value: u32 },
    Add { key: String, value: u32 },
    Get { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (key_strategy(), any::<u32>()).prop_map(|(key, value)| CacheOp::Set { key, value }),
        (key_strategy(), any::<u32>()).prop_map(|(key, value)| CacheOp::Add { key, value }),
        key_strategy().prop_map(|key| CacheOp::Get { key }),
        key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // For any sequence of operations on non-expiring entries, the container
    // agrees with a plain map and the hit/miss counters match the reads.
    #[test]
    fn prop_matches_map_model(ops in prop::collection::vec(cache_op_strategy(), 1..80)) {
        let cache = container();
        let mut model: HashMap<String, u32> = HashMap::new();
        let mut expected_hits: u64 = 0;
        let mut expected_misses: u64 = 0;

        for op in ops {
            match op {
                CacheOp::Set { key, value } => {
                    cache.set(key.clone(), value, CachePolicy::new()).unwrap();
                    model.insert(key, value);
                }
                CacheOp::Add { key, value } => {
                    let existing = cache.add_or_get_existing(key.clone(), value, CachePolicy::new()).unwrap();
                    prop_assert_eq!(existing, model.get(&key).copied());
                    model.entry(key).or_insert(value);
                }
                CacheOp::Get { key } => {
                    let got = cache.get(&key);
                    prop_assert_eq!(got, model.get(&key).copied());
                    if got.is_some() {
                        expected_hits += 1;
                    } else {
                        expected_misses += 1;
                    }
                }
                CacheOp::Remove { key } => {
                    prop_assert_eq!(cache.remove(&key), model.remove(&key));
                }
            }
        }

        cache.debug_validate_invariants();
        let stats = cache.stats();
        prop_assert_eq!(stats.hits, expected_hits);
        prop_assert_eq!(stats.misses, expected_misses);
        prop_assert_eq!(stats.total_entries, model.len());
    }

    // Trimming a cache above the occupancy floor removes exactly
    // count * percent / 100 entries, oldest first.
    #[test]
    fn prop_trim_meets_goal_in_lru_order(count in (MIN_TRIM_OCCUPANCY + 1)..120usize, percent in 0u8..=100) {
        let cache = container();
        for i in 0..count {
            cache.set(format!("k{:03}", i), i as u32, CachePolicy::new()).unwrap();
        }

        let goal = count * usize::from(percent) / 100;
        prop_assert_eq!(cache.trim(percent).unwrap(), goal);
        prop_assert_eq!(cache.len(), count - goal);
        for i in 0..count {
            prop_assert_eq!(cache.contains(&format!("k{:03}", i)), i >= goal);
        }
        cache.debug_validate_invariants();
    }

    // No trim ever removes a NotRemovable entry.
    #[test]
    fn prop_trim_never_evicts_not_removable(
        pinned in prop::collection::vec(any::<bool>(), 11..80),
        percent in 1u8..=100,
    ) {
        let cache = container();
        for (i, pin) in pinned.iter().enumerate() {
            let policy = if *pin {
                CachePolicy::new().with_priority(Priority::NotRemovable)
            } else {
                CachePolicy::new()
            };
            cache.set(format!("k{}", i), i as u32, policy).unwrap();
        }

        cache.trim(percent).unwrap();
        for (i, pin) in pinned.iter().enumerate() {
            if *pin {
                let key = format!("k{}", i);
                prop_assert!(cache.contains(&key));
            }
        }
        cache.debug_validate_invariants();
    }

    // Reading a key moves it to the most recently used end.
    #[test]
    fn prop_reads_update_recency(count in 2..30usize, reads in prop::collection::vec(0..30usize, 1..20)) {
        let cache = container();
        let mut order: Vec<String> = Vec::new();
        for i in 0..count {
            let key = format!("k{}", i);
            cache.set(key.clone(), i as u32, CachePolicy::new()).unwrap();
            order.push(key);
        }

        for read in reads {
            let key = format!("k{}", read % count);
            prop_assert!(cache.get(&key).is_some());
            order.retain(|k| k != &key);
            order.push(key);
        }

        prop_assert_eq!(cache.recency_keys(), order);
    }

    // A bounded container never holds more than its limit.
    #[test]
    fn prop_max_entries_is_respected(max in 1..20usize, keys in prop::collection::vec(key_strategy(), 1..100)) {
        let settings = ContainerSettings {
            max_entries: Some(max),
            ..ContainerSettings::default()
        };
        let cache: CacheContainer<u32> = CacheContainer::with_runtime(settings, None);
        for (i, key) in keys.into_iter().enumerate() {
            cache.set(key, i as u32, CachePolicy::new()).unwrap();
            prop_assert!(cache.len() <= max);
        }
        cache.debug_validate_invariants();
    }
}
