use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use ember_core::cache::{CacheKey, CachedResource, ResourceCache};
use ember_core::executor::{DeviceExecutor, ExecutorCache, ExecutorConfig};

#[derive(Clone)]
struct TestKey {
    bucket: u32,
    tag: &'static str,
}

impl CacheKey for TestKey {
    type Primary = u32;

    fn primary(&self) -> u32 {
        self.bucket
    }

    fn matches(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

#[derive(Debug)]
struct TestResource {
    id: usize,
    handles: Vec<u64>,
}

impl CachedResource for TestResource {
    fn owns_live_handle(&self, handle: u64) -> bool {
        self.handles.contains(&handle)
    }
}

fn key(bucket: u32, tag: &'static str) -> TestKey {
    TestKey { bucket, tag }
}

#[test]
fn racing_same_key_constructs_once() {
    let cache = Arc::new(ResourceCache::<TestKey, TestResource>::new());
    let constructions = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let mut threads = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let constructions = constructions.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            barrier.wait();
            cache
                .get_or_create(&key(1, "a"), || {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    Ok(TestResource {
                        id: 1,
                        handles: vec![],
                    })
                })
                .unwrap()
        }));
    }

    let results: Vec<Arc<TestResource>> =
        threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(constructions.load(Ordering::SeqCst), 1);
    for r in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], r));
    }
    assert_eq!(cache.len(), 1);
}

#[test]
fn distinct_keys_do_not_block_each_other() {
    let cache = Arc::new(ResourceCache::<TestKey, TestResource>::new());
    let slow_started = Arc::new(AtomicBool::new(false));
    let slow_done = Arc::new(AtomicBool::new(false));

    let slow = {
        let cache = cache.clone();
        let started = slow_started.clone();
        let done = slow_done.clone();
        thread::spawn(move || {
            cache
                .get_or_create(&key(1, "slow"), || {
                    started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(200));
                    done.store(true, Ordering::SeqCst);
                    Ok(TestResource {
                        id: 1,
                        handles: vec![],
                    })
                })
                .unwrap();
        })
    };

    while !slow_started.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    // A different primary key constructs while the slow factory is running.
    let fast = cache
        .get_or_create(&key(2, "fast"), || {
            Ok(TestResource {
                id: 2,
                handles: vec![],
            })
        })
        .unwrap();
    assert_eq!(fast.id, 2);
    assert!(
        !slow_done.load(Ordering::SeqCst),
        "fast-key construction waited on the slow key"
    );

    slow.join().unwrap();
    assert_eq!(cache.len(), 2);
}

#[test]
fn same_primary_different_tag_gets_distinct_resources() {
    let cache = ResourceCache::<TestKey, TestResource>::new();
    let a = cache
        .get_or_create(&key(1, "a"), || {
            Ok(TestResource {
                id: 10,
                handles: vec![],
            })
        })
        .unwrap();
    let b = cache
        .get_or_create(&key(1, "b"), || {
            Ok(TestResource {
                id: 11,
                handles: vec![],
            })
        })
        .unwrap();
    assert_eq!(a.id, 10);
    assert_eq!(b.id, 11);
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 2);
}

#[test]
fn failed_construction_is_retryable() {
    let cache = ResourceCache::<TestKey, TestResource>::new();
    let err = cache.get_or_create(&key(3, "a"), || {
        Err(ember_core::EmberError::ConstructionFailed(
            "flaky".to_string(),
        ))
    });
    assert!(err.is_err());
    assert_eq!(cache.len(), 0);

    // The key is not poisoned: the next attempt runs the factory again.
    let ok = cache
        .get_or_create(&key(3, "a"), || {
            Ok(TestResource {
                id: 3,
                handles: vec![],
            })
        })
        .unwrap();
    assert_eq!(ok.id, 3);
    assert_eq!(cache.len(), 1);
}

#[test]
fn get_never_constructs() {
    let cache = ResourceCache::<TestKey, TestResource>::new();
    let err = cache.get(&key(9, "missing")).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn find_by_live_handle_scans_all_entries() {
    let cache = ResourceCache::<TestKey, TestResource>::new();
    for bucket in 0..4 {
        cache
            .get_or_create(&key(bucket, "x"), || {
                Ok(TestResource {
                    id: bucket as usize,
                    handles: vec![100 + bucket as u64],
                })
            })
            .unwrap();
    }
    let found = cache.find_by_live_handle(102).unwrap();
    assert_eq!(found.id, 2);
    assert!(cache.find_by_live_handle(999).unwrap_err().is_not_found());
}

#[test]
fn clear_drops_everything() {
    let cache = ResourceCache::<TestKey, TestResource>::new();
    cache
        .get_or_create(&key(1, "a"), || {
            Ok(TestResource {
                id: 1,
                handles: vec![],
            })
        })
        .unwrap();
    assert!(!cache.is_empty());
    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.get(&key(1, "a")).unwrap_err().is_not_found());
}

#[test]
fn executor_cache_builds_once_per_config() {
    let cache = ExecutorCache::new();
    let config = ExecutorConfig {
        ordinal: 0,
        ..Default::default()
    };
    let first = cache
        .get_or_create(&config, || Ok(DeviceExecutor::new(&config)))
        .unwrap();
    let second = cache
        .get_or_create(&config, || Ok(DeviceExecutor::new(&config)))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);
}

#[test]
fn executor_cache_resolves_by_stream() {
    let cache = ExecutorCache::new();
    let config = ExecutorConfig {
        ordinal: 1,
        ..Default::default()
    };
    let executor = cache
        .get_or_create(&config, || Ok(DeviceExecutor::new(&config)))
        .unwrap();
    let stream = executor.allocate_stream();

    let by_stream = ExecutorConfig {
        stream_to_find: Some(stream),
        ..Default::default()
    };
    // Reverse lookup ignores the configuration fields entirely.
    let found = cache.get(&by_stream).unwrap();
    assert!(Arc::ptr_eq(&executor, &found));

    // And never constructs, even through get_or_create.
    let missing = ExecutorConfig {
        stream_to_find: Some(u64::MAX),
        ..Default::default()
    };
    let err = cache
        .get_or_create(&missing, || Ok(DeviceExecutor::new(&missing)))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn destroy_all_executors_empties_the_cache() {
    let cache = ExecutorCache::new();
    let config = ExecutorConfig {
        ordinal: 2,
        ..Default::default()
    };
    cache
        .get_or_create(&config, || Ok(DeviceExecutor::new(&config)))
        .unwrap();
    assert_eq!(cache.len(), 1);
    cache.destroy_all_executors();
    assert!(cache.is_empty());
}
