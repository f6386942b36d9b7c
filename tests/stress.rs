//! Mixed-operation churn against a growing map.

use std::sync::Arc;
use std::thread;

use petek::{Config, SegMap};

#[test]
#[cfg_attr(miri, ignore)]
fn test_mixed_churn_with_growth() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 2000;

    let config = Config {
        growth_factor: 1.0,
        ..Config::default()
    };
    // Undersized so the run crosses several segment allocations.
    let map = Arc::new(SegMap::<u64, u64>::with_config(256, config).unwrap());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let m = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut erased = 0u64;
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                let entry = m.insert(key, key * 3).unwrap();
                assert!(entry.is_inserted());
                let handle = entry.entry().handle;
                assert_eq!(*m.get_at(handle).unwrap().value, key * 3);

                // Tombstone every third key, touching older entries too.
                if i % 3 == 0 {
                    assert!(m.remove(&key));
                    assert!(m.get_at(handle).is_none());
                    erased += 1;
                }
                if i % 7 == 0 && i > 0 {
                    // Keys erased by this thread stay gone; survivors stay
                    // readable through growth.
                    let back = t * PER_THREAD + i - 1;
                    if (i - 1) % 3 != 0 {
                        assert_eq!(m.get(&back), Some(&(back * 3)));
                    }
                }
            }
            erased
        }));
    }
    let erased: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let expected = THREADS * PER_THREAD - erased;
    assert_eq!(map.len() as u64, expected);

    let mut live = 0u64;
    for (key, value) in map.iter() {
        assert_eq!(*value, key * 3);
        live += 1;
    }
    assert_eq!(live, expected);

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let key = t * PER_THREAD + i;
            if i % 3 == 0 {
                assert_eq!(map.get(&key), None);
            } else {
                assert_eq!(map.get(&key), Some(&(key * 3)));
            }
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_dropping_loaded_map_is_clean() {
    let map = Arc::new(SegMap::<u64, String>::new(64).unwrap());
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let m = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2000 {
                let key = t * 2000 + i;
                m.insert(key, format!("value_{}", key)).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    drop(map);
}
