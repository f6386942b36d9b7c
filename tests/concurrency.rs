use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use petek::{ArrayMap, Config, MapError, SegMap};

#[test]
#[cfg_attr(miri, ignore)]
fn test_single_winner_per_key() {
    let map = Arc::new(SegMap::<u64, u64>::new(64).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = Vec::new();
    for t in 0..8u64 {
        let m = Arc::clone(&map);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            let outcome = m.insert(42, t).unwrap();
            (
                outcome.is_inserted(),
                outcome.entry().handle,
                *outcome.entry().value,
            )
        }));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly one thread inserted; everyone else collided on its entry.
    assert_eq!(results.iter().filter(|(won, _, _)| *won).count(), 1);
    let stored = *map.get(&42).unwrap();
    for (_, handle, value) in &results {
        assert_eq!(*value, stored);
        assert_eq!(*map.get_at(*handle).unwrap().value, stored);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_growth_preserves_all_entries() {
    // Deliberately undersized: 2000 inserts against an estimate of 16
    // force repeated segment allocation under full contention.
    let config = Config {
        growth_factor: 1.0,
        ..Config::default()
    };
    let map = Arc::new(SegMap::<u64, u64>::with_config(16, config).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = Vec::new();
    for t in 0..8u64 {
        let m = Arc::clone(&map);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..250 {
                let key = t * 250 + i;
                assert!(m.insert(key, key * 2).unwrap().is_inserted());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(map.num_segments() > 1);
    for key in 0..2000 {
        assert_eq!(map.get(&key), Some(&(key * 2)));
    }
    assert_eq!(map.len(), 2000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_erase_is_exclusive() {
    let map = Arc::new(SegMap::<u64, u64>::new(2048).unwrap());
    for i in 0..1000 {
        map.insert(i, i).unwrap();
    }

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let m = Arc::clone(&map);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            let mut erased = 0u64;
            for i in 0..1000 {
                if m.remove(&i) {
                    erased += 1;
                }
            }
            erased
        }));
    }
    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // Each key was erased by exactly one of the racing threads.
    assert_eq!(total, 1000);
    assert!(map.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_reads_see_only_published_values() {
    let map = Arc::new(SegMap::<u64, (u64, u64)>::new(4096).unwrap());
    let mut handles = Vec::new();

    // Writers publish pairs whose halves must never be observed torn.
    for t in 0..4u64 {
        let m = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..1000 {
                let key = t * 1000 + i;
                m.insert(key, (key, !key)).unwrap();
            }
        }));
    }
    for _ in 0..4 {
        let m = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for round in 0..4000u64 {
                let key = round % 4000;
                if let Some(&(a, b)) = m.get(&key) {
                    assert_eq!(a, key);
                    assert_eq!(b, !key);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for key in 0..4000 {
        assert_eq!(map.get(&key), Some(&(key, !key)));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_saturated_array_map_closes_cleanly() {
    let config = Config {
        max_load_factor: 0.5,
        ..Config::default()
    };
    let map = Arc::new(ArrayMap::<u64, u64>::with_config(64, &config).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = Vec::new();
    for t in 0..8u64 {
        let m = Arc::clone(&map);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            let mut inserted = Vec::new();
            for i in 0..64 {
                let key = t * 64 + i;
                match m.insert(key, key) {
                    Ok(outcome) => {
                        if outcome.is_inserted() {
                            inserted.push(key);
                        }
                    }
                    Err(MapError::MapFull) => break,
                    Err(other) => panic!("unexpected error: {}", other),
                }
            }
            inserted
        }));
    }
    let inserted: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    // No key reported inserted twice, every reported key is findable, and
    // the exact count matches the reconciled len().
    let unique: HashSet<_> = inserted.iter().copied().collect();
    assert_eq!(unique.len(), inserted.len());
    for key in &inserted {
        assert_eq!(map.get(key), Some(key));
    }
    assert_eq!(map.len(), inserted.len());

    // Once full is reported, the map stays closed for good.
    assert_eq!(map.insert(9999, 9999).unwrap_err(), MapError::MapFull);
    assert_eq!(map.insert(9998, 9998).unwrap_err(), MapError::MapFull);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_duplicate_inserts_during_growth() {
    // Threads all race the same small key set while the map is forced to
    // grow; every key must end up stored exactly once.
    let config = Config {
        max_load_factor: 0.5,
        growth_factor: 1.0,
        ..Config::default()
    };
    let map = Arc::new(SegMap::<u64, u64>::with_config(4, config).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let m = Arc::clone(&map);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            let mut wins = 0u64;
            for key in 0..100u64 {
                if m.insert(key, key).unwrap().is_inserted() {
                    wins += 1;
                }
            }
            wins
        }));
    }
    let total_wins: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total_wins, 100);
    assert_eq!(map.len(), 100);
    for key in 0..100 {
        assert_eq!(map.get(&key), Some(&key));
    }
}
