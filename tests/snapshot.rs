//! Snapshot semantics and multi-thread scenarios, exercised through the
//! public API.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

use crossbeam_utils::thread;
use ctrie::Ctrie;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THREADS: usize = 4;
const BATCH: usize = 10_000;

struct NoHasher;

impl Hasher for NoHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _: &[u8]) {}
}

impl BuildHasher for NoHasher {
    type Hasher = NoHasher;

    fn build_hasher(&self) -> NoHasher {
        NoHasher
    }
}

/// Colliding keys coexist, and removing one leaves the other reachable
/// through whatever shape the trie contracts into.
#[test]
fn colliding_pair() {
    let map = Ctrie::with_hasher(NoHasher);
    assert!(map.insert("first", 1).is_none());
    assert!(map.insert("second", 2).is_none());

    assert_eq!(1, *map.get("first").unwrap().value());
    assert_eq!(2, *map.get("second").unwrap().value());

    assert_eq!(1, *map.remove("first").unwrap().value());
    assert_eq!(2, *map.get("second").unwrap().value());
    assert_eq!(1, map.len());

    assert_eq!(2, *map.remove("second").unwrap().value());
    assert!(map.is_empty());
}

/// A frozen snapshot keeps all entries while half of the original is
/// concurrently removed.
#[test]
fn snapshot_survives_concurrent_removal() {
    let map = Ctrie::new();
    for i in 0..BATCH {
        map.insert(i, i);
    }

    let frozen = map.snapshot_read_only();

    thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            s.spawn(move |_| {
                let chunk = BATCH / THREADS;
                for i in 0..chunk {
                    let num = t * chunk + i;
                    if num % 2 == 0 {
                        assert!(map.remove(&num).is_some());
                    }
                }
            });
        }
    })
    .unwrap();

    // The snapshot still yields every single pair.
    let mut seen: Vec<usize> = frozen.iter().map(|e| *e.key()).collect();
    seen.sort();
    let expected: Vec<usize> = (0..BATCH).collect();
    assert_eq!(expected, seen);

    // And the original has exactly the odd half left.
    assert_eq!(BATCH / 2, map.len());
    for i in 0..BATCH {
        assert_eq!(i % 2 == 1, map.get(&i).is_some());
    }
}

/// Two threads inserting disjoint key sets sum up exactly, with every key
/// retrievable afterwards.
#[test]
fn disjoint_inserts_sum_up() {
    let map = Ctrie::new();

    thread::scope(|s| {
        for t in 0..2 {
            let map = &map;
            s.spawn(move |_| {
                for i in 0..BATCH {
                    let num = t * BATCH + i;
                    assert!(map.insert(num, num * 10).is_none());
                }
            });
        }
    })
    .unwrap();

    assert_eq!(2 * BATCH, map.len());
    for i in 0..2 * BATCH {
        assert_eq!(i * 10, *map.get(&i).unwrap().value());
    }
}

/// Snapshots of snapshots: a chain of writable forks stays pairwise
/// independent.
#[test]
fn fork_chain_is_independent() {
    let map = Ctrie::new();
    map.insert(0, "origin");

    let fork1 = map.snapshot();
    fork1.insert(1, "fork1");
    let fork2 = fork1.snapshot();
    fork2.insert(2, "fork2");

    assert!(map.get(&1).is_none());
    assert!(map.get(&2).is_none());
    assert!(fork1.get(&2).is_none());

    assert_eq!("origin", *fork2.get(&0).unwrap().value());
    assert_eq!("fork1", *fork2.get(&1).unwrap().value());
    assert_eq!("fork2", *fork2.get(&2).unwrap().value());
}

/// Repeatedly snapshotting while writers run: every snapshot is internally
/// consistent (its count matches what its own iteration yields).
#[test]
fn snapshots_under_write_load() {
    let map = Ctrie::new();
    for i in 0..1000 {
        map.insert(i, i);
    }

    thread::scope(|s| {
        let writer_map = &map;
        s.spawn(move |_| {
            for round in 0..20 {
                for i in 0..1000 {
                    if (i + round) % 2 == 0 {
                        writer_map.remove(&i);
                    } else {
                        writer_map.insert(i, i + round);
                    }
                }
            }
        });

        let reader_map = &map;
        s.spawn(move |_| {
            for _ in 0..50 {
                let frozen = reader_map.snapshot_read_only();
                let walked = frozen.iter().count();
                assert_eq!(walked, frozen.count());
                // Everything a walk yields must be found by lookup on the
                // same frozen view.
                for e in &frozen {
                    let found = frozen.get(e.key()).expect("snapshot lost its own entry");
                    assert_eq!(found.value(), e.value());
                }
            }
        });
    })
    .unwrap();
}

/// A mixed workload on per-thread disjoint key ranges replays exactly
/// against a sequential model.
#[test]
fn mixed_workload_matches_model() {
    let map = Ctrie::new();
    let models = thread::scope(|s| {
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let map = &map;
            handles.push(s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(0xc1_71e + t as u64);
                let mut model = HashMap::new();
                let base = t * BATCH;
                for _ in 0..BATCH {
                    let key = base + rng.gen_range(0, BATCH);
                    match rng.gen_range(0, 4) {
                        // 50% inserts, 25% removals, 25% lookups.
                        0 | 1 => {
                            let value = rng.gen::<u32>();
                            let expected = model.insert(key, value);
                            let found = map.insert(key, value);
                            assert_eq!(expected.as_ref(), found.as_ref().map(|e| e.value()));
                        }
                        2 => {
                            let expected = model.remove(&key);
                            let found = map.remove(&key);
                            assert_eq!(expected.as_ref(), found.as_ref().map(|e| e.value()));
                        }
                        _ => {
                            let expected = model.get(&key);
                            let found = map.get(&key);
                            assert_eq!(expected, found.as_ref().map(|e| e.value()));
                        }
                    }
                }
                (t, model)
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    let total: usize = models.iter().map(|(_, m)| m.len()).sum();
    assert_eq!(total, map.len());
    for (_, model) in models {
        for (key, value) in model {
            assert_eq!(value, *map.get(&key).unwrap().value());
        }
    }
}

/// Clearing under concurrent inserts leaves a consistent, usable map.
#[test]
fn clear_races_inserts() {
    let map = Ctrie::new();

    thread::scope(|s| {
        let inserter = &map;
        s.spawn(move |_| {
            for i in 0..BATCH {
                inserter.insert(i, i);
            }
        });
        let clearer = &map;
        s.spawn(move |_| {
            for _ in 0..10 {
                clearer.clear();
            }
        });
    })
    .unwrap();

    // Whatever survived must be internally consistent.
    let frozen = map.snapshot_read_only();
    for e in &frozen {
        assert_eq!(e.key(), e.value());
    }
}
