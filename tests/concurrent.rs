use chash_map::HashMap;
use crossbeam_utils::thread;
use rand::prelude::*;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

const NUM_THREADS: usize = 8;
const PER_THREAD: usize = 2_000;

#[test]
fn disjoint_inserts() {
    let map = Arc::new(HashMap::<usize, usize>::new());
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let guard = map.guard();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    assert_eq!(map.insert(key, key, &guard), None);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), NUM_THREADS * PER_THREAD);
    let guard = map.guard();
    for key in 0..NUM_THREADS * PER_THREAD {
        assert_eq!(map.get(&key, &guard), Some(&key));
    }
}

#[test]
fn same_keys_from_every_thread() {
    let map = HashMap::<usize, usize>::new();
    thread::scope(|s| {
        for t in 0..NUM_THREADS {
            let map = &map;
            s.spawn(move |_| {
                let guard = map.guard();
                for key in 0..PER_THREAD {
                    map.insert(key, t, &guard);
                }
            });
        }
    })
    .unwrap();

    assert_eq!(map.len(), PER_THREAD);
    let guard = map.guard();
    for key in 0..PER_THREAD {
        let v = *map.get(&key, &guard).unwrap();
        assert!(v < NUM_THREADS);
    }
}

#[test]
fn try_insert_has_one_winner() {
    let map = HashMap::<usize, usize>::new();
    let winners: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let map = &map;
                s.spawn(move |_| {
                    let guard = map.guard();
                    (0..PER_THREAD)
                        .filter(|&key| map.try_insert(key, t, &guard).is_ok())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(winners.iter().sum::<usize>(), PER_THREAD);
    assert_eq!(map.len(), PER_THREAD);
}

#[test]
fn readers_see_stable_keys_during_churn() {
    let map = HashMap::<usize, usize>::new();
    {
        let guard = map.guard();
        for key in 0..1_000 {
            map.insert(key, key, &guard);
        }
    }

    thread::scope(|s| {
        // writers churn a key range that readers never look at
        for t in 0..NUM_THREADS / 2 {
            let map = &map;
            s.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for _ in 0..PER_THREAD * 4 {
                    let key = 1_000 + rng.gen_range(0..5_000);
                    let guard = map.guard();
                    if rng.gen_bool(0.5) {
                        map.insert(key, key, &guard);
                    } else {
                        map.remove(&key, &guard);
                    }
                }
            });
        }
        for _ in 0..NUM_THREADS / 2 {
            let map = &map;
            s.spawn(move |_| {
                let mut rng = thread_rng();
                for _ in 0..PER_THREAD * 4 {
                    let key = rng.gen_range(0..1_000);
                    let guard = map.guard();
                    assert_eq!(map.get(&key, &guard), Some(&key));
                }
            });
        }
    })
    .unwrap();
}

#[test]
fn concurrent_removes_take_each_key_once() {
    let map = HashMap::<usize, usize>::new();
    {
        let guard = map.guard();
        for key in 0..PER_THREAD * 4 {
            map.insert(key, key, &guard);
        }
    }

    let removed: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let map = &map;
                s.spawn(move |_| {
                    let mut keys: Vec<usize> = (0..PER_THREAD * 4).collect();
                    keys.shuffle(&mut thread_rng());
                    let guard = map.guard();
                    keys.iter()
                        .filter(|&key| map.remove(key, &guard).is_some())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
    .unwrap();

    assert_eq!(removed, PER_THREAD * 4);
    assert!(map.is_empty());
}

#[test]
fn compute_if_present_is_atomic() {
    let map = HashMap::<usize, usize>::new();
    {
        let guard = map.guard();
        for key in 0..64 {
            map.insert(key, 0, &guard);
        }
    }

    thread::scope(|s| {
        for _ in 0..NUM_THREADS {
            let map = &map;
            s.spawn(move |_| {
                for _ in 0..100 {
                    let guard = map.guard();
                    for key in 0..64 {
                        map.compute_if_present(&key, |_, v| Some(v + 1), &guard);
                    }
                }
            });
        }
    })
    .unwrap();

    let guard = map.guard();
    for key in 0..64 {
        assert_eq!(map.get(&key, &guard), Some(&(NUM_THREADS * 100)));
    }
}

#[test]
fn clear_races_with_inserts() {
    let map = HashMap::<usize, usize>::new();
    thread::scope(|s| {
        for t in 0..NUM_THREADS / 2 {
            let map = &map;
            s.spawn(move |_| {
                let guard = map.guard();
                for i in 0..PER_THREAD {
                    map.insert(t * PER_THREAD + i, i, &guard);
                }
            });
        }
        let map = &map;
        s.spawn(move |_| {
            for _ in 0..20 {
                let guard = map.guard();
                map.clear(&guard);
            }
        });
    })
    .unwrap();

    let guard = map.guard();
    map.clear(&guard);
    assert!(map.is_empty());
    for key in 0..NUM_THREADS / 2 * PER_THREAD {
        assert_eq!(map.get(&key, &guard), None);
    }
}

#[test]
fn readers_follow_keys_through_resizes() {
    let map = HashMap::<usize, usize>::new();
    {
        let guard = map.guard();
        for key in 0..8 {
            map.insert(key, key, &guard);
        }
        assert_eq!(map.capacity(&guard), 16);
    }
    let writers_done = AtomicBool::new(false);

    thread::scope(|s| {
        let writers: Vec<_> = (0..NUM_THREADS / 2)
            .map(|t| {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..PER_THREAD * 10 {
                        let key = 8 + t * PER_THREAD * 10 + i;
                        let guard = map.guard();
                        map.insert(key, key, &guard);
                    }
                })
            })
            .collect();
        for _ in 0..NUM_THREADS / 2 {
            let (map, writers_done) = (&map, &writers_done);
            s.spawn(move |_| loop {
                let done = writers_done.load(Ordering::SeqCst);
                let guard = map.guard();
                for key in 0..8 {
                    assert_eq!(map.get(&key, &guard), Some(&key));
                }
                if done {
                    break;
                }
            });
        }
        for writer in writers {
            writer.join().unwrap();
        }
        writers_done.store(true, Ordering::SeqCst);
    })
    .unwrap();

    let guard = map.guard();
    let inserted = NUM_THREADS / 2 * PER_THREAD * 10;
    assert_eq!(map.len(), 8 + inserted);
    // many doublings happened while the readers were running
    assert!(map.capacity(&guard) >= 16 << 8);
    for key in 0..8 + inserted {
        assert_eq!(map.get(&key, &guard), Some(&key));
    }
}

/// A key whose hash is the same for every id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SameBin(u32);

impl Hash for SameBin {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(42);
    }
}

#[derive(Default)]
struct LastWord(u64);

impl Hasher for LastWord {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u64::from(b);
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

#[test]
fn tree_bin_readers_during_rebalancing() {
    const STABLE: u32 = 16;
    let map: HashMap<SameBin, u32, BuildHasherDefault<LastWord>> =
        HashMap::with_capacity_and_hasher(64, Default::default());
    {
        let guard = map.guard();
        for id in 0..STABLE {
            map.insert(SameBin(id), id, &guard);
        }
    }
    let writers_done = AtomicBool::new(false);

    thread::scope(|s| {
        let writers: Vec<_> = (0..NUM_THREADS / 2)
            .map(|t| {
                let map = &map;
                s.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for _ in 0..PER_THREAD * 2 {
                        let id = STABLE + rng.gen_range(0..64);
                        let guard = map.guard();
                        if rng.gen_bool(0.5) {
                            map.insert(SameBin(id), id, &guard);
                        } else {
                            map.remove(&SameBin(id), &guard);
                        }
                    }
                })
            })
            .collect();
        for _ in 0..NUM_THREADS / 2 {
            let (map, writers_done) = (&map, &writers_done);
            s.spawn(move |_| loop {
                let done = writers_done.load(Ordering::SeqCst);
                let guard = map.guard();
                for id in 0..STABLE {
                    assert_eq!(map.get(&SameBin(id), &guard), Some(&id));
                }
                if let Some(v) = map.get(&SameBin(STABLE), &guard) {
                    assert_eq!(*v, STABLE);
                }
                if done {
                    break;
                }
            });
        }
        for writer in writers {
            writer.join().unwrap();
        }
        writers_done.store(true, Ordering::SeqCst);
    })
    .unwrap();

    let guard = map.guard();
    assert!(map.len() >= STABLE as usize);
    for id in 0..STABLE {
        assert_eq!(map.get(&SameBin(id), &guard), Some(&id));
    }
}
