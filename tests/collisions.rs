use chash_map::{HashMap, MapConfig};
use std::hash::{BuildHasherDefault, Hash, Hasher};

/// A key whose hash is chosen by the test.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pinned {
    hash: u64,
    id: u32,
}

impl Hash for Pinned {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Default)]
struct PassThrough(u64);

impl Hasher for PassThrough {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, _: &[u8]) {
        unreachable!("only u64 hashes are passed through");
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

type Map = HashMap<Pinned, u32, BuildHasherDefault<PassThrough>>;

fn colliding(n: u32) -> impl Iterator<Item = Pinned> {
    (0..n).map(|id| Pinned { hash: 7, id })
}

fn check_collisions(map: &Map, n: u32) {
    let guard = map.guard();
    for key in colliding(n) {
        assert_eq!(map.insert(key.clone(), key.id * 10, &guard), None);
    }
    assert_eq!(map.len(), n as usize);
    for key in colliding(n) {
        assert_eq!(map.get(&key, &guard), Some(&(key.id * 10)), "{:?}", key);
    }
    assert_eq!(map.get(&Pinned { hash: 7, id: n }, &guard), None);

    for key in colliding(n).filter(|k| k.id % 2 == 0) {
        assert_eq!(map.remove(&key, &guard), Some(&(key.id * 10)));
    }
    for key in colliding(n) {
        let expected = if key.id % 2 == 0 {
            None
        } else {
            Some(key.id * 10)
        };
        assert_eq!(map.get(&key, &guard).copied(), expected, "{:?}", key);
    }
    assert_eq!(map.len(), (n / 2) as usize);
}

#[test]
fn colliding_keys_in_small_table() {
    for n in [6, 7, 8, 9, 40] {
        check_collisions(&Map::default(), n);
    }
}

#[test]
fn colliding_keys_in_treeifiable_table() {
    for n in [6, 7, 8, 9, 40, 200] {
        check_collisions(&Map::with_capacity_and_hasher(64, Default::default()), n);
    }
}

#[test]
fn colliding_keys_with_low_thresholds() {
    let config = MapConfig::default()
        .with_initial_capacity(128)
        .with_treeify_threshold(2)
        .with_untreeify_threshold(1);
    for n in [1, 2, 3, 4, 17] {
        check_collisions(
            &Map::with_config_and_hasher(config, Default::default()).unwrap(),
            n,
        );
    }
}

#[test]
fn colliding_keys_across_resizes() {
    let map = Map::with_capacity_and_hasher(64, Default::default());
    let guard = map.guard();
    // 50 keys share a bin; the rest spread the table out and force resizes
    for id in 0..50 {
        map.insert(Pinned { hash: 3, id }, id, &guard);
    }
    for id in 0..2000 {
        map.insert(
            Pinned {
                hash: id as u64 * 31 + 1000,
                id,
            },
            id,
            &guard,
        );
    }
    assert!(map.capacity(&guard) >= 2048);
    for id in 0..50 {
        assert_eq!(map.get(&Pinned { hash: 3, id }, &guard), Some(&id));
    }
    for id in 0..50 {
        assert_eq!(map.remove(&Pinned { hash: 3, id }, &guard), Some(&id));
    }
    assert_eq!(map.len(), 2000);
}

#[test]
fn keys_differing_in_high_bits_split_on_resize() {
    let map = Map::with_capacity_and_hasher(64, Default::default());
    let guard = map.guard();
    let capacity = map.capacity(&guard) as u64;
    // same bin now, different bins after the table doubles
    for id in 0..30 {
        let hash = 5 + if id % 2 == 0 { 0 } else { capacity };
        map.insert(Pinned { hash, id }, id, &guard);
    }
    map.reserve(capacity as usize * 4, &guard);
    assert!(map.capacity(&guard) as u64 > capacity);
    for id in 0..30 {
        let hash = 5 + if id % 2 == 0 { 0 } else { capacity };
        assert_eq!(map.get(&Pinned { hash, id }, &guard), Some(&id));
    }
}
