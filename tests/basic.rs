use chash_map::{ConfigError, HashMap, MapConfig, TryInsertError};

#[test]
fn new_map_is_empty() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get(&42, &guard), None);
    assert!(!map.contains_key(&42, &guard));
    assert_eq!(map.remove(&42, &guard), None);
}

#[test]
fn insert_then_get() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.insert(42, 0, &guard), None);
    assert_eq!(map.get(&42, &guard), Some(&0));
    assert!(map.contains_key(&42, &guard));
    assert_eq!(map.len(), 1);
}

#[test]
fn insert_replaces_and_returns_old() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 0, &guard);
    let old = map.insert(42, 1, &guard);
    assert_eq!(old, Some(&0));
    assert_eq!(map.get(&42, &guard), Some(&1));
    assert_eq!(map.len(), 1);
}

#[test]
fn try_insert_keeps_existing() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.try_insert(42, 0, &guard), Ok(&0));
    assert_eq!(
        map.try_insert(42, 1, &guard),
        Err(TryInsertError {
            current: &0,
            not_inserted: 1
        })
    );
    assert_eq!(map.get(&42, &guard), Some(&0));
}

#[test]
fn remove_returns_value() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 7, &guard);
    assert_eq!(map.remove(&42, &guard), Some(&7));
    assert_eq!(map.get(&42, &guard), None);
    assert_eq!(map.remove(&42, &guard), None);
    assert!(map.is_empty());
}

#[test]
fn remove_entry_returns_stored_key() {
    let map = HashMap::<String, u32>::new();
    let guard = map.guard();
    map.insert("pear".to_string(), 3, &guard);
    let (k, v) = map.remove_entry("pear", &guard).unwrap();
    assert_eq!(k, "pear");
    assert_eq!(*v, 3);
}

#[test]
fn lookups_by_borrowed_key() {
    let map = HashMap::<String, u32>::new();
    let guard = map.guard();
    map.insert("apple".to_string(), 1, &guard);
    assert_eq!(map.get("apple", &guard), Some(&1));
    assert_eq!(
        map.get_key_value("apple", &guard),
        Some((&"apple".to_string(), &1))
    );
    assert!(map.contains_key("apple", &guard));
    assert!(!map.contains_key("orange", &guard));
}

#[test]
fn references_outlive_removal() {
    let map = HashMap::<usize, String>::new();
    let guard = map.guard();
    map.insert(1, "one".to_string(), &guard);
    let v = map.get(&1, &guard).unwrap();
    map.remove(&1, &guard);
    map.insert(1, "uno".to_string(), &guard);
    assert_eq!(v, "one");
    assert_eq!(map.get(&1, &guard).map(String::as_str), Some("uno"));
}

#[test]
fn compute_if_present_updates_and_removes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.compute_if_present(&1, |_, v| Some(v + 1), &guard), None);

    map.insert(1, 10, &guard);
    assert_eq!(
        map.compute_if_present(&1, |_, v| Some(v + 1), &guard),
        Some(&11)
    );
    assert_eq!(map.get(&1, &guard), Some(&11));

    assert_eq!(map.compute_if_present(&1, |_, _| None, &guard), None);
    assert_eq!(map.get(&1, &guard), None);
    assert!(map.is_empty());
}

#[test]
fn grows_past_initial_table() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..10_000 {
        assert_eq!(map.insert(i, i * 2, &guard), None);
    }
    assert_eq!(map.len(), 10_000);
    assert!(map.capacity(&guard) >= 10_000);
    assert!(map.capacity(&guard).is_power_of_two());
    for i in 0..10_000 {
        assert_eq!(map.get(&i, &guard), Some(&(i * 2)));
    }
}

#[test]
fn clear_removes_everything() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..100 {
        map.insert(i, i, &guard);
    }
    map.clear(&guard);
    assert!(map.is_empty());
    for i in 0..100 {
        assert_eq!(map.get(&i, &guard), None);
    }
    map.insert(5, 5, &guard);
    assert_eq!(map.get(&5, &guard), Some(&5));
    assert_eq!(map.len(), 1);
}

#[test]
fn reserve_grows_capacity() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.reserve(1000, &guard);
    let capacity = map.capacity(&guard);
    assert!(capacity >= 1024);
    for i in 0..700 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.capacity(&guard), capacity);
}

#[test]
fn with_config_validates() {
    let err = HashMap::<usize, usize>::with_config(MapConfig::default().with_load_factor(2.0))
        .unwrap_err();
    assert_eq!(err, ConfigError::LoadFactor(2.0));

    let map = HashMap::<usize, usize>::with_config(
        MapConfig::default()
            .with_initial_capacity(10)
            .with_load_factor(0.5),
    )
    .unwrap();
    let guard = map.guard();
    assert_eq!(map.capacity(&guard), 32);
    assert_eq!(map.config().load_factor, 0.5);
}

#[test]
fn debug_shows_size() {
    let map = HashMap::<usize, usize>::with_capacity(8);
    {
        let guard = map.guard();
        map.insert(1, 1, &guard);
    }
    let debug = format!("{:?}", map);
    assert!(debug.starts_with("HashMap { len: 1, capacity: 16"), "{}", debug);
}

#[test]
fn nested_guards() {
    let map = HashMap::<usize, usize>::new();
    let outer = map.guard();
    map.insert(1, 1, &outer);
    {
        let inner = map.guard();
        assert_eq!(map.get(&1, &inner), Some(&1));
        map.remove(&1, &inner);
    }
    assert_eq!(map.get(&1, &outer), None);
}
