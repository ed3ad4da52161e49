use citrinedb_repl::core::replication::script_cache::ScriptCache;

#[test]
fn test_add_and_exists() {
    let cache = ScriptCache::new(100);
    assert!(!cache.exists("aa"));
    cache.add("aa");
    assert!(cache.exists("aa"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_duplicate_add_is_idempotent() {
    let cache = ScriptCache::new(100);
    cache.add("aa");
    cache.add("aa");
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_eviction_removes_oldest() {
    let cache = ScriptCache::new(3);
    cache.add("a");
    cache.add("b");
    cache.add("c");
    cache.add("d");
    assert_eq!(cache.len(), 3);
    assert!(!cache.exists("a"));
    assert!(cache.exists("b"));
    assert!(cache.exists("c"));
    assert!(cache.exists("d"));
}

#[test]
fn test_flush_empties_both_structures() {
    let cache = ScriptCache::new(10);
    cache.add("a");
    cache.add("b");
    cache.flush();
    assert!(cache.is_empty());
    assert!(!cache.exists("a"));

    // The cache is usable again after a flush.
    cache.add("c");
    assert!(cache.exists("c"));
}
