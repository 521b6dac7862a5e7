use mewld::core::planner::plan_clusters;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_plan_six_shards_two_per_cluster() {
    let map = plan_clusters(&names(&["a", "b"]), 6, 2);

    assert_eq!(map.len(), 3);

    assert_eq!(map[0].id, 0);
    assert_eq!(map[0].name, "a");
    assert_eq!(map[0].shards, vec![0, 1]);

    assert_eq!(map[1].id, 1);
    assert_eq!(map[1].name, "b");
    assert_eq!(map[1].shards, vec![2, 3]);

    // The pool ran out; the third cluster gets a generated 10-char name.
    assert_eq!(map[2].id, 2);
    assert_eq!(map[2].name.len(), 10);
    assert_ne!(map[2].name, "a");
    assert_ne!(map[2].name, "b");
    assert_eq!(map[2].shards, vec![4, 5]);
}

#[test]
fn test_plan_single_shard() {
    let map = plan_clusters(&names(&["a", "b", "c"]), 1, 10);

    assert_eq!(map.len(), 1);
    assert_eq!(map[0].id, 0);
    assert_eq!(map[0].name, "a");
    assert_eq!(map[0].shards, vec![0]);
}

#[test]
fn test_plan_trailing_partial_cluster() {
    let map = plan_clusters(&names(&["a", "b", "c", "d", "e"]), 7, 3);

    assert_eq!(map.len(), 3);
    assert_eq!(map[0].shards, vec![0, 1, 2]);
    assert_eq!(map[1].shards, vec![3, 4, 5]);
    assert_eq!(map[2].shards, vec![6]);
}

#[test]
fn test_plan_exact_multiple_has_no_empty_cluster() {
    let map = plan_clusters(&names(&["a", "b", "c", "d", "e"]), 6, 3);

    assert_eq!(map.len(), 2);
    assert_eq!(map[0].shards, vec![0, 1, 2]);
    assert_eq!(map[1].shards, vec![3, 4, 5]);
}

#[test]
fn test_plan_is_deterministic_with_a_large_pool() {
    let pool = names(&["a", "b", "c", "d", "e", "f", "g", "h"]);
    let first = plan_clusters(&pool, 10, 2);
    let second = plan_clusters(&pool, 10, 2);

    assert_eq!(first, second);
}

#[test]
fn test_plan_covers_every_shard_exactly_once() {
    let map = plan_clusters(&names(&["a", "b"]), 53, 7);

    let mut seen: Vec<u64> = map.iter().flat_map(|c| c.shards.clone()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..53).collect::<Vec<u64>>());

    for (i, cluster) in map.iter().enumerate() {
        assert_eq!(cluster.id, i as u64);
        assert!(!cluster.name.is_empty());
        assert!(cluster.shards.len() <= 7);
    }
}
