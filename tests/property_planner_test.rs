use mewld::core::planner::plan_clusters;
use proptest::prelude::*;

proptest! {
    /// Every shard in [0, shards) lands in exactly one cluster, in order.
    #[test]
    fn prop_plan_partitions_the_shard_range(
        shards in 1u64..512,
        per_cluster in 1u64..64,
        pool_len in 1usize..8,
    ) {
        let pool: Vec<String> = (0..pool_len).map(|i| format!("name{i}")).collect();
        let map = plan_clusters(&pool, shards, per_cluster);

        let flattened: Vec<u64> = map.iter().flat_map(|c| c.shards.clone()).collect();
        prop_assert_eq!(flattened, (0..shards).collect::<Vec<u64>>());

        for (i, cluster) in map.iter().enumerate() {
            prop_assert_eq!(cluster.id, i as u64);
            prop_assert!(cluster.shards.len() as u64 <= per_cluster);
            prop_assert!(!cluster.shards.is_empty());
            prop_assert!(!cluster.name.is_empty());
        }
    }
}
