// src/core/planner.rs

//! Pure cluster planning: partitioning a shard range into named,
//! fixed-size clusters.

use crate::core::utils::random_string;
use serde::{Deserialize, Serialize};

/// A contiguous range of shards handled by one child process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub id: u64,
    pub name: String,
    pub shards: Vec<u64>,
}

/// Partitions shards `0..shards` into clusters of at most `per_cluster`
/// entries, assigning names from `names` in order.
///
/// The pool is extended with a fresh 10-char random name whenever fewer
/// than three unused names remain, so naming never runs out even when more
/// clusters than names are needed. A trailing partial cluster is emitted
/// as its own entry. Cluster ids are assigned in emission order from 0.
///
/// Given a fixed pool that needs no extension, the output is identical on
/// repeat calls; only extended names are random.
pub fn plan_clusters(names: &[String], shards: u64, per_cluster: u64) -> Vec<ClusterMap> {
    let mut names = names.to_vec();
    let mut map: Vec<ClusterMap> = Vec::new();

    let mut shard_arr: Vec<u64> = Vec::new();
    let mut cid: i64 = -1;
    for i in 0..shards {
        if shard_arr.len() as u64 >= per_cluster {
            if cid >= names.len() as i64 - 3 {
                names.push(random_string(10));
            }
            cid += 1;
            map.push(ClusterMap {
                id: cid as u64,
                name: names[cid as usize].clone(),
                shards: std::mem::take(&mut shard_arr),
            });
        }
        shard_arr.push(i);
    }

    if !shard_arr.is_empty() {
        if cid >= names.len() as i64 - 3 {
            names.push(random_string(10));
        }
        cid += 1;
        map.push(ClusterMap {
            id: cid as u64,
            name: names[cid as usize].clone(),
            shards: shard_arr,
        });
    }

    map
}
