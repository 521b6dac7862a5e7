// src/core/proc/launcher.rs

//! The pluggable launcher seam: how a cluster's child process is actually
//! forked, and what it is told about a reshard.

use crate::core::errors::MewldError;
use crate::core::planner::ClusterMap;
use crate::core::proc::{Instance, Supervisor};
use crate::core::utils::shard_list_repr;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Hook for forking cluster children. The default implementation speaks
/// the positional command-line protocol below; embedders can substitute
/// their own.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(
        &self,
        sup: &Supervisor,
        instance: &Instance,
        cluster: &ClusterMap,
    ) -> Result<(), MewldError>;

    async fn on_reshard(
        &self,
        sup: &Supervisor,
        instance: &Instance,
        cluster: &ClusterMap,
        old_shards: &[u64],
        new_shards: &[u64],
    ) -> Result<(), MewldError>;
}

/// Launches `interp <dir>/<module>` (or `module` directly as an
/// executable) with the positional arguments
/// `<shard_list> <total_shards> <cluster_id> <cluster_name> "0" <dir>`.
/// Stdout/stderr are inherited and `MEWLD_CHANNEL` carries the bus topic
/// to the child.
pub struct DefaultLauncher;

#[async_trait]
impl Launcher for DefaultLauncher {
    async fn start(
        &self,
        sup: &Supervisor,
        instance: &Instance,
        cluster: &ClusterMap,
    ) -> Result<(), MewldError> {
        let mut cmd = match sup.config.interp.as_deref().filter(|i| !i.is_empty()) {
            Some(interp) => {
                let mut cmd = Command::new(interp);
                cmd.arg(sup.dir.join(&sup.config.module));
                cmd
            }
            // With no interpreter, the module is the executable path.
            None => Command::new(&sup.config.module),
        };

        // Log mode, deprecated; the child ignores it.
        let logging_code = "0";

        cmd.arg(shard_list_repr(&instance.shards()))
            .arg(sup.shard_count().to_string())
            .arg(instance.cluster_id().to_string())
            .arg(&cluster.name)
            .arg(logging_code)
            .arg(&sup.dir)
            .current_dir(&sup.dir)
            .env("MEWLD_CHANNEL", &sup.config.redis_channel)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| MewldError::ProcessSpawn(e.to_string()))?;
        instance.attach_child(child).await;
        Ok(())
    }

    async fn on_reshard(
        &self,
        _sup: &Supervisor,
        _instance: &Instance,
        cluster: &ClusterMap,
        old_shards: &[u64],
        new_shards: &[u64],
    ) -> Result<(), MewldError> {
        info!(
            "Resharding cluster {} ({}) from {} to {}",
            cluster.name,
            cluster.id,
            shard_list_repr(old_shards),
            shard_list_repr(new_shards)
        );
        Ok(())
    }
}
