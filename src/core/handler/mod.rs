// src/core/handler/mod.rs

//! The bus command handler: single consumer of the IPC channel. Decodes
//! control messages, dispatches them to supervisor operations, and
//! publishes acks and status snapshots.

use crate::core::errors::StopCode;
use crate::core::proc::{DiagResponse, Supervisor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The wire format of every control message on the bus. Fields the
/// supervisor does not set are omitted from its own publishes.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LauncherCmd {
    pub scope: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LauncherCmd {
    pub fn command_id(&self) -> &str {
        self.command_id.as_deref().unwrap_or("")
    }

    /// The cluster id argument, tolerating both integer and float JSON
    /// encodings.
    pub fn arg_id(&self) -> Option<u64> {
        let id = self.args.as_ref()?.get("id")?;
        id.as_u64().or_else(|| id.as_f64().map(|f| f as u64))
    }
}

/// One entry of a `statuses` snapshot, keyed by decimal cluster id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterStatus {
    pub active: bool,
    pub name: String,
    pub started_at: i64,
    pub shard_list: Vec<u64>,
}

/// Consumes the bus until it closes. Messages outside the `launcher`
/// scope belong to other tenants of the channel and are ignored.
pub async fn run(sup: Arc<Supervisor>) {
    while let Some(msg) = sup.bus.read().await {
        let cmd: LauncherCmd = match serde_json::from_slice(&msg) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(
                    "Could not decode bus message: {e}: {}",
                    String::from_utf8_lossy(&msg)
                );
                continue;
            }
        };

        if cmd.scope != "launcher" {
            continue;
        }

        dispatch(&sup, cmd).await;
    }
    info!("Bus closed; command handler exiting");
}

async fn dispatch(sup: &Arc<Supervisor>, cmd: LauncherCmd) {
    match cmd.action.as_str() {
        "diag" => {
            let Some(Value::String(raw)) = &cmd.output else {
                error!("Diag message carries no string output: {:?}", cmd.output);
                return;
            };
            match serde_json::from_str::<DiagResponse>(raw) {
                Ok(resp) => sup.push_diag(resp),
                Err(e) => error!("Could not decode diag payload: {e}: {raw}"),
            }
        }

        "action_logs" => {
            if let Some(data) = cmd.data {
                sup.action_log(data).await;
            }
        }

        "restartproc" => {
            info!("Restarting the supervisor process: {}", cmd.command_id());
            sup.acknowledge(cmd.command_id()).await;
            sup.kill_all().await;
            std::process::exit(1);
        }

        "launch_next" => {
            let cluster_id = cmd.arg_id();
            info!("Got launch_next for cluster {cluster_id:?}");

            if let Some(id) = cluster_id {
                match sup.instance_by_id(id) {
                    Some(instance) => instance.set_launched_fully(true),
                    None => {
                        error!("No instance with cluster id {id}");
                        if !sup.roll_restarting() {
                            return;
                        }
                    }
                }
            }

            if sup.roll_restarting() {
                if let Some(id) = cluster_id {
                    sup.signal_roll_restart(id);
                }
                return;
            }

            sup.start_next().await;
        }

        "rollingrestart" => {
            sup.acknowledge(cmd.command_id()).await;
            let sup = Arc::clone(sup);
            tokio::spawn(async move { sup.rolling_restart().await });
        }

        "statuses" => {
            let mut payload: HashMap<String, ClusterStatus> = HashMap::new();
            for instance in sup.instances() {
                let name = sup
                    .cluster_for(&instance)
                    .map(|c| c.name)
                    .unwrap_or_default();
                payload.insert(
                    instance.cluster_id().to_string(),
                    ClusterStatus {
                        active: instance.active(),
                        name,
                        started_at: instance.started_at().map(|t| t.timestamp()).unwrap_or(0),
                        shard_list: instance.shards(),
                    },
                );
            }
            match serde_json::to_value(payload) {
                Ok(payload) => {
                    if let Err(e) = sup.send_message(cmd.command_id(), payload, "bot", "").await {
                        error!("Could not publish statuses: {e}");
                    }
                }
                Err(e) => error!("Could not encode statuses: {e}"),
            }
        }

        "shutdown" => {
            warn!("Got request to shutdown (hopefully you have systemctl)");
            sup.acknowledge(cmd.command_id()).await;
            sup.kill_all().await;
            // Route through the normal signal path so main exits cleanly.
            unsafe {
                libc::kill(std::process::id() as i32, libc::SIGINT);
            }
        }

        "stop" => {
            let Some(id) = cmd.arg_id() else {
                error!("stop command carries no cluster id: {:?}", cmd.args);
                return;
            };
            info!("Got stop command for cluster {id}");
            let Some(instance) = sup.instance_by_id(id) else {
                error!("No instance with cluster id {id}");
                return;
            };
            if !instance.active() {
                error!("Cluster {id} is not active");
                return;
            }
            sup.acknowledge(cmd.command_id()).await;
            let code = sup.stop(&instance).await;
            if code != StopCode::Normal {
                error!("Could not stop cluster {id}: {code:?}");
            }
        }

        "start" => {
            let Some(id) = cmd.arg_id() else {
                error!("start command carries no cluster id: {:?}", cmd.args);
                return;
            };
            info!("Got start command for cluster {id}");
            let Some(instance) = sup.instance_by_id(id) else {
                error!("No instance with cluster id {id}");
                return;
            };
            sup.acknowledge(cmd.command_id()).await;
            if let Err(e) = sup.start(&instance).await {
                error!("Could not start cluster {id}: {e}");
                sup.action_log(json!({
                    "event": "cluster_restart_failed",
                    "via": "start",
                }))
                .await;
                let _ = sup
                    .send_message(
                        cmd.command_id(),
                        json!("could not start instance"),
                        "bot",
                        "",
                    )
                    .await;
            }
        }

        "restart" => {
            let Some(id) = cmd.arg_id() else {
                error!("restart command carries no cluster id: {:?}", cmd.args);
                return;
            };
            info!("Got restart command for cluster {id}");
            let Some(instance) = sup.instance_by_id(id) else {
                error!("No instance with cluster id {id}");
                return;
            };
            if !instance.active() {
                error!("Cluster {id} is not active");
                return;
            }
            sup.acknowledge(cmd.command_id()).await;
            instance.acquire_and_lock("Restart").await;
            if sup.stop(&instance).await == StopCode::Normal {
                if let Err(e) = sup.start(&instance).await {
                    error!("Could not start cluster {id}: {e}");
                    sup.action_log(json!({
                        "event": "cluster_restart_failed",
                        "via": "restart",
                    }))
                    .await;
                }
            } else {
                error!("Could not stop cluster {id}");
            }
            instance.unlock();
        }

        "reshard" => {
            sup.acknowledge(cmd.command_id()).await;
            sup.action_log(json!({
                "event": "reshard_begin",
                "subsystem": "redis",
            }))
            .await;
            match sup.reshard().await {
                Ok(()) => {
                    sup.action_log(json!({
                        "event": "reshard_success",
                        "subsystem": "redis",
                    }))
                    .await;
                }
                Err(e) => {
                    sup.action_log(json!({
                        "event": "reshard_failed",
                        "error": e.to_string(),
                        "subsystem": "redis",
                    }))
                    .await;
                }
            }
        }

        "num_processes" => {
            let payload = json!({
                "clusters": sup.instances().len(),
                "shards": sup.shard_count(),
            });
            if let Err(e) = sup.send_message(cmd.command_id(), payload, "bot", "").await {
                error!("Could not publish num_processes: {e}");
            }
        }

        action => {
            error!("Unknown action: {action}: {:?}", cmd.args);
        }
    }
}
