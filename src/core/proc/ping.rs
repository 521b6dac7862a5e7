// src/core/proc/ping.rs

//! Health probing: the diag request/response protocol over the bus, and
//! the periodic per-instance ping loop that restarts clusters which stop
//! answering.

use crate::core::errors::MewldError;
use crate::core::proc::{Instance, Supervisor};
use crate::core::utils::random_string;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tracing::{error, info};

const NONCE_LEN: usize = 10;
const KILL_PAUSE: Duration = Duration::from_secs(1);
const RESTART_PAUSE: Duration = Duration::from_secs(3);

/// Health of a single shard, as reported by its cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShardHealth {
    pub shard_id: u64,
    pub up: bool,
    pub latency: f64,
    pub guilds: u64,
    pub users: u64,
}

/// A probe published to the bus. The nonce correlates the response; it is
/// drawn from a CSPRNG so concurrent probes cannot cross-pollute.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiagRequest {
    pub id: u64,
    pub nonce: String,
    pub diag: bool,
}

/// A cluster's answer, carried as a JSON string in a `diag` bus command.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiagResponse {
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(rename = "Data")]
    pub data: Vec<ShardHealth>,
}

/// Probes one cluster and waits for the response matching our nonce.
/// Responses carrying other nonces belong to concurrent probes and are
/// skipped. Returns `Timeout` when no match arrives within
/// `ping_timeout` seconds of issue.
pub async fn scan_shards(
    sup: &Supervisor,
    instance: &Instance,
) -> Result<Vec<ShardHealth>, MewldError> {
    let nonce = random_string(NONCE_LEN);
    let req = DiagRequest {
        id: instance.cluster_id(),
        nonce: nonce.clone(),
        diag: true,
    };

    // Subscribe before publishing so the answer cannot slip past us.
    let mut diag_rx = sup.subscribe_diag();
    sup.bus.publish(&serde_json::to_vec(&req)?).await?;

    let deadline = Instant::now() + Duration::from_secs(sup.config.ping_timeout);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MewldError::Timeout);
        }
        match timeout(remaining, diag_rx.recv()).await {
            Err(_) => return Err(MewldError::Timeout),
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => return Err(MewldError::Timeout),
            Ok(Ok(resp)) => {
                if resp.nonce != nonce {
                    continue;
                }
                instance.touch_last_checked();
                return Ok(resp.data);
            }
        }
    }
}

/// Periodic health sweep for one spawn generation of an instance.
///
/// The loop retires itself when its session token goes stale, when the
/// instance stops running, or when a matching ping-stop signal arrives.
/// A probe timeout restarts the cluster unless some other critical
/// section currently holds its lock.
pub async fn ping_loop(sup: Arc<Supervisor>, instance: Arc<Instance>, session_id: String) {
    let mut ticker = interval(Duration::from_secs(sup.config.ping_interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the child gets a
    // full interval to come up before its first probe.
    ticker.tick().await;

    let mut stop_rx = sup.subscribe_ping_stop();
    let currently_killing = std::cell::Cell::new(false);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = instance.session_id();
                if current.is_empty() || current != session_id {
                    return;
                }
                if !instance.active() || !instance.running().await {
                    sup.signal_ping_stop(instance.cluster_id());
                    return;
                }

                match scan_shards(&sup, &instance).await {
                    Ok(health) => {
                        instance.set_health(health);
                    }
                    Err(MewldError::Timeout) => {
                        let cluster_id = instance.cluster_id();
                        error!("Cluster {cluster_id} failed its health probe");
                        sup.action_log(json!({"event": "ping_failure", "id": cluster_id}))
                            .await;

                        if instance.locked() {
                            info!(
                                "Cluster {cluster_id} is locked; skipping the probe-driven restart"
                            );
                            continue;
                        }

                        let _ = sup.lock_instance(&instance, "PingCheck", false);
                        currently_killing.set(true);
                        sleep(KILL_PAUSE).await;
                        sup.stop(&instance).await;
                        sleep(RESTART_PAUSE).await;
                        if let Err(e) = sup.start(&instance).await {
                            error!("Could not restart cluster {cluster_id}: {e}");
                        }
                        currently_killing.set(false);
                        instance.unlock();
                        return;
                    }
                    Err(e) => {
                        error!(
                            "Health probe for cluster {} errored: {e}",
                            instance.cluster_id()
                        );
                    }
                }
            }
            msg = stop_rx.recv() => {
                if let Ok(cluster_id) = msg
                    && cluster_id == instance.cluster_id()
                    && !currently_killing.get()
                {
                    return;
                }
            }
        }
    }
}
