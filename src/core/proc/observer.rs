// src/core/proc/observer.rs

//! Per-spawn observer: waits on child termination and decides between
//! restart and quiesce.

use crate::core::proc::{Instance, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

const RESTART_PAUSE: Duration = Duration::from_secs(3);

/// Watches one spawn generation of an instance. `session_id` is the token
/// captured at spawn time; if the instance has been re-rolled or retired
/// by the time the child exits, this observer is stale and backs off.
pub async fn observe(sup: Arc<Supervisor>, instance: Arc<Instance>, session_id: String) {
    let status = instance.wait_for_exit().await;

    let current = instance.session_id();
    if current.is_empty() || current != session_id {
        // Intentionally stopped, or the slot was reassigned.
        return;
    }

    let cluster_id = instance.cluster_id();

    if instance.locked() {
        info!("Cluster {cluster_id} exited while locked; leaving it to the lock holder");
        return;
    }

    if sup.roll_restarting() {
        info!("Cluster {cluster_id} exited during a rolling restart; the driver owns its lifecycle");
        return;
    }

    error!("Cluster {cluster_id} died unexpectedly");
    if let Some(status) = status
        && let Some(code) = status.code()
    {
        info!("Exit status: {code}");
    }

    instance.set_active(false);
    let _ = sup.lock_instance(&instance, "Observe", true);

    sleep(RESTART_PAUSE).await;
    sup.stop(&instance).await;
    sleep(RESTART_PAUSE).await;
    if let Err(e) = sup.start(&instance).await {
        error!("Could not restart cluster {cluster_id}: {e}");
    }
    instance.unlock();
}
