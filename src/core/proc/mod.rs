// src/core/proc/mod.rs

//! The supervisor: owns the instance set, serializes child launches
//! through the start gate, and drives restart, rolling-restart, and
//! reshard state machines.

use crate::config::Config;
use crate::core::errors::{MewldError, StopCode};
use crate::core::gateway::{self, GatewayInfo};
use crate::core::handler::{self, LauncherCmd};
use crate::core::ipc::IpcBus;
use crate::core::ipc::redis::RedisBus;
use crate::core::planner::{ClusterMap, plan_clusters};
use crate::core::utils::random_string;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::{Value, json};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

pub mod instance;
pub mod launcher;
pub mod observer;
pub mod ping;

pub use instance::Instance;
pub use launcher::{DefaultLauncher, Launcher};
pub use ping::{DiagRequest, DiagResponse, ShardHealth};

const DIAG_CHANNEL_CAPACITY: usize = 64;
const PING_STOP_CHANNEL_CAPACITY: usize = 64;

/// The supervisor core. Exclusively owns the instance set; background
/// loops (observers, ping loops) look instances up through it and carry a
/// session token that tells them when they have gone stale.
pub struct Supervisor {
    pub config: Config,
    pub dir: PathBuf,
    pub bus: Arc<dyn IpcBus>,
    token: String,
    launcher: Arc<dyn Launcher>,

    /// Back-reference to the owning Arc, for handing clones to spawned
    /// tasks.
    me: Weak<Supervisor>,

    map: RwLock<Vec<ClusterMap>>,
    instances: RwLock<Vec<Arc<Instance>>>,
    shard_count: AtomicU64,
    gateway: RwLock<GatewayInfo>,

    /// At-most-one in-flight child spawn across the whole supervisor.
    start_gate: Mutex<()>,
    last_cluster_started_at: SyncMutex<Option<Instant>>,
    roll_restarting: AtomicBool,
    fully_up: AtomicBool,

    diag_tx: broadcast::Sender<DiagResponse>,
    ping_stop_tx: broadcast::Sender<u64>,
    roll_tx: mpsc::UnboundedSender<u64>,
    roll_rx: Mutex<mpsc::UnboundedReceiver<u64>>,
}

impl Supervisor {
    /// Builds a supervisor over an already-planned cluster map and an
    /// already-constructed bus. Instances are materialised with fresh
    /// session tokens; nothing is spawned yet.
    pub fn new(
        config: Config,
        token: String,
        dir: PathBuf,
        map: Vec<ClusterMap>,
        shard_count: u64,
        gateway: GatewayInfo,
        bus: Arc<dyn IpcBus>,
        launcher: Arc<dyn Launcher>,
    ) -> Arc<Self> {
        let instances = map
            .iter()
            .map(|c| Arc::new(Instance::new(c.id, c.shards.clone(), random_string(16))))
            .collect();

        let (diag_tx, _) = broadcast::channel(DIAG_CHANNEL_CAPACITY);
        let (ping_stop_tx, _) = broadcast::channel(PING_STOP_CHANNEL_CAPACITY);
        let (roll_tx, roll_rx) = mpsc::unbounded_channel();

        Arc::new_cyclic(|me| Self {
            config,
            dir,
            bus,
            token,
            launcher,
            me: me.clone(),
            map: RwLock::new(map),
            instances: RwLock::new(instances),
            shard_count: AtomicU64::new(shard_count),
            gateway: RwLock::new(gateway),
            start_gate: Mutex::new(()),
            last_cluster_started_at: SyncMutex::new(None),
            roll_restarting: AtomicBool::new(false),
            fully_up: AtomicBool::new(false),
            diag_tx,
            ping_stop_tx,
            roll_tx,
            roll_rx: Mutex::new(roll_rx),
        })
    }

    /// Loads the full supervisor from configuration: env files, gateway
    /// discovery, cluster planning, bus connection, the command-handler
    /// task, the session-budget gate, and the asynchronous start of
    /// cluster 0.
    pub async fn load(config: Config) -> Result<Arc<Self>> {
        let bus = Arc::new(
            RedisBus::new(&config.redis, &config.redis_channel)
                .context("Failed to build the redis bus")?,
        );
        Self::load_with(config, bus, Arc::new(DefaultLauncher)).await
    }

    /// As [`Supervisor::load`], with the bus and launcher supplied by the
    /// caller.
    pub async fn load_with(
        config: Config,
        bus: Arc<dyn IpcBus>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Arc<Self>> {
        for env_file in &config.env {
            dotenvy::from_filename(env_file)
                .with_context(|| format!("Failed to load env file '{env_file}'"))?;
        }
        if !config.env.is_empty() {
            info!("Env files loaded");
        }

        let token = config.resolve_token()?;

        let gateway = gateway::get_gateway_info(&config.gateway_url, &token)
            .await
            .context("Failed to fetch gateway info")?;
        info!("Recommended shard count: {}", gateway.shards);

        let mut shard_count = gateway.shards;
        if let Ok(raw) = env::var("SHARD_COUNT") {
            shard_count = raw
                .parse()
                .with_context(|| format!("Invalid SHARD_COUNT '{raw}'"))?;
        }
        if config.fixed_shard_count > 0 {
            shard_count = config.fixed_shard_count;
        }

        let mut per_cluster = config.per_cluster;
        if let Ok(raw) = env::var("PER_CLUSTER") {
            per_cluster = raw
                .parse()
                .with_context(|| format!("Invalid PER_CLUSTER '{raw}'"))?;
        }

        info!("Cluster names: {:?}", config.names);
        let map = plan_clusters(&config.names, shard_count, per_cluster);
        for cluster in &map {
            info!(
                "Cluster {} ({}): {:?}",
                cluster.name, cluster.id, cluster.shards
            );
        }

        let dir = config.resolve_directory()?;

        bus.connect()
            .await
            .context("Failed to connect to the IPC bus")?;

        let session_limit = gateway.session_start_limit.clone();
        let sup = Self::new(
            config,
            token,
            dir,
            map,
            shard_count,
            gateway,
            bus,
            launcher,
        );

        // The command handler is the single consumer of the bus.
        let handler_sup = Arc::clone(&sup);
        tokio::spawn(async move { handler::run(handler_sup).await });

        if session_limit.remaining < sup.config.minimum_safe_sessions_remaining {
            warn!(
                "Only {} session starts remaining (minimum safe {}); waiting {}ms for the budget to reset",
                session_limit.remaining,
                sup.config.minimum_safe_sessions_remaining,
                session_limit.reset_after
            );
            sleep(Duration::from_millis(session_limit.reset_after)).await;
        }

        // Start the first cluster; it reports launch_next over the bus,
        // which chains the rest.
        let first = sup.instances().into_iter().next();
        if let Some(first) = first {
            let start_sup = Arc::clone(&sup);
            tokio::spawn(async move {
                if let Err(e) = start_sup.start(&first).await {
                    error!("Could not start cluster 0: {e}");
                }
            });
        }

        Ok(sup)
    }

    // --- Accessors ---

    /// An owning handle to this supervisor, for spawned tasks. `self` is
    /// only reachable through the Arc built in [`Supervisor::new`], so the
    /// upgrade cannot fail.
    fn handle(&self) -> Arc<Supervisor> {
        self.me.upgrade().expect("supervisor is alive")
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().clone()
    }

    pub fn instance_by_id(&self, cluster_id: u64) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .iter()
            .find(|i| i.cluster_id() == cluster_id)
            .cloned()
    }

    pub fn cluster_map(&self) -> Vec<ClusterMap> {
        self.map.read().clone()
    }

    /// The planned cluster entry backing an instance slot.
    pub fn cluster_for(&self, instance: &Instance) -> Option<ClusterMap> {
        self.map
            .read()
            .iter()
            .find(|c| c.id == instance.cluster_id())
            .cloned()
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_count.load(Ordering::Acquire)
    }

    /// When the most recent child launch happened, if any.
    pub fn last_cluster_started_at(&self) -> Option<Instant> {
        *self.last_cluster_started_at.lock()
    }

    pub fn gateway(&self) -> GatewayInfo {
        self.gateway.read().clone()
    }

    pub fn roll_restarting(&self) -> bool {
        self.roll_restarting.load(Ordering::Acquire)
    }

    pub fn fully_up(&self) -> bool {
        self.fully_up.load(Ordering::Acquire)
    }

    // --- Channels ---

    pub fn subscribe_diag(&self) -> broadcast::Receiver<DiagResponse> {
        self.diag_tx.subscribe()
    }

    /// Routes a diag response to every probe currently awaiting one.
    pub fn push_diag(&self, resp: DiagResponse) {
        // No receiver just means no probe is in flight.
        let _ = self.diag_tx.send(resp);
    }

    pub fn subscribe_ping_stop(&self) -> broadcast::Receiver<u64> {
        self.ping_stop_tx.subscribe()
    }

    pub fn signal_ping_stop(&self, cluster_id: u64) {
        let _ = self.ping_stop_tx.send(cluster_id);
    }

    /// Reports a cluster's launch completion to the rolling-restart
    /// driver.
    pub fn signal_roll_restart(&self, cluster_id: u64) {
        let _ = self.roll_tx.send(cluster_id);
    }

    // --- Bus helpers ---

    /// Appends a record to the persisted action log, stamping it with the
    /// current time in microseconds.
    pub async fn action_log(&self, mut data: Value) {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("ts".to_string(), json!(Utc::now().timestamp_micros()));
        }
        let payload = match serde_json::to_vec(&data) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode action log: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.append_key_list("actlogs", &payload).await {
            error!("Could not persist action log: {e}");
        }
    }

    /// Publishes a reply addressed to `command_id`.
    pub async fn send_message(
        &self,
        command_id: &str,
        output: Value,
        scope: &str,
        action: &str,
    ) -> Result<(), MewldError> {
        let msg = LauncherCmd {
            scope: scope.to_string(),
            action: action.to_string(),
            args: None,
            command_id: (!command_id.is_empty()).then(|| command_id.to_string()),
            output: (!output.is_null()).then_some(output),
            data: None,
        };
        self.bus.publish(&serde_json::to_vec(&msg)?).await
    }

    /// Acks a command: exactly one `{command_id, output: "ok"}` per
    /// handled operator command.
    pub async fn acknowledge(&self, command_id: &str) {
        if let Err(e) = self.send_message(command_id, json!("ok"), "bot", "").await {
            error!("Could not acknowledge command {command_id}: {e}");
        }
    }

    /// Takes the instance lock on behalf of an operation, reporting a
    /// rejection to the action log.
    pub fn lock_instance(
        &self,
        instance: &Arc<Instance>,
        reason: &str,
        critical: bool,
    ) -> Result<(), MewldError> {
        match instance.try_lock(reason, critical) {
            Ok(()) => Ok(()),
            Err(e) => {
                let sup = self.handle();
                let data = json!({
                    "event": "instance_locked_error",
                    "id": instance.cluster_id(),
                    "via": reason,
                });
                tokio::spawn(async move { sup.action_log(data).await });
                Err(e)
            }
        }
    }

    // --- Lifecycle operations ---

    /// Spawns an instance's child. Serialised through the start gate so no
    /// two children are ever spawned concurrently.
    ///
    /// Returns a boxed future rather than `async fn`: this function spawns
    /// a task that calls back into it (via `observer::observe`), and the
    /// compiler cannot prove the auto-generated future type `Send` across
    /// that mutual recursion. Boxing gives it a nominal, already-`Send`
    /// type and breaks the cycle.
    pub fn start<'a>(
        &'a self,
        instance: &'a Arc<Instance>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), MewldError>> + Send + 'a>>
    {
        Box::pin(async move {
            let _gate = self.start_gate.lock().await;

            if !instance.locked() {
                let _ = self.lock_instance(instance, "Start", false);
            }

            instance.set_started_at(Utc::now());
            *self.last_cluster_started_at.lock() = Some(Instant::now());
            instance.set_session_id(&random_string(32));
            instance.touch_last_checked();
            instance.set_launched_fully(false);

            let cluster = self.cluster_for(instance).ok_or_else(|| {
                MewldError::Config(format!(
                    "no cluster planned for id {}",
                    instance.cluster_id()
                ))
            })?;

            info!(
                "Starting cluster {} ({}) in directory {}",
                cluster.name,
                cluster.id,
                self.dir.display()
            );

            if let Err(e) = self.launcher.start(self, instance, &cluster).await {
                error!("Cluster {} ({}) failed to start: {e}", cluster.name, cluster.id);
                instance.unlock();
                return Err(e);
            }

            instance.unlock();
            instance.set_active(true);

            // Background monitors for this spawn generation. Both capture the
            // session token and exit once it no longer matches.
            let session_id = instance.session_id();
            let sup = self.handle();
            let inst = Arc::clone(instance);
            let sid = session_id.clone();
            tokio::spawn(async move { observer::observe(sup, inst, sid).await });

            let sup = self.handle();
            let inst = Arc::clone(instance);
            tokio::spawn(async move { ping::ping_loop(sup, inst, session_id).await });

            Ok(())
        })
    }

    /// Stops an instance's child. Clearing the session token retires any
    /// observer or ping loop still attached to the old spawn.
    pub async fn stop(&self, instance: &Arc<Instance>) -> StopCode {
        if !instance.running().await {
            instance.clear_session();
            return StopCode::RestartFailed;
        }

        let _ = self.lock_instance(instance, "Stop", false);

        info!("Stopping cluster {}", instance.cluster_id());
        instance.kill().await;
        let _ = instance.reap().await;
        instance.set_active(false);
        instance.clear_session();
        instance.unlock();

        StopCode::Normal
    }

    /// Kills every running child and reaps them all.
    pub async fn kill_all(&self) {
        let instances = self.instances();

        for instance in &instances {
            if instance.running().await {
                instance.acquire_and_lock("KillAll").await;
                info!("Killing cluster {}", instance.cluster_id());
                instance.kill().await;
                instance.set_active(false);
                instance.clear_session();
            } else {
                warn!("Cluster {} is not running", instance.cluster_id());
            }
        }

        for instance in &instances {
            let _ = instance.reap().await;
        }

        for instance in &instances {
            instance.unlock();
        }
    }

    /// Starts the first instance without a running child, after the
    /// configured delay. When every child is already up, announces
    /// `all_clusters_launched` instead.
    pub async fn start_next(&self) {
        self.fully_up.store(false, Ordering::Release);

        for instance in self.instances() {
            if instance.running().await {
                continue;
            }

            info!("Starting next cluster {}", instance.cluster_id());
            sleep(Duration::from_secs(self.config.cluster_start_next_delay)).await;
            if let Err(e) = self.start(&instance).await {
                error!("Could not start cluster {}: {e}", instance.cluster_id());
            }
            instance.unlock();
            return;
        }

        info!("All clusters launched");
        if let Err(e) = self
            .send_message("", Value::Null, "bot", "all_clusters_launched")
            .await
        {
            error!("Could not announce launch completion: {e}");
        }
        self.fully_up.store(true, Ordering::Release);
    }

    /// Restarts every instance in order, waiting for each cluster to
    /// finish launching (its `launch_next` signal) before touching the
    /// next one.
    pub async fn rolling_restart(&self) {
        if !self.fully_up() {
            error!("Rolling restart requires all clusters to be fully up");
            return;
        }

        self.action_log(json!({"event": "rolling_restart"})).await;
        self.roll_restarting.store(true, Ordering::Release);

        let wait_bound = Duration::from_secs(self.config.rolling_restart_timeout);
        let mut roll_rx = self.roll_rx.lock().await;
        // Drop completion signals left over from an earlier run.
        while roll_rx.try_recv().is_ok() {}

        for instance in self.instances() {
            let cluster_id = instance.cluster_id();
            instance.acquire_and_lock("RollingRestart").await;

            if self.stop(&instance).await == StopCode::RestartFailed {
                error!("Could not stop cluster {cluster_id}; skipping it");
                instance.unlock();
                continue;
            }

            if let Err(e) = self.start(&instance).await {
                error!("Could not start cluster {cluster_id}: {e}");
                instance.unlock();
                continue;
            }
            instance.unlock();

            // Block until this cluster reports in; signals for other
            // clusters are logged and dropped.
            let deadline = Instant::now() + wait_bound;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(
                        "Cluster {cluster_id} did not report launch completion within {}s; moving on",
                        self.config.rolling_restart_timeout
                    );
                    break;
                }
                match timeout(remaining, roll_rx.recv()).await {
                    Err(_) => {
                        warn!(
                            "Cluster {cluster_id} did not report launch completion within {}s; moving on",
                            self.config.rolling_restart_timeout
                        );
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(done)) if done == cluster_id => break,
                    Ok(Some(other)) => {
                        info!("Ignoring launch signal for cluster {other} while waiting on {cluster_id}");
                    }
                }
            }
        }

        self.roll_restarting.store(false, Ordering::Release);
        info!("Rolling restart complete");
    }

    /// Re-plans clusters against a fresh gateway recommendation and moves
    /// every slot to its new shard set. Gated by the `reshard`
    /// experimental feature; never shrinks the cluster count; per-slot
    /// failures accumulate rather than aborting the pass.
    pub async fn reshard(&self) -> Result<(), MewldError> {
        if !self
            .config
            .experimental_features
            .iter()
            .any(|f| f == "reshard")
        {
            return Err(MewldError::ReshardDisabled);
        }
        if self.roll_restarting() {
            return Err(MewldError::ReshardUnsafe(
                "a rolling restart is in progress".to_string(),
            ));
        }
        if !self.fully_up() {
            return Err(MewldError::ReshardUnsafe(
                "not all clusters are fully up".to_string(),
            ));
        }

        let instances = self.instances();
        if instances.iter().any(|i| i.locked()) {
            return Err(MewldError::ReshardUnsafe(
                "an instance is currently locked".to_string(),
            ));
        }

        for instance in &instances {
            instance.acquire_and_lock("Reshard").await;
        }

        let result = self.reshard_locked(&instances).await;

        for instance in self.instances() {
            instance.unlock();
        }

        result
    }

    async fn reshard_locked(&self, instances: &[Arc<Instance>]) -> Result<(), MewldError> {
        self.fully_up.store(false, Ordering::Release);

        let info = gateway::get_gateway_info(&self.config.gateway_url, &self.token).await?;

        let mut shard_count = info.shards;
        if self.config.fixed_shard_count > 0 {
            shard_count = self.config.fixed_shard_count;
        }

        if info.session_start_limit.remaining < self.config.minimum_safe_sessions_remaining {
            return Err(MewldError::ReshardUnsafe(format!(
                "only {} session starts remaining (minimum safe {})",
                info.session_start_limit.remaining, self.config.minimum_safe_sessions_remaining
            )));
        }
        *self.gateway.write() = info;

        let new_map = plan_clusters(&self.config.names, shard_count, self.config.per_cluster);
        if new_map.len() < instances.len() {
            return Err(MewldError::ReshardUnsafe(format!(
                "new plan has {} clusters, fewer than the {} running",
                new_map.len(),
                instances.len()
            )));
        }

        // Install the new plan before relaunching so launches render the
        // new cluster entries.
        *self.map.write() = new_map.clone();
        self.shard_count.store(shard_count, Ordering::Release);

        let mut errors: Vec<String> = Vec::new();

        // Existing slots keep their identity; only the shard set moves.
        for (slot, instance) in instances.iter().enumerate() {
            let cluster = new_map[slot].clone();
            instance.set_cluster_id(cluster.id);

            let old_shards = instance.shards();
            if old_shards == cluster.shards && !self.config.reshard_all {
                continue;
            }

            instance.set_shards(cluster.shards.clone());
            if let Err(e) = self
                .launcher
                .on_reshard(self, instance, &cluster, &old_shards, &cluster.shards)
                .await
            {
                errors.push(format!("cluster {}: {e}", cluster.id));
                continue;
            }

            self.stop(instance).await;
            if let Err(e) = self.start(instance).await {
                errors.push(format!("cluster {}: {e}", cluster.id));
            }
        }

        // Extra clusters in the new plan get fresh slots.
        for cluster in new_map.iter().skip(instances.len()) {
            let instance = Arc::new(Instance::new(
                cluster.id,
                cluster.shards.clone(),
                random_string(16),
            ));
            self.instances.write().push(Arc::clone(&instance));
            if let Err(e) = self.start(&instance).await {
                errors.push(format!("cluster {}: {e}", cluster.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MewldError::ReshardUnsafe(errors.join("; ")))
        }
    }
}
