//! Shared fixtures for supervisor tests: a scripted in-memory bus,
//! launchers that spawn either nothing or a long-sleeping child, and a
//! canned one-response HTTP server standing in for the gateway.

#![allow(dead_code)]

use async_trait::async_trait;
use mewld::config::Config;
use mewld::core::MewldError;
use mewld::core::gateway::GatewayInfo;
use mewld::core::ipc::IpcBus;
use mewld::core::planner::{ClusterMap, plan_clusters};
use mewld::core::proc::{Instance, Launcher, Supervisor};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// An in-memory bus: `read` drains a scripted inbox (then reports the bus
/// as closed), `publish` records payloads for assertions.
#[derive(Default)]
pub struct TestBus {
    published: Mutex<Vec<Vec<u8>>>,
    inbox: AsyncMutex<VecDeque<Vec<u8>>>,
    kv: Mutex<HashMap<String, Vec<u8>>>,
    lists: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbox(messages: &[serde_json::Value]) -> Self {
        let bus = Self::default();
        {
            let mut inbox = bus.inbox.try_lock().unwrap();
            for msg in messages {
                inbox.push_back(serde_json::to_vec(msg).unwrap());
            }
        }
        bus
    }

    pub fn published(&self) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    pub fn list(&self, key: &str) -> Vec<serde_json::Value> {
        self.lists
            .lock()
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|p| serde_json::from_slice(p).unwrap())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl IpcBus for TestBus {
    async fn connect(&self) -> Result<(), MewldError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MewldError> {
        Ok(())
    }

    async fn read(&self) -> Option<Vec<u8>> {
        self.inbox.lock().await.pop_front()
    }

    async fn publish(&self, data: &[u8]) -> Result<(), MewldError> {
        self.published.lock().push(data.to_vec());
        Ok(())
    }

    async fn get_key(&self, key: &str) -> Result<Vec<u8>, MewldError> {
        Ok(self.kv.lock().get(key).cloned().unwrap_or_default())
    }

    async fn store_key(&self, key: &str, value: &[u8]) -> Result<(), MewldError> {
        self.kv.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_key_list(&self, key: &str) -> Result<Vec<Vec<u8>>, MewldError> {
        Ok(self.lists.lock().get(key).cloned().unwrap_or_default())
    }

    async fn append_key_list(&self, key: &str, value: &[u8]) -> Result<(), MewldError> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(value.to_vec());
        Ok(())
    }
}

/// A launcher that forks nothing. Instances "start" without a child.
pub struct NoopLauncher;

#[async_trait]
impl Launcher for NoopLauncher {
    async fn start(
        &self,
        _sup: &Supervisor,
        _instance: &Instance,
        _cluster: &ClusterMap,
    ) -> Result<(), MewldError> {
        Ok(())
    }

    async fn on_reshard(
        &self,
        _sup: &Supervisor,
        _instance: &Instance,
        _cluster: &ClusterMap,
        _old_shards: &[u64],
        _new_shards: &[u64],
    ) -> Result<(), MewldError> {
        Ok(())
    }
}

/// A launcher that forks a real long-sleeping child, so liveness checks
/// and kill paths behave as in production.
pub struct SleepLauncher;

#[async_trait]
impl Launcher for SleepLauncher {
    async fn start(
        &self,
        _sup: &Supervisor,
        instance: &Instance,
        _cluster: &ClusterMap,
    ) -> Result<(), MewldError> {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .map_err(|e| MewldError::ProcessSpawn(e.to_string()))?;
        instance.attach_child(child).await;
        Ok(())
    }

    async fn on_reshard(
        &self,
        _sup: &Supervisor,
        _instance: &Instance,
        _cluster: &ClusterMap,
        _old_shards: &[u64],
        _new_shards: &[u64],
    ) -> Result<(), MewldError> {
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::from_yaml(
        r#"
names: ["a", "b", "c", "d"]
redis: "localhost:6379"
redis_channel: "test_channel"
module: "mew"
"#,
    )
    .unwrap();
    config.cluster_start_next_delay = 0;
    config.rolling_restart_timeout = 5;
    config
}

/// Serves a canned HTTP response on a loopback port, accepting
/// connections until the test ends. Returns the URL to hit.
pub async fn serve_canned_http(status_line: &'static str, body: String) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    format!("http://{addr}/")
}

pub fn test_supervisor(
    mut config: Config,
    shards: u64,
    per_cluster: u64,
    bus: Arc<dyn IpcBus>,
    launcher: Arc<dyn Launcher>,
) -> Arc<Supervisor> {
    // Reshard replans from the config, so the config must agree with the
    // map this helper builds.
    config.per_cluster = per_cluster;
    let map = plan_clusters(&config.names, shards, per_cluster);
    Supervisor::new(
        config,
        "test-token".to_string(),
        std::env::temp_dir(),
        map,
        shards,
        GatewayInfo::default(),
        bus,
        launcher,
    )
}
