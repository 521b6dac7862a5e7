// src/core/ipc/redis.rs

//! Broker-backed bus variant: redis pub/sub for fan-out across processes,
//! plain keys and lists for the side-store.

use crate::core::errors::MewldError;
use crate::core::ipc::IpcBus;
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_QUEUE_CAPACITY: usize = 100;

pub struct RedisBus {
    channel: String,
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RedisBus {
    /// Creates a bus over the given redis URL and channel. A bare
    /// `host:port` value is normalized to `redis://host:port/0`.
    pub fn new(url: &str, channel: &str) -> Result<Self, MewldError> {
        let url = if url.starts_with("redis://") {
            url.to_string()
        } else {
            format!("redis://{url}/0")
        };

        let client = redis::Client::open(url.as_str())?;

        Ok(Self {
            channel: channel.to_string(),
            client,
            conn: Mutex::new(None),
            rx: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.channel, key)
    }

    async fn command_conn(&self) -> Result<MultiplexedConnection, MewldError> {
        let guard = self.conn.lock().await;
        guard
            .clone()
            .ok_or_else(|| MewldError::Ipc("bus is not connected".to_string()))
    }
}

#[async_trait]
impl IpcBus for RedisBus {
    async fn connect(&self) -> Result<(), MewldError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Fail fast on a dead broker before any task depends on it.
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let (tx, rx) = mpsc::channel(READ_QUEUE_CAPACITY);
        let pump = tokio::spawn(async move {
            // Blocking reads: the subscriber connection has no read
            // timeout, matching the broker-side contract.
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping unreadable bus message: {e}");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!("Bus read queue closed; stopping pub/sub pump");
                    return;
                }
            }
        });

        *self.conn.lock().await = Some(conn);
        *self.rx.lock().await = Some(rx);
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MewldError> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        *self.rx.lock().await = None;
        *self.conn.lock().await = None;
        Ok(())
    }

    async fn read(&self) -> Option<Vec<u8>> {
        let mut guard = self.rx.lock().await;
        guard.as_mut()?.recv().await
    }

    async fn publish(&self, data: &[u8]) -> Result<(), MewldError> {
        let mut conn = self.command_conn().await?;
        conn.publish::<_, _, ()>(&self.channel, data).await?;
        Ok(())
    }

    async fn get_key(&self, key: &str) -> Result<Vec<u8>, MewldError> {
        let mut conn = self.command_conn().await?;
        let value: Option<Vec<u8>> = conn.get(self.key(key)).await?;
        Ok(value.unwrap_or_default())
    }

    async fn store_key(&self, key: &str, value: &[u8]) -> Result<(), MewldError> {
        let mut conn = self.command_conn().await?;
        conn.set::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn get_key_list(&self, key: &str) -> Result<Vec<Vec<u8>>, MewldError> {
        let mut conn = self.command_conn().await?;
        let values: Vec<Vec<u8>> = conn.lrange(self.key(key), 0, -1).await?;
        Ok(values)
    }

    async fn append_key_list(&self, key: &str, value: &[u8]) -> Result<(), MewldError> {
        let mut conn = self.command_conn().await?;
        conn.rpush::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }
}
