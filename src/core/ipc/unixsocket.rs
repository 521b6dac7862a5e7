// src/core/ipc/unixsocket.rs

//! Local-socket bus variant: a single-host multiplexer over a unix
//! socket. Every frame a peer writes is forwarded to the supervisor's
//! read queue and echoed to every other connected peer. Keys and lists
//! live in in-memory maps.
//!
//! Frames are line-delimited JSON, so concurrent writers cannot
//! interleave partial payloads.

use crate::core::errors::MewldError;
use crate::core::ipc::IpcBus;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

const READ_QUEUE_CAPACITY: usize = 100;

type PeerMap = Arc<Mutex<HashMap<u64, OwnedWriteHalf>>>;

pub struct UnixSocketBus {
    path: PathBuf,
    peers: PeerMap,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    kv: SyncMutex<HashMap<String, Vec<u8>>>,
    lists: SyncMutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl UnixSocketBus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            rx: Mutex::new(None),
            accept: Mutex::new(None),
            kv: SyncMutex::new(HashMap::new()),
            lists: SyncMutex::new(HashMap::new()),
        }
    }

    /// Writes a frame to every peer except `from` (`None` = send to all).
    async fn fan_out(peers: &PeerMap, from: Option<u64>, data: &[u8]) {
        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.extend_from_slice(data);
        framed.push(b'\n');

        let mut dead = Vec::new();
        let mut guard = peers.lock().await;
        for (id, writer) in guard.iter_mut() {
            if Some(*id) == from {
                continue;
            }
            if let Err(e) = writer.write_all(&framed).await {
                debug!("Dropping dead local-socket peer {id}: {e}");
                dead.push(*id);
            }
        }
        for id in dead {
            guard.remove(&id);
        }
    }
}

#[async_trait]
impl IpcBus for UnixSocketBus {
    async fn connect(&self) -> Result<(), MewldError> {
        // Delete a stale socket file from a previous run.
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.path)?;
        let (tx, rx) = mpsc::channel(READ_QUEUE_CAPACITY);

        let peers = Arc::clone(&self.peers);
        let accept = tokio::spawn(async move {
            let next_id = AtomicU64::new(0);
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Local-socket accept failed: {e}");
                        return;
                    }
                };

                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let (read_half, write_half) = stream.into_split();
                peers.lock().await.insert(id, write_half);

                let peers = Arc::clone(&peers);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(read_half, LinesCodec::new());
                    while let Some(frame) = frames.next().await {
                        let line = match frame {
                            Ok(line) => line,
                            Err(e) => {
                                debug!("Local-socket peer {id} read error: {e}");
                                break;
                            }
                        };
                        let data = line.into_bytes();
                        UnixSocketBus::fan_out(&peers, Some(id), &data).await;
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    peers.lock().await.remove(&id);
                });
            }
        });

        *self.rx.lock().await = Some(rx);
        if let Some(old) = self.accept.lock().await.replace(accept) {
            old.abort();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MewldError> {
        if let Some(accept) = self.accept.lock().await.take() {
            accept.abort();
        }
        self.peers.lock().await.clear();
        *self.rx.lock().await = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self) -> Option<Vec<u8>> {
        let mut guard = self.rx.lock().await;
        guard.as_mut()?.recv().await
    }

    async fn publish(&self, data: &[u8]) -> Result<(), MewldError> {
        Self::fan_out(&self.peers, None, data).await;
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
