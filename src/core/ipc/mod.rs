// src/core/ipc/mod.rs

//! The IPC bus seam: a small capability set (publish/subscribe plus a
//! key/value side-store) behind a trait object, so the supervisor never
//! sees transport-specific types.

use crate::core::errors::MewldError;
use async_trait::async_trait;

pub mod redis;
pub mod unixsocket;

/// A connection to the supervisor's control-plane bus.
///
/// Messages are opaque byte payloads; the supervisor speaks JSON over it.
/// Delivery is at-most-once, FIFO per publisher. Reads are single-consumer
/// (the command handler owns them).
#[async_trait]
pub trait IpcBus: Send + Sync {
    async fn connect(&self) -> Result<(), MewldError>;
    async fn disconnect(&self) -> Result<(), MewldError>;

    /// Pulls the next message off the bus. `None` means the bus closed.
    async fn read(&self) -> Option<Vec<u8>>;

    /// Publishes a payload to every other peer on the channel.
    async fn publish(&self, data: &[u8]) -> Result<(), MewldError>;

    async fn get_key(&self, key: &str) -> Result<Vec<u8>, MewldError>;
    async fn store_key(&self, key: &str, value: &[u8]) -> Result<(), MewldError>;
    async fn get_key_list(&self, key: &str) -> Result<Vec<Vec<u8>>, MewldError>;
    async fn append_key_list(&self, key: &str, value: &[u8]) -> Result<(), MewldError>;
}
