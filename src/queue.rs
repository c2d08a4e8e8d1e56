//! Command delivery queue polled by relay boards
//!
//! One pending command per relay id; a newer command for the same relay
//! replaces the undelivered one. Polling removes the entry. Delivery is
//! best-effort: the in-memory queue is empty after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::RelayCommand;

/// Mailbox keyed by relay id
///
/// Injected wherever commands are produced or consumed so a durable backend
/// can replace [`MemoryCommandQueue`] without touching call sites.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Store `command` for `relay_id`, replacing any pending one
    async fn enqueue(&self, relay_id: &str, command: RelayCommand);

    /// Take the pending command for `relay_id`, if any
    async fn poll(&self, relay_id: &str) -> Option<RelayCommand>;

    /// Drop a pending command without delivering it
    async fn discard(&self, relay_id: &str) -> bool;

    async fn pending(&self) -> usize;
}

pub type SharedQueue = Arc<dyn CommandQueue>;

#[derive(Default)]
pub struct MemoryCommandQueue {
    slots: Mutex<HashMap<String, RelayCommand>>,
}

impl MemoryCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandQueue for MemoryCommandQueue {
    async fn enqueue(&self, relay_id: &str, command: RelayCommand) {
        let replaced = self
            .slots
            .lock()
            .await
            .insert(relay_id.to_string(), command);
        if replaced.is_some() {
            tracing::debug!("Replaced undelivered command for relay {}", relay_id);
        }
    }

    async fn poll(&self, relay_id: &str) -> Option<RelayCommand> {
        self.slots.lock().await.remove(relay_id)
    }

    async fn discard(&self, relay_id: &str) -> bool {
        self.slots.lock().await.remove(relay_id).is_some()
    }

    async fn pending(&self) -> usize {
        self.slots.lock().await.len()
    }
}
