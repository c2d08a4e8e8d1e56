//! Backing store for boards, users and per-user app data
//!
//! Three collections, mirroring the key-value layout the dashboard has always
//! used: `boards` (board id -> board), `users` (auth records) and `data`
//! (user id -> app data). Boards and app data are addressed per key so
//! callers can serialize read-modify-write on a single entry instead of the
//! whole collection.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Board, UserAppData, UserRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Data store contract consumed by the registry and the appliance manager
///
/// Each call is atomic for the entry it touches. Nothing here is atomic
/// across calls; serialization of read-modify-write sequences is the
/// caller's job (see `locks`).
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_boards(&self) -> StoreResult<BTreeMap<String, Board>>;
    async fn get_board(&self, board_id: &str) -> StoreResult<Option<Board>>;
    async fn put_board(&self, board: Board) -> StoreResult<()>;
    async fn remove_board(&self, board_id: &str) -> StoreResult<Option<Board>>;

    async fn get_users(&self) -> StoreResult<Vec<UserRecord>>;
    async fn put_users(&self, users: Vec<UserRecord>) -> StoreResult<()>;

    async fn get_user_app_data(&self, user_id: &str) -> StoreResult<Option<UserAppData>>;
    async fn put_user_app_data(&self, user_id: &str, data: UserAppData) -> StoreResult<()>;
    async fn get_all_app_data(&self) -> StoreResult<BTreeMap<String, UserAppData>>;
}

pub type SharedStore = Arc<dyn DataStore>;

/// Decorator bounding every store call with a timeout
///
/// A call that exceeds the budget fails with [`StoreError::Timeout`]; it is
/// not retried.
pub struct TimeoutStore {
    inner: SharedStore,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: SharedStore, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Store call exceeded {:?}", self.timeout);
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl DataStore for TimeoutStore {
    async fn get_boards(&self) -> StoreResult<BTreeMap<String, Board>> {
        self.bounded(self.inner.get_boards()).await
    }

    async fn get_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        self.bounded(self.inner.get_board(board_id)).await
    }

    async fn put_board(&self, board: Board) -> StoreResult<()> {
        self.bounded(self.inner.put_board(board)).await
    }

    async fn remove_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        self.bounded(self.inner.remove_board(board_id)).await
    }

    async fn get_users(&self) -> StoreResult<Vec<UserRecord>> {
        self.bounded(self.inner.get_users()).await
    }

    async fn put_users(&self, users: Vec<UserRecord>) -> StoreResult<()> {
        self.bounded(self.inner.put_users(users)).await
    }

    async fn get_user_app_data(&self, user_id: &str) -> StoreResult<Option<UserAppData>> {
        self.bounded(self.inner.get_user_app_data(user_id)).await
    }

    async fn put_user_app_data(&self, user_id: &str, data: UserAppData) -> StoreResult<()> {
        self.bounded(self.inner.put_user_app_data(user_id, data))
            .await
    }

    async fn get_all_app_data(&self) -> StoreResult<BTreeMap<String, UserAppData>> {
        self.bounded(self.inner.get_all_app_data()).await
    }
}
