//! In-process store (tests and ephemeral deployments)

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DataStore, StoreResult};
use crate::model::{Board, UserAppData, UserRecord};

#[derive(Debug, Default)]
pub(super) struct Collections {
    pub boards: BTreeMap<String, Board>,
    pub users: Vec<UserRecord>,
    pub data: BTreeMap<String, UserAppData>,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with auth records
    pub fn with_users(users: Vec<UserRecord>) -> Self {
        Self {
            collections: RwLock::new(Collections {
                users,
                ..Collections::default()
            }),
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_boards(&self) -> StoreResult<BTreeMap<String, Board>> {
        Ok(self.collections.read().await.boards.clone())
    }

    async fn get_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        Ok(self.collections.read().await.boards.get(board_id).cloned())
    }

    async fn put_board(&self, board: Board) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        collections.boards.insert(board.board_id.clone(), board);
        Ok(())
    }

    async fn remove_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        Ok(self.collections.write().await.boards.remove(board_id))
    }

    async fn get_users(&self) -> StoreResult<Vec<UserRecord>> {
        Ok(self.collections.read().await.users.clone())
    }

    async fn put_users(&self, users: Vec<UserRecord>) -> StoreResult<()> {
        self.collections.write().await.users = users;
        Ok(())
    }

    async fn get_user_app_data(&self, user_id: &str) -> StoreResult<Option<UserAppData>> {
        Ok(self.collections.read().await.data.get(user_id).cloned())
    }

    async fn put_user_app_data(&self, user_id: &str, data: UserAppData) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        collections.data.insert(user_id.to_string(), data);
        Ok(())
    }

    async fn get_all_app_data(&self) -> StoreResult<BTreeMap<String, UserAppData>> {
        Ok(self.collections.read().await.data.clone())
    }
}
