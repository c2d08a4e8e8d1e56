//! JSON file store
//!
//! One file per collection in the data directory (`boards.json`,
//! `users.json`, `data.json`). Collections are loaded at startup and written
//! through on every mutation: the new collection is serialized and renamed
//! into place first, and only then becomes visible to readers, so a failed
//! write leaves both disk and memory at the previous state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::memory::Collections;
use super::{DataStore, StoreResult};
use crate::model::{Board, UserAppData, UserRecord};

const BOARDS_FILE: &str = "boards.json";
const USERS_FILE: &str = "users.json";
const DATA_FILE: &str = "data.json";

pub struct JsonFileStore {
    collections: RwLock<Collections>,
    /// Serializes writers so snapshots reach disk in mutation order
    flush: Mutex<()>,
    data_dir: PathBuf,
}

impl JsonFileStore {
    /// Open the store, loading any existing collections from `data_dir`
    pub fn open(data_dir: PathBuf) -> StoreResult<Self> {
        let collections = Collections {
            boards: load_collection(&data_dir.join(BOARDS_FILE))?,
            users: load_collection(&data_dir.join(USERS_FILE))?,
            data: load_collection(&data_dir.join(DATA_FILE))?,
        };

        tracing::info!(
            "Loaded {} boards, {} users from {}",
            collections.boards.len(),
            collections.users.len(),
            data_dir.display()
        );

        Ok(Self {
            collections: RwLock::new(collections),
            flush: Mutex::new(()),
            data_dir,
        })
    }

    async fn write_file<T: Serialize>(&self, file: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let path = self.data_dir.join(file);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn update_boards(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, Board>) -> Option<Board>,
    ) -> StoreResult<Option<Board>> {
        let _flush_guard = self.flush.lock().await;
        let mut boards = self.collections.read().await.boards.clone();
        let out = mutate(&mut boards);
        self.write_file(BOARDS_FILE, &boards).await?;
        self.collections.write().await.boards = boards;
        Ok(out)
    }
}

fn load_collection<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DataStore for JsonFileStore {
    async fn get_boards(&self) -> StoreResult<BTreeMap<String, Board>> {
        Ok(self.collections.read().await.boards.clone())
    }

    async fn get_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        Ok(self.collections.read().await.boards.get(board_id).cloned())
    }

    async fn put_board(&self, board: Board) -> StoreResult<()> {
        self.update_boards(|boards| boards.insert(board.board_id.clone(), board))
            .await
            .map(|_| ())
    }

    async fn remove_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        self.update_boards(|boards| boards.remove(board_id)).await
    }

    async fn get_users(&self) -> StoreResult<Vec<UserRecord>> {
        Ok(self.collections.read().await.users.clone())
    }

    async fn put_users(&self, users: Vec<UserRecord>) -> StoreResult<()> {
        let _flush_guard = self.flush.lock().await;
        self.write_file(USERS_FILE, &users).await?;
        self.collections.write().await.users = users;
        Ok(())
    }

    async fn get_user_app_data(&self, user_id: &str) -> StoreResult<Option<UserAppData>> {
        Ok(self.collections.read().await.data.get(user_id).cloned())
    }

    async fn put_user_app_data(&self, user_id: &str, data: UserAppData) -> StoreResult<()> {
        let _flush_guard = self.flush.lock().await;
        let mut all = self.collections.read().await.data.clone();
        all.insert(user_id.to_string(), data);
        self.write_file(DATA_FILE, &all).await?;
        self.collections.write().await.data = all;
        Ok(())
    }

    async fn get_all_app_data(&self) -> StoreResult<BTreeMap<String, UserAppData>> {
        Ok(self.collections.read().await.data.clone())
    }
}
