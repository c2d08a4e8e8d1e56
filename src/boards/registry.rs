//! Board registry
//!
//! Owns the board lifecycle. Every mutation runs under the board's keyed
//! lock; cascades that touch user app data take one user lock at a time
//! while still holding the board lock.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use super::BoardLimits;
use crate::bus::{HubEvent, SharedBus};
use crate::error::{HubError, HubResult};
use crate::locks::SharedLocks;
use crate::model::{capability_token, Appliance, Board, Relay};
use crate::queue::SharedQueue;
use crate::store::SharedStore;

/// Optional relay metadata supplied by an administrator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelaySeed {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Parameters for [`BoardRegistry::create_board`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewBoard {
    #[serde(default)]
    pub board_id: Option<String>,
    #[serde(default, alias = "number_of_relays")]
    pub relay_count: Option<usize>,
    #[serde(default, alias = "version_number")]
    pub version: Option<String>,
    #[serde(default)]
    pub build_number: Option<u32>,
    #[serde(default)]
    pub relays: Vec<RelaySeed>,
    #[serde(default)]
    pub additional_features: Value,
}

/// Appliance removed by a board cascade, kept for rollback and events
#[derive(Debug, Clone)]
pub(crate) struct PurgedAppliance {
    pub user_id: String,
    pub room_id: String,
    pub appliance: Appliance,
}

#[derive(Clone)]
pub struct BoardRegistry {
    store: SharedStore,
    locks: SharedLocks,
    queue: SharedQueue,
    bus: SharedBus,
    limits: BoardLimits,
}

impl BoardRegistry {
    pub fn new(
        store: SharedStore,
        locks: SharedLocks,
        queue: SharedQueue,
        bus: SharedBus,
        limits: BoardLimits,
    ) -> Self {
        Self {
            store,
            locks,
            queue,
            bus,
            limits,
        }
    }

    /// Create an unowned board with fresh, free relays
    pub async fn create_board(&self, params: NewBoard) -> HubResult<Board> {
        let relay_count = params
            .relay_count
            .unwrap_or_else(|| params.relays.len().max(self.limits.default_relay_count));
        if relay_count == 0 || relay_count > self.limits.max_relay_count {
            return Err(HubError::Validation(format!(
                "Relay count must be between 1 and {}",
                self.limits.max_relay_count
            )));
        }
        if params.relays.len() > relay_count {
            return Err(HubError::Validation(
                "More relay entries than relays".to_string(),
            ));
        }

        let mut relays = Vec::with_capacity(relay_count);
        for i in 0..relay_count {
            let seed = params.relays.get(i).cloned().unwrap_or_default();
            let id = seed
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(capability_token);
            if relays.iter().any(|r: &Relay| r.id == id) {
                return Err(HubError::Validation(format!("Duplicate relay id {}", id)));
            }
            relays.push(Relay {
                id,
                name: seed.name.unwrap_or_else(|| format!("Relay {}", i + 1)),
                is_occupied: false,
            });
        }

        let board_id = params
            .board_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(capability_token);
        let board = Board {
            board_id: board_id.clone(),
            relay_count,
            version: params.version.unwrap_or_else(|| "1.0.0".to_string()),
            build_number: params
                .build_number
                .unwrap_or_else(|| rand::thread_rng().gen_range(0..10_000)),
            relays,
            owner_id: None,
            room_id: None,
            is_suspended: false,
            additional_features: params.additional_features,
        };

        let _board_guard = self.locks.boards.acquire(&board_id).await;
        if self.store.get_board(&board_id).await?.is_some() {
            return Err(HubError::Conflict(format!(
                "Board {} already exists",
                board_id
            )));
        }
        self.store.put_board(board.clone()).await?;
        tracing::info!("Created board {} with {} relays", board_id, relay_count);
        Ok(board)
    }

    /// Assign a board to a user's room
    pub async fn register_board(
        &self,
        board_id: &str,
        user_id: &str,
        room_id: &str,
    ) -> HubResult<Board> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        let mut board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;

        // Held until the board is written so a concurrent room delete sees it
        let _user_guard = self.locks.users.acquire(user_id).await;
        let has_room = self
            .store
            .get_user_app_data(user_id)
            .await?
            .is_some_and(|data| data.room(room_id).is_some());
        if !has_room {
            return Err(HubError::NotFound("Room"));
        }

        if board.is_suspended {
            tracing::warn!("Rejected registration of suspended board {}", board_id);
            return Err(HubError::Suspended(board_id.to_string()));
        }
        match board.owner_id.as_deref() {
            Some(owner) if owner != user_id => {
                return Err(HubError::Conflict(
                    "Board is already registered to another user".to_string(),
                ));
            }
            Some(_) if board.room_id.as_deref() == Some(room_id) => return Ok(board),
            _ => {}
        }

        board.owner_id = Some(user_id.to_string());
        board.room_id = Some(room_id.to_string());
        self.store.put_board(board.clone()).await?;
        tracing::info!(
            "Board {} registered to user {} in room {}",
            board_id,
            user_id,
            room_id
        );
        self.bus.publish(HubEvent::BoardRegistered {
            board_id: board_id.to_string(),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
        });
        Ok(board)
    }

    /// Release a board: delete every appliance bound to it, free its relays
    /// and clear the owner. Returns the number of appliances removed.
    pub async fn unregister_board(&self, board_id: &str, user_id: &str) -> HubResult<usize> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        self.unregister_locked(board_id, user_id).await
    }

    /// Unregister with the board lock already held by the caller
    ///
    /// Bound appliances are removed first; if the board write then fails
    /// they are put back, so either the whole unregistration lands or none.
    pub(crate) async fn unregister_locked(&self, board_id: &str, user_id: &str) -> HubResult<usize> {
        let mut board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;
        if !board.is_owned_by(user_id) {
            return Err(HubError::Forbidden(
                "Board is not registered to you".to_string(),
            ));
        }

        let purged = self.purge_bindings(board_id).await?;
        board.reset_assignment();
        if let Err(e) = self.store.put_board(board.clone()).await {
            tracing::warn!("Unregistering board {} failed, restoring appliances: {}", board_id, e);
            self.restore_bindings(&purged).await;
            return Err(e.into());
        }
        for relay in &board.relays {
            self.queue.discard(&relay.id).await;
        }
        self.announce_purged(purged.as_slice());

        tracing::info!(
            "Board {} unregistered by user {}, {} appliances removed",
            board_id,
            user_id,
            purged.len()
        );
        self.bus.publish(HubEvent::BoardUnregistered {
            board_id: board_id.to_string(),
            user_id: user_id.to_string(),
            released_appliances: purged.len(),
        });
        Ok(purged.len())
    }

    /// Delete every appliance bound to `board_id`, across all users
    ///
    /// Caller holds the board lock. User locks are taken one at a time. A
    /// failure part way through puts back what was already removed.
    pub(crate) async fn purge_bindings(&self, board_id: &str) -> HubResult<Vec<PurgedAppliance>> {
        let user_ids: Vec<String> = self.store.get_all_app_data().await?.into_keys().collect();
        let mut purged = Vec::new();

        for user_id in user_ids {
            let user_guard = self.locks.users.acquire(&user_id).await;
            let removed = match self.store.get_user_app_data(&user_id).await {
                Ok(Some(mut data)) => {
                    let removed = data.remove_bound_to(board_id);
                    if removed.is_empty() {
                        continue;
                    }
                    self.store
                        .put_user_app_data(&user_id, data)
                        .await
                        .map(|()| removed)
                }
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            drop(user_guard);

            match removed {
                Ok(removed) => {
                    purged.extend(removed.into_iter().map(|(room_id, appliance)| PurgedAppliance {
                        user_id: user_id.clone(),
                        room_id,
                        appliance,
                    }));
                }
                Err(e) => {
                    tracing::warn!(
                        "Purging appliances of board {} failed at user {}: {}",
                        board_id,
                        user_id,
                        e
                    );
                    self.restore_bindings(&purged).await;
                    return Err(e.into());
                }
            }
        }
        Ok(purged)
    }

    /// Put purged appliances back into their rooms. Best effort: a failure
    /// is logged and shows up in the relay audit.
    pub(crate) async fn restore_bindings(&self, purged: &[PurgedAppliance]) {
        let mut by_user: BTreeMap<&str, Vec<&PurgedAppliance>> = BTreeMap::new();
        for entry in purged {
            by_user.entry(entry.user_id.as_str()).or_default().push(entry);
        }

        for (user_id, entries) in by_user {
            let _user_guard = self.locks.users.acquire(user_id).await;
            let mut data = match self.store.get_user_app_data(user_id).await {
                Ok(data) => data.unwrap_or_default(),
                Err(e) => {
                    tracing::error!("Could not restore appliances of user {}: {}", user_id, e);
                    continue;
                }
            };
            for entry in entries {
                match data.room_mut(&entry.room_id) {
                    Some(room) => room.appliances.push(entry.appliance.clone()),
                    None => tracing::error!(
                        "Room {} of user {} is gone, appliance {} not restored",
                        entry.room_id,
                        user_id,
                        entry.appliance.id
                    ),
                }
            }
            if let Err(e) = self.store.put_user_app_data(user_id, data).await {
                tracing::error!("Could not restore appliances of user {}: {}", user_id, e);
            }
        }
    }

    fn announce_purged(&self, purged: &[PurgedAppliance]) {
        for entry in purged {
            tracing::debug!(
                "Removed appliance {} of user {} bound to board {}",
                entry.appliance.id,
                entry.user_id,
                entry.appliance.board_id
            );
            self.bus.publish(HubEvent::ApplianceRemoved {
                user_id: entry.user_id.clone(),
                room_id: entry.room_id.clone(),
                appliance_id: entry.appliance.id.clone(),
            });
        }
    }

    pub async fn set_suspended(&self, board_id: &str, suspended: bool) -> HubResult<Board> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        let mut board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;
        board.is_suspended = suspended;
        self.store.put_board(board.clone()).await?;
        tracing::info!(
            "Board {} {}",
            board_id,
            if suspended { "suspended" } else { "reinstated" }
        );
        Ok(board)
    }

    /// Remove a board from the inventory, cascading like unregistration
    pub async fn delete_board(&self, board_id: &str) -> HubResult<usize> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        let board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;
        self.delete_locked(board).await
    }

    async fn delete_locked(&self, board: Board) -> HubResult<usize> {
        let purged = self.purge_bindings(&board.board_id).await?;
        if let Err(e) = self.store.remove_board(&board.board_id).await {
            tracing::warn!("Deleting board {} failed, restoring appliances: {}", board.board_id, e);
            self.restore_bindings(&purged).await;
            return Err(e.into());
        }
        for relay in &board.relays {
            self.queue.discard(&relay.id).await;
        }
        self.announce_purged(purged.as_slice());
        tracing::info!(
            "Deleted board {}, {} appliances removed",
            board.board_id,
            purged.len()
        );
        if let Some(owner) = board.owner_id {
            self.bus.publish(HubEvent::BoardUnregistered {
                board_id: board.board_id,
                user_id: owner,
                released_appliances: purged.len(),
            });
        }
        Ok(purged.len())
    }

    /// Delete several boards; ids that do not exist are skipped.
    /// Returns the number of boards deleted.
    pub async fn delete_boards(&self, board_ids: &[String]) -> HubResult<usize> {
        if board_ids.is_empty() {
            return Err(HubError::Validation("No board ids given".to_string()));
        }
        let mut deleted = 0;
        for board_id in board_ids {
            let _board_guard = self.locks.boards.acquire(board_id).await;
            let Some(board) = self.store.get_board(board_id).await? else {
                tracing::debug!("Skipping missing board {} in bulk delete", board_id);
                continue;
            };
            self.delete_locked(board).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    pub async fn delete_all_boards(&self) -> HubResult<usize> {
        let ids: Vec<String> = self.store.get_boards().await?.into_keys().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.delete_boards(&ids).await
    }

    pub async fn list_all(&self) -> HubResult<Vec<Board>> {
        Ok(self.store.get_boards().await?.into_values().collect())
    }

    pub async fn get_by_owner(&self, user_id: &str) -> HubResult<Vec<Board>> {
        Ok(self
            .store
            .get_boards()
            .await?
            .into_values()
            .filter(|b| b.is_owned_by(user_id))
            .collect())
    }

    pub async fn get(&self, board_id: &str) -> HubResult<Option<Board>> {
        Ok(self.store.get_board(board_id).await?)
    }

    /// Ownership check shared by every appliance path
    pub async fn assert_owns_board(&self, user_id: &str, board_id: &str) -> HubResult<Board> {
        let board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;
        check_ownership(&board, user_id)?;
        Ok(board)
    }
}

/// `Forbidden` unless `user_id` owns the board, `Suspended` if it is suspended
pub(crate) fn check_ownership(board: &Board, user_id: &str) -> HubResult<()> {
    if !board.is_owned_by(user_id) {
        return Err(HubError::Forbidden(
            "You do not own this board".to_string(),
        ));
    }
    if board.is_suspended {
        return Err(HubError::Suspended(board.board_id.clone()));
    }
    Ok(())
}
