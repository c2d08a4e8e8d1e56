use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use super::{apply_order, ApplianceManager};
use crate::boards::allocator::release_in;
use crate::bus::HubEvent;
use crate::error::{HubError, HubResult};
use crate::model::{short_id, Appliance, Board, Room, UserAppData};

/// Passes before a room delete gives up on a room that keeps changing
const ROOM_DELETE_ATTEMPTS: usize = 3;

impl ApplianceManager {
    pub async fn list_rooms(&self, user_id: &str) -> HubResult<Vec<Room>> {
        Ok(self
            .store
            .get_user_app_data(user_id)
            .await?
            .map(|data| data.rooms)
            .unwrap_or_default())
    }

    /// Create an empty room; a user without app data gets a fresh record
    pub async fn add_room(&self, user_id: &str, name: &str) -> HubResult<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(HubError::Validation("Room name must not be empty".to_string()));
        }

        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self
            .store
            .get_user_app_data(user_id)
            .await?
            .unwrap_or_default();
        let room = Room {
            id: short_id(),
            name: name.to_string(),
            ai_control: false,
            appliances: Vec::new(),
        };
        data.rooms.push(room.clone());
        self.store.put_user_app_data(user_id, data).await?;
        tracing::info!("User {} added room {}", user_id, room.id);
        Ok(room)
    }

    pub async fn update_room_settings(
        &self,
        user_id: &str,
        room_id: &str,
        name: Option<&str>,
        ai_control: Option<bool>,
    ) -> HubResult<Room> {
        let name = match name.map(str::trim) {
            Some("") => {
                return Err(HubError::Validation("Room name must not be empty".to_string()))
            }
            other => other.map(str::to_string),
        };

        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        let room = data.room_mut(room_id).ok_or(HubError::NotFound("Room"))?;
        if let Some(name) = name {
            room.name = name;
        }
        if let Some(ai_control) = ai_control {
            room.ai_control = ai_control;
        }
        let room = room.clone();
        self.store.put_user_app_data(user_id, data).await?;
        Ok(room)
    }

    pub async fn reorder_rooms(&self, user_id: &str, order: &[String]) -> HubResult<()> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        apply_order(&mut data.rooms, order, |r| r.id.as_str())?;
        self.store.put_user_app_data(user_id, data).await?;
        Ok(())
    }

    /// Enable or disable AI control on every room
    pub async fn set_global_ai_control(&self, user_id: &str, enabled: bool) -> HubResult<usize> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        for room in &mut data.rooms {
            room.ai_control = enabled;
        }
        let count = data.rooms.len();
        self.store.put_user_app_data(user_id, data).await?;
        Ok(count)
    }

    /// Delete a room: unregister its boards, drop its remaining appliances
    /// and free their relays. Returns the number of boards unregistered.
    ///
    /// Locks every board the room touches, then the user. If the room gained
    /// a board or an appliance on another board in between, the locks are
    /// released and the pass starts over.
    pub async fn delete_room(&self, user_id: &str, room_id: &str) -> HubResult<usize> {
        let mut unregistered = 0;
        for attempt in 1..=ROOM_DELETE_ATTEMPTS {
            let (registered, bound) = self.room_footprint(user_id, room_id).await?;
            let held: BTreeSet<String> = registered.union(&bound).cloned().collect();
            let board_guards = self.locks.boards.acquire_many(held.iter().cloned()).await;

            for board_id in &registered {
                match self.registry.unregister_locked(board_id, user_id).await {
                    Ok(_) => unregistered += 1,
                    // Moved or released since the snapshot
                    Err(HubError::NotFound(_) | HubError::Forbidden(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            let user_guard = self.locks.users.acquire(user_id).await;
            let (registered, bound) = self.room_footprint(user_id, room_id).await?;
            if !registered.is_empty() || !bound.is_subset(&held) {
                drop(user_guard);
                drop(board_guards);
                tracing::debug!(
                    "Room {} changed while deleting (attempt {}), retrying",
                    room_id,
                    attempt
                );
                continue;
            }
            let removed = self.remove_room_locked(user_id, room_id).await?;
            drop(user_guard);
            drop(board_guards);

            for appliance in &removed {
                self.queue.discard(&appliance.relay_id).await;
                self.bus.publish(HubEvent::ApplianceRemoved {
                    user_id: user_id.to_string(),
                    room_id: room_id.to_string(),
                    appliance_id: appliance.id.clone(),
                });
            }
            tracing::info!(
                "User {} deleted room {} ({} boards unregistered, {} appliances removed)",
                user_id,
                room_id,
                unregistered,
                removed.len()
            );
            return Ok(unregistered);
        }
        Err(HubError::Conflict(
            "Room changed while it was being deleted, try again".to_string(),
        ))
    }

    /// Boards registered to the room, and boards its appliances are bound to
    async fn room_footprint(
        &self,
        user_id: &str,
        room_id: &str,
    ) -> HubResult<(BTreeSet<String>, BTreeSet<String>)> {
        let data = self.load_data(user_id).await?;
        let room = data.room(room_id).ok_or(HubError::NotFound("Room"))?;
        let bound = room.appliances.iter().map(|a| a.board_id.clone()).collect();
        let registered = self
            .registry
            .get_by_owner(user_id)
            .await?
            .into_iter()
            .filter(|b| b.room_id.as_deref() == Some(room_id))
            .map(|b| b.board_id)
            .collect();
        Ok((registered, bound))
    }

    /// Remove the room and free the relays of its appliances, or do neither.
    /// Caller holds the user lock and the locks of every bound board.
    async fn remove_room_locked(&self, user_id: &str, room_id: &str) -> HubResult<Vec<Appliance>> {
        let mut data = self.load_data(user_id).await?;
        let pos = data
            .rooms
            .iter()
            .position(|r| r.id == room_id)
            .ok_or(HubError::NotFound("Room"))?;
        let room = data.rooms.remove(pos);

        let mut by_board: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for appliance in &room.appliances {
            by_board
                .entry(appliance.board_id.clone())
                .or_default()
                .push(appliance.relay_id.clone());
        }

        let mut released = Vec::new();
        for (board_id, relay_ids) in by_board {
            match self.release_relays(&board_id, &relay_ids).await {
                Ok(Some(freed)) => released.push(freed),
                Ok(None) => {}
                Err(e) => {
                    self.reoccupy(released).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.store.put_user_app_data(user_id, data).await {
            tracing::warn!("Deleting room {} failed, re-occupying relays: {}", room_id, e);
            self.reoccupy(released).await;
            return Err(e.into());
        }
        Ok(room.appliances)
    }

    /// Free `relay_ids` on one board; returns the written board and the
    /// relays that actually changed
    async fn release_relays(
        &self,
        board_id: &str,
        relay_ids: &[String],
    ) -> HubResult<Option<(Board, Vec<String>)>> {
        let Some(mut board) = self.store.get_board(board_id).await? else {
            return Ok(None);
        };
        let changed: Vec<String> = relay_ids
            .iter()
            .filter(|relay_id| release_in(&mut board, relay_id))
            .cloned()
            .collect();
        if changed.is_empty() {
            return Ok(None);
        }
        self.store.put_board(board.clone()).await?;
        Ok(Some((board, changed)))
    }

    async fn reoccupy(&self, released: Vec<(Board, Vec<String>)>) {
        for (mut board, relay_ids) in released {
            for relay_id in &relay_ids {
                if let Some(relay) = board.relay_mut(relay_id) {
                    relay.is_occupied = true;
                }
            }
            if let Err(e) = self.store.put_board(board.clone()).await {
                tracing::error!(
                    "Could not re-occupy relays on board {}: {}",
                    board.board_id,
                    e
                );
            }
        }
    }

    /// Apply an AI detection result to every unlocked appliance in the room,
    /// or in all rooms when `room_id` is `None`. Returns how many appliances
    /// were set.
    pub async fn ai_detection_signal(
        &self,
        user_id: &str,
        room_id: Option<&str>,
        state: bool,
    ) -> HubResult<usize> {
        let user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        if let Some(room_id) = room_id {
            if data.room(room_id).is_none() {
                return Err(HubError::NotFound("Room"));
            }
        }

        let mut affected = Vec::new();
        for room in data
            .rooms
            .iter_mut()
            .filter(|r| room_id.map_or(true, |id| r.id == id))
        {
            for appliance in room.appliances.iter_mut().filter(|a| !a.locked) {
                appliance.state = state;
                if !state {
                    appliance.timer = None;
                }
                affected.push((room.id.clone(), appliance.clone()));
            }
        }
        record_last_command(&mut data, room_id, state);
        self.store.put_user_app_data(user_id, data).await?;

        // Still under the user lock: an unregister cannot purge in between
        let mut deliverable_boards: BTreeMap<String, bool> = BTreeMap::new();
        for (room_id, appliance) in &affected {
            let deliverable = match deliverable_boards.get(&appliance.board_id) {
                Some(known) => *known,
                None => {
                    let known = self
                        .registry
                        .get(&appliance.board_id)
                        .await?
                        .is_some_and(|b| b.is_owned_by(user_id) && !b.is_suspended);
                    deliverable_boards.insert(appliance.board_id.clone(), known);
                    known
                }
            };
            if deliverable {
                self.dispatch(user_id, room_id, appliance).await;
            } else {
                tracing::warn!(
                    "Skipping command for appliance {}: board {} not deliverable",
                    appliance.id,
                    appliance.board_id
                );
            }
        }
        drop(user_guard);

        tracing::info!(
            "Detection signal for user {} ({}): {} appliances set {}",
            user_id,
            room_id.unwrap_or("all rooms"),
            affected.len(),
            if state { "ON" } else { "OFF" }
        );
        self.bus.publish(HubEvent::DetectionSignal {
            user_id: user_id.to_string(),
            room_id: room_id.map(str::to_string),
            state,
            affected: affected.len(),
        });
        Ok(affected.len())
    }
}

fn record_last_command(data: &mut UserAppData, room_id: Option<&str>, state: bool) {
    data.extra.insert(
        "last_command".to_string(),
        json!({
            "room_id": room_id,
            "state": state,
            "timestamp": chrono::Utc::now().timestamp(),
        }),
    );
}
