use serde::Serialize;

use super::{apply_order, ApplianceManager};
use crate::boards::allocator::{release_in, reserve_in};
use crate::boards::registry::check_ownership;
use crate::bus::HubEvent;
use crate::error::{HubError, HubResult};
use crate::model::{short_id, Appliance, RelayCommand, UserAppData};

/// Result of a state toggle, with the names the dashboard message needs
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub appliance: Appliance,
    pub room_name: String,
}

fn validate_name(name: &str) -> HubResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HubError::Validation("Name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

impl ApplianceManager {
    pub(super) async fn load_data(&self, user_id: &str) -> HubResult<UserAppData> {
        self.store
            .get_user_app_data(user_id)
            .await?
            .ok_or(HubError::NotFound("User data"))
    }

    /// Reserve the relay and create the appliance, or do neither
    pub async fn add_appliance(
        &self,
        user_id: &str,
        room_id: &str,
        board_id: &str,
        relay_id: &str,
        name: &str,
    ) -> HubResult<Appliance> {
        let name = validate_name(name)?;

        let _board_guard = self.locks.boards.acquire(board_id).await;
        let user_guard = self.locks.users.acquire(user_id).await;

        let mut data = self.load_data(user_id).await?;
        if data.room(room_id).is_none() {
            return Err(HubError::NotFound("Room"));
        }
        let mut board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or(HubError::NotFound("Board"))?;
        check_ownership(&board, user_id)?;
        if let Some((_, bound)) = data
            .appliances()
            .find(|(_, a)| a.is_bound_to(board_id, relay_id))
        {
            if board.relay(relay_id).is_some_and(|r| !r.is_occupied) {
                return Err(HubError::Invariant(format!(
                    "relay {} of board {} is marked free but bound to appliance {}",
                    relay_id, board_id, bound.id
                )));
            }
        }
        reserve_in(&mut board, relay_id)?;
        self.store.put_board(board.clone()).await?;

        let appliance = Appliance {
            id: short_id(),
            name,
            state: false,
            locked: false,
            timer: None,
            board_id: board_id.to_string(),
            relay_id: relay_id.to_string(),
        };
        if let Some(room) = data.room_mut(room_id) {
            room.appliances.push(appliance.clone());
        }

        if let Err(e) = self.store.put_user_app_data(user_id, data).await {
            tracing::warn!(
                "Rolling back reservation of relay {} on board {}: {}",
                relay_id,
                board_id,
                e
            );
            release_in(&mut board, relay_id);
            if let Err(rollback) = self.store.put_board(board).await {
                tracing::error!(
                    "Rollback of relay {} on board {} failed: {}",
                    relay_id,
                    board_id,
                    rollback
                );
            }
            return Err(e.into());
        }
        drop(user_guard);

        tracing::info!(
            "User {} added appliance {} on relay {} of board {}",
            user_id,
            appliance.id,
            relay_id,
            board_id
        );
        self.bus.publish(HubEvent::ApplianceAdded {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            appliance_id: appliance.id.clone(),
        });
        Ok(appliance)
    }

    /// Remove an appliance and free its relay
    pub async fn delete_appliance(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
    ) -> HubResult<Appliance> {
        // Binding never changes, so an unlocked peek is enough to pick the board lock
        let board_id = self
            .load_data(user_id)
            .await?
            .room(room_id)
            .ok_or(HubError::NotFound("Room"))?
            .appliance(appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?
            .board_id
            .clone();

        let _board_guard = self.locks.boards.acquire(&board_id).await;
        let user_guard = self.locks.users.acquire(user_id).await;

        let mut data = self.load_data(user_id).await?;
        let room = data.room_mut(room_id).ok_or(HubError::NotFound("Room"))?;
        let pos = room
            .appliances
            .iter()
            .position(|a| a.id == appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?;
        let removed = room.appliances.remove(pos);

        // Relay first, binding second; a failed binding write re-occupies it
        let mut released_board = None;
        if let Some(mut board) = self.store.get_board(&removed.board_id).await? {
            if release_in(&mut board, &removed.relay_id) {
                self.store.put_board(board.clone()).await?;
                released_board = Some(board);
            } else if board.relay(&removed.relay_id).is_some() {
                tracing::error!(
                    "Appliance {} was bound to relay {} of board {} but the relay was marked free",
                    removed.id,
                    removed.relay_id,
                    removed.board_id
                );
            }
        }

        if let Err(e) = self.store.put_user_app_data(user_id, data).await {
            if let Some(mut board) = released_board {
                tracing::warn!(
                    "Rolling back release of relay {} on board {}: {}",
                    removed.relay_id,
                    removed.board_id,
                    e
                );
                if let Some(relay) = board.relay_mut(&removed.relay_id) {
                    relay.is_occupied = true;
                }
                if let Err(rollback) = self.store.put_board(board).await {
                    tracing::error!(
                        "Rollback of relay {} on board {} failed: {}",
                        removed.relay_id,
                        removed.board_id,
                        rollback
                    );
                }
            }
            return Err(e.into());
        }
        drop(user_guard);
        self.queue.discard(&removed.relay_id).await;

        tracing::info!("User {} deleted appliance {}", user_id, appliance_id);
        self.bus.publish(HubEvent::ApplianceRemoved {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            appliance_id: appliance_id.to_string(),
        });
        Ok(removed)
    }

    /// Toggle an appliance and queue the command for its relay
    ///
    /// Board ownership is re-checked on every toggle; a missing board counts
    /// as not owned.
    pub async fn set_state(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        state: bool,
    ) -> HubResult<StateChange> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        let room = data.room_mut(room_id).ok_or(HubError::NotFound("Room"))?;
        let room_name = room.name.clone();
        let appliance = room
            .appliance_mut(appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?;

        self.check_bound_board(user_id, &appliance.board_id).await?;

        appliance.state = state;
        if !state {
            appliance.timer = None;
        }
        let appliance = appliance.clone();
        self.store.put_user_app_data(user_id, data).await?;

        self.dispatch(user_id, room_id, &appliance).await;
        Ok(StateChange {
            appliance,
            room_name,
        })
    }

    pub async fn set_lock(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        locked: bool,
    ) -> HubResult<Appliance> {
        self.edit_appliance(user_id, room_id, appliance_id, |a| {
            a.locked = locked;
            Ok(())
        })
        .await
    }

    /// Record a switch-off time. Setting a timer turns the appliance on.
    pub async fn set_timer(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        timer: Option<i64>,
    ) -> HubResult<Appliance> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        let appliance = data
            .room_mut(room_id)
            .ok_or(HubError::NotFound("Room"))?
            .appliance_mut(appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?;

        if timer.is_some() {
            self.check_bound_board(user_id, &appliance.board_id).await?;
            appliance.state = true;
        }
        appliance.timer = timer;
        let appliance = appliance.clone();
        self.store.put_user_app_data(user_id, data).await?;

        if timer.is_some() {
            self.dispatch(user_id, room_id, &appliance).await;
        }
        Ok(appliance)
    }

    pub async fn rename(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        name: &str,
    ) -> HubResult<Appliance> {
        let name = validate_name(name)?;
        self.edit_appliance(user_id, room_id, appliance_id, |a| {
            a.name = name;
            Ok(())
        })
        .await
    }

    pub async fn move_to_room(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        new_room_id: &str,
    ) -> HubResult<Appliance> {
        self.update_settings(user_id, room_id, appliance_id, None, Some(new_room_id))
            .await
    }

    /// Rename and/or move in one write. The relay binding is untouched.
    pub async fn update_settings(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        name: Option<&str>,
        new_room_id: Option<&str>,
    ) -> HubResult<Appliance> {
        let name = name.map(validate_name).transpose()?;

        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        if let Some(target) = new_room_id {
            if data.room(target).is_none() {
                return Err(HubError::NotFound("Room"));
            }
        }

        let room = data.room_mut(room_id).ok_or(HubError::NotFound("Room"))?;
        let pos = room
            .appliances
            .iter()
            .position(|a| a.id == appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?;
        if let Some(name) = name {
            room.appliances[pos].name = name;
        }

        let appliance = match new_room_id {
            Some(target) if target != room_id => {
                let appliance = room.appliances.remove(pos);
                if let Some(target_room) = data.room_mut(target) {
                    target_room.appliances.push(appliance.clone());
                }
                tracing::info!(
                    "Moved appliance {} from room {} to {}",
                    appliance_id,
                    room_id,
                    target
                );
                appliance
            }
            _ => room.appliances[pos].clone(),
        };
        self.store.put_user_app_data(user_id, data).await?;
        Ok(appliance)
    }

    pub async fn reorder(&self, user_id: &str, room_id: &str, order: &[String]) -> HubResult<()> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        let room = data.room_mut(room_id).ok_or(HubError::NotFound("Room"))?;
        apply_order(&mut room.appliances, order, |a| a.id.as_str())?;
        self.store.put_user_app_data(user_id, data).await?;
        Ok(())
    }

    /// Apply `edit` to one appliance under the user lock and persist it
    async fn edit_appliance(
        &self,
        user_id: &str,
        room_id: &str,
        appliance_id: &str,
        edit: impl FnOnce(&mut Appliance) -> HubResult<()>,
    ) -> HubResult<Appliance> {
        let _user_guard = self.locks.users.acquire(user_id).await;
        let mut data = self.load_data(user_id).await?;
        let appliance = data
            .room_mut(room_id)
            .ok_or(HubError::NotFound("Room"))?
            .appliance_mut(appliance_id)
            .ok_or(HubError::NotFound("Appliance"))?;
        edit(appliance)?;
        let appliance = appliance.clone();
        self.store.put_user_app_data(user_id, data).await?;
        Ok(appliance)
    }

    /// Ownership check for the board an appliance is bound to
    async fn check_bound_board(&self, user_id: &str, board_id: &str) -> HubResult<()> {
        match self.registry.get(board_id).await? {
            Some(board) => check_ownership(&board, user_id),
            None => {
                tracing::warn!(
                    "User {} toggled an appliance bound to missing board {}",
                    user_id,
                    board_id
                );
                Err(HubError::Forbidden(
                    "You do not own this board".to_string(),
                ))
            }
        }
    }

    /// Queue the appliance's current state for its relay and announce it
    pub(super) async fn dispatch(&self, user_id: &str, room_id: &str, appliance: &Appliance) {
        self.queue
            .enqueue(&appliance.relay_id, RelayCommand::from_state(appliance.state))
            .await;
        tracing::debug!(
            "Queued {} for relay {} (appliance {})",
            if appliance.state { "ON" } else { "OFF" },
            appliance.relay_id,
            appliance.id
        );
        self.bus.publish(HubEvent::ApplianceStateChanged {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            appliance_id: appliance.id.clone(),
            state: appliance.state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::{BoardLimits, BoardRegistry, NewBoard, RelayAllocator};
    use crate::bus::create_bus;
    use crate::locks::HubLocks;
    use crate::model::Room;
    use crate::queue::{CommandQueue, MemoryCommandQueue, SharedQueue};
    use crate::store::{DataStore, MemoryStore};
    use std::sync::Arc;

    struct Fixture {
        manager: ApplianceManager,
        registry: BoardRegistry,
        queue: SharedQueue,
        store: Arc<MemoryStore>,
        board_id: String,
        relays: Vec<String>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let data = UserAppData {
            rooms: vec![
                Room {
                    id: "kitchen".to_string(),
                    name: "Kitchen".to_string(),
                    ai_control: false,
                    appliances: Vec::new(),
                },
                Room {
                    id: "hall".to_string(),
                    name: "Hall".to_string(),
                    ai_control: false,
                    appliances: Vec::new(),
                },
            ],
            ..UserAppData::default()
        };
        store.put_user_app_data("alice", data).await.unwrap();

        let locks = Arc::new(HubLocks::default());
        let queue: SharedQueue = Arc::new(MemoryCommandQueue::new());
        let bus = create_bus();
        let registry = BoardRegistry::new(
            store.clone(),
            locks.clone(),
            queue.clone(),
            bus.clone(),
            BoardLimits::default(),
        );
        let allocator = RelayAllocator::new(store.clone(), locks.clone());
        let manager = ApplianceManager::new(
            store.clone(),
            locks,
            registry.clone(),
            allocator,
            queue.clone(),
            bus,
        );

        let board = registry.create_board(NewBoard::default()).await.unwrap();
        registry
            .register_board(&board.board_id, "alice", "kitchen")
            .await
            .unwrap();
        Fixture {
            manager,
            registry,
            queue,
            store,
            relays: board.relays.iter().map(|r| r.id.clone()).collect(),
            board_id: board.board_id,
        }
    }

    #[tokio::test]
    async fn add_then_delete_releases_relay() {
        let f = fixture().await;
        let a = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[0], " Lamp ")
            .await
            .unwrap();
        assert_eq!(a.name, "Lamp");

        let err = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[0], "Fan")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));

        f.manager.delete_appliance("alice", "kitchen", &a.id).await.unwrap();
        let board = f.store.get_board(&f.board_id).await.unwrap().unwrap();
        assert!(board.relays.iter().all(|r| !r.is_occupied));
    }

    #[tokio::test]
    async fn set_state_queues_and_clears_timer() {
        let f = fixture().await;
        let a = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[1], "Heater")
            .await
            .unwrap();

        let on = f
            .manager
            .set_timer("alice", "kitchen", &a.id, Some(1_700_000_000_000))
            .await
            .unwrap();
        assert!(on.state);
        assert_eq!(f.queue.poll(&f.relays[1]).await, Some(RelayCommand { state: 1 }));

        let change = f
            .manager
            .set_state("alice", "kitchen", &a.id, false)
            .await
            .unwrap();
        assert_eq!(change.room_name, "Kitchen");
        assert_eq!(change.appliance.timer, None);
        assert_eq!(f.queue.poll(&f.relays[1]).await, Some(RelayCommand { state: 0 }));
    }

    #[tokio::test]
    async fn suspended_board_blocks_toggle() {
        let f = fixture().await;
        let a = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[0], "Lamp")
            .await
            .unwrap();
        f.registry.set_suspended(&f.board_id, true).await.unwrap();

        let err = f
            .manager
            .set_state("alice", "kitchen", &a.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Suspended(_)));
        assert_eq!(f.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn update_settings_moves_without_rebinding() {
        let f = fixture().await;
        let a = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[2], "Lamp")
            .await
            .unwrap();

        let moved = f
            .manager
            .update_settings("alice", "kitchen", &a.id, Some("Desk lamp"), Some("hall"))
            .await
            .unwrap();
        assert_eq!(moved.name, "Desk lamp");
        assert_eq!(moved.relay_id, f.relays[2]);

        let data = f.store.get_user_app_data("alice").await.unwrap().unwrap();
        assert!(data.room("kitchen").unwrap().appliances.is_empty());
        assert_eq!(data.room("hall").unwrap().appliances.len(), 1);

        assert!(matches!(
            f.manager.move_to_room("alice", "hall", &a.id, "attic").await,
            Err(HubError::NotFound("Room"))
        ));
    }

    #[tokio::test]
    async fn reorder_appliances() {
        let f = fixture().await;
        let first = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[0], "One")
            .await
            .unwrap();
        let second = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[1], "Two")
            .await
            .unwrap();

        f.manager
            .reorder("alice", "kitchen", &[second.id.clone()])
            .await
            .unwrap();
        let data = f.store.get_user_app_data("alice").await.unwrap().unwrap();
        let ids: Vec<_> = data
            .room("kitchen")
            .unwrap()
            .appliances
            .iter()
            .map(|a| a.id.clone())
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn relay_marked_free_while_bound_is_an_invariant_error() {
        let f = fixture().await;
        let lamp = f
            .manager
            .add_appliance("alice", "kitchen", &f.board_id, &f.relays[2], "Lamp")
            .await
            .unwrap();

        // Flag drifts behind the manager's back
        let mut board = f.store.get_board(&f.board_id).await.unwrap().unwrap();
        board.relay_mut(&f.relays[2]).unwrap().is_occupied = false;
        f.store.put_board(board).await.unwrap();

        let err = f
            .manager
            .add_appliance("alice", "hall", &f.board_id, &f.relays[2], "Second lamp")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Invariant(_)));
        assert!(err.is_internal());

        // Deleting the bound appliance converges the record
        f.manager.delete_appliance("alice", "kitchen", &lamp.id).await.unwrap();
        let board = f.store.get_board(&f.board_id).await.unwrap().unwrap();
        assert!(!board.relay(&f.relays[2]).unwrap().is_occupied);
        let data = f.store.get_user_app_data("alice").await.unwrap().unwrap();
        assert_eq!(data.appliances().count(), 0);
    }
}
