//! Relay allocation
//!
//! Occupancy lives on the relay itself (`is_occupied`) and is never derived
//! by scanning appliances on the hot path. Every path that creates or
//! destroys an appliance flips the flag under the board lock. [`audit`]
//! recomputes occupancy from appliances to detect drift.
//!
//! [`audit`]: RelayAllocator::audit

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{HubError, HubResult};
use crate::locks::SharedLocks;
use crate::model::Board;
use crate::store::SharedStore;

/// Relay as offered to the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaySlot {
    pub id: String,
    pub name: String,
}

/// Free relays of one board
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreeRelays {
    pub board_id: String,
    pub relays: Vec<RelaySlot>,
}

/// Occupancy drift found by [`RelayAllocator::audit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// More than one appliance bound to the same relay
    DoubleBooked {
        board_id: String,
        relay_id: String,
        appliance_ids: Vec<String>,
    },
    /// Relay flagged occupied but no appliance is bound to it
    OccupiedUnbound { board_id: String, relay_id: String },
    /// Appliance bound to a relay flagged free
    BoundButFree {
        board_id: String,
        relay_id: String,
        appliance_id: String,
    },
    /// Appliance bound to a board or relay that does not exist
    Dangling {
        user_id: String,
        appliance_id: String,
        board_id: String,
        relay_id: String,
    },
    /// Appliance bound to a board its owner does not own
    ForeignBoard {
        user_id: String,
        appliance_id: String,
        board_id: String,
    },
}

/// Mark `relay_id` occupied. Fails if the relay is missing or taken.
pub(crate) fn reserve_in(board: &mut Board, relay_id: &str) -> HubResult<()> {
    let relay = board
        .relay_mut(relay_id)
        .ok_or_else(|| HubError::Conflict("Relay is not available".to_string()))?;
    if relay.is_occupied {
        return Err(HubError::Conflict("Relay is already in use".to_string()));
    }
    relay.is_occupied = true;
    Ok(())
}

/// Mark `relay_id` free. Returns whether anything changed.
pub(crate) fn release_in(board: &mut Board, relay_id: &str) -> bool {
    match board.relay_mut(relay_id) {
        Some(relay) if relay.is_occupied => {
            relay.is_occupied = false;
            true
        }
        _ => false,
    }
}

#[derive(Clone)]
pub struct RelayAllocator {
    store: SharedStore,
    locks: SharedLocks,
}

impl RelayAllocator {
    pub fn new(store: SharedStore, locks: SharedLocks) -> Self {
        Self { store, locks }
    }

    /// Free relays on every board the user owns in `room_id`
    pub async fn free_relays_for(&self, user_id: &str, room_id: &str) -> HubResult<Vec<FreeRelays>> {
        let boards = self.store.get_boards().await?;
        Ok(boards
            .into_values()
            .filter(|b| b.is_owned_by(user_id) && b.room_id.as_deref() == Some(room_id))
            .filter(|b| !b.is_suspended)
            .map(|b| FreeRelays {
                relays: b
                    .free_relays()
                    .map(|r| RelaySlot {
                        id: r.id.clone(),
                        name: r.name.clone(),
                    })
                    .collect(),
                board_id: b.board_id,
            })
            .collect())
    }

    /// Atomically take a free relay
    pub async fn reserve(&self, board_id: &str, relay_id: &str) -> HubResult<()> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        let mut board = self
            .store
            .get_board(board_id)
            .await?
            .ok_or_else(|| HubError::Conflict("Relay is not available".to_string()))?;
        reserve_in(&mut board, relay_id)?;
        self.store.put_board(board).await?;
        tracing::debug!("Reserved relay {} on board {}", relay_id, board_id);
        Ok(())
    }

    /// Free a relay. Releasing a free relay, or one whose board is gone, is a
    /// no-op; returns whether the flag changed.
    pub async fn release(&self, board_id: &str, relay_id: &str) -> HubResult<bool> {
        let _board_guard = self.locks.boards.acquire(board_id).await;
        let Some(mut board) = self.store.get_board(board_id).await? else {
            tracing::debug!("Release on missing board {}, nothing to do", board_id);
            return Ok(false);
        };
        if !release_in(&mut board, relay_id) {
            return Ok(false);
        }
        self.store.put_board(board).await?;
        tracing::debug!("Released relay {} on board {}", relay_id, board_id);
        Ok(true)
    }

    /// Recompute occupancy from all appliances and compare with the flags
    ///
    /// Reads a snapshot without locks; run it on a quiet system for an exact
    /// answer.
    pub async fn audit(&self) -> HubResult<Vec<Discrepancy>> {
        let boards = self.store.get_boards().await?;
        let all_data = self.store.get_all_app_data().await?;

        let mut bindings: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        let mut found = Vec::new();

        for (user_id, data) in &all_data {
            for (_, appliance) in data.appliances() {
                let relay = boards
                    .get(&appliance.board_id)
                    .and_then(|b| b.relay(&appliance.relay_id).map(|r| (b, r)));
                let Some((board, relay)) = relay else {
                    found.push(Discrepancy::Dangling {
                        user_id: user_id.clone(),
                        appliance_id: appliance.id.clone(),
                        board_id: appliance.board_id.clone(),
                        relay_id: appliance.relay_id.clone(),
                    });
                    continue;
                };
                if !board.is_owned_by(user_id) {
                    found.push(Discrepancy::ForeignBoard {
                        user_id: user_id.clone(),
                        appliance_id: appliance.id.clone(),
                        board_id: board.board_id.clone(),
                    });
                }
                if !relay.is_occupied {
                    found.push(Discrepancy::BoundButFree {
                        board_id: board.board_id.clone(),
                        relay_id: relay.id.clone(),
                        appliance_id: appliance.id.clone(),
                    });
                }
                bindings
                    .entry((board.board_id.clone(), relay.id.clone()))
                    .or_default()
                    .push(appliance.id.clone());
            }
        }

        for board in boards.values() {
            for relay in &board.relays {
                let key = (board.board_id.clone(), relay.id.clone());
                match bindings.get(&key) {
                    None if relay.is_occupied => found.push(Discrepancy::OccupiedUnbound {
                        board_id: key.0,
                        relay_id: key.1,
                    }),
                    Some(ids) if ids.len() > 1 => found.push(Discrepancy::DoubleBooked {
                        board_id: key.0,
                        relay_id: key.1,
                        appliance_ids: ids.clone(),
                    }),
                    _ => {}
                }
            }
        }

        if !found.is_empty() {
            tracing::error!("Relay audit found {} discrepancies", found.len());
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::HubLocks;
    use crate::model::{Appliance, Relay, Room, UserAppData};
    use crate::store::{DataStore, MemoryStore};
    use std::sync::Arc;

    fn board(owner: Option<&str>, room: Option<&str>) -> Board {
        Board {
            board_id: "b1".to_string(),
            relay_count: 2,
            version: "1.0.0".to_string(),
            build_number: 1,
            relays: vec![
                Relay {
                    id: "r0".to_string(),
                    name: "Relay 1".to_string(),
                    is_occupied: false,
                },
                Relay {
                    id: "r1".to_string(),
                    name: "Relay 2".to_string(),
                    is_occupied: false,
                },
            ],
            owner_id: owner.map(str::to_string),
            room_id: room.map(str::to_string),
            is_suspended: false,
            additional_features: serde_json::Value::Null,
        }
    }

    fn allocator(store: Arc<MemoryStore>) -> RelayAllocator {
        RelayAllocator::new(store, Arc::new(HubLocks::default()))
    }

    #[test]
    fn reserve_in_rejects_taken_and_unknown_relays() {
        let mut b = board(None, None);
        reserve_in(&mut b, "r0").unwrap();
        assert!(matches!(reserve_in(&mut b, "r0"), Err(HubError::Conflict(_))));
        assert!(matches!(reserve_in(&mut b, "nope"), Err(HubError::Conflict(_))));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut b = board(Some("u1"), Some("room"));
        b.relays[0].is_occupied = true;
        store.put_board(b).await.unwrap();
        let alloc = allocator(store.clone());

        assert!(alloc.release("b1", "r0").await.unwrap());
        assert!(!alloc.release("b1", "r0").await.unwrap());
        assert!(!alloc.release("missing-board", "r0").await.unwrap());

        let stored = store.get_board("b1").await.unwrap().unwrap();
        assert!(!stored.relays[0].is_occupied);
    }

    #[tokio::test]
    async fn free_relays_only_for_owner_and_room() {
        let store = Arc::new(MemoryStore::new());
        let mut b = board(Some("u1"), Some("kitchen"));
        b.relays[1].is_occupied = true;
        store.put_board(b).await.unwrap();
        let alloc = allocator(store);

        let free = alloc.free_relays_for("u1", "kitchen").await.unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].relays.len(), 1);
        assert_eq!(free[0].relays[0].id, "r0");

        assert!(alloc.free_relays_for("u1", "hall").await.unwrap().is_empty());
        assert!(alloc.free_relays_for("u2", "kitchen").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn audit_reports_drift() {
        let store = Arc::new(MemoryStore::new());
        let mut b = board(Some("u1"), Some("kitchen"));
        b.relays[1].is_occupied = true;
        store.put_board(b).await.unwrap();

        let appliance = |id: &str| Appliance {
            id: id.to_string(),
            name: id.to_string(),
            state: false,
            locked: false,
            timer: None,
            board_id: "b1".to_string(),
            relay_id: "r0".to_string(),
        };
        let data = UserAppData {
            rooms: vec![Room {
                id: "kitchen".to_string(),
                name: "Kitchen".to_string(),
                ai_control: false,
                appliances: vec![appliance("a1"), appliance("a2")],
            }],
            ..UserAppData::default()
        };
        store.put_user_app_data("u1", data).await.unwrap();

        let found = allocator(store).audit().await.unwrap();
        assert!(found.contains(&Discrepancy::OccupiedUnbound {
            board_id: "b1".to_string(),
            relay_id: "r1".to_string(),
        }));
        assert!(found.contains(&Discrepancy::DoubleBooked {
            board_id: "b1".to_string(),
            relay_id: "r0".to_string(),
            appliance_ids: vec!["a1".to_string(), "a2".to_string()],
        }));
        assert!(found
            .iter()
            .any(|d| matches!(d, Discrepancy::BoundButFree { .. })));
    }
}
