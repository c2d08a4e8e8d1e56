//! Appliances and rooms
//!
//! Appliances live inside rooms in the user's app data and bind to exactly
//! one (board, relay) pair. All mutations of a user's rooms run under that
//! user's keyed lock; paths that also flip relay occupancy take the board
//! lock first.

mod manager;
mod rooms;

pub use manager::StateChange;

use crate::boards::{BoardRegistry, RelayAllocator};
use crate::bus::SharedBus;
use crate::locks::SharedLocks;
use crate::queue::SharedQueue;
use crate::store::SharedStore;

#[derive(Clone)]
pub struct ApplianceManager {
    store: SharedStore,
    locks: SharedLocks,
    registry: BoardRegistry,
    allocator: RelayAllocator,
    queue: SharedQueue,
    bus: SharedBus,
}

impl ApplianceManager {
    pub fn new(
        store: SharedStore,
        locks: SharedLocks,
        registry: BoardRegistry,
        allocator: RelayAllocator,
        queue: SharedQueue,
        bus: SharedBus,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            allocator,
            queue,
            bus,
        }
    }
}

/// Move the listed ids to the front in the given order, keeping the rest in
/// their current relative order. Unknown ids are rejected.
pub(crate) fn apply_order<T>(
    items: &mut Vec<T>,
    order: &[String],
    id_of: impl Fn(&T) -> &str,
) -> crate::error::HubResult<()> {
    if let Some(unknown) = order.iter().find(|id| !items.iter().any(|i| id_of(i) == id.as_str())) {
        return Err(crate::error::HubError::Validation(format!(
            "Unknown id {} in order",
            unknown
        )));
    }
    let mut rest = std::mem::take(items);
    for id in order {
        if let Some(pos) = rest.iter().position(|i| id_of(i) == id.as_str()) {
            items.push(rest.remove(pos));
        }
    }
    items.append(&mut rest);
    Ok(())
}
