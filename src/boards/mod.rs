//! Board inventory, ownership and relay allocation
//!
//! - `registry`: board lifecycle (create, register, unregister, suspend,
//!   delete) and the shared ownership check
//! - `allocator`: free-relay queries, reserve/release and occupancy audit

pub mod allocator;
pub mod registry;

pub use allocator::{Discrepancy, FreeRelays, RelayAllocator, RelaySlot};
pub use registry::{BoardRegistry, NewBoard, RelaySeed};

use serde::Deserialize;

/// Relay count bounds for newly created boards
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BoardLimits {
    #[serde(default = "default_relay_count")]
    pub default_relay_count: usize,
    #[serde(default = "max_relay_count")]
    pub max_relay_count: usize,
}

fn default_relay_count() -> usize {
    4
}

fn max_relay_count() -> usize {
    16
}

impl Default for BoardLimits {
    fn default() -> Self {
        Self {
            default_relay_count: default_relay_count(),
            max_relay_count: max_relay_count(),
        }
    }
}
