//! Domain records shared by the store, the registry and the HTTP layer
//!
//! Boards own their relays. Rooms live inside a user's app data record and
//! own their appliances. An appliance points at exactly one (board, relay)
//! pair; the relay's `is_occupied` flag is the cached source of truth for
//! whether that pair is taken.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Bytes of entropy in board and relay ids (128 bits).
const TOKEN_BYTES: usize = 16;

/// Generate an unguessable hex token.
///
/// Board and relay ids double as capabilities (QR codes, device check-in),
/// so they come from the OS RNG.
pub fn capability_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Short random id for rooms and appliances (not a capability).
pub fn short_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One switch slot on a board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_occupied: bool,
}

/// Physical relay controller record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub board_id: String,
    #[serde(alias = "number_of_relays")]
    pub relay_count: usize,
    #[serde(alias = "version_number")]
    pub version: String,
    pub build_number: u32,
    pub relays: Vec<Relay>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub is_suspended: bool,
    #[serde(default)]
    pub additional_features: Value,
}

impl Board {
    pub fn relay(&self, relay_id: &str) -> Option<&Relay> {
        self.relays.iter().find(|r| r.id == relay_id)
    }

    pub fn relay_mut(&mut self, relay_id: &str) -> Option<&mut Relay> {
        self.relays.iter_mut().find(|r| r.id == relay_id)
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Owner and room are either both set or both unset.
    pub fn assignment_is_consistent(&self) -> bool {
        self.owner_id.is_some() == self.room_id.is_some()
    }

    /// Drop the owner/room assignment and free every relay.
    pub fn reset_assignment(&mut self) {
        self.owner_id = None;
        self.room_id = None;
        for relay in &mut self.relays {
            relay.is_occupied = false;
        }
    }

    pub fn free_relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.iter().filter(|r| !r.is_occupied)
    }
}

/// User-facing controllable device, bound to one relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appliance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub locked: bool,
    /// Scheduled switch-off time (epoch millis); recorded intent only
    #[serde(default)]
    pub timer: Option<i64>,
    pub board_id: String,
    pub relay_id: String,
}

impl Appliance {
    pub fn is_bound_to(&self, board_id: &str, relay_id: &str) -> bool {
        self.board_id == board_id && self.relay_id == relay_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ai_control: bool,
    #[serde(default)]
    pub appliances: Vec<Appliance>,
}

impl Room {
    pub fn appliance(&self, appliance_id: &str) -> Option<&Appliance> {
        self.appliances.iter().find(|a| a.id == appliance_id)
    }

    pub fn appliance_mut(&mut self, appliance_id: &str) -> Option<&mut Appliance> {
        self.appliances.iter_mut().find(|a| a.id == appliance_id)
    }
}

/// Per-user application state (the `data` collection entry)
///
/// Fields owned by other parts of the system (settings, theme, ...) are kept
/// verbatim in `extra` so a round trip through this crate never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAppData {
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserAppData {
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.iter_mut().find(|r| r.id == room_id)
    }

    pub fn appliances(&self) -> impl Iterator<Item = (&Room, &Appliance)> {
        self.rooms
            .iter()
            .flat_map(|room| room.appliances.iter().map(move |a| (room, a)))
    }

    /// Remove every appliance bound to `board_id`, returning
    /// `(room_id, appliance)` for each removed one.
    pub fn remove_bound_to(&mut self, board_id: &str) -> Vec<(String, Appliance)> {
        let mut removed = Vec::new();
        for room in &mut self.rooms {
            let (gone, kept): (Vec<_>, Vec<_>) = room
                .appliances
                .drain(..)
                .partition(|a| a.board_id == board_id);
            room.appliances = kept;
            removed.extend(gone.into_iter().map(|a| (room.id.clone(), a)));
        }
        removed
    }
}

/// Authentication record (the `users` collection entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_suspended: bool,
}

/// Pending command for one relay, as the device sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    /// 1 = on, 0 = off
    pub state: u8,
}

impl RelayCommand {
    pub fn from_state(on: bool) -> Self {
        Self { state: u8::from(on) }
    }

    pub fn is_on(&self) -> bool {
        self.state != 0
    }
}
