//! Luminous Hub
//!
//! Multi-tenant smart-home control backend. Users register relay boards,
//! bind relays to appliances organized into rooms, and toggle them from the
//! dashboard or from AI detection signals. Boards poll a relay-keyed
//! check-in queue for pending commands.
//!
//! This library provides:
//! - Board registry and relay allocation with exclusive ownership
//! - Appliance and room management
//! - Command delivery queue for polling devices
//! - HTTP API with Server-Sent Events
//! - MQTT command mirror and detection notifications

pub mod api;
pub mod appliances;
pub mod boards;
pub mod bus;
pub mod config;
pub mod error;
pub mod locks;
pub mod model;
pub mod mqtt;
pub mod notify;
pub mod queue;
pub mod store;
