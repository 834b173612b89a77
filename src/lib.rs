//! Authoritative server for a multi-player, multi-layer 3D maze game:
//! WebSocket game protocol, HTTP status surface, operator console, and
//! JSON-file persistence around a single shared game state.

pub mod broadcast;
pub mod console;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod http_api;
pub mod maze;
pub mod mazegen;
pub mod net;
pub mod registry;
pub mod rng;
pub mod server;
pub mod state;
pub mod store;
pub mod types;
