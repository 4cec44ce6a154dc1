//! Local bridge between the UI and the connection manager
//!
//! This module handles:
//! - The loopback TCP endpoint and its accept loop
//! - Per-client framing, command dispatch and event push

mod client;
mod server;

pub use server::{BridgeError, BridgeServer};
