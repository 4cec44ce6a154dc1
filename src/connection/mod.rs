//! Connection lifecycle management
//!
//! This module handles:
//! - The registry of connection ids, their lifecycle state and handles
//! - Routing of tagged events to per-id listeners
//! - The manager facade that validates and executes connection commands

mod manager;
pub mod registry;
pub mod router;

pub use manager::{ConnectionManager, ManagerSettings};
pub use registry::ConnectionRegistry;
pub use router::{Disposer, EventRouter, EventSink, Listener};
