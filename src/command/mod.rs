//! Command execution for the bridge
//!
//! This module handles:
//! - Dispatching decoded commands to the connection manager and session store
//! - Mapping every outcome to a branchable reply
//! - Tracking the listeners each bridge client registered

mod executor;
mod listeners;

pub use executor::CommandExecutor;
pub use listeners::ListenerTable;
