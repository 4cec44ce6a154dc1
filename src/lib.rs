//! portmux: a privileged host that owns serial ports and MQTT sessions on
//! behalf of an untrusted UI, multiplexing them by connection id.

pub mod bridge;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod transport;

pub use portmux_shared as shared;
