pub mod handle;
#[cfg(test)]
pub mod mock;
pub mod mqtt;
pub mod serial;
pub mod subscriptions;
pub mod traits;

pub use handle::TransportHandle;
pub use mqtt::{MqttConnector, MqttTransport};
pub use serial::{SerialConnector, SerialTransport};
pub use subscriptions::SubscriptionFilter;
pub use traits::{Transport, TransportConnector, TransportEvents};
