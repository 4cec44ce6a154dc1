//! MQTT transport implementation
//!
//! One connection is one broker session driven by a rumqttc event loop. The
//! event loop runs in its own task; it turns incoming PUBLISH packets into
//! `MqttMessage` events and ends the session on the first error instead of
//! reconnecting, so a dropped broker always surfaces as an error plus `Closed`.

use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::subscriptions::SubscriptionFilter;
use crate::transport::traits::{Transport, TransportConnector, TransportEvents};
use async_trait::async_trait;
use portmux_shared::{
    now_ms, ConnectionConfig, ConnectionId, ErrorKind, EventPayload, MqttConfig, PublishOptions,
    QoS, TransportKind,
};
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// How long to wait for CONNACK when no timeout is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for the DISCONNECT packet to go out
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// QoS used for subscriptions
const SUBSCRIBE_QOS: rumqttc::QoS = rumqttc::QoS::AtLeastOnce;

/// A live broker session
pub struct MqttTransport {
    broker_url: String,
    client: AsyncClient,
    subscriptions: Arc<Mutex<SubscriptionFilter>>,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    fn filters(&self) -> MutexGuard<'_, SubscriptionFilter> {
        lock_filters(&self.subscriptions)
    }
}

fn lock_filters(filters: &Mutex<SubscriptionFilter>) -> MutexGuard<'_, SubscriptionFilter> {
    filters.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> ConnectionResult<()> {
        self.client
            .publish(topic, qos(options.qos), options.retain, payload.to_vec())
            .await
            .map_err(|e| ConnectionError::Publish(format!("{}: {}", topic, e)))
    }

    async fn subscribe(&mut self, filter: &str) -> ConnectionResult<()> {
        let added = self.filters().insert(filter);
        if !added {
            return Ok(());
        }

        if let Err(e) = self.client.subscribe(filter, SUBSCRIBE_QOS).await {
            self.filters().remove(filter);
            return Err(ConnectionError::Subscribe(format!("{}: {}", filter, e)));
        }
        Ok(())
    }

    /// Messages still in flight for a removed filter are dropped
    async fn unsubscribe(&mut self, filter: &str) -> ConnectionResult<()> {
        let removed = self.filters().remove(filter);
        if !removed {
            return Ok(());
        }

        if let Err(e) = self.client.unsubscribe(filter).await {
            self.filters().insert(filter);
            return Err(ConnectionError::Subscribe(format!("{}: {}", filter, e)));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(broker = %self.broker_url, error = %e, "disconnect request not queued");
        }
        if timeout(DISCONNECT_GRACE, &mut self.event_loop).await.is_err() {
            self.event_loop.abort();
        }
    }
}

/// Connector that opens broker sessions through rumqttc
pub struct MqttConnector {
    connect_timeout: Duration,
    channel_capacity: usize,
}

impl MqttConnector {
    pub fn new(connect_timeout: Duration, channel_capacity: usize) -> Self {
        Self {
            connect_timeout,
            channel_capacity: channel_capacity.max(1),
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, 64)
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn connect(
        &self,
        id: &ConnectionId,
        config: &ConnectionConfig,
        events: TransportEvents,
    ) -> ConnectionResult<Box<dyn Transport>> {
        let ConnectionConfig::Mqtt(mqtt) = config else {
            return Err(ConnectionError::InvalidArgument(format!(
                "{} is not an MQTT configuration",
                id
            )));
        };

        let options = mqtt_options(id, mqtt)?;
        let (client, mut event_loop) = AsyncClient::new(options, self.channel_capacity);

        let url = mqtt.broker_url.clone();
        let connack = match timeout(self.connect_timeout, wait_for_connack(&mut event_loop)).await {
            Err(_) => {
                return Err(ConnectionError::BrokerUnreachable {
                    url,
                    reason: "timed out waiting for CONNACK".into(),
                })
            }
            Ok(Err(rumqttc::ConnectionError::ConnectionRefused(code))) => {
                return Err(refused(url, code))
            }
            Ok(Err(e)) => {
                return Err(ConnectionError::BrokerUnreachable {
                    url,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(connack)) => connack,
        };
        if connack.code != ConnectReturnCode::Success {
            return Err(refused(url, connack.code));
        }

        info!(id = %id, broker = %mqtt.broker_url, "MQTT session established");
        let subscriptions = Arc::new(Mutex::new(SubscriptionFilter::new()));
        let event_loop = tokio::spawn(run_event_loop(
            event_loop,
            events,
            Arc::clone(&subscriptions),
            url.clone(),
        ));

        Ok(Box::new(MqttTransport {
            broker_url: url,
            client,
            subscriptions,
            event_loop,
        }))
    }

    fn name(&self) -> &'static str {
        "MQTT"
    }
}

fn mqtt_options(id: &ConnectionId, config: &MqttConfig) -> ConnectionResult<MqttOptions> {
    let (host, port) = config
        .endpoint()
        .map_err(ConnectionError::InvalidArgument)?;
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| generated_client_id(id));

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(config.clean_session);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    Ok(options)
}

/// Client ids only keep characters every broker accepts
fn generated_client_id(id: &ConnectionId) -> String {
    let safe: String = id
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(32)
        .collect();
    format!("portmux-{}-{}", safe, now_ms() % 1_000_000)
}

fn refused(url: String, code: ConnectReturnCode) -> ConnectionError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectionError::AuthRejected { url }
        }
        other => ConnectionError::BrokerUnreachable {
            url,
            reason: format!("connection refused: {:?}", other),
        },
    }
}

fn qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<ConnAck, rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(connack)) = event_loop.poll().await? {
            return Ok(connack);
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    events: TransportEvents,
    subscriptions: Arc<Mutex<SubscriptionFilter>>,
    url: String,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let wanted = lock_filters(&subscriptions).matches(&publish.topic);
                if !wanted {
                    debug!(topic = %publish.topic, "dropping message for unsubscribed topic");
                    continue;
                }
                let message = EventPayload::MqttMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(EventPayload::error(
                    ErrorKind::Disconnected,
                    format!("{} closed the session", url),
                ));
                break;
            }
            // Our own shutdown
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(EventPayload::error(
                    ErrorKind::Disconnected,
                    format!("{}: {}", url, e),
                ));
                break;
            }
        }
    }

    let _ = events.send(EventPayload::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_name() {
        let connector = MqttConnector::default();
        assert_eq!(connector.name(), "MQTT");
        assert_eq!(connector.kind(), TransportKind::Mqtt);
    }

    #[test]
    fn test_refused_codes() {
        let url = "mqtt://broker".to_string();
        assert!(matches!(
            refused(url.clone(), ConnectReturnCode::NotAuthorized),
            ConnectionError::AuthRejected { .. }
        ));
        assert!(matches!(
            refused(url.clone(), ConnectReturnCode::BadUserNamePassword),
            ConnectionError::AuthRejected { .. }
        ));
        assert!(matches!(
            refused(url, ConnectReturnCode::ServiceUnavailable),
            ConnectionError::BrokerUnreachable { .. }
        ));
    }

    #[test]
    fn test_generated_client_id_is_sanitized() {
        let client_id = generated_client_id(&"m1/üx y".into());
        assert!(client_id.starts_with("portmux-m1x"));
        assert!(client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_options_from_config() {
        let config = MqttConfig::new("mqtt://broker.local:1884").with_credentials("user", "pw");
        let options = mqtt_options(&"m1".into(), &config).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.client_id().starts_with("portmux-m1-"));
    }

    /// A transport whose event loop is gone, so every broker request fails
    fn detached_transport() -> MqttTransport {
        let options = MqttOptions::new("portmux-test", "127.0.0.1", 1883);
        let (client, event_loop) = AsyncClient::new(options, 8);
        drop(event_loop);
        MqttTransport {
            broker_url: "mqtt://127.0.0.1".into(),
            client,
            subscriptions: Arc::new(Mutex::new(SubscriptionFilter::new())),
            event_loop: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_keeps_filter() {
        let mut transport = detached_transport();
        transport.filters().insert("sensors/#");

        let result = transport.unsubscribe("sensors/#").await;
        assert!(matches!(result, Err(ConnectionError::Subscribe(_))));
        assert!(transport.filters().matches("sensors/temp"));

        // Not subscribed, so nothing reaches the broker
        assert!(transport.unsubscribe("alerts/+").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_rolled_back() {
        let mut transport = detached_transport();

        let result = transport.subscribe("alerts/+").await;
        assert!(matches!(result, Err(ConnectionError::Subscribe(_))));
        assert!(transport.filters().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        // Port 1 on loopback refuses connections immediately
        let connector = MqttConnector::new(Duration::from_secs(2), 8);
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let config = ConnectionConfig::Mqtt(MqttConfig::new("mqtt://127.0.0.1:1"));

        let result = connector.connect(&"m1".into(), &config, events).await;
        assert!(matches!(
            result,
            Err(ConnectionError::BrokerUnreachable { .. })
        ));
    }
}
