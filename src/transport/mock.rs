//! In-memory transport for tests
//!
//! `MockConnector` hands out `MockTransport`s and keeps a `MockLink` per
//! opened connection, through which tests inject inbound events and inspect
//! what the connection wrote, published and subscribed.

use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::subscriptions::SubscriptionFilter;
use crate::transport::traits::{Transport, TransportConnector, TransportEvents};
use async_trait::async_trait;
use portmux_shared::{
    ConnectionConfig, ConnectionId, EventPayload, PortInfo, PublishOptions, TransportKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Test side of one opened mock connection
pub struct MockLink {
    events: TransportEvents,
    writes: Mutex<Vec<Vec<u8>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<SubscriptionFilter>,
    subscribe_calls: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MockLink {
    fn new(events: TransportEvents) -> Self {
        Self {
            events,
            writes: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(SubscriptionFilter::new()),
            subscribe_calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Push an inbound event as if the device or broker produced it
    pub fn emit(&self, payload: EventPayload) {
        let _ = self.events.send(payload);
    }

    /// Deliver a broker message only if a subscribed filter matches the topic
    pub fn deliver_message(&self, topic: &str, payload: &[u8]) -> bool {
        let subscribed = self.subscriptions.lock().unwrap().matches(topic);
        if subscribed {
            self.emit(EventPayload::MqttMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
        subscribed
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect()
    }

    /// Subscribe requests that actually reached the broker
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

struct MockTransport {
    kind: TransportKind,
    link: Arc<MockLink>,
    write_delay: Duration,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn write(&mut self, data: &[u8]) -> ConnectionResult<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.link.fail_writes.load(Ordering::SeqCst) {
            return Err(ConnectionError::Write("injected write failure".into()));
        }
        self.link.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _options: PublishOptions,
    ) -> ConnectionResult<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.link.fail_writes.load(Ordering::SeqCst) {
            return Err(ConnectionError::Publish("injected publish failure".into()));
        }
        self.link
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> ConnectionResult<()> {
        if self.link.subscriptions.lock().unwrap().insert(filter) {
            self.link.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> ConnectionResult<()> {
        self.link.subscriptions.lock().unwrap().remove(filter);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.link.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockSettings {
    fail_next_open: Option<ConnectionError>,
    open_delay: Duration,
    write_delay: Duration,
}

/// Connector producing mock transports of one kind
pub struct MockConnector {
    kind: TransportKind,
    settings: Mutex<MockSettings>,
    links: Mutex<HashMap<ConnectionId, Arc<MockLink>>>,
    opens: AtomicUsize,
    ports: Vec<PortInfo>,
}

impl MockConnector {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            settings: Mutex::new(MockSettings::default()),
            links: Mutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
            ports: Vec::new(),
        }
    }

    pub fn serial() -> Self {
        Self::new(TransportKind::Serial)
    }

    pub fn mqtt() -> Self {
        Self::new(TransportKind::Mqtt)
    }

    pub fn with_ports(mut self, ports: Vec<PortInfo>) -> Self {
        self.ports = ports;
        self
    }

    /// Make the next `connect` fail with `error`
    pub fn fail_next_open(&self, error: ConnectionError) {
        self.settings.lock().unwrap().fail_next_open = Some(error);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.settings.lock().unwrap().open_delay = delay;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.settings.lock().unwrap().write_delay = delay;
    }

    /// Link of the most recent connection opened under `id`
    pub fn link(&self, id: &ConnectionId) -> Option<Arc<MockLink>> {
        self.links.lock().unwrap().get(id).cloned()
    }

    /// Successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(
        &self,
        id: &ConnectionId,
        _config: &ConnectionConfig,
        events: TransportEvents,
    ) -> ConnectionResult<Box<dyn Transport>> {
        let (failure, open_delay, write_delay) = {
            let mut settings = self.settings.lock().unwrap();
            (
                settings.fail_next_open.take(),
                settings.open_delay,
                settings.write_delay,
            )
        };

        if !open_delay.is_zero() {
            tokio::time::sleep(open_delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let link = Arc::new(MockLink::new(events));
        self.links.lock().unwrap().insert(id.clone(), link.clone());
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockTransport {
            kind: self.kind,
            link,
            write_delay,
        }))
    }

    async fn list_ports(&self) -> Vec<PortInfo> {
        self.ports.clone()
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
