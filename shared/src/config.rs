//! Connection configurations
//!
//! A [`ConnectionConfig`] describes how to reach one transport. It carries no
//! live resource and is what a saved session consists of.

use crate::{limits, TransportKind};
use serde::{Deserialize, Serialize};

/// Transport-specific parameters for one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Serial(SerialConfig),
    Mqtt(MqttConfig),
}

impl ConnectionConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionConfig::Serial(_) => TransportKind::Serial,
            ConnectionConfig::Mqtt(_) => TransportKind::Mqtt,
        }
    }

    /// Check parameters before any resource is touched
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ConnectionConfig::Serial(serial) => serial.validate(),
            ConnectionConfig::Mqtt(mqtt) => mqtt.validate(),
        }
    }

    /// Short human-readable target, e.g. the device path or broker URL
    pub fn target(&self) -> &str {
        match self {
            ConnectionConfig::Serial(serial) => &serial.path,
            ConnectionConfig::Mqtt(mqtt) => &mqtt.broker_url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial device parameters (e.g. "/dev/ttyUSB0" at 115200 baud)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.path.trim().is_empty() {
            return Err("serial port path must not be empty".into());
        }
        if self.baud_rate == 0 {
            return Err("baud rate must be greater than zero".into());
        }
        Ok(())
    }
}

/// MQTT broker session parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// `mqtt://host:port`, `tcp://host:port` or bare `host[:port]`
    pub broker_url: String,
    /// Generated from the connection id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

impl MqttConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        parse_broker_url(&self.broker_url)?;
        if self.keep_alive_secs < limits::MIN_KEEP_ALIVE_SECS {
            return Err(format!(
                "keep-alive must be at least {} seconds",
                limits::MIN_KEEP_ALIVE_SECS
            ));
        }
        if let Some(client_id) = &self.client_id {
            if client_id.is_empty() || client_id.starts_with(' ') {
                return Err("client id must not be empty or start with a space".into());
            }
        }
        if self.password.is_some() && self.username.is_none() {
            return Err("password given without a username".into());
        }
        Ok(())
    }

    /// Resolve the broker host and port
    pub fn endpoint(&self) -> Result<(String, u16), String> {
        parse_broker_url(&self.broker_url)
    }
}

/// Split a broker URL into host and port.
///
/// Only plain TCP brokers are accepted; TLS and websocket schemes are refused.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), String> {
    let url = url.trim();
    let rest = match url.split_once("://") {
        Some(("mqtt", rest)) | Some(("tcp", rest)) => rest,
        Some((scheme, _)) => return Err(format!("unsupported broker scheme: {}", scheme)),
        None => url,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err("broker URL has no host".into());
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err("broker URL has no host".into());
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid broker port: {}", port))?;
            if port == 0 {
                return Err("broker port must not be zero".into());
            }
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), limits::DEFAULT_MQTT_PORT)),
    }
}

/// Check a concrete topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".into());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("publish topic must not contain wildcards: {}", topic));
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL".into());
    }
    Ok(())
}

/// Check a subscription filter (`+` matches one level, `#` the remainder)
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".into());
    }
    if filter.contains('\0') {
        return Err("topic filter must not contain NUL".into());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(format!("'#' must be the whole final level: {}", filter));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level: {}", filter));
        }
    }
    Ok(())
}
