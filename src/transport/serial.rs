//! Serial transport implementation

use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::traits::{Transport, TransportConnector, TransportEvents};
use async_trait::async_trait;
use portmux_shared::{
    ConnectionConfig, ConnectionId, DataBits, ErrorKind, EventPayload, FlowControl, Parity,
    PortInfo, SerialConfig, StopBits, TransportKind,
};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType, SerialStream};
use tracing::{debug, warn};

/// Default size of the inbound read buffer
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// An open serial device.
///
/// The read half lives in its own task and pushes `Data` events; the write
/// half stays here so writes never wait behind reads.
pub struct SerialTransport {
    path: String,
    writer: WriteHalf<SerialStream>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn write(&mut self, data: &[u8]) -> ConnectionResult<()> {
        // write_all keeps retrying partial writes until every byte is accepted
        self.writer
            .write_all(data)
            .await
            .map_err(|e| ConnectionError::Write(format!("{}: {}", self.path, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ConnectionError::Write(format!("{}: {}", self.path, e)))
    }

    async fn shutdown(&mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!(path = %self.path, error = %e, "serial shutdown reported an error");
        }
    }
}

/// Connector that opens serial devices through tokio-serial
pub struct SerialConnector {
    read_buffer: usize,
}

impl SerialConnector {
    pub fn new(read_buffer: usize) -> Self {
        Self {
            read_buffer: read_buffer.max(1),
        }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BUFFER)
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn connect(
        &self,
        id: &ConnectionId,
        config: &ConnectionConfig,
        events: TransportEvents,
    ) -> ConnectionResult<Box<dyn Transport>> {
        let ConnectionConfig::Serial(serial) = config else {
            return Err(ConnectionError::InvalidArgument(format!(
                "{} is not a serial configuration",
                id
            )));
        };

        let stream = open_port(serial)?;
        let (reader, writer) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(
            reader,
            events,
            self.read_buffer,
            serial.path.clone(),
        ));

        debug!(id = %id, path = %serial.path, baud = serial.baud_rate, "serial port opened");
        Ok(Box::new(SerialTransport {
            path: serial.path.clone(),
            writer,
            reader,
        }))
    }

    async fn list_ports(&self) -> Vec<PortInfo> {
        match tokio::task::spawn_blocking(tokio_serial::available_ports).await {
            Ok(Ok(ports)) => ports.into_iter().map(port_info).collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "serial port enumeration failed");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "serial port enumeration task failed");
                Vec::new()
            }
        }
    }

    fn name(&self) -> &'static str {
        "Serial"
    }
}

/// Open the device with the configured line settings.
///
/// tokio-serial opens TTYs exclusively, so a port already held elsewhere
/// fails here rather than sharing the line.
fn open_port(config: &SerialConfig) -> ConnectionResult<SerialStream> {
    if device_missing(&config.path) {
        return Err(ConnectionError::PortNotFound(config.path.clone()));
    }

    tokio_serial::new(config.path.as_str(), config.baud_rate)
        .data_bits(data_bits(config.data_bits))
        .parity(parity(config.parity))
        .stop_bits(stop_bits(config.stop_bits))
        .flow_control(flow_control(config.flow_control))
        .open_native_async()
        .map_err(|e| map_open_error(&config.path, e))
}

/// Windows port names ("COM3") are not filesystem paths, so only unix checks
fn device_missing(path: &str) -> bool {
    cfg!(unix) && !Path::new(path).exists()
}

fn map_open_error(path: &str, error: tokio_serial::Error) -> ConnectionError {
    match error.kind {
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            ConnectionError::PortNotFound(path.to_string())
        }
        tokio_serial::ErrorKind::NoDevice if device_missing(path) => {
            ConnectionError::PortNotFound(path.to_string())
        }
        tokio_serial::ErrorKind::InvalidInput => {
            ConnectionError::InvalidArgument(format!("{}: {}", path, error))
        }
        _ => ConnectionError::PortUnavailable {
            path: path.to_string(),
            reason: error.to_string(),
        },
    }
}

async fn read_loop(
    mut reader: ReadHalf<SerialStream>,
    events: TransportEvents,
    buffer_size: usize,
    path: String,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(EventPayload::error(
                    ErrorKind::Disconnected,
                    format!("{} closed by the device", path),
                ));
                break;
            }
            Ok(n) => {
                let data = EventPayload::Data {
                    bytes: buf[..n].to_vec(),
                };
                if events.send(data).is_err() {
                    // Nobody is routing this connection any more
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(EventPayload::error(
                    ErrorKind::ReadError,
                    format!("{}: {}", path, e),
                ));
                break;
            }
        }
    }

    let _ = events.send(EventPayload::Closed);
}

fn port_info(info: SerialPortInfo) -> PortInfo {
    let mut port = PortInfo {
        path: info.port_name,
        port_type: "unknown".into(),
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial_number: None,
    };

    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            port.port_type = "usb".into();
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        SerialPortType::PciPort => port.port_type = "pci".into(),
        SerialPortType::BluetoothPort => port.port_type = "bluetooth".into(),
        SerialPortType::Unknown => {}
    }

    port
}

fn data_bits(bits: DataBits) -> tokio_serial::DataBits {
    match bits {
        DataBits::Five => tokio_serial::DataBits::Five,
        DataBits::Six => tokio_serial::DataBits::Six,
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn stop_bits(bits: StopBits) -> tokio_serial::StopBits {
    match bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

fn flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
    match flow {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    }
}
