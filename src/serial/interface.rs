use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use serialport::SerialPortType;

use super::protocol::Request;
use super::{Result, SerialDeviceInfo, SerialError};

pub const BAUD_RATE: u32 = 115200;

/// Byte transport underneath a [`SerialInterface`].
///
/// Reads are expected to block for at most the port timeout and then fail
/// with `ErrorKind::TimedOut`, which is what `serialport` does.
pub trait SerialPortIO: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialPortIO for T {}

/// Blocking, line-oriented access to one open serial port.
pub struct SerialInterface {
    port: Box<dyn SerialPortIO>,
    port_name: String,
    timeout: Duration,
    pending: Vec<u8>,
}

impl SerialInterface {
    /// Open a hardware port at [`BAUD_RATE`] with a bounded read timeout
    pub fn open(port_name: &str, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(timeout)
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::info!("Opened serial port {} at {} baud", port_name, BAUD_RATE);
        Ok(Self::from_io(port_name, Box::new(port), timeout))
    }

    /// Wrap an already open transport
    pub fn from_io(port_name: impl Into<String>, port: Box<dyn SerialPortIO>, timeout: Duration) -> Self {
        Self {
            port,
            port_name: port_name.into(),
            timeout,
            pending: Vec::new(),
        }
    }

    /// List the serial ports present on this machine
    pub fn available_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();

        Ok(devices)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write one line. Anything still buffered from an earlier exchange is
    /// discarded so a late reply can't be mistaken for the next answer.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.pending.clear();
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one newline-terminated line, without the terminator.
    pub fn read_line(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut buffer = [0u8; 256];

        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                if !raw.is_ascii() {
                    return Err(SerialError::ProtocolError(format!(
                        "Non-ASCII response: {}",
                        String::from_utf8_lossy(&raw).trim_end()
                    )));
                }
                let line = String::from_utf8_lossy(&raw);
                return Ok(line.trim_end_matches(['\r', '\n']).to_string());
            }

            if Instant::now() >= deadline {
                return Err(SerialError::Timeout);
            }

            match self.port.read(&mut buffer) {
                Ok(0) => {
                    return Err(SerialError::ConnectionFailed(format!("{} closed", self.port_name)));
                }
                Ok(n) => self.pending.extend_from_slice(&buffer[..n]),
                Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    if !self.pending.is_empty() {
                        log::debug!(
                            "Partial response before timeout on {}: {:?}",
                            self.port_name,
                            String::from_utf8_lossy(&self.pending)
                        );
                    }
                    return Err(SerialError::Timeout);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(SerialError::IoError(e)),
            }
        }
    }

    /// Send a request and wait for the single response line
    pub fn transact(&mut self, request: &Request) -> Result<String> {
        self.send_line(&request.encode())?;
        self.read_line()
    }
}

/// Opens the device transport. The coordinator calls this on every
/// reconnect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Human readable name of what is being opened
    fn describe(&self) -> String;

    async fn open(&self) -> Result<SerialInterface>;
}

/// Connector for a real serial port
pub struct SerialConnector {
    port_name: String,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(port_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("serial port {}", self.port_name)
    }

    async fn open(&self) -> Result<SerialInterface> {
        let port_name = self.port_name.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || SerialInterface::open(&port_name, timeout))
            .await
            .map_err(|e| SerialError::ConnectionFailed(format!("Open task failed: {}", e)))?
    }
}
