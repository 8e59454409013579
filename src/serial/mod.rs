pub mod emulator;
pub mod interface;
pub mod link;
pub mod protocol;

pub use emulator::{EmulatedDevice, EmulatorConnector, EmulatorHandle};
pub use interface::{Connector, SerialConnector, SerialInterface, SerialPortIO, BAUD_RATE};
pub use link::DeviceLink;
pub use protocol::{Request, Response, Tag};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// True for failures of the transport itself, as opposed to a device
    /// that answered late or answered garbage.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SerialError::ConnectionFailed(_) | SerialError::IoError(_) | SerialError::SerialportError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
