pub mod coordinator;
pub mod models;

pub use coordinator::{BridgeState, Coordinator, CoordinatorConfig};
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Serial communication error: {0}")]
    Serial(#[from] crate::serial::SerialError),

    #[error("Device reported no sensors")]
    NoSensors,
}

pub type Result<T> = std::result::Result<T, DeviceError>;
