pub mod registry;

pub use registry::{Session, SessionId, SessionRegistry, INBOUND_CAPACITY, OUTBOUND_CAPACITY};
