mod device;
pub mod error;
pub mod gesture;
pub mod memory;
mod output;
mod poller;
pub mod pulse;
pub mod session;
pub mod types;

pub use device::IoDevice;
pub use error::{DeviceError, DeviceResult};
pub use session::{
    Endpoint, IoFunction, IoSession, ModbusTcpConnector, SessionConnector, SessionError,
    SessionOptions, SessionResult,
};
pub use types::{DeviceEvent, DeviceEventEnvelope, DeviceGeometry, DeviceSnapshot, EventSender};
