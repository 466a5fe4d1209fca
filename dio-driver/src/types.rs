use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::session::Endpoint;

/// Bounded wait for opening a session, in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 3000;
/// Per-request read timeout, in milliseconds.
pub const READ_TIMEOUT_MS: u64 = 1500;
/// Length of one pulse step, in milliseconds.
pub const PULSE_STEP_MS: u64 = 100;
/// Default polling cycle before a profile is applied, in milliseconds.
pub const DEFAULT_POLLING_CYCLE_MS: u64 = 100;
pub const DEFAULT_DOUBLE_CLICK_WINDOW_MS: u16 = 1000;
pub const DEFAULT_LONG_PUSH_TIMEOUT_SECS: u16 = 30;
pub const DEFAULT_LONG_PUSH_ACTION_SECS: u16 = 3;

/// Largest discrete-input block a single read may request.
pub const MAX_INPUT_COUNT: u16 = 2000;
/// Largest coil block a single multiple-coil write may carry.
pub const MAX_COIL_COUNT: u16 = 1968;

/// Events exposed by every device, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    PollingStarted,
    PollingStopped,
    InputStatusChanged { index: u16, status: bool },
    ButtonDown { index: u16 },
    ButtonUp { index: u16 },
    Click { index: u16 },
    DoubleClick { index: u16 },
    LongPush { index: u16, duration_ms: u64 },
    LongPushTimeout { index: u16, timeout_secs: u16 },
}

impl DeviceEvent {
    /// Input channel the event refers to, if any.
    pub fn index(&self) -> Option<u16> {
        match *self {
            DeviceEvent::InputStatusChanged { index, .. }
            | DeviceEvent::ButtonDown { index }
            | DeviceEvent::ButtonUp { index }
            | DeviceEvent::Click { index }
            | DeviceEvent::DoubleClick { index }
            | DeviceEvent::LongPush { index, .. }
            | DeviceEvent::LongPushTimeout { index, .. } => Some(index),
            DeviceEvent::Connected
            | DeviceEvent::Disconnected
            | DeviceEvent::PollingStarted
            | DeviceEvent::PollingStopped => None,
        }
    }
}

/// A device event tagged with its source.
#[derive(Debug, Clone)]
pub struct DeviceEventEnvelope {
    pub device: Arc<str>,
    pub event: DeviceEvent,
    pub at: DateTime<Utc>,
}

/// Registered at construction; every device event is delivered through it.
pub type EventSender = mpsc::UnboundedSender<DeviceEventEnvelope>;

/// Channel layout of one module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub input_address: u16,
    pub input_count: u16,
    pub coil_address: u16,
    pub coil_count: u16,
}

impl DeviceGeometry {
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.input_count != 0 || self.coil_count != 0
    }

    /// Number of input channels paired 1:1 with a coil.
    #[inline]
    pub fn sync_count(&self) -> u16 {
        self.input_count.min(self.coil_count)
    }
}

/// Point-in-time view of a device for shells and diagnostics.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub name: Arc<str>,
    pub endpoint: Endpoint,
    pub geometry: DeviceGeometry,
    pub connected: bool,
    pub polling: bool,
    pub pulsing: bool,
    pub inputs: Vec<bool>,
    pub input_last_changed: Vec<DateTime<Utc>>,
    pub coils: Vec<bool>,
    pub pulse_enabled: Vec<bool>,
}
