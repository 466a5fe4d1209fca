#![allow(dead_code)]

use dio_driver::{
    memory::MemoryModule, DeviceEvent, DeviceEventEnvelope, DeviceGeometry, Endpoint, IoDevice,
};
use std::{
    sync::{Arc, Once},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::Level;

pub const POLL_CYCLE_MS: u64 = 10;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

#[inline]
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Device over an in-memory module, initialized with the given geometry at address 0.
pub fn build_device(
    module: &MemoryModule,
    inputs: u16,
    coils: u16,
) -> (Arc<IoDevice>, mpsc::UnboundedReceiver<DeviceEventEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let device = Arc::new(IoDevice::new(
        "DM-test",
        Endpoint::new("127.0.0.1", 502),
        Arc::new(module.clone()),
        tx,
    ));
    device
        .initialize(
            DeviceGeometry {
                input_address: 0,
                input_count: inputs,
                coil_address: 0,
                coil_count: coils,
            },
            POLL_CYCLE_MS,
        )
        .expect("initialize");
    (device, rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEventEnvelope>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}

/// Events about one input channel, in emission order.
pub fn for_input(events: &[DeviceEvent], index: u16) -> Vec<DeviceEvent> {
    events
        .iter()
        .copied()
        .filter(|e| e.index() == Some(index))
        .collect()
}

pub fn count(events: &[DeviceEvent], pred: impl Fn(&DeviceEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
