mod common;

use common::{build_device, count, drain, init_tracing, ms, POLL_CYCLE_MS};
use dio_driver::{
    memory::{MemoryFault, MemoryModule},
    DeviceError, DeviceEvent, DeviceGeometry, Endpoint, IoDevice, IoFunction,
};
use std::sync::Arc;
use tokio::{sync::mpsc, time::sleep};

#[tokio::test(start_paused = true)]
async fn link_fault_stops_polling() {
    init_tracing();
    let module = MemoryModule::new(2, 2);
    let (device, mut rx) = build_device(&module, 2, 2);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    sleep(ms(25)).await;
    drain(&mut rx);

    module.push_fault(IoFunction::ReadDiscreteInputs, MemoryFault::Link);
    sleep(ms(50)).await;

    assert!(!device.is_connected());
    assert!(!device.is_polling());
    assert_eq!(
        drain(&mut rx),
        vec![DeviceEvent::Disconnected, DeviceEvent::PollingStopped]
    );

    // Nothing is read once the cadence is gone.
    module.set_input(0, true);
    sleep(ms(100)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn severed_session_on_coil_read_stops_polling() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    module.push_fault(IoFunction::ReadCoils, MemoryFault::Link);
    sleep(ms(30)).await;

    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == DeviceEvent::Disconnected), 1);
    assert_eq!(count(&events, |e| *e == DeviceEvent::PollingStopped), 1);
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn protocol_exception_keeps_polling() {
    init_tracing();
    let module = MemoryModule::new(2, 2);
    let (device, mut rx) = build_device(&module, 2, 2);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    sleep(ms(5)).await;

    module.push_fault(IoFunction::ReadDiscreteInputs, MemoryFault::Exception);
    module.push_fault(IoFunction::ReadCoils, MemoryFault::Exception);
    module.set_input(1, true);
    sleep(ms(50)).await;

    assert!(device.is_connected());
    assert!(device.is_polling());
    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == DeviceEvent::Disconnected), 0);
    assert_eq!(
        count(&events, |e| *e
            == DeviceEvent::InputStatusChanged {
                index: 1,
                status: true
            }),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn refused_connect_is_not_an_error() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    module.refuse_connections(true);
    let (device, mut rx) = build_device(&module, 1, 1);

    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    assert!(!device.is_connected());
    assert!(!device.is_polling());
    assert!(drain(&mut rx).is_empty());

    module.refuse_connections(false);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    assert!(device.is_connected());
    assert_eq!(
        drain(&mut rx),
        vec![DeviceEvent::Connected, DeviceEvent::PollingStarted]
    );
}

#[tokio::test(start_paused = true)]
async fn zero_cycle_polls_once() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    module.set_input(0, true);
    device.begin_polling(0).await.unwrap();
    sleep(ms(100)).await;

    assert!(device.is_connected());
    assert!(!device.is_polling());
    module.set_input(0, false);
    sleep(ms(100)).await;

    let events = drain(&mut rx);
    assert_eq!(
        count(&events, |e| matches!(e, DeviceEvent::InputStatusChanged { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn polling_cycle_change_keeps_polling() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    device.set_polling_cycle(50).unwrap();
    assert_eq!(device.polling_cycle_ms(), 50);
    sleep(ms(20)).await;
    drain(&mut rx);

    module.set_input(0, true);
    sleep(ms(120)).await;
    assert!(device.is_polling());
    assert_eq!(
        drain(&mut rx)[..2],
        [
            DeviceEvent::InputStatusChanged {
                index: 0,
                status: true
            },
            DeviceEvent::ButtonDown { index: 0 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn endpoint_change_disconnects() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();

    device.set_endpoint("127.0.0.1", 502);
    assert!(device.is_connected());

    device.set_endpoint("127.0.0.2", 502);
    assert!(!device.is_connected());
    assert_eq!(device.endpoint(), Endpoint::new("127.0.0.2", 502));
    assert_eq!(drain(&mut rx).last(), Some(&DeviceEvent::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();

    assert!(device.disconnect());
    assert!(!device.disconnect());
    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == DeviceEvent::Disconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn dispose_is_terminal() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, mut rx) = build_device(&module, 1, 1);
    device.begin_polling(POLL_CYCLE_MS).await.unwrap();
    module.set_input(0, true);
    sleep(ms(20)).await;

    device.dispose();
    device.dispose();
    assert!(device.is_disposed());
    assert!(!device.is_connected());

    // The pending gesture timer never fires.
    sleep(ms(2000)).await;
    let events = drain(&mut rx);
    assert_eq!(count(&events, |e| *e == DeviceEvent::Disconnected), 1);
    assert_eq!(events.last(), Some(&DeviceEvent::Disconnected));

    assert!(matches!(
        device.begin_polling(POLL_CYCLE_MS).await,
        Err(DeviceError::Disposed(_))
    ));
    assert!(!device.connect().await);
}

#[tokio::test]
async fn configuration_errors() {
    init_tracing();
    let module = MemoryModule::new(4, 4);
    let (tx, _rx) = mpsc::unbounded_channel();
    let device = Arc::new(IoDevice::new(
        "DM-raw",
        Endpoint::new("127.0.0.1", 502),
        Arc::new(module.clone()),
        tx,
    ));

    assert!(matches!(
        device.begin_polling(POLL_CYCLE_MS).await,
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.set_io_sync_all(true),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.initialize(DeviceGeometry::default(), POLL_CYCLE_MS),
        Err(DeviceError::ConfigurationError(_))
    ));

    let geometry = DeviceGeometry {
        input_address: 0,
        input_count: 4,
        coil_address: 0,
        coil_count: 2,
    };
    device.initialize(geometry, POLL_CYCLE_MS).unwrap();

    assert!(matches!(
        device.set_io_sync(2, true),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(device.set_io_sync(1, true).is_ok());
    assert!(matches!(
        device.set_push_timeout(4, true),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.set_double_click_window(50),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.set_long_push_time(61),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.set_long_push_timeout(0),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.set_channel_long_push_time(0, 50),
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.change_coil_status(0, true).await,
        Err(DeviceError::NotConnected(_))
    ));

    assert!(device.connect().await);
    assert!(matches!(
        device.change_coil_status(2, true).await,
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.change_coils_status(&[true, true, true]).await,
        Err(DeviceError::ConfigurationError(_))
    ));
    assert!(matches!(
        device.initialize(geometry, POLL_CYCLE_MS),
        Err(DeviceError::ConfigurationError(_))
    ));
    device.dispose();
}

#[tokio::test]
async fn direct_coil_writes_reach_the_module() {
    init_tracing();
    let module = MemoryModule::new(3, 3);
    let (device, _rx) = build_device(&module, 3, 3);
    assert!(device.connect().await);

    device.change_coil_status(1, true).await.unwrap();
    assert_eq!(module.coils(), vec![false, true, false]);

    device.change_coils_status(&[true, false, true]).await.unwrap();
    assert_eq!(module.coils(), vec![true, false, true]);
    assert_eq!(device.snapshot().coils, vec![true, false, true]);

    // A refused write leaves the session up.
    module.push_fault(IoFunction::WriteSingleCoil, MemoryFault::Exception);
    device.change_coil_status(0, false).await.unwrap();
    assert!(device.is_connected());
    assert_eq!(module.coil(0), Some(true));
    device.dispose();
}
