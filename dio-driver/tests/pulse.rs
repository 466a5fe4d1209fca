mod common;

use common::{build_device, init_tracing, ms};
use dio_driver::{memory::MemoryModule, DeviceError, IoFunction};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn five_by_five_pulse_toggles_every_half_second() {
    init_tracing();
    let module = MemoryModule::new(2, 2);
    let (device, _rx) = build_device(&module, 2, 2);
    assert!(device.connect().await);

    device.set_pulse_control(0, 5, -5, 0).unwrap();
    assert!(device.is_pulse_enabled(0).unwrap());
    assert!(!device.is_pulse_enabled(1).unwrap());
    device.start_pulse().unwrap();
    assert!(device.is_on_pulse());

    sleep(ms(2450)).await;
    let writes = module.coil_writes();
    assert!(writes.len() >= 4, "writes: {writes:?}");
    for (n, write) in writes.iter().enumerate() {
        assert_eq!(write.function, IoFunction::WriteMultipleCoils);
        assert_eq!(write.address, 0);
        // Full coil block, coil 0 alternating, coil 1 untouched.
        assert_eq!(write.values, vec![n % 2 == 0, false]);
    }

    device.stop_pulse().unwrap();
    assert!(!device.is_on_pulse());
    let settled = module.coil_writes().len();
    sleep(ms(1000)).await;
    assert_eq!(module.coil_writes().len(), settled);
    device.dispose();
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_keep_the_shape() {
    init_tracing();
    let module = MemoryModule::new(1, 1);
    let (device, _rx) = build_device(&module, 1, 1);
    assert!(device.connect().await);
    device.set_pulse_control(0, 2, -2, 0).unwrap();
    device.start_pulse().unwrap();
    sleep(ms(1000)).await;

    device.pause_pulse().unwrap();
    assert!(!device.is_on_pulse());
    let paused = module.coil_writes().len();
    assert!(paused > 0);
    sleep(ms(1000)).await;
    assert_eq!(module.coil_writes().len(), paused);

    device.resume_pulse().unwrap();
    assert!(device.is_on_pulse());
    sleep(ms(1000)).await;
    assert!(module.coil_writes().len() > paused);
    device.dispose();
}

#[tokio::test(start_paused = true)]
async fn disabled_and_cleared_coils_stop_blinking() {
    init_tracing();
    let module = MemoryModule::new(2, 2);
    let (device, _rx) = build_device(&module, 2, 2);
    assert!(device.connect().await);
    device.set_pulse_control(0, 1, -1, 0).unwrap();
    device.set_pulse_control(1, -1, 1, 0).unwrap();

    device.disable_pulse(1).unwrap();
    assert!(!device.is_pulse_enabled(1).unwrap());

    device.clear_pulse().unwrap();
    assert!(!device.is_pulse_enabled(0).unwrap());
    device.start_pulse().unwrap();
    sleep(ms(500)).await;
    assert!(module.coil_writes().is_empty());
    device.dispose();
}

#[tokio::test]
async fn pulse_requires_a_connection_and_valid_shape() {
    init_tracing();
    let module = MemoryModule::new(2, 2);
    let (device, _rx) = build_device(&module, 2, 2);

    assert!(matches!(
        device.set_pulse_control(0, 3, 3, 0),
        Err(DeviceError::InvalidArgument(_))
    ));
    assert!(matches!(
        device.set_pulse_control(2, 3, -3, 0),
        Err(DeviceError::ConfigurationError(_))
    ));
    device.set_pulse_control(0, 3, -3, 0).unwrap();
    assert!(matches!(
        device.start_pulse(),
        Err(DeviceError::NotConnected(_))
    ));
    assert!(!device.is_on_pulse());
}
