use dio_driver::{DeviceGeometry, DeviceResult, IoDevice};
use dio_models::{ChannelSelection, DeviceProfile};

/// Initialize a device with a profile's geometry, then apply its channel
/// flags and timing. Listed channel indices outside the geometry are rejected.
pub fn apply_profile(device: &IoDevice, profile: &DeviceProfile) -> DeviceResult<()> {
    let geometry = DeviceGeometry {
        input_address: profile.input_address,
        input_count: profile.input_count,
        coil_address: profile.coil_address,
        coil_count: profile.coil_count,
    };
    device.initialize(geometry, profile.polling_cycle_ms)?;
    device.set_long_push_time(profile.long_push_action_secs)?;
    device.set_long_push_timeout(profile.long_push_timeout_secs)?;
    device.set_double_click_window(profile.double_click_window_ms)?;

    select(
        &profile.sync,
        |all| device.set_io_sync_all(all),
        |index| device.set_io_sync(index, true),
    )?;
    select(
        &profile.push_timeout,
        |all| device.set_push_timeout_all(all),
        |index| device.set_push_timeout(index, true),
    )?;
    select(
        &profile.double_click,
        |all| device.set_double_click_all(all),
        |index| device.set_double_click(index, true),
    )
}

fn select(
    selection: &ChannelSelection,
    set_all: impl Fn(bool) -> DeviceResult<()>,
    enable: impl Fn(u16) -> DeviceResult<()>,
) -> DeviceResult<()> {
    match selection {
        ChannelSelection::All(flag) => set_all(*flag),
        ChannelSelection::Only(indices) => {
            set_all(false)?;
            indices.iter().try_for_each(|index| enable(*index))
        }
    }
}
