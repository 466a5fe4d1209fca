// Constants shared by the panel crates

/// The default configuration file name, resolved against the working
/// directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "panel.toml";

/// Prefix of environment overrides, e.g. `DIO__GENERAL__RETRY_CONNECT_SECS=5`.
pub const ENV_PREFIX: &str = "DIO";

/// Default Modbus TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Seconds between reconnect attempts.
pub const RETRY_CONNECT_SECS: u64 = 10;

/// Polling cycle used by the built-in profiles, in milliseconds.
pub const POLLING_CYCLE_MS: u64 = 25;

/// Channel geometry of the built-in profiles.
pub const DEFAULT_INPUT_COUNT: u16 = 6;
pub const DEFAULT_COIL_COUNT: u16 = 6;

/// Long-push action threshold of the built-in profiles, in seconds.
pub const LONG_PUSH_ACTION_SECS: u16 = 3;

/// Long-push timeout of the built-in profiles, in seconds.
pub const LONG_PUSH_TIMEOUT_SECS: u16 = 10;

/// Double-click window of the built-in profiles, in milliseconds.
pub const DOUBLE_CLICK_WINDOW_MS: u16 = 1000;

pub const PRIMARY_PROFILE: &str = "primary";
pub const SECONDARY_PROFILE: &str = "secondary";
