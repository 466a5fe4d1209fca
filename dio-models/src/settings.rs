use crate::constants::{
    DEFAULT_COIL_COUNT, DEFAULT_INPUT_COUNT, DEFAULT_MODBUS_PORT, DOUBLE_CLICK_WINDOW_MS,
    ENV_PREFIX, LONG_PUSH_ACTION_SECS, LONG_PUSH_TIMEOUT_SECS, POLLING_CYCLE_MS,
    PRIMARY_PROFILE, RETRY_CONNECT_SECS, SECONDARY_PROFILE,
};
use config::{Config, Environment, File};
use dio_error::{DioError, DioResult};
use serde::{self, Deserialize};
use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    sync::Arc,
};

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(config_path: &str) -> DioResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        inner.validate()?;
        Ok(Self(Arc::new(inner)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub logging: Logging,
    /// Static roster of devices started by the orchestrator.
    #[serde(default = "Inner::devices_default")]
    pub devices: Vec<DeviceEntry>,
    /// Named device profiles referenced by roster entries.
    #[serde(default = "Inner::profiles_default")]
    pub profiles: HashMap<String, DeviceProfile>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            general: General::default(),
            logging: Logging::default(),
            devices: Inner::devices_default(),
            profiles: Inner::profiles_default(),
        }
    }
}

impl Inner {
    fn devices_default() -> Vec<DeviceEntry> {
        [
            ("DM1-1", "192.168.127.130", PRIMARY_PROFILE),
            ("DM1-2", "192.168.127.131", SECONDARY_PROFILE),
            ("DM2-1", "192.168.127.230", PRIMARY_PROFILE),
            ("DM2-2", "192.168.127.231", SECONDARY_PROFILE),
        ]
        .into_iter()
        .map(|(name, host, profile)| DeviceEntry {
            name: name.to_string(),
            host: host.to_string(),
            port: DEFAULT_MODBUS_PORT,
            unit_id: DeviceEntry::unit_id_default(),
            profile: profile.to_string(),
        })
        .collect()
    }

    fn profiles_default() -> HashMap<String, DeviceProfile> {
        let primary = DeviceProfile::default();
        let secondary = DeviceProfile {
            sync: ChannelSelection::Only(vec![0, 1]),
            push_timeout: ChannelSelection::Only(vec![0, 1]),
            press_follow_offset: Some(2),
            ..DeviceProfile::default()
        };
        HashMap::from([
            (PRIMARY_PROFILE.to_string(), primary),
            (SECONDARY_PROFILE.to_string(), secondary),
        ])
    }

    /// Structural checks that do not need a device: a non-zero retry delay,
    /// unique names and resolvable profile references.
    pub fn validate(&self) -> DioResult<()> {
        if self.general.retry_connect_secs == 0 {
            return Err(DioError::ConfigurationError(
                "general.retry_connect_secs must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for entry in &self.devices {
            if entry.name.trim().is_empty() {
                return Err(DioError::ConfigurationError(
                    "Device name must not be empty".to_string(),
                ));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(DioError::ConfigurationError(format!(
                    "Duplicate device name '{}'",
                    entry.name
                )));
            }
            if !self.profiles.contains_key(&entry.profile) {
                return Err(DioError::ConfigurationError(format!(
                    "Device '{}' references unknown profile '{}'",
                    entry.name, entry.profile
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct General {
    /// Delay before a disconnected device is polled again, in seconds
    #[serde(default = "General::retry_connect_secs_default")]
    pub retry_connect_secs: u64,
    /// Upper bound for the orchestrator event loop to drain on shutdown
    #[serde(default = "General::shutdown_timeout_ms_default")]
    pub shutdown_timeout_ms: u64,
}

impl Default for General {
    fn default() -> Self {
        General {
            retry_connect_secs: General::retry_connect_secs_default(),
            shutdown_timeout_ms: General::shutdown_timeout_ms_default(),
        }
    }
}

impl General {
    fn retry_connect_secs_default() -> u64 {
        RETRY_CONNECT_SECS
    }

    fn shutdown_timeout_ms_default() -> u64 {
        2000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Logging {
    #[serde(default = "Logging::level_default")]
    pub level: String,
    #[serde(default = "Logging::dir_default")]
    pub dir: String,
    #[serde(default = "Logging::file_prefix_default")]
    pub file_prefix: String,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: Logging::level_default(),
            dir: Logging::dir_default(),
            file_prefix: Logging::file_prefix_default(),
        }
    }
}

impl Logging {
    fn level_default() -> String {
        "info".into()
    }

    fn dir_default() -> String {
        "logs".into()
    }

    fn file_prefix_default() -> String {
        "dio.log".into()
    }
}

/// One roster entry: identity, endpoint and the profile applied at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "DeviceEntry::port_default")]
    pub port: u16,
    #[serde(default = "DeviceEntry::unit_id_default")]
    pub unit_id: u8,
    pub profile: String,
}

impl DeviceEntry {
    fn port_default() -> u16 {
        DEFAULT_MODBUS_PORT
    }

    fn unit_id_default() -> u8 {
        1
    }
}

/// Per-channel flag selection: either a blanket value or the list of
/// enabled channel indices.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChannelSelection {
    All(bool),
    Only(Vec<u16>),
}

impl ChannelSelection {
    pub fn is_enabled(&self, index: u16) -> bool {
        match self {
            ChannelSelection::All(flag) => *flag,
            ChannelSelection::Only(indices) => indices.contains(&index),
        }
    }
}

/// Channel geometry, per-channel flags and timing applied to a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceProfile {
    #[serde(default)]
    pub input_address: u16,
    #[serde(default = "DeviceProfile::input_count_default")]
    pub input_count: u16,
    #[serde(default)]
    pub coil_address: u16,
    #[serde(default = "DeviceProfile::coil_count_default")]
    pub coil_count: u16,
    #[serde(default = "DeviceProfile::polling_cycle_ms_default")]
    pub polling_cycle_ms: u64,
    #[serde(default = "DeviceProfile::sync_default")]
    pub sync: ChannelSelection,
    #[serde(default = "DeviceProfile::enabled_default")]
    pub push_timeout: ChannelSelection,
    #[serde(default = "DeviceProfile::enabled_default")]
    pub double_click: ChannelSelection,
    #[serde(default = "DeviceProfile::long_push_action_secs_default")]
    pub long_push_action_secs: u16,
    #[serde(default = "DeviceProfile::long_push_timeout_secs_default")]
    pub long_push_timeout_secs: u16,
    #[serde(default = "DeviceProfile::double_click_window_ms_default")]
    pub double_click_window_ms: u16,
    /// Inputs at or above this index drive coil `index - offset` while held
    #[serde(default)]
    pub press_follow_offset: Option<u16>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            input_address: 0,
            input_count: DeviceProfile::input_count_default(),
            coil_address: 0,
            coil_count: DeviceProfile::coil_count_default(),
            polling_cycle_ms: DeviceProfile::polling_cycle_ms_default(),
            sync: DeviceProfile::sync_default(),
            push_timeout: DeviceProfile::enabled_default(),
            double_click: DeviceProfile::enabled_default(),
            long_push_action_secs: DeviceProfile::long_push_action_secs_default(),
            long_push_timeout_secs: DeviceProfile::long_push_timeout_secs_default(),
            double_click_window_ms: DeviceProfile::double_click_window_ms_default(),
            press_follow_offset: None,
        }
    }
}

impl DeviceProfile {
    fn input_count_default() -> u16 {
        DEFAULT_INPUT_COUNT
    }

    fn coil_count_default() -> u16 {
        DEFAULT_COIL_COUNT
    }

    fn polling_cycle_ms_default() -> u64 {
        POLLING_CYCLE_MS
    }

    fn sync_default() -> ChannelSelection {
        ChannelSelection::All(true)
    }

    fn enabled_default() -> ChannelSelection {
        ChannelSelection::All(true)
    }

    fn long_push_action_secs_default() -> u16 {
        LONG_PUSH_ACTION_SECS
    }

    fn long_push_timeout_secs_default() -> u16 {
        LONG_PUSH_TIMEOUT_SECS
    }

    fn double_click_window_ms_default() -> u16 {
        DOUBLE_CLICK_WINDOW_MS
    }
}
