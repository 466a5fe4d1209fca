#![allow(dead_code)]

use async_trait::async_trait;
use dio_driver::{
    memory::MemoryModule, Endpoint, IoSession, SessionConnector, SessionError, SessionOptions,
    SessionResult,
};
use dio_models::{
    settings::{General, Inner},
    ChannelSelection, DeviceEntry, DeviceProfile, Settings,
};
use std::{collections::HashMap, sync::Once, time::Duration};
use tracing::Level;

pub const RETRY_SECS: u64 = 10;

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
pub fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

#[inline]
pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// 4 inputs / 4 coils, 10 ms polling, no mirroring, 1 s long-push timeout.
pub fn test_profile() -> DeviceProfile {
    DeviceProfile {
        input_count: 4,
        coil_count: 4,
        polling_cycle_ms: 10,
        sync: ChannelSelection::All(false),
        long_push_timeout_secs: 1,
        ..DeviceProfile::default()
    }
}

/// Routes each endpoint host to its own module.
#[derive(Clone, Default)]
pub struct Rack {
    modules: HashMap<String, MemoryModule>,
}

impl Rack {
    pub fn with(mut self, host: &str, module: &MemoryModule) -> Self {
        self.modules.insert(host.to_string(), module.clone());
        self
    }
}

#[async_trait]
impl SessionConnector for Rack {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: SessionOptions,
    ) -> SessionResult<Box<dyn IoSession>> {
        match self.modules.get(&endpoint.host) {
            Some(module) => module.connect(endpoint, options).await,
            None => Err(SessionError::Connect(format!("no module at {endpoint}"))),
        }
    }
}

pub fn entry(name: &str, profile: &str) -> DeviceEntry {
    entry_at(name, profile, "127.0.0.1")
}

pub fn entry_at(name: &str, profile: &str, host: &str) -> DeviceEntry {
    DeviceEntry {
        name: name.to_string(),
        host: host.to_string(),
        port: 502,
        unit_id: 1,
        profile: profile.to_string(),
    }
}

pub fn settings(devices: Vec<DeviceEntry>, profiles: Vec<(&str, DeviceProfile)>) -> Settings {
    Settings::from(Inner {
        general: General {
            retry_connect_secs: RETRY_SECS,
            shutdown_timeout_ms: 500,
        },
        devices,
        profiles: profiles
            .into_iter()
            .map(|(name, profile)| (name.to_string(), profile))
            .collect::<HashMap<_, _>>(),
        ..Inner::default()
    })
}
