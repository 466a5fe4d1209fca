use dashmap::{mapref::entry::Entry, DashMap};
use dio_driver::{
    DeviceEvent, DeviceEventEnvelope, DeviceSnapshot, Endpoint, EventSender, IoDevice,
    SessionConnector,
};
use dio_error::{DioError, DioResult};
use dio_models::{DeviceEntry, DeviceProfile, Settings};
use futures::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::{AbortHandle, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Blink pattern toggled on a coil by a long-push timeout, in pulse units.
const TOGGLE_PULSE: (i16, i16) = (5, -5);

/// Coil write requested by a press-follow input.
type FollowWrite = (u16, bool);

/// A pending one-shot reconnect for one device.
struct ReconnectEntry {
    seq: u64,
    handle: AbortHandle,
}

/// Owns every device, routes their events and keeps them connected.
pub struct DeviceOrchestrator {
    roster: Vec<DeviceEntry>,
    /// Profile of every roster entry, resolved once by device name.
    profiles: HashMap<String, DeviceProfile>,
    connector: Arc<dyn SessionConnector>,
    devices: Arc<DashMap<String, Arc<IoDevice>>>,
    reconnects: Arc<DashMap<String, ReconnectEntry>>,
    /// Per-device writer queues for press-follow coils.
    followers: DashMap<String, UnboundedSender<FollowWrite>>,
    reconnect_seq: AtomicU64,
    retry_interval: Duration,
    shutdown_timeout: Duration,
    shut_down: AtomicBool,
    events_tx: EventSender,
    events_rx: Mutex<Option<UnboundedReceiver<DeviceEventEnvelope>>>,
    event_token: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceOrchestrator {
    pub fn new(settings: &Settings, connector: Arc<dyn SessionConnector>) -> DioResult<Arc<Self>> {
        settings.validate()?;
        let profiles = settings
            .devices
            .iter()
            .map(|entry| {
                settings
                    .profiles
                    .get(&entry.profile)
                    .map(|profile| (entry.name.clone(), profile.clone()))
                    .ok_or_else(|| {
                        DioError::ConfigurationError(format!(
                            "Device '{}' references unknown profile '{}'",
                            entry.name, entry.profile
                        ))
                    })
            })
            .collect::<DioResult<HashMap<_, _>>>()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            roster: settings.devices.clone(),
            profiles,
            connector,
            devices: Arc::new(DashMap::new()),
            reconnects: Arc::new(DashMap::new()),
            followers: DashMap::new(),
            reconnect_seq: AtomicU64::new(0),
            retry_interval: Duration::from_secs(settings.general.retry_connect_secs),
            shutdown_timeout: Duration::from_millis(settings.general.shutdown_timeout_ms),
            shut_down: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            event_token: CancellationToken::new(),
            event_task: Mutex::new(None),
        }))
    }

    /// Create every roster device, apply its profile and make the first
    /// connection attempt. Devices that fail to connect are retried later.
    pub async fn start(self: &Arc<Self>) -> DioResult<()> {
        if self.is_shut_down() {
            return Err(DioError::InitializationError(
                "Orchestrator has been shut down".into(),
            ));
        }
        let events_rx = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DioError::InitializationError("Orchestrator already started".into()))?;
        self.spawn_event_loop(events_rx);

        for entry in &self.roster {
            let profile = self.profile(&entry.name)?;
            let endpoint = Endpoint::new(entry.host.clone(), entry.port).with_unit_id(entry.unit_id);
            let device = Arc::new(IoDevice::new(
                entry.name.as_str(),
                endpoint,
                Arc::clone(&self.connector),
                self.events_tx.clone(),
            ));
            crate::apply_profile(&device, profile)
                .map_err(|e| DioError::DeviceError(format!("{}: {e}", entry.name)))?;
            if profile.press_follow_offset.is_some() {
                let follower = self.spawn_press_follower(Arc::downgrade(&device));
                self.followers.insert(entry.name.clone(), follower);
            }
            self.devices.entry(entry.name.clone()).or_insert(device);
            debug!(device = %entry.name, profile = %entry.profile, "Device registered");
        }

        join_all(self.roster.iter().map(|entry| self.repool(&entry.name))).await;
        info!(
            devices = self.devices.len(),
            offline = self.reconnects.len(),
            "Orchestrator started"
        );
        Ok(())
    }

    fn profile(&self, name: &str) -> DioResult<&DeviceProfile> {
        self.profiles.get(name).ok_or_else(|| {
            DioError::ConfigurationError(format!("No profile resolved for device '{name}'"))
        })
    }

    pub fn device(&self, name: &str) -> Option<Arc<IoDevice>> {
        self.devices.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn device_names(&self) -> Vec<String> {
        self.roster
            .iter()
            .filter(|entry| self.devices.contains_key(&entry.name))
            .map(|entry| entry.name.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.roster
            .iter()
            .filter_map(|entry| self.device(&entry.name))
            .map(|device| device.snapshot())
            .collect()
    }

    /// Number of devices waiting for a reconnect attempt.
    pub fn pending_reconnects(&self) -> usize {
        self.reconnects.len()
    }

    pub fn has_pending_reconnect(&self, name: &str) -> bool {
        self.reconnects.contains_key(name)
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: UnboundedReceiver<DeviceEventEnvelope>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.event_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    envelope = events_rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        let Some(this) = weak.upgrade() else { break };
                        this.handle_event(envelope);
                    }
                }
            }
            debug!("Device event loop stopped");
        });
        *self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Never awaits device I/O, so one slow device cannot hold up the others.
    fn handle_event(self: &Arc<Self>, envelope: DeviceEventEnvelope) {
        let name = envelope.device.as_ref();
        match envelope.event {
            DeviceEvent::InputStatusChanged { index, status } => {
                debug!(device = name, index, status, "Input changed");
            }
            DeviceEvent::ButtonDown { index } | DeviceEvent::ButtonUp { index } => {
                let pressed = matches!(envelope.event, DeviceEvent::ButtonDown { .. });
                info!(device = name, index, pressed, "Button");
                self.follow_press(name, index, pressed);
            }
            DeviceEvent::Click { index } => info!(device = name, index, "Click"),
            DeviceEvent::DoubleClick { index } => info!(device = name, index, "Double click"),
            DeviceEvent::LongPush { index, duration_ms } => {
                info!(device = name, index, duration_ms, "Long push");
            }
            DeviceEvent::LongPushTimeout {
                index,
                timeout_secs,
            } => {
                info!(device = name, index, timeout_secs, "Long push timeout");
                self.toggle_pulse(name, index);
            }
            DeviceEvent::Connected => info!(device = name, "Connected"),
            DeviceEvent::PollingStarted => info!(device = name, "Polling started"),
            DeviceEvent::PollingStopped => info!(device = name, "Polling stopped"),
            DeviceEvent::Disconnected => {
                info!(
                    device = name,
                    retry_secs = self.retry_interval.as_secs(),
                    "Disconnected, scheduling reconnect"
                );
                self.schedule_reconnect(name);
            }
        }
    }

    /// Drive coil `index - offset` while input `index` is held, for profiles
    /// with a press-follow offset.
    fn follow_press(&self, name: &str, index: u16, pressed: bool) {
        let Some(offset) = self.profiles.get(name).and_then(|p| p.press_follow_offset) else {
            return;
        };
        let Some(coil) = index.checked_sub(offset) else {
            return;
        };
        let Some(follower) = self.followers.get(name) else {
            return;
        };
        if follower.send((coil, pressed)).is_err() {
            debug!(device = name, index, coil, "Press follow writer stopped");
        }
    }

    /// Writes press-follow coils of one device in request order.
    fn spawn_press_follower(&self, device: Weak<IoDevice>) -> UnboundedSender<FollowWrite> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FollowWrite>();
        let token = self.event_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => {
                        let Some((coil, pressed)) = next else { break };
                        let Some(device) = device.upgrade() else { break };
                        if let Err(e) = device.change_coil_status(coil, pressed).await {
                            warn!(device = device.name(), coil, error = %e, "Press follow write failed");
                        }
                    }
                }
            }
        });
        tx
    }

    /// Start a blink on the coil paired with a timed-out input, or stop it.
    /// A freshly armed `(5, -5)` blink opens with four off ticks before its
    /// steady five-on, five-off cycle.
    fn toggle_pulse(&self, name: &str, index: u16) {
        let Some(device) = self.device(name) else {
            return;
        };
        let outcome = match device.is_pulse_enabled(index) {
            Ok(true) => device.disable_pulse(index).map(|_| false),
            Ok(false) => {
                let (high, low) = TOGGLE_PULSE;
                device
                    .set_pulse_control(index, high, low, 0)
                    .and_then(|_| {
                        if device.is_on_pulse() {
                            Ok(())
                        } else {
                            device.start_pulse()
                        }
                    })
                    .map(|_| true)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(enabled) => info!(device = name, index, enabled, "Pulse toggled"),
            Err(e) => warn!(device = name, index, error = %e, "Pulse toggle failed"),
        }
    }

    /// Replace any pending reconnect for the device with a fresh one-shot
    /// attempt after the retry interval.
    pub fn schedule_reconnect(self: &Arc<Self>, name: &str) {
        if self.is_shut_down() || !self.devices.contains_key(name) {
            return;
        }
        let seq = self.reconnect_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(self);
        let key = name.to_string();
        let delay = self.retry_interval;

        // The shard stays locked until the entry is stored, so the task can
        // never look for its entry before it exists.
        let slot = self.reconnects.entry(name.to_string());
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.reconnects.remove_if(&key, |_, entry| entry.seq == seq);
            this.repool(&key).await;
        })
        .abort_handle();
        let pending = ReconnectEntry { seq, handle };
        match slot {
            Entry::Occupied(mut occupied) => {
                occupied.insert(pending).handle.abort();
                debug!(device = name, "Replaced pending reconnect");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(pending);
            }
        }
    }

    /// One connect-and-poll attempt; reschedules itself while the device
    /// stays offline.
    async fn repool(self: &Arc<Self>, name: &str) {
        if self.is_shut_down() {
            return;
        }
        let Some(device) = self.device(name) else {
            return;
        };
        let cycle = match self.profile(name) {
            Ok(profile) => profile.polling_cycle_ms,
            Err(e) => {
                warn!(device = name, error = %e, "Cannot poll device");
                return;
            }
        };
        match device.begin_polling(cycle).await {
            Ok(()) if device.is_connected() && device.is_polling() => {
                debug!(device = name, "Device online");
            }
            Ok(()) => {
                debug!(
                    device = name,
                    retry_secs = self.retry_interval.as_secs(),
                    "Connect failed, retrying"
                );
                self.schedule_reconnect(name);
            }
            Err(e) => warn!(device = name, error = %e, "Begin polling rejected"),
        }
    }

    /// Cancel pending reconnects, dispose every device and clear the registry.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down devices");
        self.reconnects.retain(|_, entry| {
            entry.handle.abort();
            false
        });
        self.followers.clear();
        for device in self.devices.iter() {
            device.dispose();
        }
        self.devices.clear();
        self.event_token.cancel();
    }

    /// [`shutdown`](Self::shutdown), then wait for the event loop to drain
    /// within the configured timeout.
    pub async fn stop(&self) {
        self.shutdown();
        let handle = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            tokio::select! {
                _ = &mut handle => {}
                _ = sleep(self.shutdown_timeout) => {
                    warn!("Event loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for DeviceOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
