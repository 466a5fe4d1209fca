use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::Mutex as AsyncMutex, task::AbortHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{DeviceError, DeviceResult},
    gesture::{GestureDetector, GestureTiming},
    pulse::PulseChannel,
    session::{Endpoint, IoSession, SessionConnector, SessionError, SessionOptions},
    types::{
        DeviceEvent, DeviceEventEnvelope, DeviceGeometry, DeviceSnapshot, EventSender,
        CONNECT_TIMEOUT_MS, DEFAULT_POLLING_CYCLE_MS, MAX_COIL_COUNT, MAX_INPUT_COUNT,
    },
};

/// Live transport session; the async mutex serializes requests on the wire.
pub(crate) type SharedSession = Arc<AsyncMutex<Box<dyn IoSession>>>;

/// The single outstanding gesture wait-timer of an input channel.
#[derive(Debug)]
pub(crate) struct PendingTimer {
    pub seq: u64,
    pub handle: AbortHandle,
}

#[derive(Debug)]
pub(crate) struct InputChannel {
    pub status: bool,
    pub last_changed: DateTime<Utc>,
    pub detector: GestureDetector,
    pub timer: Option<PendingTimer>,
}

impl InputChannel {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: false,
            last_changed: now,
            detector: GestureDetector::default(),
            timer: None,
        }
    }

    pub fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CoilChannel {
    pub status: bool,
    pub sync: bool,
    pub pulse: PulseChannel,
}

/// Everything guarded by the per-device lock. Input and coil vectors are
/// only ever resized together, by [`IoDevice::initialize`].
#[derive(Debug)]
pub(crate) struct ChannelTable {
    pub geometry: DeviceGeometry,
    pub polling_cycle: Duration,
    pub timing: GestureTiming,
    pub inputs: Vec<InputChannel>,
    pub coils: Vec<CoilChannel>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            geometry: DeviceGeometry::default(),
            polling_cycle: Duration::from_millis(DEFAULT_POLLING_CYCLE_MS),
            timing: GestureTiming::default(),
            inputs: Vec::new(),
            coils: Vec::new(),
        }
    }
}

impl ChannelTable {
    pub fn ensure_initialized(&self, device: &str) -> DeviceResult<()> {
        if self.geometry.is_initialized() {
            Ok(())
        } else {
            Err(DeviceError::ConfigurationError(format!(
                "Device [{device}] is not initialized"
            )))
        }
    }

    pub fn input_mut(&mut self, index: u16) -> DeviceResult<&mut InputChannel> {
        let count = self.inputs.len();
        self.inputs.get_mut(usize::from(index)).ok_or_else(|| {
            DeviceError::ConfigurationError(format!("Input index {index} out of range (count {count})"))
        })
    }

    pub fn coil(&self, index: u16) -> DeviceResult<&CoilChannel> {
        self.coils.get(usize::from(index)).ok_or_else(|| {
            DeviceError::ConfigurationError(format!(
                "Coil index {index} out of range (count {})",
                self.coils.len()
            ))
        })
    }

    pub fn coil_mut(&mut self, index: u16) -> DeviceResult<&mut CoilChannel> {
        let count = self.coils.len();
        self.coils.get_mut(usize::from(index)).ok_or_else(|| {
            DeviceError::ConfigurationError(format!("Coil index {index} out of range (count {count})"))
        })
    }

    /// Coil paired with an input for mirroring, if sync is on for it.
    pub fn is_synced(&self, index: usize) -> bool {
        index < usize::from(self.geometry.sync_count())
            && self.coils.get(index).is_some_and(|c| c.sync)
    }
}

/// Drops overlapping runs of a recurring task instead of queueing them.
pub(crate) struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One discrete-I/O module: connection manager, polling engine, output
/// synchronizer and pulse generator over a single transport session.
///
/// Events are pushed into the [`EventSender`] registered at construction.
/// Recurring tasks hold only a weak reference, so dropping the last `Arc`
/// ends them; [`IoDevice::dispose`] ends them explicitly.
pub struct IoDevice {
    pub(crate) name: Arc<str>,
    endpoint: Mutex<Endpoint>,
    connector: Arc<dyn SessionConnector>,
    pub(crate) session: ArcSwapOption<AsyncMutex<Box<dyn IoSession>>>,
    table: RwLock<ChannelTable>,
    pub(crate) connected: AtomicBool,
    pub(crate) polling: AtomicBool,
    pub(crate) stop_polling: AtomicBool,
    pub(crate) poll_in_flight: AtomicBool,
    pub(crate) pulse_in_flight: AtomicBool,
    pub(crate) pulsing: AtomicBool,
    disposed: AtomicBool,
    pub(crate) timer_seq: AtomicU64,
    poll_token: Mutex<Option<CancellationToken>>,
    pulse_token: Mutex<Option<CancellationToken>>,
    events: EventSender,
}

impl std::fmt::Debug for IoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDevice")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint())
            .field("connected", &self.is_connected())
            .field("polling", &self.is_polling())
            .finish_non_exhaustive()
    }
}

impl IoDevice {
    pub fn new(
        name: impl Into<Arc<str>>,
        endpoint: Endpoint,
        connector: Arc<dyn SessionConnector>,
        events: EventSender,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: Mutex::new(endpoint),
            connector,
            session: ArcSwapOption::from(None),
            table: RwLock::new(ChannelTable::default()),
            connected: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            stop_polling: AtomicBool::new(false),
            poll_in_flight: AtomicBool::new(false),
            pulse_in_flight: AtomicBool::new(false),
            pulsing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            timer_seq: AtomicU64::new(0),
            poll_token: Mutex::new(None),
            pulse_token: Mutex::new(None),
            events,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.read_table().geometry
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn polling_cycle_ms(&self) -> u64 {
        u64::try_from(self.read_table().polling_cycle.as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn read_table(&self) -> RwLockReadGuard<'_, ChannelTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_table(&self) -> RwLockWriteGuard<'_, ChannelTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_live(&self) -> DeviceResult<()> {
        if self.is_disposed() {
            Err(DeviceError::Disposed(self.name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Live, initialized and connected.
    pub(crate) fn ensure_ready(&self) -> DeviceResult<()> {
        self.ensure_live()?;
        self.read_table().ensure_initialized(&self.name)?;
        if !self.is_connected() {
            return Err(DeviceError::NotConnected(self.name.to_string()));
        }
        Ok(())
    }

    /// Run a configuration change against an initialized, live device.
    pub(crate) fn with_table_mut<T>(
        &self,
        f: impl FnOnce(&mut ChannelTable) -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        self.ensure_live()?;
        let mut table = self.write_table();
        table.ensure_initialized(&self.name)?;
        f(&mut table)
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        trace!(device = %self.name, ?event, "Device event");
        let envelope = DeviceEventEnvelope {
            device: Arc::clone(&self.name),
            event,
            at: Utc::now(),
        };
        if self.events.send(envelope).is_err() {
            trace!(device = %self.name, "Event receiver dropped");
        }
    }

    pub(crate) fn swap_poll_token(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        std::mem::replace(
            &mut *self.poll_token.lock().unwrap_or_else(PoisonError::into_inner),
            token,
        )
    }

    pub(crate) fn swap_pulse_token(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        std::mem::replace(
            &mut *self.pulse_token.lock().unwrap_or_else(PoisonError::into_inner),
            token,
        )
    }

    /// Fix the channel geometry and reset every channel to its defaults.
    pub fn initialize(&self, geometry: DeviceGeometry, polling_cycle_ms: u64) -> DeviceResult<()> {
        self.ensure_live()?;
        if self.is_connected() {
            return Err(DeviceError::ConfigurationError(format!(
                "Device [{}] cannot be re-initialized while connected",
                self.name
            )));
        }
        if !geometry.is_initialized() {
            return Err(DeviceError::ConfigurationError(
                "Input and coil counts cannot both be zero".into(),
            ));
        }
        if geometry.input_count > MAX_INPUT_COUNT {
            return Err(DeviceError::ConfigurationError(format!(
                "Input count {} exceeds {MAX_INPUT_COUNT}",
                geometry.input_count
            )));
        }
        if geometry.coil_count > MAX_COIL_COUNT {
            return Err(DeviceError::ConfigurationError(format!(
                "Coil count {} exceeds {MAX_COIL_COUNT}",
                geometry.coil_count
            )));
        }
        let span_fits = |address: u16, count: u16| u32::from(address) + u32::from(count) <= 0x1_0000;
        if !span_fits(geometry.input_address, geometry.input_count)
            || !span_fits(geometry.coil_address, geometry.coil_count)
        {
            return Err(DeviceError::ConfigurationError(
                "Channel block exceeds the 16-bit address space".into(),
            ));
        }

        let now = Utc::now();
        let mut table = self.write_table();
        for input in table.inputs.iter_mut() {
            input.abort_timer();
        }
        *table = ChannelTable {
            geometry,
            polling_cycle: Duration::from_millis(polling_cycle_ms),
            timing: GestureTiming::default(),
            inputs: (0..geometry.input_count)
                .map(|_| InputChannel::new(now))
                .collect(),
            coils: (0..geometry.coil_count)
                .map(|_| CoilChannel::default())
                .collect(),
        };
        info!(device = %self.name, ?geometry, polling_cycle_ms, "Device initialized");
        Ok(())
    }

    /// Change the remote address; a connected device is disconnected when it differs.
    pub fn set_endpoint(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        let changed = {
            let mut endpoint = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = endpoint.host != host || endpoint.port != port;
            endpoint.host = host;
            endpoint.port = port;
            changed
        };
        if changed && self.is_connected() {
            debug!(device = %self.name, "Endpoint changed, dropping session");
            self.disconnect();
        }
    }

    /// Mirror the first `min(inputs, coils)` inputs to their coils, or stop mirroring.
    pub fn set_io_sync_all(&self, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            let paired = usize::from(table.geometry.sync_count());
            table
                .coils
                .iter_mut()
                .take(paired)
                .for_each(|c| c.sync = enabled);
            Ok(())
        })
    }

    pub fn set_io_sync(&self, index: u16, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            let paired = table.geometry.sync_count();
            if index >= paired {
                return Err(DeviceError::ConfigurationError(format!(
                    "Sync index {index} out of range (paired channels {paired})"
                )));
            }
            table.coil_mut(index)?.sync = enabled;
            Ok(())
        })
    }

    pub fn set_push_timeout_all(&self, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            table
                .inputs
                .iter_mut()
                .for_each(|i| i.detector.long_push_timeout_enabled = enabled);
            Ok(())
        })
    }

    pub fn set_push_timeout(&self, index: u16, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            table.input_mut(index)?.detector.long_push_timeout_enabled = enabled;
            Ok(())
        })
    }

    pub fn set_double_click_all(&self, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            table
                .inputs
                .iter_mut()
                .for_each(|i| i.detector.double_click_enabled = enabled);
            Ok(())
        })
    }

    pub fn set_double_click(&self, index: u16, enabled: bool) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            table.input_mut(index)?.detector.double_click_enabled = enabled;
            Ok(())
        })
    }

    /// Long-push action threshold for every input, 3 to 60 seconds.
    pub fn set_long_push_time(&self, secs: u16) -> DeviceResult<()> {
        if !(3..=60).contains(&secs) {
            return Err(DeviceError::ConfigurationError(format!(
                "Long push time must be 3..=60 s, got {secs}"
            )));
        }
        self.with_table_mut(|table| {
            let threshold = Duration::from_secs(u64::from(secs));
            table
                .inputs
                .iter_mut()
                .for_each(|i| i.detector.long_push_action = threshold);
            Ok(())
        })
    }

    /// Long-push action threshold for one input, at least 100 ms.
    pub fn set_channel_long_push_time(&self, index: u16, millis: u64) -> DeviceResult<()> {
        if millis < 100 {
            return Err(DeviceError::ConfigurationError(format!(
                "Long push time must be at least 100 ms, got {millis}"
            )));
        }
        self.with_table_mut(|table| {
            table.input_mut(index)?.detector.long_push_action = Duration::from_millis(millis);
            Ok(())
        })
    }

    /// Device-wide long-push timeout, 1 to 60 seconds.
    pub fn set_long_push_timeout(&self, secs: u16) -> DeviceResult<()> {
        if !(1..=60).contains(&secs) {
            return Err(DeviceError::ConfigurationError(format!(
                "Long push timeout must be 1..=60 s, got {secs}"
            )));
        }
        self.with_table_mut(|table| {
            table.timing.long_push_timeout_secs = secs;
            Ok(())
        })
    }

    /// Device-wide double-click window, 100 to 5000 ms.
    pub fn set_double_click_window(&self, millis: u16) -> DeviceResult<()> {
        if !(100..=5000).contains(&millis) {
            return Err(DeviceError::ConfigurationError(format!(
                "Double click window must be 100..=5000 ms, got {millis}"
            )));
        }
        self.with_table_mut(|table| {
            table.timing.double_click_window = Duration::from_millis(u64::from(millis));
            Ok(())
        })
    }

    /// Change the polling period; a running cadence restarts at the new period.
    pub fn set_polling_cycle(self: &Arc<Self>, millis: u64) -> DeviceResult<()> {
        let cycle = Duration::from_millis(millis);
        self.with_table_mut(|table| {
            table.polling_cycle = cycle;
            Ok(())
        })?;
        if self.is_polling() {
            self.spawn_poll_cadence(cycle);
            self.polling.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Open the transport within the bounded connect wait.
    ///
    /// Every failure is logged and reported as `false`.
    pub async fn connect(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        let endpoint = self.endpoint();
        debug!(device = %self.name, %endpoint, "Connecting to device");

        let wait = Duration::from_millis(CONNECT_TIMEOUT_MS);
        let session = match timeout(
            wait,
            self.connector.connect(&endpoint, SessionOptions::default()),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                debug!(device = %self.name, %endpoint, error = %e, "Can't connect to device");
                return false;
            }
            Err(_) => {
                debug!(device = %self.name, %endpoint, timeout_ms = CONNECT_TIMEOUT_MS, "Connect timed out");
                return false;
            }
        };

        let session: SharedSession = Arc::new(AsyncMutex::new(session));
        if self.is_disposed() {
            close_detached(session);
            return false;
        }
        if let Some(stale) = self.session.swap(Some(session)) {
            close_detached(stale);
        }
        self.connected.store(true, Ordering::Release);
        info!(device = %self.name, %endpoint, "Device connected");
        self.emit(DeviceEvent::Connected);
        true
    }

    /// Stop polling and release the transport. Returns whether a live session
    /// was torn down; `Disconnected` is emitted only in that case.
    pub fn disconnect(&self) -> bool {
        self.stop_polling.store(true, Ordering::Release);
        if let Some(token) = self.swap_poll_token(None) {
            token.cancel();
        }
        self.polling.store(false, Ordering::Release);

        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        let session = self.session.swap(None);
        let torn_down = was_connected || session.is_some();
        if let Some(session) = session {
            close_detached(session);
        }
        if torn_down {
            info!(device = %self.name, "Device disconnected");
            self.emit(DeviceEvent::Disconnected);
        }
        torn_down
    }

    /// Connect and start the polling cadence.
    ///
    /// Only configuration problems are errors; a failed connect returns
    /// `Ok(())` with the device left disconnected.
    pub async fn begin_polling(self: &Arc<Self>, cycle_ms: u64) -> DeviceResult<()> {
        self.ensure_live()?;
        let cycle = Duration::from_millis(cycle_ms);
        {
            let mut table = self.write_table();
            table.ensure_initialized(&self.name)?;
            table.polling_cycle = cycle;
        }
        self.stop_polling.store(false, Ordering::Release);

        if !self.is_connected() && !self.connect().await {
            return Ok(());
        }

        self.polling.store(true, Ordering::Release);
        self.spawn_poll_cadence(cycle);
        info!(device = %self.name, cycle_ms, "Polling started");
        self.emit(DeviceEvent::PollingStarted);
        Ok(())
    }

    /// Sort a failed request: exceptions are logged and skipped, link faults
    /// tear the session down.
    pub(crate) fn handle_session_error(&self, error: &SessionError) {
        if !error.is_link_fault() {
            debug!(device = %self.name, error = %error, "Modbus exception, skipping");
            return;
        }
        warn!(device = %self.name, error = %error, "Link fault, closing session");
        if self.disconnect() {
            self.emit(DeviceEvent::PollingStopped);
        }
    }

    /// Terminal shutdown: stops every cadence and timer and closes the transport.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.halt_pulse_cadence();
        {
            let mut table = self.write_table();
            for input in table.inputs.iter_mut() {
                input.abort_timer();
                input.detector.reset();
            }
        }
        self.disconnect();
        info!(device = %self.name, "Device disposed");
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let table = self.read_table();
        DeviceSnapshot {
            name: Arc::clone(&self.name),
            endpoint: self.endpoint(),
            geometry: table.geometry,
            connected: self.is_connected(),
            polling: self.is_polling(),
            pulsing: self.is_on_pulse(),
            inputs: table.inputs.iter().map(|i| i.status).collect(),
            input_last_changed: table.inputs.iter().map(|i| i.last_changed).collect(),
            coils: table.coils.iter().map(|c| c.status).collect(),
            pulse_enabled: table.coils.iter().map(|c| c.pulse.is_enabled()).collect(),
        }
    }
}

impl Drop for IoDevice {
    fn drop(&mut self) {
        for token in [self.swap_poll_token(None), self.swap_pulse_token(None)]
            .into_iter()
            .flatten()
        {
            token.cancel();
        }
    }
}

/// Close a session off the caller's task; a no-op outside a runtime.
fn close_detached(session: SharedSession) {
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(async move {
            session.lock().await.disconnect().await;
        });
    }
}
