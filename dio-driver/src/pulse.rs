//! Blink patterns on coils.
//!
//! A coil's pulse shape is two signed unit counts (one unit = one
//! [`PULSE_STEP_MS`] tick) plus a start delay. The positive count is the
//! on-phase length, the negative one the off-phase length; their order
//! decides whether the coil starts on or off.

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    device::{InFlightGuard, IoDevice},
    error::{DeviceError, DeviceResult},
    types::PULSE_STEP_MS,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseChannel {
    enabled: bool,
    high: i16,
    low: i16,
    delay: u16,
    step: i32,
}

impl PulseChannel {
    /// Validated pulse shape; both bounds must be non-zero with opposite signs.
    pub fn new(high: i16, low: i16, delay: u16) -> DeviceResult<Self> {
        if high == 0 || low == 0 || (high > 0) == (low > 0) {
            return Err(DeviceError::InvalidArgument(format!(
                "Pulse bounds must be non-zero with opposite signs, got ({high}, {low})"
            )));
        }
        Ok(Self {
            enabled: true,
            high,
            low,
            delay,
            step: 0,
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn shape(&self) -> (i16, i16, u16) {
        (self.high, self.low, self.delay)
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Initial step bias applied when a pulse run starts.
    ///
    /// Without a delay the counter starts at zero, so the first phase is one
    /// tick short: `(5, -5)` gives four off ticks, then five on, five off.
    pub fn arm(&mut self) {
        let (high, low, delay) = (
            i32::from(self.high),
            i32::from(self.low),
            i32::from(self.delay),
        );
        self.step = if delay == 0 {
            0
        } else if high > low {
            high + delay
        } else {
            low - delay
        };
    }

    /// Advance one tick and return the coil status for it.
    pub fn advance(&mut self) -> bool {
        let (high, low) = (i32::from(self.high), i32::from(self.low));
        if high > low {
            self.step -= 1;
            if self.step <= low {
                self.step = high;
            }
            self.step > 0
        } else {
            self.step += 1;
            if self.step >= low {
                self.step = high;
            }
            self.step >= 0
        }
    }

    pub fn reset_step(&mut self) {
        self.step = 0;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl IoDevice {
    /// Enable a blink pattern on one coil; takes effect on the next [`start_pulse`](Self::start_pulse).
    pub fn set_pulse_control(&self, index: u16, high: i16, low: i16, delay: u16) -> DeviceResult<()> {
        let pulse = PulseChannel::new(high, low, delay)?;
        self.with_table_mut(|table| {
            table.coil_mut(index)?.pulse = pulse;
            Ok(())
        })?;
        debug!(device = %self.name, index, high, low, delay, "Pulse configured");
        Ok(())
    }

    pub fn disable_pulse(&self, index: u16) -> DeviceResult<()> {
        self.with_table_mut(|table| {
            table.coil_mut(index)?.pulse.disable();
            Ok(())
        })
    }

    pub fn is_pulse_enabled(&self, index: u16) -> DeviceResult<bool> {
        let table = self.read_table();
        table.ensure_initialized(&self.name)?;
        table.coil(index).map(|coil| coil.pulse.is_enabled())
    }

    /// Whether the pulse cadence is running.
    #[inline]
    pub fn is_on_pulse(&self) -> bool {
        self.pulsing.load(Ordering::Acquire)
    }

    /// Bias every enabled coil by its delay and start the pulse cadence.
    pub fn start_pulse(self: &Arc<Self>) -> DeviceResult<()> {
        self.ensure_ready()?;
        {
            let mut table = self.write_table();
            for coil in table.coils.iter_mut().filter(|c| c.pulse.is_enabled()) {
                coil.pulse.arm();
            }
        }
        self.spawn_pulse_cadence();
        info!(device = %self.name, "Pulse started");
        Ok(())
    }

    /// Stop the cadence, keeping every step counter where it is.
    pub fn pause_pulse(&self) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.halt_pulse_cadence();
        Ok(())
    }

    /// Restart the cadence from the current step counters.
    pub fn resume_pulse(self: &Arc<Self>) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.spawn_pulse_cadence();
        Ok(())
    }

    /// Stop the cadence and zero the transient step counters.
    pub fn stop_pulse(&self) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.halt_pulse_cadence();
        let mut table = self.write_table();
        table.coils.iter_mut().for_each(|c| c.pulse.reset_step());
        Ok(())
    }

    /// Stop the cadence and forget every pulse shape.
    pub fn clear_pulse(&self) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.halt_pulse_cadence();
        let mut table = self.write_table();
        table.coils.iter_mut().for_each(|c| c.pulse.clear());
        Ok(())
    }

    pub(crate) fn halt_pulse_cadence(&self) {
        if let Some(token) = self.swap_pulse_token(None) {
            token.cancel();
            debug!(device = %self.name, "Pulse cadence stopped");
        }
        self.pulsing.store(false, Ordering::Release);
    }

    fn spawn_pulse_cadence(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.swap_pulse_token(Some(token.clone())) {
            previous.cancel();
        }
        self.pulsing.store(true, Ordering::Release);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(PULSE_STEP_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(device) = weak.upgrade() else { break };
                        device.pulse_tick().await;
                    }
                }
            }
        });
    }

    async fn pulse_tick(&self) {
        let Some(_guard) = InFlightGuard::try_acquire(&self.pulse_in_flight) else {
            trace!(device = %self.name, "Pulse tick still running, dropping tick");
            return;
        };
        if !self.is_connected() {
            return;
        }

        let (address, block) = {
            let mut table = self.write_table();
            let mut changed = false;
            for coil in table.coils.iter_mut().filter(|c| c.pulse.is_enabled()) {
                let status = coil.pulse.advance();
                if status != coil.status {
                    coil.status = status;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
            let block: Vec<bool> = table.coils.iter().map(|c| c.status).collect();
            (table.geometry.coil_address, block)
        };
        self.write_coil_block(address, &block).await;
    }
}
