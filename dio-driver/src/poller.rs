use chrono::Utc;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    device::{InFlightGuard, InputChannel, IoDevice, PendingTimer},
    gesture::TimerCommand,
    types::DeviceEvent,
};

impl IoDevice {
    /// Replace the polling cadence. A zero cycle runs one tick and stops.
    pub(crate) fn spawn_poll_cadence(self: &Arc<Self>, cycle: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.swap_poll_token(Some(token.clone())) {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if cycle.is_zero() {
                if let Some(device) = weak.upgrade() {
                    device.poll_tick().await;
                    device.polling.store(false, Ordering::Release);
                }
                return;
            }

            let mut ticker = interval(cycle);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(device) = weak.upgrade() else { break };
                        device.poll_tick().await;
                    }
                }
            }
        });
    }

    #[inline]
    fn polling_stopped(&self) -> bool {
        self.stop_polling.load(Ordering::Acquire)
    }

    /// One polling pass: read inputs, resolve transitions in index order,
    /// then refresh the coil snapshot.
    pub(crate) async fn poll_tick(self: &Arc<Self>) {
        let Some(_guard) = InFlightGuard::try_acquire(&self.poll_in_flight) else {
            trace!(device = %self.name, "Poll tick still running, dropping tick");
            return;
        };
        if self.polling_stopped() {
            return;
        }
        let geometry = self.read_table().geometry;

        if geometry.input_count > 0 {
            let Some(session) = self.session.load_full() else {
                return;
            };
            let outcome = session
                .lock()
                .await
                .read_discrete_inputs(geometry.input_address, geometry.input_count)
                .await;
            match outcome {
                Ok(values) => {
                    if !self.apply_inputs(values).await {
                        return;
                    }
                }
                Err(e) if e.is_link_fault() => {
                    self.handle_session_error(&e);
                    return;
                }
                Err(e) => self.handle_session_error(&e),
            }
        }

        if geometry.coil_count == 0 || self.polling_stopped() {
            return;
        }
        let Some(session) = self.session.load_full() else {
            return;
        };
        let outcome = session
            .lock()
            .await
            .read_coils(geometry.coil_address, geometry.coil_count)
            .await;
        match outcome {
            Ok(values) => {
                let mut table = self.write_table();
                for (coil, status) in table.coils.iter_mut().zip(values) {
                    coil.status = status;
                }
            }
            Err(e) => self.handle_session_error(&e),
        }
    }

    /// Returns false when polling was stopped part-way.
    async fn apply_inputs(self: &Arc<Self>, values: Vec<bool>) -> bool {
        for (position, status) in values.into_iter().enumerate() {
            if self.polling_stopped() {
                return false;
            }
            let Ok(index) = u16::try_from(position) else {
                break;
            };

            let (transition, synced) = {
                let mut table = self.write_table();
                let timing = table.timing;
                let synced = table.is_synced(position);
                let Some(input) = table.inputs.get_mut(position) else {
                    break;
                };
                if input.status == status {
                    continue;
                }
                input.status = status;
                input.last_changed = Utc::now();
                let now = Instant::now();
                let transition = if status {
                    input.detector.press(now, &timing)
                } else {
                    input.detector.release(now, &timing)
                };
                self.apply_timer(input, index, transition.timer);
                (transition, synced)
            };

            if synced {
                if let Err(e) = self.change_coil_status(index, status).await {
                    debug!(device = %self.name, index, error = %e, "Sync write skipped");
                }
                if self.polling_stopped() {
                    return false;
                }
            }

            self.emit(DeviceEvent::InputStatusChanged { index, status });
            for gesture in transition.gestures {
                self.emit(gesture.into_event(index));
            }
        }
        true
    }

    /// Carry out a detector's timer command on its channel.
    pub(crate) fn apply_timer(self: &Arc<Self>, input: &mut InputChannel, index: u16, command: TimerCommand) {
        match command {
            TimerCommand::Keep => {}
            TimerCommand::Cancel => input.abort_timer(),
            TimerCommand::Arm(delay) => {
                input.abort_timer();
                let seq = self.timer_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(device) = weak.upgrade() {
                        device.fire_gesture_timer(index, seq);
                    }
                })
                .abort_handle();
                input.timer = Some(PendingTimer { seq, handle });
            }
        }
    }

    fn fire_gesture_timer(self: &Arc<Self>, index: u16, seq: u64) {
        if self.is_disposed() {
            return;
        }
        let gestures = {
            let mut table = self.write_table();
            let timing = table.timing;
            let Some(input) = table.inputs.get_mut(usize::from(index)) else {
                return;
            };
            // Replaced or cancelled while this one was already waking up.
            if input.timer.as_ref().map(|t| t.seq) != Some(seq) {
                return;
            }
            input.timer = None;
            let transition = input.detector.timer_fired(input.status, &timing);
            self.apply_timer(input, index, transition.timer);
            transition.gestures
        };
        for gesture in gestures {
            self.emit(gesture.into_event(index));
        }
    }
}
