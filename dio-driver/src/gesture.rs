//! Per-input gesture detection.
//!
//! Raw transitions plus timer expiries become button gestures. The detector
//! is pure: it never sleeps or spawns, it only tells the caller which events
//! to emit and what to do with the channel's single wait-timer.
//!
//! | State                    | Entered on                               | Timer                |
//! |--------------------------|------------------------------------------|----------------------|
//! | `Idle`                   | start, or a press cycle resolved         | none                 |
//! | `WaitingFirstClick`      | first press                              | `window / 2`         |
//! | `WaitingLongPushTimeout` | first-click check while still held       | long-push timeout    |
//! | `WaitingDoubleClick`     | short release with double-click enabled  | `window / 4`         |
//!
//! A second press while a timer is pending and within `window` of the first
//! press resolves immediately as a double click, before its release.

use std::time::Duration;
use tokio::time::Instant;

use crate::types::{
    DeviceEvent, DEFAULT_DOUBLE_CLICK_WINDOW_MS, DEFAULT_LONG_PUSH_ACTION_SECS,
    DEFAULT_LONG_PUSH_TIMEOUT_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GestureState {
    #[default]
    Idle,
    WaitingFirstClick,
    WaitingLongPushTimeout,
    WaitingDoubleClick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    ButtonDown,
    ButtonUp,
    Click,
    DoubleClick,
    LongPush(Duration),
    LongPushTimeout(u16),
}

impl Gesture {
    pub fn into_event(self, index: u16) -> DeviceEvent {
        match self {
            Gesture::ButtonDown => DeviceEvent::ButtonDown { index },
            Gesture::ButtonUp => DeviceEvent::ButtonUp { index },
            Gesture::Click => DeviceEvent::Click { index },
            Gesture::DoubleClick => DeviceEvent::DoubleClick { index },
            Gesture::LongPush(held) => DeviceEvent::LongPush {
                index,
                duration_ms: u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
            },
            Gesture::LongPushTimeout(timeout_secs) => DeviceEvent::LongPushTimeout {
                index,
                timeout_secs,
            },
        }
    }
}

/// What the owner must do with the channel's wait-timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Keep,
    Cancel,
    /// Replace any pending timer with one firing after the delay.
    Arm(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub gestures: Vec<Gesture>,
    pub timer: TimerCommand,
}

impl Transition {
    fn new(timer: TimerCommand) -> Self {
        Self {
            gestures: Vec::with_capacity(2),
            timer,
        }
    }

    fn emit(mut self, gesture: Gesture) -> Self {
        self.gestures.push(gesture);
        self
    }
}

/// Device-wide timing shared by every input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureTiming {
    pub double_click_window: Duration,
    pub long_push_timeout_secs: u16,
}

impl Default for GestureTiming {
    fn default() -> Self {
        Self {
            double_click_window: Duration::from_millis(u64::from(DEFAULT_DOUBLE_CLICK_WINDOW_MS)),
            long_push_timeout_secs: DEFAULT_LONG_PUSH_TIMEOUT_SECS,
        }
    }
}

impl GestureTiming {
    #[inline]
    fn first_click_check(&self) -> Duration {
        self.double_click_window / 2
    }

    #[inline]
    fn double_click_wait(&self) -> Duration {
        self.double_click_window / 4
    }

    #[inline]
    fn long_push_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.long_push_timeout_secs))
    }
}

#[derive(Debug, Clone)]
pub struct GestureDetector {
    state: GestureState,
    pressed_at: Option<Instant>,
    pub double_click_enabled: bool,
    pub long_push_timeout_enabled: bool,
    pub long_push_action: Duration,
}

impl Default for GestureDetector {
    fn default() -> Self {
        Self {
            state: GestureState::Idle,
            pressed_at: None,
            double_click_enabled: true,
            long_push_timeout_enabled: true,
            long_push_action: Duration::from_secs(u64::from(DEFAULT_LONG_PUSH_ACTION_SECS)),
        }
    }
}

impl GestureDetector {
    #[inline]
    pub fn state(&self) -> GestureState {
        self.state
    }

    /// A wait-timer is pending exactly when the state is not `Idle`.
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.state != GestureState::Idle
    }

    /// Drop any in-progress press cycle.
    pub fn reset(&mut self) {
        self.state = GestureState::Idle;
        self.pressed_at = None;
    }

    /// false -> true transition.
    pub fn press(&mut self, now: Instant, timing: &GestureTiming) -> Transition {
        if !self.is_waiting() {
            self.pressed_at = Some(now);
            self.state = GestureState::WaitingFirstClick;
            return Transition::new(TimerCommand::Arm(timing.first_click_check()))
                .emit(Gesture::ButtonDown);
        }

        let since_first = self.held_for(now);
        if since_first <= timing.double_click_window {
            self.state = GestureState::Idle;
            return Transition::new(TimerCommand::Cancel)
                .emit(Gesture::ButtonDown)
                .emit(Gesture::DoubleClick);
        }

        // Too late for a double click; the pending timer resolves the cycle.
        Transition::new(TimerCommand::Keep).emit(Gesture::ButtonDown)
    }

    /// true -> false transition.
    pub fn release(&mut self, now: Instant, timing: &GestureTiming) -> Transition {
        if !self.is_waiting() {
            // Cycle already resolved, e.g. by a long-push timeout.
            return Transition::new(TimerCommand::Keep).emit(Gesture::ButtonUp);
        }

        let held = self.held_for(now);
        self.state = GestureState::Idle;

        if !self.double_click_enabled {
            return Transition::new(TimerCommand::Cancel)
                .emit(Gesture::ButtonUp)
                .emit(Gesture::Click);
        }
        if held < timing.double_click_window {
            self.state = GestureState::WaitingDoubleClick;
            return Transition::new(TimerCommand::Arm(timing.double_click_wait()))
                .emit(Gesture::ButtonUp);
        }
        if held > self.long_push_action {
            return Transition::new(TimerCommand::Cancel)
                .emit(Gesture::ButtonUp)
                .emit(Gesture::LongPush(held));
        }
        Transition::new(TimerCommand::Cancel)
            .emit(Gesture::ButtonUp)
            .emit(Gesture::Click)
    }

    /// The pending wait-timer expired. `pressed` is the channel's stored status.
    pub fn timer_fired(&mut self, pressed: bool, timing: &GestureTiming) -> Transition {
        match self.state {
            GestureState::Idle => Transition::new(TimerCommand::Keep),
            GestureState::WaitingFirstClick => {
                if self.long_push_timeout_enabled && pressed {
                    self.state = GestureState::WaitingLongPushTimeout;
                    Transition::new(TimerCommand::Arm(timing.long_push_timeout()))
                } else {
                    self.state = GestureState::Idle;
                    Transition::new(TimerCommand::Keep).emit(Gesture::Click)
                }
            }
            GestureState::WaitingLongPushTimeout => {
                self.state = GestureState::Idle;
                Transition::new(TimerCommand::Keep)
                    .emit(Gesture::LongPushTimeout(timing.long_push_timeout_secs))
            }
            GestureState::WaitingDoubleClick => {
                self.state = GestureState::Idle;
                Transition::new(TimerCommand::Keep).emit(Gesture::Click)
            }
        }
    }

    #[inline]
    fn held_for(&self, now: Instant) -> Duration {
        self.pressed_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }
}
