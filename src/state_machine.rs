//! Device-wide state with a validated transition table.

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// Numeric values match the state codes the GUI process understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Unknown = 0,
    Starting = 1,
    WifiConfiguring = 2,
    Idle = 3,
    Connecting = 4,
    Listening = 5,
    Speaking = 6,
    Upgrading = 7,
    Activating = 8,
    AudioTesting = 9,
    FatalError = 10,
    WakeWordDetected = 11,
}

impl DeviceState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Starting => "starting",
            DeviceState::WifiConfiguring => "configuring",
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::Upgrading => "upgrading",
            DeviceState::Activating => "activating",
            DeviceState::AudioTesting => "audio_testing",
            DeviceState::FatalError => "fatal_error",
            DeviceState::WakeWordDetected => "wake_word_detected",
        }
    }

    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        if next == FatalError {
            return true;
        }
        match self {
            Unknown => matches!(next, Starting),
            Starting => matches!(next, WifiConfiguring | Activating | Idle),
            WifiConfiguring => matches!(next, AudioTesting | Starting | Idle),
            AudioTesting => matches!(next, WifiConfiguring),
            Activating => matches!(next, Idle | Upgrading | WifiConfiguring),
            Idle => matches!(
                next,
                Connecting
                    | WakeWordDetected
                    | Listening
                    | Speaking
                    | Upgrading
                    | WifiConfiguring
                    | Activating
            ),
            Connecting => matches!(next, Idle | Listening | Speaking),
            WakeWordDetected => matches!(next, Connecting | Listening | Idle),
            Listening => matches!(next, Speaking | Idle),
            Speaking => matches!(next, Listening | Idle),
            Upgrading => matches!(next, Idle),
            FatalError => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal device state transition {} -> {}", .from.name(), .to.name())]
    IllegalTransition { from: DeviceState, to: DeviceState },
}

pub type StateObserver = Box<dyn Fn(DeviceState, DeviceState) + Send + Sync>;

pub struct StateMachine {
    state: Mutex<DeviceState>,
    observers: RwLock<Vec<StateObserver>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::Unknown),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn current(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Observers run after the state lock is released, in registration order.
    pub fn add_observer(&self, observer: StateObserver) {
        self.observers.write().push(observer);
    }

    /// Move to `next`, running `side_effects(previous, next)` while the state
    /// lock is held. Returns `Ok(false)` if already in `next`.
    ///
    /// `side_effects` must not call back into this state machine.
    pub fn transition<F>(&self, next: DeviceState, side_effects: F) -> Result<bool, StateError>
    where
        F: FnOnce(DeviceState, DeviceState),
    {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == next {
                return Ok(false);
            }
            if !previous.can_transition_to(next) {
                return Err(StateError::IllegalTransition {
                    from: previous,
                    to: next,
                });
            }
            *state = next;
            side_effects(previous, next);
            previous
        };

        log::info!("STATE: {} -> {}", previous.name(), next.name());
        for observer in self.observers.read().iter() {
            observer(previous, next);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn at(state: DeviceState) -> StateMachine {
        let sm = StateMachine::new();
        *sm.state.lock() = state;
        sm
    }

    #[test]
    fn boot_path_is_legal() {
        let sm = StateMachine::new();
        for next in [
            DeviceState::Starting,
            DeviceState::Idle,
            DeviceState::Connecting,
            DeviceState::Listening,
            DeviceState::Speaking,
            DeviceState::Listening,
            DeviceState::Idle,
        ] {
            assert_eq!(sm.transition(next, |_, _| {}), Ok(true));
        }
        assert_eq!(sm.current(), DeviceState::Idle);
    }

    #[test]
    fn illegal_transition_is_rejected_without_side_effects() {
        let sm = at(DeviceState::Listening);
        let mut ran = false;
        let result = sm.transition(DeviceState::Upgrading, |_, _| ran = true);
        assert_eq!(
            result,
            Err(StateError::IllegalTransition {
                from: DeviceState::Listening,
                to: DeviceState::Upgrading
            })
        );
        assert!(!ran);
        assert_eq!(sm.current(), DeviceState::Listening);
    }

    #[test]
    fn same_state_is_a_no_op() {
        let sm = at(DeviceState::Idle);
        let mut ran = false;
        assert_eq!(sm.transition(DeviceState::Idle, |_, _| ran = true), Ok(false));
        assert!(!ran);
    }

    #[test]
    fn fatal_error_is_reachable_from_anywhere_and_terminal() {
        for state in [DeviceState::Unknown, DeviceState::Speaking, DeviceState::Upgrading] {
            assert!(state.can_transition_to(DeviceState::FatalError));
        }
        assert!(!DeviceState::FatalError.can_transition_to(DeviceState::Idle));
    }

    #[test]
    fn observers_see_previous_and_next() {
        let sm = at(DeviceState::Idle);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sm.add_observer(Box::new(move |from, to| sink.lock().push((from, to))));

        sm.transition(DeviceState::Connecting, |_, _| {}).unwrap();
        sm.transition(DeviceState::Speaking, |_, _| {}).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (DeviceState::Idle, DeviceState::Connecting),
                (DeviceState::Connecting, DeviceState::Speaking)
            ]
        );
    }

    #[test]
    fn gui_codes_are_stable() {
        assert_eq!(DeviceState::Idle.code(), 3);
        assert_eq!(DeviceState::Listening.code(), 5);
        assert_eq!(DeviceState::Speaking.code(), 6);
    }
}
