//! Status indicator
//!
//! Holds the single current visual state and applies the latch policy:
//! `Fault` is terminal for the process lifetime and `Busy` can only be
//! superseded by `Fault`. Every other state replaces any other freely.
//!
//! Rendering lives in [`render`] and is a pure function of state and
//! elapsed time; the physical output goes through an [`sink::IndicatorSink`].

pub mod render;
pub mod sink;

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub use render::{Rgb, render, spawn_render_worker};
pub use sink::{IndicatorSink, LogSink, SysfsLedSink};

/// Visual states, listed from lowest to highest priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorState {
    /// Running, no peripheral attached (pulsing blue)
    Idle,
    /// Listen address unavailable (pulsing orange)
    NetworkDisconnected,
    /// Peripheral attached, nobody watching (solid green)
    PeripheralConnected,
    /// At least one relay subscriber (solid cyan)
    SubscriberActive,
    /// Storage replacement in progress (pulsing magenta)
    Busy,
    /// Unrecoverable error, cleared only by restart (solid red)
    Fault,
}

impl IndicatorState {
    /// All states in ascending priority order
    pub const ALL: [IndicatorState; 6] = [
        IndicatorState::Idle,
        IndicatorState::NetworkDisconnected,
        IndicatorState::PeripheralConnected,
        IndicatorState::SubscriberActive,
        IndicatorState::Busy,
        IndicatorState::Fault,
    ];

    /// Position in the precedence order (higher wins)
    pub fn priority(self) -> u8 {
        match self {
            IndicatorState::Idle => 0,
            IndicatorState::NetworkDisconnected => 1,
            IndicatorState::PeripheralConnected => 2,
            IndicatorState::SubscriberActive => 3,
            IndicatorState::Busy => 4,
            IndicatorState::Fault => 5,
        }
    }

    /// Whether the state ignores ordinary set requests
    pub fn is_latched(self) -> bool {
        matches!(self, IndicatorState::Busy | IndicatorState::Fault)
    }
}

/// Next state after `requested` is applied on top of `current`
pub fn transition(current: IndicatorState, requested: IndicatorState) -> IndicatorState {
    match current {
        IndicatorState::Fault => IndicatorState::Fault,
        IndicatorState::Busy if requested != IndicatorState::Fault => IndicatorState::Busy,
        _ => requested,
    }
}

/// Shared handle to the process-wide indicator state
///
/// Cloning is cheap; all clones observe the same state. The lock is held
/// only for the read-modify-write, never across output I/O.
#[derive(Debug, Clone)]
pub struct Indicator {
    state: Arc<Mutex<IndicatorState>>,
}

impl Default for Indicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator {
    /// Create an indicator in `Idle`
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(IndicatorState::Idle)),
        }
    }

    /// Current state
    pub fn get(&self) -> IndicatorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request a state; returns the state in effect afterwards
    pub fn set(&self, requested: IndicatorState) -> IndicatorState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        let next = transition(current, requested);
        if next != current {
            info!("Indicator: {:?} -> {:?}", current, next);
        } else if next != requested {
            debug!(
                "Indicator: {:?} ignored while {:?} is latched",
                requested, current
            );
        }
        *state = next;
        next
    }

    /// Release a `Busy` latch after a storage job ends without restart
    ///
    /// Has no effect unless the current state is exactly `Busy`.
    pub fn clear_busy(&self, restore: IndicatorState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != IndicatorState::Busy || restore.is_latched() {
            return false;
        }
        info!("Indicator: Busy released -> {:?}", restore);
        *state = restore;
        true
    }
}
