//! Indicator rendering
//!
//! [`render`] maps `(state, elapsed)` to a colour with no stored animation
//! state. The render worker samples the shared state on a fixed tick and
//! pushes the colour to the sink.

use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::sink::IndicatorSink;
use super::{Indicator, IndicatorState};

/// 8-bit RGB intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    fn scaled(self, factor: f32) -> Self {
        let scale = |c: u8| (c as f32 * factor).round().clamp(0.0, 255.0) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

const BLUE: Rgb = Rgb::new(0, 0, 255);
const ORANGE: Rgb = Rgb::new(255, 165, 0);
const GREEN: Rgb = Rgb::new(0, 255, 0);
const CYAN: Rgb = Rgb::new(0, 255, 255);
const MAGENTA: Rgb = Rgb::new(255, 0, 255);
const RED: Rgb = Rgb::new(255, 0, 0);

/// Milliseconds per radian of the pulse sine wave
const PULSE_MS_PER_RADIAN: f32 = 400.0;

/// Lowest brightness of a pulse, as a fraction of full
const PULSE_FLOOR: f32 = 0.1;

/// Brightness factor of a pulsing colour at `elapsed`
///
/// Sine-shaped, ranging from 10% to 100%.
pub fn pulse_factor(elapsed: Duration) -> f32 {
    let angle = elapsed.as_millis() as f32 / PULSE_MS_PER_RADIAN;
    let wave = (angle.sin() + 1.0) / 2.0;
    PULSE_FLOOR + wave * (1.0 - PULSE_FLOOR)
}

/// Colour to show for `state` at `elapsed` since process start
pub fn render(state: IndicatorState, elapsed: Duration) -> Rgb {
    match state {
        IndicatorState::Idle => BLUE.scaled(pulse_factor(elapsed)),
        IndicatorState::NetworkDisconnected => ORANGE.scaled(pulse_factor(elapsed)),
        IndicatorState::PeripheralConnected => GREEN,
        IndicatorState::SubscriberActive => CYAN,
        IndicatorState::Busy => MAGENTA.scaled(pulse_factor(elapsed)),
        IndicatorState::Fault => RED,
    }
}

/// Spawn the periodic render task
///
/// Sink errors are logged once per run of consecutive failures and never
/// stop the task.
pub fn spawn_render_worker(
    indicator: Indicator,
    mut sink: Box<dyn IndicatorSink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failing = false;

        info!("Indicator render worker started ({}ms tick)", interval.as_millis());

        loop {
            ticker.tick().await;
            let colour = render(indicator.get(), started.elapsed());
            match sink.set_rgb(colour) {
                Ok(()) => failing = false,
                Err(e) => {
                    if !failing {
                        warn!("Indicator sink error: {}", e);
                    }
                    failing = true;
                }
            }
        }
    })
}
