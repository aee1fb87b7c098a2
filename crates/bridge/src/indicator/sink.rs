//! Indicator output sinks

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, trace};

use super::render::Rgb;

/// Opaque "set RGB intensity" output
pub trait IndicatorSink: Send {
    fn set_rgb(&mut self, colour: Rgb) -> io::Result<()>;
}

/// Sink that only traces colour changes, for hosts without an LED
#[derive(Debug, Default)]
pub struct LogSink {
    last: Option<Rgb>,
}

impl IndicatorSink for LogSink {
    fn set_rgb(&mut self, colour: Rgb) -> io::Result<()> {
        if self.last != Some(colour) {
            trace!("Indicator colour {:?}", colour);
            self.last = Some(colour);
        }
        Ok(())
    }
}

/// Linux multicolour LED class device (`/sys/class/leds/<name>`)
///
/// Brightness is pinned to the device maximum and colour goes through
/// `multi_intensity`, which expects the channels in `multi_index` order;
/// the common red/green/blue order is assumed.
#[derive(Debug)]
pub struct SysfsLedSink {
    intensity_path: PathBuf,
    last: Option<Rgb>,
}

impl SysfsLedSink {
    /// Default sysfs root for LED class devices
    pub const LEDS_ROOT: &'static str = "/sys/class/leds";

    /// Open the LED named `name` under `root`
    pub fn open(root: &Path, name: &str) -> io::Result<Self> {
        let dir = root.join(name);
        let max = fs::read_to_string(dir.join("max_brightness"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "255".to_string());
        fs::write(dir.join("brightness"), &max)?;

        info!("Indicator LED: {} (max brightness {})", dir.display(), max);

        Ok(Self {
            intensity_path: dir.join("multi_intensity"),
            last: None,
        })
    }
}

impl IndicatorSink for SysfsLedSink {
    fn set_rgb(&mut self, colour: Rgb) -> io::Result<()> {
        if self.last == Some(colour) {
            return Ok(());
        }
        fs::write(
            &self.intensity_path,
            format!("{} {} {}", colour.r, colour.g, colour.b),
        )?;
        self.last = Some(colour);
        Ok(())
    }
}
