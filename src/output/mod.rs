//! Audio output back-ends.
//!
//! An [AudioOutput] is the clock the playback scheduler plans against: it
//! reports the current playback time and accepts blocks of samples to be
//! played starting at a given time on that same clock.

#[cfg(feature = "cpal")]
pub mod device;
pub mod virtual_clock;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use virtual_clock::VirtualOutput;

pub trait AudioOutput: Send {
    /// Sample rate the output was opened with
    fn sample_rate(&self) -> u32;

    /// Current playback time in seconds since the output was opened
    fn current_time(&self) -> f64;

    /// Queue `samples` for playback starting at `start` seconds.
    fn schedule(&mut self, samples: &[f32], start: f64) -> Result<()>;

    /// Release the underlying resource. Scheduled audio is discarded.
    fn close(&mut self);
}

/// Opens a fresh output at the given sample rate.
pub type OutputFactory = Arc<dyn Fn(u32) -> Result<Box<dyn AudioOutput>> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Keeps time with the system clock and discards the audio
    #[default]
    Virtual,

    /// Plays through the default sound device
    Device,
}

pub fn factory(kind: OutputKind) -> OutputFactory {
    match kind {
        OutputKind::Virtual => Arc::new(|sample_rate: u32| -> Result<Box<dyn AudioOutput>> {
            Ok(Box::new(VirtualOutput::new(sample_rate)))
        }),
        #[cfg(feature = "cpal")]
        OutputKind::Device => Arc::new(|sample_rate: u32| -> Result<Box<dyn AudioOutput>> {
            Ok(Box::new(device::DeviceOutput::open(sample_rate)?))
        }),
        #[cfg(not(feature = "cpal"))]
        OutputKind::Device => Arc::new(|_: u32| -> Result<Box<dyn AudioOutput>> {
            Err(anyhow::anyhow!(
                "Device output requested but the cpal feature is not enabled"
            ))
        }),
    }
}
