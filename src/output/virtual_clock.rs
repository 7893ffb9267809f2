use super::AudioOutput;
use anyhow::{anyhow, Result};
use std::time::Instant;

/// Output that follows the monotonic system clock without producing sound.
///
/// Used when no sound device is wanted (headless runs, CI). Scheduling still
/// behaves like a real device so the pipeline timing is the same.
pub struct VirtualOutput {
    sample_rate: u32,
    opened_at: Instant,
    scheduled_until: f64,
    closed: bool,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            opened_at: Instant::now(),
            scheduled_until: 0.0,
            closed: false,
        }
    }

    /// End of the latest scheduled block, in seconds
    pub fn scheduled_until(&self) -> f64 {
        self.scheduled_until
    }
}

impl AudioOutput for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, samples: &[f32], start: f64) -> Result<()> {
        if self.closed {
            return Err(anyhow!("Output is closed"));
        }

        let end = start + samples.len() as f64 / self.sample_rate as f64;
        trace!(
            "Virtual output: {} samples at {start:.3}s..{end:.3}s",
            samples.len()
        );
        self.scheduled_until = self.scheduled_until.max(end);

        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
