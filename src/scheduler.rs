//! Gapless playback scheduling.
//!
//! Decoded chunks are queued in arrival order and scheduled back-to-back on
//! the output clock. Each chunk starts where the previous one ends (or now, if
//! the schedule has fallen behind), so jitter in delivery does not turn into
//! gaps in the audio as long as data arrives faster than it plays.

use crate::{
    constants::{MAX_QUEUE, QUEUE_KEEP},
    frame::AudioChunk,
    output::{AudioOutput, OutputFactory},
};
use anyhow::{bail, Context, Result};
use std::collections::VecDeque;

/// Overflow policy: once `queue` holds more than [MAX_QUEUE] items, drop the
/// oldest ones so only the newest [QUEUE_KEEP] remain. Returns the number of
/// evicted items.
pub fn evict_oldest<T>(queue: &mut VecDeque<T>) -> usize {
    if queue.len() <= MAX_QUEUE {
        return 0;
    }

    let evicted = queue.len() - QUEUE_KEEP;
    queue.drain(..evicted);
    evicted
}

/// Bounded FIFO of chunks waiting to be scheduled.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    chunks: VecDeque<AudioChunk>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk, evicting the oldest backlog on overflow. Returns the
    /// number of chunks evicted.
    pub fn push(&mut self, chunk: AudioChunk) -> usize {
        self.chunks.push_back(chunk);
        evict_oldest(&mut self.chunks)
    }

    pub fn pop(&mut self) -> Option<AudioChunk> {
        self.chunks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioChunk> {
        self.chunks.iter()
    }
}

/// Outcome of one [PlaybackScheduler::drain] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub scheduled: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct PlaybackScheduler {
    sample_rate: u32,
    factory: OutputFactory,
    output: Option<Box<dyn AudioOutput>>,
    queue: PlaybackQueue,

    /// End of the last scheduled chunk on the output clock, in seconds
    next_play_time: f64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, factory: OutputFactory) -> Self {
        Self {
            sample_rate,
            factory,
            output: None,
            queue: PlaybackQueue::new(),
            next_play_time: 0.0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Opens the output clock if it is not running yet. An already running
    /// clock is kept so playback continues seamlessly across reconnects.
    pub fn start_clock(&mut self) -> Result<()> {
        if self.output.is_some() {
            return Ok(());
        }

        let mut output = (self.factory)(self.sample_rate)
            .with_context(|| format!("Failed to open audio output at {} Hz", self.sample_rate))?;

        if output.sample_rate() != self.sample_rate {
            output.close();
            bail!(
                "Audio output runs at {} Hz, stream is {} Hz",
                output.sample_rate(),
                self.sample_rate
            );
        }

        debug!("Audio output clock started at {} Hz", self.sample_rate);
        self.next_play_time = output.current_time();
        self.output = Some(output);

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.output.is_some()
    }

    pub fn enqueue(&mut self, chunk: AudioChunk) {
        let evicted = self.queue.push(chunk);
        if evicted > 0 {
            warn!(
                "Playback queue overflow, dropped {evicted} oldest chunks, {} remain",
                self.queue.len()
            );
        }
    }

    /// Schedules every queued chunk in FIFO order.
    ///
    /// Without a running output clock nothing is scheduled and the queue is
    /// left as is.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        let Some(output) = self.output.as_mut() else {
            if !self.queue.is_empty() {
                debug!(
                    "Output clock not running, holding {} chunks",
                    self.queue.len()
                );
            }
            return report;
        };

        while let Some(chunk) = self.queue.pop() {
            if chunk.is_empty() {
                report.skipped += 1;
                continue;
            }

            let start = output.current_time().max(self.next_play_time);
            match output.schedule(chunk.samples(), start) {
                Ok(()) => {
                    trace!(
                        "Scheduled {} samples at {start:.3}s, {:?} after arrival",
                        chunk.len(),
                        chunk.arrived_at().elapsed()
                    );
                    self.next_play_time = start + chunk.duration_secs(self.sample_rate);
                    report.scheduled += 1;
                }
                Err(e) => {
                    warn!("Failed to schedule chunk of {} samples: {e:?}", chunk.len());
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Discards everything waiting in the queue.
    pub fn flush(&mut self) {
        if !self.queue.is_empty() {
            debug!("Flushing {} queued chunks", self.queue.len());
        }
        self.queue.clear();
    }

    /// Flushes the queue and releases the output clock.
    pub fn stop(&mut self) {
        self.flush();
        if let Some(mut output) = self.output.take() {
            output.close();
            debug!("Audio output clock released");
        }
        self.next_play_time = 0.0;
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    /// Current time on the output clock, if it is running
    pub fn current_time(&self) -> Option<f64> {
        self.output.as_ref().map(|output| output.current_time())
    }

    /// Seconds of audio scheduled ahead of the output clock
    pub fn buffered_secs(&self) -> f64 {
        self.current_time()
            .map(|now| (self.next_play_time - now).max(0.0))
            .unwrap_or_default()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
