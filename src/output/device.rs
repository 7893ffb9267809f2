//! Sound device output via cpal.
//!
//! The device is opened at its own default rate and sample format. Scheduled
//! stream audio is resampled to the device rate and written into a timeline
//! buffer positioned in device frames. The device callback pops from the head
//! of the timeline and plays silence when nothing is scheduled, so the clock
//! keeps running.

use super::AudioOutput;
use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Scheduled blocks closer than this to the end of the previous one are
/// treated as continuing it
const CONTIGUOUS_EPSILON: f64 = 1e-6;

#[derive(Default)]
struct Timeline {
    /// Frames handed to the device so far, also the frame index of `samples[0]`
    played: u64,
    samples: VecDeque<f32>,
}

impl Timeline {
    fn write(&mut self, samples: &[f32], start_frame: u64) {
        // Anything scheduled in the past is clipped off the front
        let skip = self.played.saturating_sub(start_frame) as usize;
        if skip >= samples.len() {
            return;
        }

        let offset = start_frame.saturating_sub(self.played) as usize;
        if self.samples.len() < offset {
            self.samples.resize(offset, 0.0);
        }

        for (i, sample) in samples[skip..].iter().enumerate() {
            let index = offset + i;
            if index < self.samples.len() {
                self.samples[index] = *sample;
            } else {
                self.samples.push_back(*sample);
            }
        }
    }
}

/// Mono sample rate converter fed in arbitrary sized pieces.
///
/// Input is buffered until the resampler has a full block. Equal rates pass
/// straight through.
struct RateConverter {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl RateConverter {
    fn new(from: u32, to: u32) -> Result<Self> {
        let resampler = if from == to {
            None
        } else {
            // 10ms blocks
            let chunk_size = (from as usize / 100).max(1);
            let resampler = FftFixedIn::<f32>::new(from as usize, to as usize, chunk_size, 1, 1)
                .with_context(|| format!("Failed to create resampler {from} Hz -> {to} Hz"))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let block: Vec<Vec<f32>> =
                vec![self.pending.drain(..resampler.input_frames_next()).collect()];
            let mut converted = resampler.process(&block, None)?;
            output.append(&mut converted[0]);
        }

        Ok(output)
    }

    /// Converts whatever is still buffered, padded with silence to a full block.
    fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(vec![]);
        };
        if self.pending.is_empty() {
            return Ok(vec![]);
        }

        let mut tail = std::mem::take(&mut self.pending);
        tail.resize(resampler.input_frames_next(), 0.0);
        let block: Vec<Vec<f32>> = vec![tail];
        let mut converted = resampler.process(&block, None)?;
        Ok(std::mem::take(&mut converted[0]))
    }

    fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Places stream-rate blocks on the device timeline.
///
/// Back to back blocks are converted as one continuous signal. A block that
/// does not continue the previous one starts a new run at its own position.
struct TimelineWriter {
    stream_rate: u32,
    device_rate: u32,
    converter: RateConverter,
    /// Device frame the next converted sample goes to
    cursor: u64,
    /// End of the latest scheduled block, in seconds
    scheduled_until: f64,
}

impl TimelineWriter {
    fn new(stream_rate: u32, device_rate: u32) -> Result<Self> {
        Ok(Self {
            stream_rate,
            device_rate,
            converter: RateConverter::new(stream_rate, device_rate)?,
            cursor: 0,
            scheduled_until: 0.0,
        })
    }

    fn write(&mut self, timeline: &mut Timeline, samples: &[f32], start: f64) -> Result<()> {
        if (start - self.scheduled_until).abs() > CONTIGUOUS_EPSILON {
            let tail = self.converter.flush()?;
            timeline.write(&tail, self.cursor);
            self.converter.reset();
            self.cursor = (start * self.device_rate as f64).round() as u64;
        }

        let converted = self.converter.process(samples)?;
        timeline.write(&converted, self.cursor);
        self.cursor += converted.len() as u64;
        self.scheduled_until = start + samples.len() as f64 / self.stream_rate as f64;

        Ok(())
    }
}

struct SendStream {
    stream: cpal::Stream,
}
unsafe impl Send for SendStream {}

pub struct DeviceOutput {
    stream_rate: u32,
    device_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    writer: TimelineWriter,
    stream: Option<SendStream>,
}

impl DeviceOutput {
    /// Opens the default device for audio arriving at `stream_rate`.
    pub fn open(stream_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No audio output device found")?;

        let supported = device
            .default_output_config()
            .context("Failed to query output device config")?;
        let device_rate = supported.sample_rate().0;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let writer = TimelineWriter::new(stream_rate, device_rate)?;

        let timeline = Arc::new(Mutex::new(Timeline::default()));

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, timeline.clone()),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, timeline.clone()),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, timeline.clone()),
            other => bail!("Unsupported output sample format {other}"),
        }?;

        stream.play().context("Failed to start output stream")?;

        info!(
            "Opened audio device {} at {device_rate} Hz ({sample_format}), stream is {stream_rate} Hz",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        Ok(Self {
            stream_rate,
            device_rate,
            timeline,
            writer,
            stream: Some(SendStream { stream }),
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let Ok(mut timeline) = timeline.lock() else {
                    data.fill(T::EQUILIBRIUM);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = timeline.samples.pop_front().unwrap_or(0.0);
                    timeline.played += 1;
                    frame.fill(T::from_sample(sample));
                }
            },
            |err| error!("Audio output stream error: {err}"),
            None,
        )
        .with_context(|| format!("Failed to open output stream at {} Hz", config.sample_rate.0))
}

impl AudioOutput for DeviceOutput {
    fn sample_rate(&self) -> u32 {
        self.stream_rate
    }

    fn current_time(&self) -> f64 {
        let played = self.timeline.lock().map(|t| t.played).unwrap_or_default();
        played as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, samples: &[f32], start: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(anyhow!("Output is closed"));
        }

        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| anyhow!("Output timeline lock poisoned"))?;
        self.writer.write(&mut timeline, samples, start)
    }

    fn close(&mut self) {
        if let Some(SendStream { stream }) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause output stream: {e}");
            }
        }
        self.writer.converter.reset();
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.samples.clear();
        }
    }
}
