//! Validation and decoding of binary audio frames.
//!
//! Frames arrive from an untrusted socket as raw little-endian 16-bit PCM.
//! Nothing in here fails loudly: a bad frame is reported through the logs and
//! handed back as "nothing to play" so the stream keeps flowing.

use crate::constants::{BYTES_PER_SAMPLE, MIN_FRAME_SAMPLES};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Why a binary frame was not let into the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameRejection {
    Empty,
    Misaligned { len: usize },
    TooShort { samples: usize },
}

impl Display for FrameRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRejection::Empty => write!(f, "empty frame"),
            FrameRejection::Misaligned { len } => {
                write!(f, "{len} bytes is not a whole number of 16-bit samples")
            }
            FrameRejection::TooShort { samples } => {
                write!(f, "{samples} samples is below the minimum of {MIN_FRAME_SAMPLES}")
            }
        }
    }
}

/// Checks a frame and returns its sample count if it is playable.
pub fn inspect(frame: &[u8]) -> Result<usize, FrameRejection> {
    if frame.is_empty() {
        return Err(FrameRejection::Empty);
    }

    if frame.len() % BYTES_PER_SAMPLE != 0 {
        return Err(FrameRejection::Misaligned { len: frame.len() });
    }

    let samples = frame.len() / BYTES_PER_SAMPLE;
    if samples < MIN_FRAME_SAMPLES {
        return Err(FrameRejection::TooShort { samples });
    }

    Ok(samples)
}

/// Returns whether `frame` may enter the pipeline. Rejections are logged.
pub fn validate(frame: &[u8]) -> bool {
    match inspect(frame) {
        Ok(_) => true,
        Err(reason) => {
            debug!("Dropping binary frame: {reason}");
            false
        }
    }
}

/// Converts PCM16 LE bytes into normalized samples in [-1, 1].
///
/// Returns an empty vector for input that is not sample aligned, which the
/// caller treats as nothing to schedule.
pub fn decode(frame: &[u8]) -> Vec<f32> {
    if frame.is_empty() || frame.len() % BYTES_PER_SAMPLE != 0 {
        return Vec::new();
    }

    frame
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|bytes| {
            let sample = LittleEndian::read_i16(bytes);
            (sample as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// A decoded block of audio waiting to be scheduled.
#[derive(Clone, Debug)]
pub struct AudioChunk {
    samples: Vec<f32>,
    arrived_at: Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            arrived_at: Instant::now(),
        }
    }

    /// Runs a raw frame through validation and decoding. `None` means the
    /// frame was dropped.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if !validate(frame) {
            return None;
        }

        let samples = decode(frame);
        if samples.is_empty() {
            return None;
        }

        Some(Self::new(samples))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    /// Playback length in seconds at `sample_rate`
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}
