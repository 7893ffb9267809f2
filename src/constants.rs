use std::time::Duration;

// Audio parameters of the listen stream (mono, signed 16-bit little-endian)
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;
pub const SUPPORTED_SAMPLE_RATES: [u32; 2] = [8000, 16000];
pub const BYTES_PER_SAMPLE: usize = 2;

/// Frames with fewer samples than this are rejected
pub const MIN_FRAME_SAMPLES: usize = 128;

/// Playback queue bound and how many of the newest chunks survive an overflow
pub const MAX_QUEUE: usize = 50;
pub const QUEUE_KEEP: usize = 25;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Normal closure and going away
pub const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1001];

/// Reported when the socket drops without a close frame
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;
