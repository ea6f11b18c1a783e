//! Audio helpers for calls: PCM gain, MTU fragmentation, jitter buffering, and the
//! device traits the host implements.
//!
//! Samples are signed 16-bit little-endian PCM.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Deserialize;

/// Largest CALL_AUDIO payload.
pub const DEFAULT_MTU: usize = 1400;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Bytes read from the capture device per loop iteration.
    #[serde(default = "default_capture_block")]
    pub capture_block: usize,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Initial playback gain.
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// Frames queued before playback (re)starts. 0 disables jitter buffering.
    #[serde(default = "default_jitter_min_frames")]
    pub jitter_min_frames: usize,
    /// Queue bound; the oldest frame is dropped past it.
    #[serde(default = "default_jitter_max_frames")]
    pub jitter_max_frames: usize,
    /// How long stop waits for each audio thread.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Capture command (reads raw PCM from its stdout). `{rate}` and `{channels}` are substituted.
    #[serde(default = "default_capture_command")]
    pub capture_command: String,
    /// Playback command (raw PCM written to its stdin).
    #[serde(default = "default_playback_command")]
    pub playback_command: String,
}

fn default_sample_rate() -> u32 {
    44_100
}
fn default_channels() -> u16 {
    2
}
fn default_capture_block() -> usize {
    2048
}
fn default_mtu() -> usize {
    DEFAULT_MTU
}
fn default_gain() -> f32 {
    1.0
}
fn default_jitter_min_frames() -> usize {
    4
}
fn default_jitter_max_frames() -> usize {
    64
}
fn default_join_timeout_ms() -> u64 {
    500
}
fn default_capture_command() -> String {
    "arecord -q -t raw -f S16_LE -r {rate} -c {channels}".to_string()
}
fn default_playback_command() -> String {
    "aplay -q -t raw -f S16_LE -r {rate} -c {channels}".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            capture_block: default_capture_block(),
            mtu: default_mtu(),
            gain: default_gain(),
            jitter_min_frames: default_jitter_min_frames(),
            jitter_max_frames: default_jitter_max_frames(),
            join_timeout_ms: default_join_timeout_ms(),
            capture_command: default_capture_command(),
            playback_command: default_playback_command(),
        }
    }
}

/// Scale every i16 LE sample by `gain`, saturating at the i16 range. A trailing odd byte
/// is left as is. Negative or NaN gains are treated as 0.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    let gain = if gain.is_nan() { 0.0 } else { gain.max(0.0) };
    if gain == 1.0 {
        return;
    }
    for pair in pcm.chunks_exact_mut(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32;
        let scaled = (sample * gain)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Split a captured block into datagram-sized pieces. `mtu` 0 means "one piece".
pub fn fragment(block: &[u8], mtu: usize) -> impl Iterator<Item = &[u8]> {
    let size = if mtu == 0 { block.len().max(1) } else { mtu };
    block.chunks(size)
}

/// Playback gain shared between the user and the playback thread.
#[derive(Debug)]
pub struct Gain(AtomicU32);

impl Gain {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(sanitize(value).to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Returns the value actually stored.
    pub fn set(&self, value: f32) -> f32 {
        let v = sanitize(value);
        self.0.store(v.to_bits(), Ordering::Relaxed);
        v
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        1.0
    }
}

/// Frame queue between the network and the playback device. Holds playback until
/// `min_frames` are queued, and re-arms whenever it drains to empty.
#[derive(Debug)]
pub struct JitterBuffer {
    frames: VecDeque<Vec<u8>>,
    min_frames: usize,
    max_frames: usize,
    primed: bool,
    dropped: u64,
}

impl JitterBuffer {
    pub fn new(min_frames: usize, max_frames: usize) -> Self {
        let max_frames = max_frames.max(min_frames).max(1);
        Self {
            frames: VecDeque::with_capacity(max_frames),
            min_frames,
            max_frames,
            primed: min_frames == 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        if self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
        if self.frames.len() >= self.min_frames {
            self.primed = true;
        }
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        if !self.primed {
            return None;
        }
        let frame = self.frames.pop_front();
        if self.frames.is_empty() && self.min_frames > 0 {
            self.primed = false;
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames discarded on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.primed = self.min_frames == 0;
    }
}

/// Blocking capture device.
pub trait AudioInput: Send {
    /// Read raw PCM into `buf`. `Ok(0)` means the device was closed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Blocking playback device.
pub trait AudioOutput: Send {
    fn write(&mut self, pcm: &[u8]) -> io::Result<()>;
}

/// Releases both devices from any thread, forcing blocked reads and writes to return.
pub trait DeviceRelease: Send + Sync {
    fn release(&self);
}

pub struct AudioDevices {
    pub input: Box<dyn AudioInput>,
    pub output: Box<dyn AudioOutput>,
    pub release: Box<dyn DeviceRelease>,
}

/// Opens a fresh device pair per call.
pub trait AudioBackend: Send + Sync {
    fn open(&self, config: &AudioConfig) -> io::Result<AudioDevices>;
}
