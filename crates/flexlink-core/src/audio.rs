//! Audio streaming types and capability traits.
//!
//! Audio samples are always `f32` normalized to `[-1.0, 1.0]` at the
//! flexlink API boundary, matching the radio's native DAX float format.
//! Buffers flow through [`tokio::sync::mpsc`] channels wrapped in
//! [`AudioReceiver`] and [`AudioSender`]: the DAX RX pipeline pushes
//! decoded 48 kHz mono buffers into a channel, and the application reads
//! them via [`AudioReceiver::recv()`].
//!
//! The actual playback device and microphone capture are external
//! collaborators; this module only defines the interfaces the engine
//! talks to ([`AudioOutput`], [`NoiseReduction`]).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A buffer of interleaved audio samples.
///
/// Samples are normalized `f32` values in `[-1.0, 1.0]`. For stereo audio,
/// samples are interleaved `[L0, R0, L1, R1, ...]`; mono buffers are a
/// plain sample sequence. Each buffer carries its own channel count and
/// sample rate so consumers can verify the stream configuration.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    /// Number of audio channels (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Sample rate in hertz.
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Create a new `AudioBuffer`.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        AudioBuffer {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of audio frames in this buffer.
    ///
    /// A frame contains one sample per channel: a stereo buffer with 100
    /// interleaved samples holds 50 frames.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Duration of this buffer in seconds, `0.0` if the rate is zero.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Whether this buffer contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Receives audio buffers from the DAX RX pipeline.
///
/// Wraps a bounded [`mpsc::Receiver`]; if the consumer falls behind, the
/// producer drops buffers rather than accumulate unbounded memory. The
/// stream ends when the sender side is dropped (DAX stop or disconnect),
/// at which point [`recv()`](AudioReceiver::recv) returns `None`.
pub struct AudioReceiver {
    rx: mpsc::Receiver<AudioBuffer>,
}

impl AudioReceiver {
    /// Create a new `AudioReceiver` wrapping an mpsc receiver.
    pub fn new(rx: mpsc::Receiver<AudioBuffer>) -> Self {
        AudioReceiver { rx }
    }

    /// Receive the next audio buffer.
    ///
    /// Returns `None` when the stream has been closed.
    pub async fn recv(&mut self) -> Option<AudioBuffer> {
        self.rx.recv().await
    }
}

/// Sends audio buffers toward the radio.
///
/// When the receiver side is dropped, [`send()`](AudioSender::send)
/// returns [`Error::StreamClosed`].
pub struct AudioSender {
    tx: mpsc::Sender<AudioBuffer>,
}

impl AudioSender {
    /// Create a new `AudioSender` wrapping an mpsc sender.
    pub fn new(tx: mpsc::Sender<AudioBuffer>) -> Self {
        AudioSender { tx }
    }

    /// Send an audio buffer.
    pub async fn send(&self, buffer: AudioBuffer) -> Result<()> {
        self.tx.send(buffer).await.map_err(|_| Error::StreamClosed)
    }
}

/// Noise-reduction capability applied to received mono audio.
///
/// Implementations must be realtime-safe: `process` runs on the audio
/// delivery path and may not block or allocate. When no backend is
/// configured the engine uses [`Passthrough`].
pub trait NoiseReduction: Send + Sync {
    /// Enable or disable processing. A disabled backend must behave like
    /// [`Passthrough`].
    fn set_enabled(&self, enabled: bool);

    /// Process a mono buffer in place.
    fn process(&self, samples: &mut [f32]);
}

/// The default no-op noise-reduction backend.
#[derive(Debug, Default)]
pub struct Passthrough;

impl NoiseReduction for Passthrough {
    fn set_enabled(&self, _enabled: bool) {}

    fn process(&self, _samples: &mut [f32]) {}
}

/// Playback device collaborator.
///
/// The engine hands decoded 48 kHz mono audio to an implementation of
/// this trait; the implementation owns the OS audio device.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Start playback, optionally on a specific device.
    async fn start(&self, device: Option<&str>) -> Result<()>;

    /// Stop playback and release the device.
    async fn stop(&self);

    /// Set output gain, `0.0..=1.0`.
    fn set_gain(&self, gain: f32);

    /// Enqueue a buffer of 48 kHz mono samples for playback.
    fn enqueue_48k_mono(&self, samples: &[f32]);
}
