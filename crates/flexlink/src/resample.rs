//! Sample-rate conversion helpers for the DAX audio pipelines.
//!
//! Three small pieces:
//!
//! - [`downmix_stereo`] -- average interleaved L/R pairs to mono.
//! - [`LinearUpsampler`] -- 2x linear interpolation with a one-sample
//!   carry across buffer boundaries, used to lift 24 kHz LAN audio to
//!   48 kHz.
//! - [`MicResampler`] -- arbitrary-rate to 24 kHz linear interpolation
//!   for the microphone path, with an allocation-free `process_into`.

/// Average interleaved stereo pairs into the output buffer.
///
/// `input` must hold complete L/R pairs; a trailing odd sample is
/// dropped. The output is cleared first.
pub fn downmix_stereo(input: &[f32], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(input.len() / 2);
    for pair in input.chunks_exact(2) {
        out.push((pair[0] + pair[1]) / 2.0);
    }
}

/// 2x linear upsampler with inter-buffer continuity.
///
/// For each input sample `s`, emits `(prev + s) / 2` followed by `s`,
/// then updates `prev` to `s`. The carry survives across invocations so
/// that for consecutive buffers `A` and `B`, the first output sample for
/// `B` equals `(last(A) + B[0]) / 2`. The very first invocation seeds
/// `prev` with the first input sample.
#[derive(Debug, Default)]
pub struct LinearUpsampler {
    prev: Option<f32>,
}

impl LinearUpsampler {
    /// Create a fresh upsampler with no carry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsample `input` 2x, appending `2 * input.len()` samples to `out`.
    pub fn upsample_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.reserve(input.len() * 2);
        let mut prev = match self.prev {
            Some(p) => p,
            None => match input.first() {
                Some(&first) => first,
                None => return,
            },
        };

        for &s in input {
            out.push((prev + s) / 2.0);
            out.push(s);
            prev = s;
        }

        self.prev = Some(prev);
    }

    /// Drop the carry, as on stream stop/start.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// Linear resampler from an arbitrary input rate to 24 kHz mono.
///
/// Used on the microphone path, where the host may deliver any sample
/// rate. Interpolation position and the last input sample carry across
/// calls, so arbitrary host buffer sizes produce a continuous output
/// stream. `process_into` performs no allocation; the caller provides a
/// preallocated output buffer sized for the worst case.
#[derive(Debug)]
pub struct MicResampler {
    /// Input samples consumed per output sample.
    step: f64,
    /// Fractional read position within the current input, relative to
    /// the carried sample at index -1.
    pos: f64,
    /// Last sample of the previous input buffer.
    carry: Option<f32>,
}

/// Target rate for the microphone path.
pub const MIC_TARGET_RATE: u32 = 24_000;

impl MicResampler {
    /// Create a resampler from `input_rate` Hz to 24 kHz.
    pub fn new(input_rate: u32) -> Self {
        MicResampler {
            step: input_rate as f64 / MIC_TARGET_RATE as f64,
            pos: 0.0,
            carry: None,
        }
    }

    /// Upper bound on the output length for `input_len` input samples.
    pub fn max_output_len(&self, input_len: usize) -> usize {
        (input_len as f64 / self.step).ceil() as usize + 2
    }

    /// Resample `input`, appending to `out` without reallocating.
    ///
    /// Panics in debug builds if `out` lacks capacity; size it with
    /// [`max_output_len`](Self::max_output_len) at start.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }

        // Virtual input: carry sample at index -1 (when present),
        // followed by this buffer. Index is clamped at the top end; the
        // clamped neighbor is only read when the interpolation fraction
        // is exactly zero.
        let carry = self.carry;
        let last = input.len() - 1;
        let sample_at = move |idx: isize| -> f32 {
            if idx < 0 {
                carry.unwrap_or(input[0])
            } else {
                input[(idx as usize).min(last)]
            }
        };

        let start_idx: isize = if carry.is_some() { -1 } else { 0 };
        let available = (input.len() as isize - start_idx) as f64 - 1.0;

        while self.pos <= available {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            let idx = base as isize + start_idx;
            let a = sample_at(idx);
            let b = sample_at(idx + 1);
            debug_assert!(out.len() < out.capacity(), "mic resampler scratch overflow");
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        // The carry sample sits at relative position `available`; the next
        // call's position 0 maps onto it.
        self.pos -= available;
        self.carry = Some(input[input.len() - 1]);
    }

    /// Reset interpolation state, as on stream stop/start.
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.carry = None;
    }
}
