//! Look-ahead output limiter
//!
//! Runs across all real output channels at once: a sliding peak detector
//! looks `lookahead` samples into the future, an attack/release envelope
//! smooths the required gain reduction, and the audio is delayed by the
//! same lookahead so the gain is in place before a peak arrives. Leaves
//! enough headroom for the dither stage that follows it.

use sf_core::{ChannelBuf, Sample, BUFFER_SIZE, MAX_OUTPUT_CHANNELS};

use crate::Processor;

/// Multichannel look-ahead limiter
pub struct Limiter {
    ceiling: f32,
    attack_coeff: f32,
    release_coeff: f32,
    lookahead: usize,
    /// Delay FIFOs, one per channel
    delay: Vec<Vec<Sample>>,
    /// Peak magnitudes of the delayed window, shared across channels
    peaks: Vec<Sample>,
    write_pos: usize,
    envelope: f32,
    scratch: Box<ChannelBuf>,
}

impl Limiter {
    /// Create a limiter for `num_channels` at `sample_rate`, with the
    /// given output ceiling (linear) and 2ms of lookahead.
    pub fn new(sample_rate: f32, num_channels: usize, ceiling: f32) -> Self {
        Self::with_lookahead(sample_rate, num_channels, ceiling, 0.002)
    }

    /// Create with an explicit lookahead window. Zero lookahead limits
    /// without delaying the signal (attack smoothing only).
    pub fn with_lookahead(
        sample_rate: f32,
        num_channels: usize,
        ceiling: f32,
        lookahead_secs: f32,
    ) -> Self {
        debug_assert!(num_channels <= MAX_OUTPUT_CHANNELS);
        let lookahead = ((sample_rate * lookahead_secs) as usize).min(BUFFER_SIZE);
        let attack_coeff = (-1.0 / (sample_rate * 0.0005)).exp();
        let release_coeff = (-1.0 / (sample_rate * 0.2)).exp();

        Self {
            ceiling,
            attack_coeff,
            release_coeff,
            lookahead,
            delay: vec![vec![0.0; lookahead]; num_channels],
            peaks: vec![0.0; lookahead.max(1)],
            write_pos: 0,
            envelope: 1.0,
            scratch: Box::new([0.0; BUFFER_SIZE]),
        }
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Limit a block across all channels in place
    pub fn process(&mut self, buffers: &mut [ChannelBuf], samples_to_do: usize) {
        let num_channels = self.delay.len().min(buffers.len());
        if num_channels == 0 {
            return;
        }

        for i in 0..samples_to_do {
            // Instantaneous cross-channel peak of the incoming sample.
            let mut peak = 0.0f32;
            for chan in buffers.iter().take(num_channels) {
                peak = peak.max(chan[i].abs());
            }

            if self.lookahead > 0 {
                // Swap the delayed samples out of the FIFOs.
                let pos = self.write_pos;
                for (c, fifo) in self.delay.iter_mut().enumerate().take(num_channels) {
                    let delayed = fifo[pos];
                    fifo[pos] = buffers[c][i];
                    buffers[c][i] = delayed;
                }
                self.peaks[pos] = peak;
                self.write_pos = (pos + 1) % self.lookahead;
            } else {
                self.peaks[0] = peak;
            }

            // The strongest peak anywhere in the lookahead window decides
            // the gain target for the sample leaving the delay now.
            let mut window_peak = 0.0f32;
            for &p in &self.peaks {
                window_peak = window_peak.max(p);
            }
            let target = if window_peak > self.ceiling {
                self.ceiling / window_peak
            } else {
                1.0
            };

            let coeff = if target < self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = target + (self.envelope - target) * coeff;

            self.scratch[i] = self.envelope;
        }

        for chan in buffers.iter_mut().take(num_channels) {
            for (s, &g) in chan[..samples_to_do].iter_mut().zip(&self.scratch[..samples_to_do]) {
                *s *= g;
            }
        }
    }
}

impl Processor for Limiter {
    fn reset(&mut self) {
        for fifo in &mut self.delay {
            fifo.fill(0.0);
        }
        self.peaks.fill(0.0);
        self.write_pos = 0;
        self.envelope = 1.0;
    }

    fn latency(&self) -> usize {
        self.lookahead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_signal_passes_through_delayed() {
        let mut limiter = Limiter::new(48000.0, 1, 1.0);
        let delay = limiter.lookahead();

        let mut buffers = vec![[0.0f32; BUFFER_SIZE]];
        buffers[0][0] = 0.5;
        limiter.process(&mut buffers, BUFFER_SIZE);

        assert!((buffers[0][delay] - 0.5).abs() < 1e-5);
        assert!(buffers[0][0].abs() < 1e-6);
    }

    #[test]
    fn loud_signal_is_held_near_ceiling() {
        let mut limiter = Limiter::new(48000.0, 2, 1.0);
        let mut buffers = vec![[2.0f32; BUFFER_SIZE], [2.0f32; BUFFER_SIZE]];
        limiter.process(&mut buffers, BUFFER_SIZE);
        // Give the attack time to settle, then everything obeys the
        // ceiling with a small tolerance for the envelope smoothing.
        for chan in &buffers {
            for &s in &chan[256..] {
                assert!(s.abs() <= 1.05, "sample {s}");
            }
        }
    }

    #[test]
    fn gain_recovers_after_peak() {
        let mut limiter = Limiter::new(48000.0, 1, 1.0);
        let mut buffers = vec![[0.0f32; BUFFER_SIZE]];
        for s in buffers[0][..64].iter_mut() {
            *s = 4.0;
        }
        for s in buffers[0][64..].iter_mut() {
            *s = 0.25;
        }
        limiter.process(&mut buffers, BUFFER_SIZE);

        // Run a second quiet block; by its end the envelope has mostly
        // released and the quiet signal approaches unity.
        let mut quiet = vec![[0.25f32; BUFFER_SIZE]];
        for _ in 0..20 {
            limiter.process(&mut quiet, BUFFER_SIZE);
            quiet[0].fill(0.25);
        }
        limiter.process(&mut quiet, BUFFER_SIZE);
        assert!(quiet[0][BUFFER_SIZE - 1] > 0.2, "released {}", quiet[0][BUFFER_SIZE - 1]);
    }
}
