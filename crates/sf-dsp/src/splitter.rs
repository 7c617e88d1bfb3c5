//! Two-band crossover and matching all-pass
//!
//! The splitter separates a signal into low and high bands that sum back
//! to an all-passed copy of the input. Channels that are not split run
//! through `AllPassSplitter` so every path shares the same phase response.

use sf_core::Sample;
use std::f32::consts::TAU;

use crate::Processor;

/// Two-band crossover splitter
#[derive(Debug, Clone, Copy, Default)]
pub struct BandSplitter {
    coeff: f32,
    lp_z1: f32,
    lp_z2: f32,
    ap_z1: f32,
}

impl BandSplitter {
    /// Create a splitter with the crossover at `f0norm` (frequency over
    /// sample rate).
    pub fn new(f0norm: f32) -> Self {
        let mut s = Self::default();
        s.init(f0norm);
        s
    }

    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.reset();
    }

    /// Split `input` into `hpout` and `lpout`
    pub fn process(&mut self, hpout: &mut [Sample], lpout: &mut [Sample], input: &[Sample]) {
        debug_assert_eq!(hpout.len(), input.len());
        debug_assert_eq!(lpout.len(), input.len());

        let ap_coeff = self.coeff;
        let lp_coeff = self.coeff * 0.5 + 0.5;
        let mut lp_z1 = self.lp_z1;
        let mut lp_z2 = self.lp_z2;
        let mut ap_z1 = self.ap_z1;

        for ((hp, lp), &input) in hpout.iter_mut().zip(lpout.iter_mut()).zip(input) {
            // Low-pass: two chained one-pole sections.
            let mut d = (input - lp_z1) * lp_coeff;
            let mut lp_y = lp_z1 + d;
            lp_z1 = lp_y + d;

            d = (lp_y - lp_z2) * lp_coeff;
            lp_y = lp_z2 + d;
            lp_z2 = lp_y + d;

            *lp = lp_y;

            // All-pass, with the low band removed to leave the high band.
            let ap_y = input * ap_coeff + ap_z1;
            ap_z1 = input - ap_y * ap_coeff;
            *hp = ap_y - lp_y;
        }

        self.lp_z1 = lp_z1;
        self.lp_z2 = lp_z2;
        self.ap_z1 = ap_z1;
    }
}

impl Processor for BandSplitter {
    fn reset(&mut self) {
        self.lp_z1 = 0.0;
        self.lp_z2 = 0.0;
        self.ap_z1 = 0.0;
    }
}

/// The splitter's all-pass section alone, for phase-matching unsplit
/// channels
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPassSplitter {
    coeff: f32,
    z1: f32,
}

impl AllPassSplitter {
    pub fn new(f0norm: f32) -> Self {
        let mut s = Self::default();
        s.init(f0norm);
        s
    }

    pub fn init(&mut self, f0norm: f32) {
        let w = f0norm * TAU;
        let cw = w.cos();
        self.coeff = if cw > f32::EPSILON {
            (w.sin() - 1.0) / cw
        } else {
            cw * -0.5
        };
        self.z1 = 0.0;
    }

    pub fn process(&mut self, samples: &mut [Sample]) {
        let coeff = self.coeff;
        let mut z1 = self.z1;
        for s in samples.iter_mut() {
            let input = *s;
            let out = input * coeff + z1;
            z1 = input - out * coeff;
            *s = out;
        }
        self.z1 = z1;
    }
}

impl Processor for AllPassSplitter {
    fn reset(&mut self) {
        self.z1 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_sum_to_allpassed_input() {
        let mut splitter = BandSplitter::new(400.0 / 48000.0);
        let mut allpass = AllPassSplitter::new(400.0 / 48000.0);

        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.13).sin()).collect();
        let mut hp = vec![0.0; 256];
        let mut lp = vec![0.0; 256];
        splitter.process(&mut hp, &mut lp, &input);

        let mut reference = input.clone();
        allpass.process(&mut reference);

        for i in 0..256 {
            assert!((hp[i] + lp[i] - reference[i]).abs() < 1e-5, "at {i}");
        }
    }

    #[test]
    fn dc_lands_in_low_band() {
        let mut splitter = BandSplitter::new(400.0 / 48000.0);
        let input = vec![1.0f32; 4096];
        let mut hp = vec![0.0; 4096];
        let mut lp = vec![0.0; 4096];
        splitter.process(&mut hp, &mut lp, &input);

        assert!((lp[4095] - 1.0).abs() < 0.01);
        assert!(hp[4095].abs() < 0.01);
    }

    #[test]
    fn allpass_preserves_magnitude_of_dc() {
        let mut allpass = AllPassSplitter::new(400.0 / 48000.0);
        let mut buf = vec![1.0f32; 4096];
        allpass.process(&mut buf);
        assert!((buf[4095].abs() - 1.0).abs() < 0.01);
    }
}
