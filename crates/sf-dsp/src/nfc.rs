//! Near-field control filters for ambisonic playback
//!
//! An ambisonic source closer to the listener than the playback radius
//! shows a bass rise that grows with order. Each filter pairs a bass-boost
//! section derived from the source distance (w0) with a bass-cut section
//! derived from the speaker distance (w1); orders one through three use
//! one-, two-, and three-pole sections respectively.
//!
//! `w = speed_of_sound / (distance_meters * sample_rate)`; adjusting with
//! w0 = 0 makes the boost side flat so the filter degrades to the fixed
//! speaker-distance compensation while keeping its history.

use sf_core::Sample;

use crate::Processor;

/// Bessel polynomial coefficients per order
const B: [[f32; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [3.0, 3.0, 0.0],
    [3.6778, 6.4595, 2.3222],
];

#[derive(Debug, Clone, Copy, Default)]
struct NfcSection1 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    a1: f32,
    z: [f32; 1],
}

impl NfcSection1 {
    fn init(w1: f32) -> Self {
        let mut sec = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        // Bass-cut coefficients from the speaker distance.
        let r = 0.5 * w1;
        let b_00 = B[1][0] * r;
        let g_0 = 1.0 + b_00;

        sec.base_gain /= g_0;
        sec.gain /= g_0;
        sec.a1 = 2.0 * b_00 / g_0;
        sec
    }

    fn adjust(&mut self, w0: f32) {
        // Bass-boost coefficients from the source distance.
        let r = 0.5 * w0;
        let b_00 = B[1][0] * r;
        let g_0 = 1.0 + b_00;

        self.gain = self.base_gain * g_0;
        self.b1 = 2.0 * b_00 / g_0;
    }

    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        let y = input * self.gain - self.a1 * self.z[0];
        let out = y + self.b1 * self.z[0];
        self.z[0] += y;
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct NfcSection2 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z: [f32; 2],
}

impl NfcSection2 {
    fn init(w1: f32) -> Self {
        let mut sec = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        let r = 0.5 * w1;
        let b_10 = B[2][0] * r;
        let b_11 = B[2][1] * r * r;
        let g_1 = 1.0 + b_10 + b_11;

        sec.base_gain /= g_1;
        sec.gain /= g_1;
        sec.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        sec.a2 = 4.0 * b_11 / g_1;
        sec
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let b_10 = B[2][0] * r;
        let b_11 = B[2][1] * r * r;
        let g_1 = 1.0 + b_10 + b_11;

        self.gain = self.base_gain * g_1;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
    }

    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        let y = input * self.gain - self.a1 * self.z[0] - self.a2 * self.z[1];
        let out = y + self.b1 * self.z[0] + self.b2 * self.z[1];
        self.z[1] += self.z[0];
        self.z[0] += y;
        out
    }
}

/// Third order is a quadratic pole-pair section chained with a linear
/// section; the first two entries of `B[3]` belong to the quadratic
/// factor, the last to the linear one.
#[derive(Debug, Clone, Copy, Default)]
struct NfcSection3 {
    base_gain: f32,
    gain: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    a1: f32,
    a2: f32,
    a3: f32,
    z: [f32; 3],
}

impl NfcSection3 {
    fn init(w1: f32) -> Self {
        let mut sec = Self {
            base_gain: 1.0,
            gain: 1.0,
            ..Default::default()
        };

        let r = 0.5 * w1;
        let b_10 = B[3][0] * r;
        let b_11 = B[3][1] * r * r;
        let b_00 = B[3][2] * r;
        let g_1 = 1.0 + b_10 + b_11;
        let g_0 = 1.0 + b_00;

        sec.base_gain /= g_1 * g_0;
        sec.gain /= g_1 * g_0;
        sec.a1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        sec.a2 = 4.0 * b_11 / g_1;
        sec.a3 = 2.0 * b_00 / g_0;
        sec
    }

    fn adjust(&mut self, w0: f32) {
        let r = 0.5 * w0;
        let b_10 = B[3][0] * r;
        let b_11 = B[3][1] * r * r;
        let b_00 = B[3][2] * r;
        let g_1 = 1.0 + b_10 + b_11;
        let g_0 = 1.0 + b_00;

        self.gain = self.base_gain * g_1 * g_0;
        self.b1 = (2.0 * b_10 + 4.0 * b_11) / g_1;
        self.b2 = 4.0 * b_11 / g_1;
        self.b3 = 2.0 * b_00 / g_0;
    }

    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        let y0 = input * self.gain - self.a1 * self.z[0] - self.a2 * self.z[1];
        let mut out = y0 + self.b1 * self.z[0] + self.b2 * self.z[1];
        self.z[1] += self.z[0];
        self.z[0] += y0;

        let y1 = out - self.a3 * self.z[2];
        out = y1 + self.b3 * self.z[2];
        self.z[2] += y1;
        out
    }
}

/// Near-field control filter covering ambisonic orders 1..=3
#[derive(Debug, Clone, Copy, Default)]
pub struct NfcFilter {
    first: NfcSection1,
    second: NfcSection2,
    third: NfcSection3,
}

impl NfcFilter {
    /// Create a filter for a speaker at `w1` with the source initially at
    /// the speaker radius (flat response).
    pub fn new(w1: f32) -> Self {
        Self {
            first: NfcSection1::init(w1),
            second: NfcSection2::init(w1),
            third: NfcSection3::init(w1),
        }
    }

    /// Re-target the boost side for a new source distance. `w0 = 0` is a
    /// pass-through that keeps the bass-cut compensation and history.
    pub fn adjust(&mut self, w0: f32) {
        self.first.adjust(w0);
        self.second.adjust(w0);
        self.third.adjust(w0);
    }

    /// Filter a first-order component
    pub fn process1(&mut self, dst: &mut [Sample], src: &[Sample]) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = self.first.process_sample(s);
        }
    }

    /// Filter a second-order component
    pub fn process2(&mut self, dst: &mut [Sample], src: &[Sample]) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = self.second.process_sample(s);
        }
    }

    /// Filter a third-order component
    pub fn process3(&mut self, dst: &mut [Sample], src: &[Sample]) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = self.third.process_sample(s);
        }
    }

    /// Filter a component of the given ambisonic order (0 copies through)
    pub fn process_order(&mut self, order: usize, dst: &mut [Sample], src: &[Sample]) {
        match order {
            0 => dst.copy_from_slice(src),
            1 => self.process1(dst, src),
            2 => self.process2(dst, src),
            _ => self.process3(dst, src),
        }
    }
}

impl Processor for NfcFilter {
    fn reset(&mut self) {
        self.first.z = [0.0; 1];
        self.second.z = [0.0; 2];
        self.third.z = [0.0; 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matched_distances_are_flat() {
        // Source at the speaker radius: boost and cut cancel.
        let w = 343.3 / (2.0 * 48000.0);
        let mut nfc = NfcFilter::new(w);
        nfc.adjust(w);

        let src: Vec<f32> = (0..512).map(|i| (i as f32 * 0.21).sin()).collect();
        let mut dst = vec![0.0; 512];
        nfc.process1(&mut dst, &src);

        for i in 64..512 {
            assert!((dst[i] - src[i]).abs() < 1e-3, "at {i}");
        }
    }

    #[test]
    fn near_source_boosts_bass() {
        let w1 = 343.3 / (2.0 * 48000.0);
        let mut nfc = NfcFilter::new(w1);
        // Source at a quarter of the speaker distance.
        nfc.adjust(w1 * 4.0);

        // DC gain should exceed unity for the boosted first order.
        let src = vec![1.0f32; 8192];
        let mut dst = vec![0.0; 8192];
        nfc.process1(&mut dst, &src);
        assert!(dst[8191] > 1.5, "dc gain {}", dst[8191]);
    }

    #[test]
    fn zero_w0_cuts_bass() {
        // w0 = 0 leaves only the bass-cut side (plane-wave source).
        let w1 = 343.3 / (1.0 * 48000.0);
        let mut nfc = NfcFilter::new(w1);
        nfc.adjust(0.0);

        let src = vec![1.0f32; 8192];
        let mut dst = vec![0.0; 8192];
        nfc.process1(&mut dst, &src);
        assert!(dst[8191] < 0.75, "dc gain {}", dst[8191]);
    }

    #[test]
    fn order_zero_copies() {
        let mut nfc = NfcFilter::new(0.01);
        let src = [0.5f32; 8];
        let mut dst = [0.0f32; 8];
        nfc.process_order(0, &mut dst, &src);
        assert_eq!(dst, src);
    }
}
