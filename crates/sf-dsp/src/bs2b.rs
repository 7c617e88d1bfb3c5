//! Headphone crossfeed filter
//!
//! Feeds a low-passed, attenuated copy of each channel into the other,
//! with a matching high boost on the direct path, approximating the head
//! shadow a speaker listener hears. Levels 1-6 select the cut frequency
//! and feed strength presets.

use sf_core::Sample;

use crate::Processor;

/// Crossfeed preset: (cut frequency Hz, feed in tenths of a dB)
const LEVEL_PARAMS: [(f32, f32); 6] = [
    (360.0, 60.0), // low
    (500.0, 45.0), // middle
    (700.0, 30.0), // high (defined crossfeed)
    (360.0, 84.0), // low easy
    (500.0, 72.0), // middle easy
    (700.0, 60.0), // high easy
];

/// Two-channel crossfeed processor
#[derive(Debug, Clone, Default)]
pub struct CrossfeedFilter {
    // Lowpass (cross path) coefficients
    b1_lo: f32,
    a0_lo: f32,
    // Highboost (direct path) coefficients
    b1_hi: f32,
    a0_hi: f32,
    a1_hi: f32,
    // Global attenuation keeping the sum below unity
    gain: f32,
    // Per-channel state: [lo_l, lo_r], last input and output of the
    // direct path per channel
    lo: [f32; 2],
    hi_in: [f32; 2],
    hi_out: [f32; 2],
}

impl CrossfeedFilter {
    /// Create a filter for `level` in 1..=6 at the given sample rate
    pub fn new(level: u8, sample_rate: f32) -> Self {
        let mut f = Self::default();
        f.set_params(level, sample_rate);
        f
    }

    pub fn set_params(&mut self, level: u8, sample_rate: f32) {
        let idx = (level.clamp(1, 6) - 1) as usize;
        let (fc_lo, feed_tenth_db) = LEVEL_PARAMS[idx];
        let level_db = feed_tenth_db / 10.0;

        // Feed level splits between lowering the shadowed side and
        // boosting the direct side.
        let gb_lo = level_db * -5.0 / 6.0 - 3.0;
        let gb_hi = level_db / 6.0 - 3.0;

        let g_lo = 10.0f32.powf(gb_lo / 20.0);
        let g_hi = 1.0 - 10.0f32.powf(gb_hi / 20.0);
        let fc_hi = fc_lo * 2.0f32.powf((gb_lo - 20.0 * g_hi.log10()) / 12.0);

        let x = (-std::f32::consts::TAU * fc_lo / sample_rate).exp();
        self.b1_lo = x;
        self.a0_lo = g_lo * (1.0 - x);

        let x = (-std::f32::consts::TAU * fc_hi / sample_rate).exp();
        self.b1_hi = x;
        self.a0_hi = 1.0 - g_hi * (1.0 - x);
        self.a1_hi = -x;

        self.gain = 1.0 / (1.0 + g_lo);
        self.reset();
    }

    /// Filter a stereo pair in place
    pub fn process(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        debug_assert_eq!(left.len(), right.len());
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let in_l = *l;
            let in_r = *r;

            // Cross paths: one-pole lowpass of the opposite channel.
            self.lo[0] = self.a0_lo * in_r + self.b1_lo * self.lo[0];
            self.lo[1] = self.a0_lo * in_l + self.b1_lo * self.lo[1];

            // Direct paths: complementary high boost.
            let hi_l = self.a0_hi * in_l + self.a1_hi * self.hi_in[0] + self.b1_hi * self.hi_out[0];
            let hi_r = self.a0_hi * in_r + self.a1_hi * self.hi_in[1] + self.b1_hi * self.hi_out[1];
            self.hi_in[0] = in_l;
            self.hi_in[1] = in_r;
            self.hi_out[0] = hi_l;
            self.hi_out[1] = hi_r;

            *l = (hi_l + self.lo[0]) * self.gain;
            *r = (hi_r + self.lo[1]) * self.gain;
        }
    }
}

impl Processor for CrossfeedFilter {
    fn reset(&mut self) {
        self.lo = [0.0; 2];
        self.hi_in = [0.0; 2];
        self.hi_out = [0.0; 2];
    }
}
