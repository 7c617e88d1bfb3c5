//! Ambisonic decoding to speaker feeds, and first-order up-sampling
//!
//! The decoder multiplies the ambisonic mix through a per-speaker matrix,
//! optionally split into low and high bands with separate matrices. The
//! up-sampler raises first-order content into a higher-order stream by
//! band-splitting each shared component and counter-scaling the high band,
//! so a subsequent higher-order decode reproduces a first-order decode's
//! response.

use sf_core::{
    calc_direction_coeffs, AmbiIndex, AmbiNorm, BfChannelConfig, ChannelBuf, CustomDecoder,
    Sample, BUFFER_SIZE, MAX_AMBI2D_COEFFS, MAX_AMBI_COEFFS, MAX_OUTPUT_CHANNELS,
};

use crate::splitter::BandSplitter;

const HF_BAND: usize = 0;
const LF_BAND: usize = 1;
const NUM_BANDS: usize = 2;

/// Cube corners used as the virtual first-order layout, in listener
/// coordinates
pub const AMBI3D_POINTS: [[f32; 3]; 8] = [
    [-0.577350269, 0.577350269, -0.577350269],
    [0.577350269, 0.577350269, -0.577350269],
    [-0.577350269, 0.577350269, 0.577350269],
    [0.577350269, 0.577350269, 0.577350269],
    [-0.577350269, -0.577350269, -0.577350269],
    [0.577350269, -0.577350269, -0.577350269],
    [-0.577350269, -0.577350269, 0.577350269],
    [0.577350269, -0.577350269, 0.577350269],
];

/// First-order decode matrix for the cube layout (rows per point, columns
/// per ACN)
pub const AMBI3D_DECODER: [[f32; 4]; 8] = [
    [0.125, 0.125, 0.125, 0.125],
    [0.125, -0.125, 0.125, 0.125],
    [0.125, 0.125, 0.125, -0.125],
    [0.125, -0.125, 0.125, -0.125],
    [0.125, 0.125, -0.125, 0.125],
    [0.125, -0.125, -0.125, 0.125],
    [0.125, 0.125, -0.125, -0.125],
    [0.125, -0.125, -0.125, -0.125],
];

/// High-frequency scale per first-order component for the cube decode
pub const AMBI3D_DECODER_HF_SCALE: [f32; 4] = [2.0, 1.15470054, 1.15470054, 1.15470054];

/// Accumulate `gains[i] * inputs[i]` rows into `out`
fn mix_row(out: &mut [Sample], gains: &[f32], inputs: &[ChannelBuf], samples_to_do: usize) {
    for (gain, input) in gains.iter().zip(inputs) {
        if gain.abs() < 1e-10 {
            continue;
        }
        for (o, &s) in out[..samples_to_do].iter_mut().zip(&input[..samples_to_do]) {
            *o += gain * s;
        }
    }
}

#[derive(Clone, Copy)]
struct UpsamplerChan {
    xover: BandSplitter,
    gains: [f32; NUM_BANDS],
}

enum DecMatrix {
    Single(Vec<[f32; MAX_AMBI_COEFFS]>),
    Dual(Vec<[[f32; MAX_AMBI_COEFFS]; NUM_BANDS]>),
}

/// B-Format decoder over the device's dry ambisonic bus
pub struct BFormatDec {
    enabled_mask: u32,
    num_channels: usize,
    matrix: DecMatrix,
    xover: Vec<BandSplitter>,
    up_sampler: [UpsamplerChan; 4],
    samples_hf: Vec<ChannelBuf>,
    samples_lf: Vec<ChannelBuf>,
    channel_mix: Box<ChannelBuf>,
}

impl BFormatDec {
    /// Single-band decoder from builtin per-speaker coefficient rows.
    /// `chan_decs` pairs each row with the real output channel it feeds;
    /// `num_channels` is the (2D) ambisonic channel count of the dry bus.
    pub fn new_single(
        num_channels: usize,
        xover_f0norm: f32,
        chan_decs: &[(usize, [f32; MAX_AMBI2D_COEFFS])],
    ) -> Self {
        let mut enabled_mask = 0u32;
        let mut rows = vec![[0.0f32; MAX_AMBI_COEFFS]; MAX_OUTPUT_CHANNELS];
        for &(out_idx, coeffs) in chan_decs {
            enabled_mask |= 1 << out_idx;
            rows[out_idx][..MAX_AMBI2D_COEFFS].copy_from_slice(&coeffs);
        }

        Self {
            enabled_mask,
            num_channels,
            matrix: DecMatrix::Single(rows),
            xover: Vec::new(),
            up_sampler: Self::make_upsampler(num_channels, false, xover_f0norm),
            samples_hf: Vec::new(),
            samples_lf: Vec::new(),
            channel_mix: Box::new([0.0; BUFFER_SIZE]),
        }
    }

    /// Decoder from a custom layout description. `chan_map[i]` is the real
    /// output channel of speaker `i`; `sample_rate` places the crossover.
    pub fn new_custom(conf: &CustomDecoder, chan_map: &[usize], sample_rate: u32, hq: bool) -> Self {
        let periphonic = conf.is_periphonic();
        let num_channels = if periphonic {
            match conf.order() {
                3 => 16,
                2 => 9,
                _ => 4,
            }
        } else {
            conf.order() * 2 + 1
        };

        let mut enabled_mask = 0u32;
        for &chan in &chan_map[..conf.speakers.len()] {
            enabled_mask |= 1 << chan;
        }

        let coeff_scale = conf.coeff_scale.to_n3d();
        let dual_band = hq && conf.freq_bands == 2;

        // Decoder-channel ACN for each dry-bus channel position.
        let acn_of = |j: usize| -> usize {
            if periphonic {
                j
            } else {
                AmbiIndex::FROM_2D[j]
            }
        };
        let order_gain = |gains: &[f32; 4], acn: usize| -> f32 { gains[sf_core::acn_order(acn)] };

        let matrix = if !dual_band {
            let mut rows = vec![[0.0f32; MAX_AMBI_COEFFS]; MAX_OUTPUT_CHANNELS];
            for (i, speaker) in conf.speakers.iter().enumerate() {
                let row = &mut rows[chan_map[i]];
                let mut k = 0;
                for j in 0..num_channels {
                    let acn = acn_of(j);
                    if conf.chan_mask & (1 << acn) == 0 {
                        continue;
                    }
                    row[j] = speaker.hf_gains[k] / coeff_scale[acn]
                        * order_gain(&conf.hf_order_gain, acn);
                    k += 1;
                }
            }
            DecMatrix::Single(rows)
        } else {
            let ratio = 10.0f32.powf(conf.xover_ratio / 40.0);
            let mut rows = vec![[[0.0f32; MAX_AMBI_COEFFS]; NUM_BANDS]; MAX_OUTPUT_CHANNELS];
            for (i, speaker) in conf.speakers.iter().enumerate() {
                let row = &mut rows[chan_map[i]];
                let mut k = 0;
                for j in 0..num_channels {
                    let acn = acn_of(j);
                    if conf.chan_mask & (1 << acn) == 0 {
                        continue;
                    }
                    row[HF_BAND][j] = speaker.hf_gains[k] / coeff_scale[acn]
                        * order_gain(&conf.hf_order_gain, acn)
                        * ratio;
                    row[LF_BAND][j] = speaker.lf_gains[k] / coeff_scale[acn]
                        * order_gain(&conf.lf_order_gain, acn)
                        / ratio;
                    k += 1;
                }
            }
            DecMatrix::Dual(rows)
        };

        let (xover, samples_hf, samples_lf) = if dual_band {
            let splitter = BandSplitter::new(conf.xover_freq / sample_rate as f32);
            (
                vec![splitter; num_channels],
                vec![[0.0; BUFFER_SIZE]; num_channels],
                vec![[0.0; BUFFER_SIZE]; num_channels],
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        Self {
            enabled_mask,
            num_channels,
            matrix,
            xover,
            up_sampler: Self::make_upsampler(num_channels, periphonic, 400.0 / sample_rate as f32),
            samples_hf,
            samples_lf,
            channel_mix: Box::new([0.0; BUFFER_SIZE]),
        }
    }

    /// Up-sampler bindings for the first-order components shared with the
    /// decoder's input stream.
    fn make_upsampler(num_channels: usize, periphonic: bool, f0norm: f32) -> [UpsamplerChan; 4] {
        let splitter = BandSplitter::new(f0norm);
        let mut chans = [UpsamplerChan {
            xover: splitter,
            gains: [0.0; NUM_BANDS],
        }; 4];

        // Combined encode-then-decode gain of each first-order component
        // through the cube layout, with the HF counter-scale applied.
        if periphonic || num_channels >= 4 {
            for (i, chan) in chans.iter_mut().enumerate() {
                let mut gain = 0.0f64;
                for (k, point) in AMBI3D_POINTS.iter().enumerate() {
                    let coeffs = calc_direction_coeffs(*point, 0.0);
                    gain += AMBI3D_DECODER[k][i] as f64 * coeffs[i] as f64;
                }
                chan.gains[HF_BAND] = (gain * AMBI3D_DECODER_HF_SCALE[i] as f64) as f32;
                chan.gains[LF_BAND] = gain as f32;
            }
        } else {
            // Horizontal-only: W, Y, X share the stream; Z is dropped.
            for (c, chan) in chans.iter_mut().enumerate().take(3) {
                let acn = AmbiIndex::FROM_2D[c];
                let mut gain = 0.0f64;
                for (k, point) in AMBI3D_POINTS.iter().enumerate() {
                    let coeffs = calc_direction_coeffs(*point, 0.0);
                    gain += AMBI3D_DECODER[k][acn] as f64 * coeffs[acn] as f64;
                }
                chan.gains[HF_BAND] = (gain * AMBI3D_DECODER_HF_SCALE[acn] as f64) as f32;
                chan.gains[LF_BAND] = gain as f32;
            }
        }
        chans
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn is_dual_band(&self) -> bool {
        matches!(self.matrix, DecMatrix::Dual(_))
    }

    /// Decode the ambisonic `input` channels, accumulating onto the real
    /// output channels.
    pub fn process(
        &mut self,
        output: &mut [ChannelBuf],
        input: &[ChannelBuf],
        samples_to_do: usize,
    ) {
        match &self.matrix {
            DecMatrix::Dual(rows) => {
                for i in 0..self.num_channels {
                    let (hf, lf) = (&mut self.samples_hf[i], &mut self.samples_lf[i]);
                    self.xover[i].process(
                        &mut hf[..samples_to_do],
                        &mut lf[..samples_to_do],
                        &input[i][..samples_to_do],
                    );
                }

                for (chan, out) in output.iter_mut().enumerate() {
                    if self.enabled_mask & (1 << chan) == 0 {
                        continue;
                    }
                    self.channel_mix[..samples_to_do].fill(0.0);
                    mix_row(
                        &mut self.channel_mix[..samples_to_do],
                        &rows[chan][HF_BAND][..self.num_channels],
                        &self.samples_hf,
                        samples_to_do,
                    );
                    mix_row(
                        &mut self.channel_mix[..samples_to_do],
                        &rows[chan][LF_BAND][..self.num_channels],
                        &self.samples_lf,
                        samples_to_do,
                    );
                    for (o, &m) in out[..samples_to_do].iter_mut().zip(&self.channel_mix[..samples_to_do]) {
                        *o += m;
                    }
                }
            }
            DecMatrix::Single(rows) => {
                for (chan, out) in output.iter_mut().enumerate() {
                    if self.enabled_mask & (1 << chan) == 0 {
                        continue;
                    }
                    self.channel_mix[..samples_to_do].fill(0.0);
                    mix_row(
                        &mut self.channel_mix[..samples_to_do],
                        &rows[chan][..self.num_channels],
                        input,
                        samples_to_do,
                    );
                    for (o, &m) in out[..samples_to_do].iter_mut().zip(&self.channel_mix[..samples_to_do]) {
                        *o += m;
                    }
                }
            }
        }
    }

    /// Mix first-order content into the decoder's higher-order input
    /// stream (component-aligned channels).
    pub fn up_sample(
        &mut self,
        output: &mut [ChannelBuf],
        input: &[ChannelBuf],
        in_channels: usize,
        samples_to_do: usize,
    ) {
        let mut hf = [0.0f32; BUFFER_SIZE];
        let mut lf = [0.0f32; BUFFER_SIZE];
        for i in 0..in_channels.min(4) {
            let chan = &mut self.up_sampler[i];
            chan.xover.process(
                &mut hf[..samples_to_do],
                &mut lf[..samples_to_do],
                &input[i][..samples_to_do],
            );
            for s in 0..samples_to_do {
                output[i][s] += hf[s] * chan.gains[HF_BAND] + lf[s] * chan.gains[LF_BAND];
            }
        }
    }
}

/// Standalone first-order up-sampler used when the device output is
/// itself ambisonic or feeds the HRTF direct mixer
pub struct AmbiUpsampler {
    xover: [BandSplitter; 4],
    gains: [[[f32; MAX_OUTPUT_CHANNELS]; NUM_BANDS]; 4],
}

impl AmbiUpsampler {
    /// Build for a target ambisonic bus described by `ambi_map`.
    pub fn new(ambi_map: &[BfChannelConfig], f0norm: f32) -> Self {
        let mut encgains = [[0.0f32; MAX_OUTPUT_CHANNELS]; 8];
        for (k, point) in AMBI3D_POINTS.iter().enumerate() {
            let coeffs = calc_direction_coeffs(*point, 0.0);
            for (j, cfg) in ambi_map.iter().enumerate() {
                encgains[k][j] = cfg.scale * coeffs[cfg.index];
            }
        }

        // Combine the in->virtual and virtual->out matrices into a single
        // in->out conversion per band.
        let mut gains = [[[0.0f32; MAX_OUTPUT_CHANNELS]; NUM_BANDS]; 4];
        for i in 0..4 {
            for j in 0..ambi_map.len() {
                let mut gain = 0.0f64;
                for k in 0..AMBI3D_DECODER.len() {
                    gain += AMBI3D_DECODER[k][i] as f64 * encgains[k][j] as f64;
                }
                gains[i][HF_BAND][j] = (gain * AMBI3D_DECODER_HF_SCALE[i] as f64) as f32;
                gains[i][LF_BAND][j] = gain as f32;
            }
        }

        Self {
            xover: [BandSplitter::new(f0norm); 4],
            gains,
        }
    }

    /// Mix first-order `input` into the target bus
    pub fn process(
        &mut self,
        output: &mut [ChannelBuf],
        input: &[ChannelBuf],
        samples_to_do: usize,
    ) {
        let mut hf = [0.0f32; BUFFER_SIZE];
        let mut lf = [0.0f32; BUFFER_SIZE];
        for i in 0..4.min(input.len()) {
            self.xover[i].process(
                &mut hf[..samples_to_do],
                &mut lf[..samples_to_do],
                &input[i][..samples_to_do],
            );
            for (j, out) in output.iter_mut().enumerate() {
                let ghf = self.gains[i][HF_BAND][j];
                let glf = self.gains[i][LF_BAND][j];
                if ghf.abs() < 1e-10 && glf.abs() < 1e-10 {
                    continue;
                }
                for s in 0..samples_to_do {
                    out[s] += hf[s] * ghf + lf[s] * glf;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_decode_of_omni_is_uniform() {
        // Decoding a W-only signal sends equal energy to every corner.
        let w = [1.0f32, 0.0, 0.0, 0.0];
        let feeds: Vec<f32> = AMBI3D_DECODER
            .iter()
            .map(|row| row.iter().zip(&w).map(|(a, b)| a * b).sum())
            .collect();
        for f in &feeds {
            assert!((f - 0.125).abs() < 1e-6);
        }
    }

    #[test]
    fn single_band_decode_feeds_enabled_channels() {
        let mut coeffs = [0.0f32; MAX_AMBI2D_COEFFS];
        coeffs[0] = 0.7;
        let mut dec = BFormatDec::new_single(3, 400.0 / 48000.0, &[(1, coeffs)]);

        let mut input = vec![[0.0f32; BUFFER_SIZE]; 3];
        input[0][0] = 1.0;
        let mut output = vec![[0.0f32; BUFFER_SIZE]; 2];
        dec.process(&mut output, &input, 16);

        assert_eq!(output[0][0], 0.0);
        assert!((output[1][0] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn upsampler_preserves_w_at_dc() {
        // Identity N3D target map for a first-order bus.
        let map: Vec<BfChannelConfig> = (0..4)
            .map(|i| BfChannelConfig { scale: 1.0, index: i })
            .collect();
        let mut up = AmbiUpsampler::new(&map, 400.0 / 48000.0);

        let mut input = vec![[0.0f32; BUFFER_SIZE]; 4];
        for s in input[0].iter_mut() {
            *s = 1.0;
        }
        let mut output = vec![[0.0f32; BUFFER_SIZE]; 4];
        up.process(&mut output, &input, BUFFER_SIZE);

        // DC lands in the low band whose combined gain for W is
        // 8 * 0.125 * 1 = 1.
        let tail = output[0][BUFFER_SIZE - 1];
        assert!((tail - 1.0).abs() < 0.02, "W gain {tail}");
    }
}
