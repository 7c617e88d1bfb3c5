//! HRIR storage, lookup, and binaural mixing
//!
//! An `HrtfStore` holds left-ear impulse responses on an elevation/azimuth
//! grid; the right ear reuses the mirrored azimuth. Lookup blends the four
//! surrounding responses and, for spread sources, fades toward an
//! equal-ear pass-through so wide sources lose their direction without
//! losing energy.
//!
//! Two mixers consume the data: the per-voice mixer convolves one source
//! channel with its looked-up response, and the device direct mixer
//! convolves the ambisonic dry bus through per-component responses built
//! from a virtual speaker layout.

use sf_core::{ChannelBuf, Sample, SfError, SfResult, MAX_AMBI_COEFFS};
use std::f32::consts::{PI, TAU};

/// FIR length of one impulse response
pub const HRIR_LENGTH: usize = 32;
const HRIR_MASK: usize = HRIR_LENGTH - 1;

/// Input history kept for delay lookups
pub const HRTF_HISTORY_LENGTH: usize = 64;
const HRTF_HISTORY_MASK: usize = HRTF_HISTORY_LENGTH - 1;

/// Largest representable inter-aural delay in samples
pub const MAX_HRIR_DELAY: usize = HRTF_HISTORY_LENGTH - 1;

/// Ear gain of the non-directional pass-through component (-3dB)
const PASSTHRU_COEFF: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Loaded HRTF data set
pub struct HrtfStore {
    sample_rate: u32,
    /// Azimuth count per elevation row, bottom (-90) to top (+90)
    az_counts: Vec<usize>,
    /// Offset of each elevation row's first impulse response
    ev_offsets: Vec<usize>,
    /// Left-ear FIR coefficients, `HRIR_LENGTH` per response
    coeffs: Vec<f32>,
    /// Per-response delay in samples
    delays: Vec<u8>,
}

impl HrtfStore {
    /// Build a store from raw data. `az_counts` gives the azimuth
    /// resolution of each elevation row from -90 to +90 degrees;
    /// `coeffs` holds `HRIR_LENGTH` left-ear taps per response.
    pub fn new(
        sample_rate: u32,
        az_counts: Vec<usize>,
        coeffs: Vec<f32>,
        delays: Vec<u8>,
    ) -> SfResult<Self> {
        let total: usize = az_counts.iter().sum();
        if az_counts.len() < 2 || total == 0 {
            return Err(SfError::InvalidParam("HRTF grid needs at least two elevations"));
        }
        if coeffs.len() != total * HRIR_LENGTH || delays.len() != total {
            return Err(SfError::InvalidParam("HRTF data length mismatch"));
        }
        if delays.iter().any(|&d| d as usize > MAX_HRIR_DELAY) {
            return Err(SfError::InvalidParam("HRTF delay out of range"));
        }

        let mut ev_offsets = Vec::with_capacity(az_counts.len());
        let mut offset = 0;
        for &count in &az_counts {
            ev_offsets.push(offset);
            offset += count;
        }

        Ok(Self {
            sample_rate,
            az_counts,
            ev_offsets,
            coeffs,
            delays,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn ev_count(&self) -> usize {
        self.az_counts.len()
    }

    /// Index and blend factor of the elevation row below `elevation`
    fn calc_ev_index(&self, elevation: f32) -> (usize, f32) {
        let ev = (PI / 2.0 + elevation) * (self.ev_count() - 1) as f32 / PI;
        let idx = (ev.floor().max(0.0) as usize).min(self.ev_count() - 1);
        (idx, (ev - idx as f32).clamp(0.0, 1.0))
    }

    /// Index and blend factor of the azimuth column at `azimuth` for a
    /// row of `az_count` columns
    fn calc_az_index(az_count: usize, azimuth: f32) -> (usize, f32) {
        let az = azimuth.rem_euclid(TAU) * az_count as f32 / TAU;
        let idx = (az.floor() as usize) % az_count;
        (idx, az - az.floor())
    }

    /// Look up the blended impulse response and ear delays for a
    /// direction, with `spread` (radians) fading toward non-directional.
    pub fn coeffs_for(&self, elevation: f32, azimuth: f32, spread: f32) -> HrtfParams {
        let dirfact = 1.0 - spread / TAU;

        let (ev0, evmu) = self.calc_ev_index(elevation);
        let ev1 = (ev0 + 1).min(self.ev_count() - 1);

        // The four surrounding responses: two azimuths on each of two
        // elevation rows, plus the right ear's mirrored azimuths.
        let mut lidx = [0usize; 4];
        let mut ridx = [0usize; 4];
        let mut blend = [0.0f32; 4];
        for (i, &(ev, evw)) in [(ev0, 1.0 - evmu), (ev1, evmu)].iter().enumerate() {
            let count = self.az_counts[ev];
            let offset = self.ev_offsets[ev];
            let (az0, azmu) = Self::calc_az_index(count, azimuth);
            let az1 = (az0 + 1) % count;

            lidx[i * 2] = offset + az0;
            lidx[i * 2 + 1] = offset + az1;
            ridx[i * 2] = offset + (count - az0) % count;
            ridx[i * 2 + 1] = offset + (count - az1) % count;
            blend[i * 2] = evw * (1.0 - azmu) * dirfact;
            blend[i * 2 + 1] = evw * azmu * dirfact;
        }

        let mut params = HrtfParams::default();
        let mut dl = 0.0f32;
        let mut dr = 0.0f32;
        for c in 0..4 {
            dl += self.delays[lidx[c]] as f32 * blend[c];
            dr += self.delays[ridx[c]] as f32 * blend[c];
        }
        params.delay[0] = (dl + 0.5) as usize;
        params.delay[1] = (dr + 0.5) as usize;

        params.coeffs[0][0] = PASSTHRU_COEFF * (1.0 - dirfact);
        params.coeffs[0][1] = PASSTHRU_COEFF * (1.0 - dirfact);
        for c in 0..4 {
            let lco = &self.coeffs[lidx[c] * HRIR_LENGTH..(lidx[c] + 1) * HRIR_LENGTH];
            let rco = &self.coeffs[ridx[c] * HRIR_LENGTH..(ridx[c] + 1) * HRIR_LENGTH];
            for i in 0..HRIR_LENGTH {
                params.coeffs[i][0] += lco[i] * blend[c];
                params.coeffs[i][1] += rco[i] * blend[c];
            }
        }

        params
    }

    /// Nearest single response for a direction (used when building the
    /// device decode)
    fn nearest(&self, elevation: f32, azimuth: f32) -> (usize, usize) {
        let (ev0, evmu) = self.calc_ev_index(elevation);
        let ev = if evmu > 0.5 { (ev0 + 1).min(self.ev_count() - 1) } else { ev0 };
        let count = self.az_counts[ev];
        let (az0, azmu) = Self::calc_az_index(count, azimuth);
        let az = if azmu > 0.5 { (az0 + 1) % count } else { az0 };
        let lidx = self.ev_offsets[ev] + az;
        let ridx = self.ev_offsets[ev] + (count - az) % count;
        (lidx, ridx)
    }
}

/// Target filter for one voice channel: stereo FIR plus ear delays
#[derive(Clone, Copy)]
pub struct HrtfParams {
    pub coeffs: [[f32; 2]; HRIR_LENGTH],
    pub delay: [usize; 2],
    pub gain: f32,
}

impl HrtfParams {
    /// Whether two parameter sets describe the same filter (gain aside)
    pub fn same_filter(&self, other: &Self) -> bool {
        self.delay == other.delay && self.coeffs == other.coeffs
    }
}

impl Default for HrtfParams {
    fn default() -> Self {
        Self {
            coeffs: [[0.0; 2]; HRIR_LENGTH],
            delay: [0; 2],
            gain: 0.0,
        }
    }
}

impl std::fmt::Debug for HrtfParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HrtfParams")
            .field("delay", &self.delay)
            .field("gain", &self.gain)
            .finish_non_exhaustive()
    }
}

/// Per-voice-channel convolution state
#[derive(Clone)]
pub struct HrtfState {
    history: [f32; HRTF_HISTORY_LENGTH],
    values: [[f32; 2]; HRIR_LENGTH],
    offset: usize,
}

impl Default for HrtfState {
    fn default() -> Self {
        Self {
            history: [0.0; HRTF_HISTORY_LENGTH],
            values: [[0.0; 2]; HRIR_LENGTH],
            offset: 0,
        }
    }
}

impl HrtfState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[inline]
fn apply_coeffs(
    offset: usize,
    values: &mut [[f32; 2]; HRIR_LENGTH],
    coeffs: &[[f32; 2]; HRIR_LENGTH],
    left: f32,
    right: f32,
) {
    for (c, coeff) in coeffs.iter().enumerate() {
        let v = &mut values[(offset + c) & HRIR_MASK];
        v[0] += coeff[0] * left;
        v[1] += coeff[1] * right;
    }
}

/// Convolve `input` through the filter, accumulating into the outputs.
/// `gain` ramps by `gain_step` per sample; the final gain is returned so
/// the caller can persist it.
pub fn mix_hrtf(
    left_out: &mut [Sample],
    right_out: &mut [Sample],
    input: &[Sample],
    state: &mut HrtfState,
    params: &HrtfParams,
    mut gain: f32,
    gain_step: f32,
) -> f32 {
    let mut offset = state.offset;
    for (i, &sample) in input.iter().enumerate() {
        state.history[offset & HRTF_HISTORY_MASK] = sample;
        let left = state.history[offset.wrapping_sub(params.delay[0]) & HRTF_HISTORY_MASK] * gain;
        let right = state.history[offset.wrapping_sub(params.delay[1]) & HRTF_HISTORY_MASK] * gain;

        state.values[(offset + HRIR_LENGTH) & HRIR_MASK] = [0.0, 0.0];
        offset += 1;

        apply_coeffs(offset, &mut state.values, &params.coeffs, left, right);

        left_out[i] += state.values[offset & HRIR_MASK][0];
        right_out[i] += state.values[offset & HRIR_MASK][1];

        gain += gain_step;
    }
    state.offset = offset;
    gain
}

/// Crossfade from an old filter to a new one over the block: the old
/// response fades from `old_gain` to zero while the new rises from zero
/// to `params.gain`, sharing one history write per sample.
#[allow(clippy::too_many_arguments)]
pub fn mix_hrtf_blend(
    left_out: &mut [Sample],
    right_out: &mut [Sample],
    input: &[Sample],
    state: &mut HrtfState,
    old: &HrtfParams,
    old_gain: f32,
    params: &HrtfParams,
) {
    let n = input.len().max(1) as f32;
    let old_step = -old_gain / n;
    let new_step = params.gain / n;
    let mut gain_old = old_gain;
    let mut gain_new = 0.0f32;

    let mut offset = state.offset;
    for (i, &sample) in input.iter().enumerate() {
        state.history[offset & HRTF_HISTORY_MASK] = sample;

        let left_o = state.history[offset.wrapping_sub(old.delay[0]) & HRTF_HISTORY_MASK] * gain_old;
        let right_o = state.history[offset.wrapping_sub(old.delay[1]) & HRTF_HISTORY_MASK] * gain_old;
        let left_n = state.history[offset.wrapping_sub(params.delay[0]) & HRTF_HISTORY_MASK] * gain_new;
        let right_n =
            state.history[offset.wrapping_sub(params.delay[1]) & HRTF_HISTORY_MASK] * gain_new;

        state.values[(offset + HRIR_LENGTH) & HRIR_MASK] = [0.0, 0.0];
        offset += 1;

        apply_coeffs(offset, &mut state.values, &old.coeffs, left_o, right_o);
        apply_coeffs(offset, &mut state.values, &params.coeffs, left_n, right_n);

        left_out[i] += state.values[offset & HRIR_MASK][0];
        right_out[i] += state.values[offset & HRIR_MASK][1];

        gain_old += old_step;
        gain_new += new_step;
    }
    state.offset = offset;
}

/// One dry-bus component's decode filter in the direct mixer
#[derive(Clone)]
struct DirectHrtfChannel {
    coeffs: [[f32; 2]; HRIR_LENGTH],
    values: [[f32; 2]; HRIR_LENGTH],
}

/// Device post-process mixer: ambisonic dry bus to binaural stereo
pub struct DirectHrtfMixer {
    channels: Vec<DirectHrtfChannel>,
    offset: usize,
}

impl DirectHrtfMixer {
    /// Build the decode filters from a virtual speaker layout: each point
    /// contributes its (nearest) impulse response to every ambisonic
    /// component, weighted by the decode matrix and the per-order
    /// high-frequency compensation.
    pub fn build(
        store: &HrtfStore,
        num_channels: usize,
        points: &[(f32, f32)],
        matrix: &[[f32; MAX_AMBI_COEFFS]],
        order_hf_gain: &[f32; 4],
    ) -> Self {
        debug_assert_eq!(points.len(), matrix.len());

        let mut channels = vec![
            DirectHrtfChannel {
                coeffs: [[0.0; 2]; HRIR_LENGTH],
                values: [[0.0; 2]; HRIR_LENGTH],
            };
            num_channels
        ];

        let min_delay = points
            .iter()
            .map(|&(ev, az)| {
                let (lidx, ridx) = store.nearest(ev, az);
                store.delays[lidx].min(store.delays[ridx])
            })
            .min()
            .unwrap_or(0) as usize;

        for (&(ev, az), row) in points.iter().zip(matrix) {
            let (lidx, ridx) = store.nearest(ev, az);
            let ldelay = store.delays[lidx] as usize - min_delay;
            let rdelay = store.delays[ridx] as usize - min_delay;
            let lco = &store.coeffs[lidx * HRIR_LENGTH..(lidx + 1) * HRIR_LENGTH];
            let rco = &store.coeffs[ridx * HRIR_LENGTH..(ridx + 1) * HRIR_LENGTH];

            for (c, chan) in channels.iter_mut().enumerate() {
                let gain = row[c] * order_hf_gain[sf_core::acn_order(c).min(3)];
                if gain.abs() < 1e-8 {
                    continue;
                }
                for (i, &co) in lco.iter().enumerate() {
                    if ldelay + i < HRIR_LENGTH {
                        chan.coeffs[ldelay + i][0] += co * gain;
                    }
                }
                for (i, &co) in rco.iter().enumerate() {
                    if rdelay + i < HRIR_LENGTH {
                        chan.coeffs[rdelay + i][1] += co * gain;
                    }
                }
            }
        }

        Self { channels, offset: 0 }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Convolve the dry-bus channels into the left/right outputs and
    /// advance the stream offset.
    pub fn process(
        &mut self,
        left_out: &mut ChannelBuf,
        right_out: &mut ChannelBuf,
        input: &[ChannelBuf],
        samples_to_do: usize,
    ) {
        for (chan, inbuf) in self.channels.iter_mut().zip(input) {
            let mut offset = self.offset;
            for (i, &sample) in inbuf[..samples_to_do].iter().enumerate() {
                chan.values[(offset + HRIR_LENGTH) & HRIR_MASK] = [0.0, 0.0];
                offset += 1;

                apply_coeffs(offset, &mut chan.values, &chan.coeffs, sample, sample);

                left_out[i] += chan.values[offset & HRIR_MASK][0];
                right_out[i] += chan.values[offset & HRIR_MASK][1];
            }
        }
        self.offset += samples_to_do;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal store: two elevation rows of four azimuths, each response
    /// a scaled unit impulse with an azimuth-dependent delay.
    fn test_store() -> HrtfStore {
        let az_counts = vec![4usize, 4];
        let total = 8;
        let mut coeffs = vec![0.0f32; total * HRIR_LENGTH];
        let mut delays = vec![0u8; total];
        for r in 0..total {
            coeffs[r * HRIR_LENGTH] = 1.0;
            delays[r] = (r % 4) as u8;
        }
        HrtfStore::new(44100, az_counts, coeffs, delays).unwrap()
    }

    #[test]
    fn store_validates_lengths() {
        assert!(HrtfStore::new(44100, vec![4, 4], vec![0.0; 3], vec![0; 8]).is_err());
        assert!(HrtfStore::new(44100, vec![4], vec![0.0; 4 * HRIR_LENGTH], vec![0; 4]).is_err());
    }

    #[test]
    fn point_source_keeps_unit_energy() {
        let store = test_store();
        let p = store.coeffs_for(0.0, 0.0, 0.0);
        let sum: f32 = p.coeffs.iter().map(|c| c[0]).sum();
        assert!((sum - 1.0).abs() < 1e-5, "left sum {sum}");
    }

    #[test]
    fn full_spread_is_passthrough() {
        let store = test_store();
        let p = store.coeffs_for(0.3, 1.0, TAU);
        assert!((p.coeffs[0][0] - PASSTHRU_COEFF).abs() < 1e-6);
        assert!((p.coeffs[0][1] - PASSTHRU_COEFF).abs() < 1e-6);
        for c in &p.coeffs[1..] {
            assert!(c[0].abs() < 1e-6 && c[1].abs() < 1e-6);
        }
        assert_eq!(p.delay, [0, 0]);
    }

    #[test]
    fn mix_hrtf_delays_impulse() {
        let store = test_store();
        // Bottom row, front column: a single response with delay 0.
        let mut params = store.coeffs_for(-PI / 2.0, 0.0, 0.0);
        params.gain = 1.0;

        let mut state = HrtfState::default();
        let mut input = [0.0f32; 16];
        input[0] = 1.0;
        let mut left = [0.0f32; 16];
        let mut right = [0.0f32; 16];
        mix_hrtf(&mut left, &mut right, &input, &mut state, &params, 1.0, 0.0);

        // Unit impulse comes out with unit amplitude somewhere within the
        // delay+FIR window, total energy preserved.
        let energy: f32 = left.iter().map(|s| s * s).sum();
        assert!((energy - 1.0).abs() < 1e-4, "energy {energy}");
    }

    #[test]
    fn direct_mixer_passes_omni_energy() {
        let store = test_store();
        let points = [(0.0f32, 0.0f32), (0.0, PI)];
        let matrix = [[0.5f32; MAX_AMBI_COEFFS], [0.5; MAX_AMBI_COEFFS]];
        let mut mixer = DirectHrtfMixer::build(&store, 1, &points, &matrix, &[1.0; 4]);

        let mut input = vec![[0.0f32; sf_core::BUFFER_SIZE]; 1];
        input[0][0] = 1.0;
        let mut left = [0.0f32; sf_core::BUFFER_SIZE];
        let mut right = [0.0f32; sf_core::BUFFER_SIZE];
        mixer.process(&mut left, &mut right, &input, 64);

        let sum: f32 = left.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "sum {sum}");
        assert_eq!(mixer.num_channels(), 1);
    }
}
