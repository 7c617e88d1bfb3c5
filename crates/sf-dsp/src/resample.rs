//! Per-voice resamplers with fixed-point phase
//!
//! The mixer advances a 32-bit position split into whole samples and a
//! `FRACTION_BITS` sub-sample phase. Four families are provided: point,
//! linear, cubic (4-point Hermite), and band-limited sinc at two quality
//! levels. The sinc tables are Kaiser-windowed, scaled per-increment so
//! downsampling keeps the cutoff below the new Nyquist, and interpolated
//! between phase steps.

use once_cell::sync::Lazy;
use sf_core::{cubic, lerp, Sample, FRACTION_BITS, FRACTION_MASK, FRACTION_ONE};

/// Samples of history kept on either side of the resample position
pub const MAX_RESAMPLE_PADDING: usize = 24;

const BSINC_PHASE_BITS: u32 = 5;
const BSINC_PHASE_COUNT: usize = 1 << BSINC_PHASE_BITS;
const BSINC_SCALE_COUNT: usize = 16;
/// Cutoff scale of the widest (most downsampled) filter level
const BSINC_SCALE_BASE: f32 = 0.5;

/// Resampler selection for a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerKind {
    Point,
    #[default]
    Linear,
    Cubic,
    /// 12-point band-limited sinc (-60dB stop band)
    BSinc12,
    /// 24-point band-limited sinc (-90dB stop band)
    BSinc24,
}

/// One quality level's precomputed filter bank
struct BsincTable {
    /// Taps per scale level
    m: [usize; BSINC_SCALE_COUNT],
    /// Offset of each scale level's phase filters in `coeffs`
    filter_offset: [usize; BSINC_SCALE_COUNT],
    /// Per (scale, phase): m filter taps followed by m phase-delta taps
    coeffs: Vec<f32>,
}

/// Zeroth-order modified Bessel function of the first kind
fn bessel_i0(x: f64) -> f64 {
    let mut term = 1.0;
    let mut sum = 1.0;
    let x2 = x / 2.0;
    for k in 1..64 {
        term *= (x2 / k as f64) * (x2 / k as f64);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

fn kaiser(x: f64, beta: f64, i0_beta: f64) -> f64 {
    if !(-1.0..=1.0).contains(&x) {
        return 0.0;
    }
    bessel_i0(beta * (1.0 - x * x).sqrt()) / i0_beta
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Cutoff scale of a table level
fn scale_of_level(level: usize) -> f32 {
    BSINC_SCALE_BASE + (1.0 - BSINC_SCALE_BASE) * level as f32 / (BSINC_SCALE_COUNT - 1) as f32
}

fn build_bsinc_table(base_points: usize, rejection_db: f64) -> BsincTable {
    let beta = 0.1102 * (rejection_db - 8.7);
    let i0_beta = bessel_i0(beta);

    let mut m = [0usize; BSINC_SCALE_COUNT];
    let mut filter_offset = [0usize; BSINC_SCALE_COUNT];
    let mut total = 0usize;
    for level in 0..BSINC_SCALE_COUNT {
        let sf = scale_of_level(level);
        // Stretch the filter as the cutoff drops, in whole tap pairs.
        let taps = (((base_points as f32 / sf).ceil() as usize) + 1) & !1;
        let taps = taps.min(MAX_RESAMPLE_PADDING * 2);
        m[level] = taps;
        filter_offset[level] = total;
        total += BSINC_PHASE_COUNT * taps * 2;
    }

    let mut coeffs = vec![0.0f32; total];

    // A filter evaluated at fractional offset `pf` for taps centered on
    // l = m/2 - 1 samples before the position.
    let eval = |sf: f64, taps: usize, pf: f64, out: &mut [f32]| {
        let l = taps as isize / 2 - 1;
        let half = (taps / 2) as f64;
        for (j, o) in out.iter_mut().enumerate().take(taps) {
            let d = (j as isize - l) as f64 - pf;
            *o = (sf * sinc(sf * d) * kaiser(d / half, beta, i0_beta)) as f32;
        }
    };

    let mut scratch = vec![0.0f32; MAX_RESAMPLE_PADDING * 2];
    let mut scratch_next = vec![0.0f32; MAX_RESAMPLE_PADDING * 2];
    for level in 0..BSINC_SCALE_COUNT {
        let sf = scale_of_level(level) as f64;
        let taps = m[level];
        for phase in 0..BSINC_PHASE_COUNT {
            let pf = phase as f64 / BSINC_PHASE_COUNT as f64;
            let pf_next = (phase + 1) as f64 / BSINC_PHASE_COUNT as f64;
            eval(sf, taps, pf, &mut scratch);
            eval(sf, taps, pf_next, &mut scratch_next);

            let base = filter_offset[level] + phase * taps * 2;
            for j in 0..taps {
                coeffs[base + j] = scratch[j];
                coeffs[base + taps + j] = scratch_next[j] - scratch[j];
            }
        }
    }

    BsincTable {
        m,
        filter_offset,
        coeffs,
    }
}

static BSINC12_TABLE: Lazy<BsincTable> = Lazy::new(|| build_bsinc_table(12, 60.0));
static BSINC24_TABLE: Lazy<BsincTable> = Lazy::new(|| build_bsinc_table(24, 90.0));

/// Prepared sinc state for a voice's current step
#[derive(Debug, Clone, Copy, Default)]
struct BsincState {
    /// Taps of the selected scale level
    m: usize,
    /// Taps before the resample position (m/2 - 1)
    l: usize,
    /// Offset of the level's phase filters
    filter_offset: usize,
}

impl BsincState {
    fn prepare(table: &BsincTable, increment: u32) -> Self {
        let level = if increment <= FRACTION_ONE {
            BSINC_SCALE_COUNT - 1
        } else {
            let sf = FRACTION_ONE as f32 / increment as f32;
            let t = (sf - BSINC_SCALE_BASE) / (1.0 - BSINC_SCALE_BASE);
            ((t * (BSINC_SCALE_COUNT - 1) as f32).floor().max(0.0) as usize)
                .min(BSINC_SCALE_COUNT - 1)
        };
        Self {
            m: table.m[level],
            l: table.m[level] / 2 - 1,
            filter_offset: table.filter_offset[level],
        }
    }
}

/// A voice's resampler: kind plus any prepared state
#[derive(Debug, Clone, Copy, Default)]
pub struct Resampler {
    kind: ResamplerKind,
    bsinc: BsincState,
}

impl Resampler {
    pub fn new(kind: ResamplerKind) -> Self {
        Self {
            kind,
            bsinc: BsincState::default(),
        }
    }

    pub fn kind(&self) -> ResamplerKind {
        self.kind
    }

    /// Re-prepare for a new fixed-point increment. Cheap for the
    /// stateless kinds; selects the sinc scale level otherwise.
    pub fn prepare(&mut self, increment: u32) {
        match self.kind {
            ResamplerKind::BSinc12 => {
                self.bsinc = BsincState::prepare(&BSINC12_TABLE, increment);
            }
            ResamplerKind::BSinc24 => {
                self.bsinc = BsincState::prepare(&BSINC24_TABLE, increment);
            }
            _ => {}
        }
    }

    /// Resample `dst.len()` output samples from `src`.
    ///
    /// `src[src_pos]` is the sample at phase `frac`; at least
    /// `MAX_RESAMPLE_PADDING` valid samples must surround every position
    /// the increment reaches.
    pub fn resample(
        &self,
        src: &[Sample],
        src_pos: usize,
        frac: u32,
        increment: u32,
        dst: &mut [Sample],
    ) {
        match self.kind {
            ResamplerKind::Point => resample_point(src, src_pos, frac, increment, dst),
            ResamplerKind::Linear => resample_linear(src, src_pos, frac, increment, dst),
            ResamplerKind::Cubic => resample_cubic(src, src_pos, frac, increment, dst),
            ResamplerKind::BSinc12 => {
                resample_bsinc(&BSINC12_TABLE, self.bsinc, src, src_pos, frac, increment, dst)
            }
            ResamplerKind::BSinc24 => {
                resample_bsinc(&BSINC24_TABLE, self.bsinc, src, src_pos, frac, increment, dst)
            }
        }
    }
}

fn resample_point(src: &[Sample], mut pos: usize, mut frac: u32, increment: u32, dst: &mut [Sample]) {
    for d in dst.iter_mut() {
        *d = src[pos];
        frac += increment;
        pos += (frac >> FRACTION_BITS) as usize;
        frac &= FRACTION_MASK;
    }
}

fn resample_linear(src: &[Sample], mut pos: usize, mut frac: u32, increment: u32, dst: &mut [Sample]) {
    for d in dst.iter_mut() {
        *d = lerp(src[pos], src[pos + 1], frac as f32 / FRACTION_ONE as f32);
        frac += increment;
        pos += (frac >> FRACTION_BITS) as usize;
        frac &= FRACTION_MASK;
    }
}

fn resample_cubic(src: &[Sample], mut pos: usize, mut frac: u32, increment: u32, dst: &mut [Sample]) {
    for d in dst.iter_mut() {
        *d = cubic(
            src[pos - 1],
            src[pos],
            src[pos + 1],
            src[pos + 2],
            frac as f32 / FRACTION_ONE as f32,
        );
        frac += increment;
        pos += (frac >> FRACTION_BITS) as usize;
        frac &= FRACTION_MASK;
    }
}

fn resample_bsinc(
    table: &BsincTable,
    state: BsincState,
    src: &[Sample],
    mut pos: usize,
    mut frac: u32,
    increment: u32,
    dst: &mut [Sample],
) {
    const FRAC_PHASE_BITDIFF: u32 = FRACTION_BITS - BSINC_PHASE_BITS;
    let m = state.m;
    let l = state.l;

    for d in dst.iter_mut() {
        let phase = (frac >> FRAC_PHASE_BITDIFF) as usize;
        let pf = (frac & ((1 << FRAC_PHASE_BITDIFF) - 1)) as f32
            / (1 << FRAC_PHASE_BITDIFF) as f32;

        let base = state.filter_offset + phase * m * 2;
        let fil = &table.coeffs[base..base + m];
        let phd = &table.coeffs[base + m..base + m * 2];

        let start = pos - l;
        let mut acc = 0.0f32;
        for j in 0..m {
            acc += src[start + j] * (fil[j] + pf * phd[j]);
        }
        *d = acc;

        frac += increment;
        pos += (frac >> FRACTION_BITS) as usize;
        frac &= FRACTION_MASK;
    }
}
