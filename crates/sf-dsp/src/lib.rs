//! sf-dsp: DSP processors for Soundfield
//!
//! Block-oriented processors used by the mixing pipeline:
//! - `biquad` - TDF-II biquads (shelves, cutoffs, band-pass, peaking)
//! - `splitter` - two-band crossover and phase-matching all-pass
//! - `nfc` - near-field control filters for ambisonic playback
//! - `resample` - point/linear/cubic/band-limited-sinc resamplers
//! - `uhj` - stereo-compatible UHJ encoding from B-Format
//! - `bs2b` - headphone crossfeed filter
//! - `hrtf` - HRIR storage, lookup, and binaural mixers
//! - `bformatdec` - ambisonic decoder and first-order up-sampler
//! - `stablizer` - front image stabilizer for surround layouts
//! - `limiter` - look-ahead output limiter
//!
//! Everything here is allocation-free in its `process` paths; state is
//! sized at construction or `reset`.

pub mod bformatdec;
pub mod biquad;
pub mod bs2b;
pub mod hrtf;
pub mod limiter;
pub mod nfc;
pub mod resample;
pub mod splitter;
pub mod stablizer;
pub mod uhj;

pub use bformatdec::{AmbiUpsampler, BFormatDec};
pub use biquad::{calc_rcpq_from_bandwidth, calc_rcpq_from_slope, BiquadFilter, BiquadType};
pub use bs2b::CrossfeedFilter;
pub use hrtf::{
    mix_hrtf, mix_hrtf_blend, DirectHrtfMixer, HrtfParams, HrtfState, HrtfStore, HRIR_LENGTH,
};
pub use limiter::Limiter;
pub use nfc::NfcFilter;
pub use resample::{Resampler, ResamplerKind, MAX_RESAMPLE_PADDING};
pub use splitter::{AllPassSplitter, BandSplitter};
pub use stablizer::FrontStablizer;
pub use uhj::Uhj2Encoder;

/// Trait for stateful DSP processors
pub trait Processor {
    /// Reset processor state without touching parameters
    fn reset(&mut self);

    /// Latency in samples introduced by the processor
    fn latency(&self) -> usize {
        0
    }
}
