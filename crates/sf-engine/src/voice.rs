//! Voices: the per-source rendering slots of a context
//!
//! A voice renders one playing source. The control thread starts a voice
//! by filling its mix state while it is inactive and release-storing the
//! playing flag; from then on the mix state belongs to the mixer thread,
//! and the control thread communicates through the props mailbox and the
//! atomic identity fields only. The mixer ends a voice by zeroing the
//! source id before releasing the playing flag.

use std::cell::UnsafeCell;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use sf_core::{
    DistanceModel, HP_FREQ_REF, LP_FREQ_REF, MAX_AMBI_ORDER, MAX_INPUT_CHANNELS,
    MAX_OUTPUT_CHANNELS, MAX_SENDS,
};
use sf_dsp::{
    BiquadFilter, HrtfParams, HrtfState, NfcFilter, Resampler, ResamplerKind,
    MAX_RESAMPLE_PADDING,
};

use crate::buffer::BufferQueue;
use crate::props::Mailbox;
use crate::slot::EffectSlot;

/// Voice flag bits
pub mod voice_flags {
    /// Set after the first mixed block: parameter changes now ramp from
    /// current to target instead of jumping
    pub const FADE: u8 = 1 << 0;
    /// Direct path renders through HRTF filters
    pub const HAS_HRTF: u8 = 1 << 1;
    /// Near-field control filters are active
    pub const HAS_NFC: u8 = 1 << 2;
    /// Fade out and stop at the end of the next block
    pub const STOPPING: u8 = 1 << 3;
}

/// Direct/send filter flag bits
pub mod filter_flags {
    pub const LOW_PASS: u8 = 1 << 0;
    pub const HIGH_PASS: u8 = 1 << 1;
}

/// When a source is spatialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatializeMode {
    Off,
    On,
    /// Spatialize mono buffers only
    #[default]
    Auto,
}

/// Which device bus a voice's direct path feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetBus {
    #[default]
    Dry,
    Foa,
    Real,
}

/// Per-path filter and gain properties
#[derive(Debug, Clone, Copy)]
pub struct PathProps {
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
    pub hf_reference: f32,
    pub lf_reference: f32,
}

impl Default for PathProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
            hf_reference: LP_FREQ_REF,
            lf_reference: HP_FREQ_REF,
        }
    }
}

/// Send routing properties
#[derive(Clone, Default)]
pub struct SendProps {
    pub slot: Option<Arc<EffectSlot>>,
    pub path: PathProps,
}

/// Control-thread snapshot of all mixing-relevant source state
#[derive(Clone)]
pub struct VoiceProps {
    pub pitch: f32,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,

    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub direction: [f32; 3],
    pub orient_at: [f32; 3],
    pub orient_up: [f32; 3],
    pub head_relative: bool,

    pub distance_model: DistanceModel,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub room_rolloff_factor: f32,

    pub inner_angle: f32,
    pub outer_angle: f32,
    pub outer_gain: f32,
    pub outer_gain_hf: f32,

    pub air_absorption_factor: f32,
    pub doppler_factor: f32,
    pub radius: f32,

    pub dry_gain_hf_auto: bool,
    pub wet_gain_auto: bool,
    pub wet_gain_hf_auto: bool,

    pub direct_channels: bool,
    pub spatialize_mode: SpatializeMode,
    pub resampler: ResamplerKind,
    /// Stereo-format pan angles (counter-clockwise radians)
    pub stereo_pan: [f32; 2],
    pub looping: bool,

    pub direct: PathProps,
    pub sends: [SendProps; MAX_SENDS],
}

impl Default for VoiceProps {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            position: [0.0; 3],
            velocity: [0.0; 3],
            direction: [0.0; 3],
            orient_at: [0.0, 0.0, -1.0],
            orient_up: [0.0, 1.0, 0.0],
            head_relative: false,
            distance_model: DistanceModel::default(),
            ref_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            room_rolloff_factor: 0.0,
            inner_angle: 360.0,
            outer_angle: 360.0,
            outer_gain: 0.0,
            outer_gain_hf: 1.0,
            air_absorption_factor: 0.0,
            doppler_factor: 1.0,
            radius: 0.0,
            dry_gain_hf_auto: true,
            wet_gain_auto: true,
            wet_gain_hf_auto: true,
            direct_channels: false,
            spatialize_mode: SpatializeMode::default(),
            resampler: ResamplerKind::default(),
            stereo_pan: [PI / 6.0, -PI / 6.0],
            looping: false,
            direct: PathProps::default(),
            sends: Default::default(),
        }
    }
}

/// Direct-path state for one input channel
pub(crate) struct DirectChannelParams {
    pub hrtf_state: HrtfState,
    pub hrtf_target: HrtfParams,
    /// Filter currently applied (fades toward the target on change)
    pub hrtf_current: HrtfParams,
    pub current_gains: [f32; MAX_OUTPUT_CHANNELS],
    pub target_gains: [f32; MAX_OUTPUT_CHANNELS],
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
    pub nfc: NfcFilter,
    /// Speaker-distance coefficient the NFC filter was built with
    /// (0 = not built yet)
    pub nfc_w1: f32,
}

impl Default for DirectChannelParams {
    fn default() -> Self {
        Self {
            hrtf_state: HrtfState::default(),
            hrtf_target: HrtfParams::default(),
            hrtf_current: HrtfParams::default(),
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
            low_pass: BiquadFilter::new(),
            high_pass: BiquadFilter::new(),
            nfc: NfcFilter::default(),
            nfc_w1: 0.0,
        }
    }
}

/// Send-path state for one input channel
pub(crate) struct SendChannelParams {
    pub current_gains: [f32; MAX_OUTPUT_CHANNELS],
    pub target_gains: [f32; MAX_OUTPUT_CHANNELS],
    pub low_pass: BiquadFilter,
    pub high_pass: BiquadFilter,
}

impl Default for SendChannelParams {
    fn default() -> Self {
        Self {
            current_gains: [0.0; MAX_OUTPUT_CHANNELS],
            target_gains: [0.0; MAX_OUTPUT_CHANNELS],
            low_pass: BiquadFilter::new(),
            high_pass: BiquadFilter::new(),
        }
    }
}

/// The voice's direct output path
#[derive(Default)]
pub(crate) struct DirectPath {
    pub target: TargetBus,
    pub filter_type: u8,
    pub channels_per_order: [usize; MAX_AMBI_ORDER + 1],
    pub params: Vec<DirectChannelParams>,
}

/// One auxiliary send path
#[derive(Default)]
pub(crate) struct SendPath {
    pub slot: Option<Arc<EffectSlot>>,
    pub filter_type: u8,
    pub params: Vec<SendChannelParams>,
}

/// Mixer-owned voice state
pub(crate) struct VoiceMix {
    pub props: VoiceProps,
    pub queue: Option<Arc<BufferQueue>>,
    pub queue_index: usize,
    pub position: usize,
    pub position_frac: u32,
    pub step: u32,
    pub resampler: Resampler,
    pub flags: u8,
    pub num_channels: usize,
    pub prev_samples: [[f32; MAX_RESAMPLE_PADDING * 2]; MAX_INPUT_CHANNELS],
    pub direct: DirectPath,
    pub sends: Vec<SendPath>,
}

impl VoiceMix {
    fn new(num_sends: usize) -> Self {
        Self {
            props: VoiceProps::default(),
            queue: None,
            queue_index: 0,
            position: 0,
            position_frac: 0,
            step: 0,
            resampler: Resampler::default(),
            flags: 0,
            num_channels: 0,
            prev_samples: [[0.0; MAX_RESAMPLE_PADDING * 2]; MAX_INPUT_CHANNELS],
            direct: DirectPath {
                params: (0..MAX_INPUT_CHANNELS)
                    .map(|_| DirectChannelParams::default())
                    .collect(),
                ..Default::default()
            },
            sends: (0..num_sends)
                .map(|_| SendPath {
                    params: (0..MAX_INPUT_CHANNELS)
                        .map(|_| SendChannelParams::default())
                        .collect(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

/// A slot that renders one playing source
pub struct Voice {
    source_id: AtomicU32,
    playing: AtomicBool,
    stop_requested: AtomicBool,
    pub(crate) update: Mailbox<VoiceProps>,
    mix: UnsafeCell<VoiceMix>,
}

// `mix` is owned by the mixer thread while `playing` is set, and by the
// control thread only during `begin` on an inactive voice. The
// playing-flag release/acquire pair hands ownership across.
unsafe impl Send for Voice {}
unsafe impl Sync for Voice {}

impl Voice {
    pub(crate) fn new(num_sends: usize) -> Self {
        Self {
            source_id: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            update: Mailbox::new(),
            mix: UnsafeCell::new(VoiceMix::new(num_sends)),
        }
    }

    pub fn source_id(&self) -> u32 {
        self.source_id.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Fixed-point frames advanced per output frame. Diagnostic value,
    /// stable only between mix calls on the driving thread.
    pub fn step(&self) -> u32 {
        unsafe { self.mix_state() }.step
    }

    /// Whether this voice can be claimed for a new source
    pub fn is_free(&self) -> bool {
        !self.is_playing() && self.source_id() == 0
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mix_state(&self) -> &mut VoiceMix {
        &mut *self.mix.get()
    }

    /// Claim and start an inactive voice (control thread). The caller
    /// must have verified `is_free`.
    pub(crate) fn begin(&self, source_id: u32, queue: Arc<BufferQueue>, props: VoiceProps) {
        debug_assert!(source_id != 0);
        {
            // Exclusive: the mixer ignores this voice until `playing` is
            // published below.
            let mix = unsafe { self.mix_state() };
            mix.props = props;
            mix.queue = Some(queue);
            mix.queue_index = 0;
            mix.position = 0;
            mix.position_frac = 0;
            mix.step = 0;
            // The first block jumps straight to its computed gains.
            mix.flags = 0;
            for chans in &mut mix.prev_samples {
                chans.fill(0.0);
            }
            for param in &mut mix.direct.params {
                *param = DirectChannelParams::default();
            }
            for send in &mut mix.sends {
                for param in &mut send.params {
                    *param = SendChannelParams::default();
                }
            }
        }
        self.stop_requested.store(false, Ordering::Relaxed);
        self.source_id.store(source_id, Ordering::Relaxed);
        self.playing.store(true, Ordering::Release);
    }

    /// Ask the mixer to fade this voice out and stop it (control thread)
    pub(crate) fn request_stop(&self) {
        // The mixer folds this into its flags at the next block.
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Consume a pending stop request (mixer thread)
    pub(crate) fn take_stop_request(&self) -> bool {
        self.stop_requested.swap(false, Ordering::AcqRel)
    }

    /// Mixer-side termination: identity cleared before the playing flag.
    pub(crate) fn finish(&self) {
        self.source_id.store(0, Ordering::Relaxed);
        self.playing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;

    #[test]
    fn voice_lifecycle_flags() {
        let voice = Voice::new(2);
        assert!(voice.is_free());

        let buf = Arc::new(AudioBuffer::mono(44100, vec![0.0; 16]));
        voice.begin(7, Arc::new(BufferQueue::single(buf)), VoiceProps::default());
        assert!(!voice.is_free());
        assert_eq!(voice.source_id(), 7);
        assert!(voice.is_playing());
        assert_eq!(unsafe { voice.mix_state() }.flags, 0);

        voice.finish();
        assert!(voice.is_free());
        assert_eq!(voice.source_id(), 0);
    }

    #[test]
    fn default_props_are_unity_point_source() {
        let props = VoiceProps::default();
        assert_eq!(props.pitch, 1.0);
        assert_eq!(props.inner_angle, 360.0);
        assert_eq!(props.ref_distance, 1.0);
        assert!(props.dry_gain_hf_auto);
        assert_eq!(props.sends.len(), MAX_SENDS);
    }
}
