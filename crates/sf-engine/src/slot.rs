//! Effect slots and the effect-state processing contract
//!
//! A slot owns one effect state and a first-order ambisonic wet buffer
//! that voices mix their sends into. Slots may chain: a slot with a
//! target writes its output into the target's wet buffer instead of the
//! main bus. The mixer runs slots in dependency order each block.
//!
//! Effect states are opaque: `update` runs on the control/propagation
//! path, `process` on the mixer and must not allocate. A state swapped
//! out by an update is never dropped on the mixer thread; it rides the
//! async-event ring back to the control thread.

use std::cell::UnsafeCell;
use std::sync::Arc;

use sf_core::{AmbiIndex, BfChannelConfig, ChannelBuf, BUFFER_SIZE, MAX_OUTPUT_CHANNELS};

use crate::props::Mailbox;

/// Ambisonic channels of a slot's wet buffer (first order)
pub const MAX_EFFECT_CHANNELS: usize = 4;

/// Installed effect kind. `Null` slots are skipped by sends entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EffectType {
    #[default]
    Null,
    /// Mixes its wet input into the target bus unchanged
    Passthrough,
    /// Reverb parameter set (the decay model feeds send attenuation)
    Reverb,
}

/// Reverb parameters the mixer's send-decay model consumes
#[derive(Debug, Clone, Copy)]
pub struct ReverbProps {
    pub room_rolloff_factor: f32,
    pub decay_time: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_ratio: f32,
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
}

impl Default for ReverbProps {
    fn default() -> Self {
        Self {
            room_rolloff_factor: 0.0,
            decay_time: 1.49,
            decay_lf_ratio: 1.0,
            decay_hf_ratio: 0.83,
            decay_hf_limit: true,
            air_absorption_gain_hf: 0.994,
        }
    }
}

/// Effect-specific parameters carried in slot props
#[derive(Debug, Clone, Copy, Default)]
pub enum EffectProps {
    #[default]
    None,
    Reverb(ReverbProps),
}

/// Output description handed to `EffectState::update`
pub struct EffectTarget<'a> {
    /// Ambisonic map of the output bus the effect feeds
    pub out_map: &'a [BfChannelConfig],
    pub out_channels: usize,
}

/// The capability set every effect implements
pub trait EffectState: Send {
    /// Device format changed; resize internal buffers. Control thread.
    fn device_update(&mut self, _frequency: u32) {}

    /// Parameters or routing changed. Propagation path (mixer thread,
    /// but allowed before the block's audio work).
    fn update(&mut self, params: &SlotParams, target: &EffectTarget);

    /// Render one block: read the slot's wet input, accumulate into the
    /// output channels. Mixer thread; must not allocate.
    fn process(&mut self, samples_to_do: usize, input: &[ChannelBuf], output: &mut [ChannelBuf]);
}

/// Control-side pending update for a slot
#[derive(Default)]
pub struct EffectSlotProps {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<Arc<EffectSlot>>,
    pub effect_type: EffectType,
    pub props: EffectProps,
    /// Freshly built state to install, if the effect changed
    pub state: Option<Box<dyn EffectState>>,
}

/// Mixer-side slot parameter snapshot
#[derive(Clone, Default)]
pub struct SlotParams {
    pub gain: f32,
    pub aux_send_auto: bool,
    pub target: Option<Arc<EffectSlot>>,
    pub effect_type: EffectType,
    pub props: EffectProps,
    // Decay model derived from reverb props during propagation
    pub room_rolloff: f32,
    pub decay_time: f32,
    pub decay_lf_ratio: f32,
    pub decay_hf_ratio: f32,
    pub decay_hf_limit: bool,
    pub air_absorption_gain_hf: f32,
}

/// Mixer-owned slot state
pub struct SlotMix {
    pub params: SlotParams,
    pub state: Box<dyn EffectState>,
    pub wet_buffer: Box<[ChannelBuf; MAX_EFFECT_CHANNELS]>,
}

/// One processing unit in the effect graph
pub struct EffectSlot {
    pub(crate) update: Mailbox<EffectSlotProps>,
    pub(crate) mix: UnsafeCell<SlotMix>,
}

// The `mix` cell is touched only by the mixer thread (or before the slot
// is shared); everything else is the atomic mailbox.
unsafe impl Send for EffectSlot {}
unsafe impl Sync for EffectSlot {}

impl EffectSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            update: Mailbox::new(),
            mix: UnsafeCell::new(SlotMix {
                params: SlotParams::default(),
                state: Box::new(NullEffect),
                wet_buffer: Box::new([[0.0; BUFFER_SIZE]; MAX_EFFECT_CHANNELS]),
            }),
        })
    }

    /// Ambisonic layout of the wet buffer: ACN identity at first order
    pub fn chan_map() -> [BfChannelConfig; MAX_EFFECT_CHANNELS] {
        let mut map = [BfChannelConfig::default(); MAX_EFFECT_CHANNELS];
        for (i, m) in map.iter_mut().enumerate() {
            *m = BfChannelConfig {
                scale: 1.0,
                index: AmbiIndex::FROM_3D[i],
            };
        }
        map
    }

    /// Mixer-side access to the slot state.
    ///
    /// # Safety
    /// Only the mixer thread (or single-threaded setup/tests) may call
    /// this, and only one reference may be live at a time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mix_state(&self) -> &mut SlotMix {
        &mut *self.mix.get()
    }
}

/// Whether `slot` transitively targets `other`
pub fn in_target_chain(slot: &Arc<EffectSlot>, other: &Arc<EffectSlot>) -> bool {
    // Safe to walk on the mixer thread: targets are part of mixer state.
    let mut current = unsafe { slot.mix_state() }.params.target.clone();
    while let Some(t) = current {
        if Arc::ptr_eq(&t, other) {
            return true;
        }
        current = unsafe { t.mix_state() }.params.target.clone();
    }
    false
}

/// Effect with no output; a slot holding it is skipped by sends
pub struct NullEffect;

impl EffectState for NullEffect {
    fn update(&mut self, _params: &SlotParams, _target: &EffectTarget) {}

    fn process(&mut self, _samples_to_do: usize, _input: &[ChannelBuf], _output: &mut [ChannelBuf]) {}
}

/// Minimal real effect: forwards its wet input to the target bus scaled
/// by the slot gain. Useful on its own as a submix bus and as the
/// reverb-parameter carrier when no reverb DSP is wired in.
pub struct PassthroughEffect {
    out_gains: [[f32; MAX_OUTPUT_CHANNELS]; MAX_EFFECT_CHANNELS],
    out_channels: usize,
}

impl PassthroughEffect {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            out_gains: [[0.0; MAX_OUTPUT_CHANNELS]; MAX_EFFECT_CHANNELS],
            out_channels: 0,
        })
    }
}

impl EffectState for PassthroughEffect {
    fn update(&mut self, params: &SlotParams, target: &EffectTarget) {
        self.out_channels = target.out_channels;
        let chan_map = EffectSlot::chan_map();
        for (c, gains) in self.out_gains.iter_mut().enumerate() {
            gains.fill(0.0);
            let acn = chan_map[c].index;
            for (j, out) in target.out_map[..target.out_channels].iter().enumerate() {
                if out.index == acn {
                    gains[j] = out.scale * params.gain;
                }
            }
        }
    }

    fn process(&mut self, samples_to_do: usize, input: &[ChannelBuf], output: &mut [ChannelBuf]) {
        for (c, inbuf) in input.iter().enumerate().take(MAX_EFFECT_CHANNELS) {
            for (j, out) in output.iter_mut().enumerate().take(self.out_channels) {
                let gain = self.out_gains[c][j];
                if gain.abs() < 1e-10 {
                    continue;
                }
                for (o, &s) in out[..samples_to_do].iter_mut().zip(&inbuf[..samples_to_do]) {
                    *o += s * gain;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chan_map_is_foa_identity() {
        let map = EffectSlot::chan_map();
        for (i, m) in map.iter().enumerate() {
            assert_eq!(m.index, i);
            assert_eq!(m.scale, 1.0);
        }
    }

    #[test]
    fn target_chain_walk() {
        let a = EffectSlot::new();
        let b = EffectSlot::new();
        let c = EffectSlot::new();
        unsafe {
            a.mix_state().params.target = Some(b.clone());
            b.mix_state().params.target = Some(c.clone());
        }
        assert!(in_target_chain(&a, &b));
        assert!(in_target_chain(&a, &c));
        assert!(in_target_chain(&b, &c));
        assert!(!in_target_chain(&c, &a));
        assert!(!in_target_chain(&b, &a));
    }

    #[test]
    fn passthrough_routes_matching_components() {
        let mut fx = PassthroughEffect::new();
        let out_map: Vec<BfChannelConfig> = (0..4)
            .map(|i| BfChannelConfig { scale: 0.5, index: i })
            .collect();
        let params = SlotParams {
            gain: 2.0,
            ..Default::default()
        };
        fx.update(
            &params,
            &EffectTarget {
                out_map: &out_map,
                out_channels: 4,
            },
        );

        let mut input = vec![[0.0f32; BUFFER_SIZE]; 4];
        input[1][0] = 1.0;
        let mut output = vec![[0.0f32; BUFFER_SIZE]; 4];
        fx.process(8, &input, &mut output);

        // Component 1 lands on output channel 1 with scale*gain = 1.0.
        assert!((output[1][0] - 1.0).abs() < 1e-6);
        assert_eq!(output[0][0], 0.0);
        assert_eq!(output[2][0], 0.0);
    }
}
