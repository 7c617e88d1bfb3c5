//! Per-voice gain and filter computation
//!
//! Turns a voice's world-space attributes into target gain vectors per
//! output channel and per send, HRTF filter targets, near-field control
//! coefficients, and the dual shelf filter setup. Runs on the mixer
//! thread during parameter propagation.

use std::f32::consts::{PI, TAU};
use std::sync::Arc;

use once_cell::sync::Lazy;
use sf_core::{
    calc_angle_coeffs, scale_azimuth_front, BfChannelConfig, BufferFormat, Channel,
    DistanceModel, RenderMode, Vec4, AIR_ABSORB_GAIN_HF, FRACTION_BITS, FRACTION_ONE,
    GAIN_MIX_MAX, MAX_AMBI_COEFFS, MAX_OUTPUT_CHANNELS, MAX_PITCH, MAX_SENDS,
    REVERB_DECAY_GAIN, SPEED_OF_SOUND_METERS_PER_SEC,
};
use sf_dsp::{calc_rcpq_from_slope, BiquadType, HrtfParams, NfcFilter};

use crate::context::Context;
use crate::device::Device;
use crate::listener::ListenerParams;
use crate::slot::EffectSlot;
use crate::voice::{filter_flags, voice_flags, SpatializeMode, TargetBus, Voice, VoiceProps};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v.trim() == "1")
        .unwrap_or(false)
}

/// Cone scalar, halved when half-angle cones are requested
pub static CONE_SCALE: Lazy<f32> = Lazy::new(|| {
    if env_flag("__ALSOFT_HALF_ANGLE_CONES") {
        0.5
    } else {
        1.0
    }
});

/// Z scalar for localized sources, negated for reversed-Z content
pub static Z_SCALE: Lazy<f32> = Lazy::new(|| {
    if env_flag("__ALSOFT_REVERSE_Z") {
        -1.0
    } else {
        1.0
    }
});

/// Keep the default speed of sound for distance-based reverb decay
pub static OVERRIDE_REVERB_SPEED_OF_SOUND: Lazy<bool> =
    Lazy::new(|| env_flag("__ALSOFT_REVERB_IGNORES_SOUND_SPEED"));

#[derive(Clone, Copy)]
struct ChanMap {
    channel: Channel,
    angle: f32,
    elevation: f32,
}

const fn chan(channel: Channel, angle_deg: f32, elevation_deg: f32) -> ChanMap {
    ChanMap {
        channel,
        angle: angle_deg * (PI / 180.0),
        elevation: elevation_deg * (PI / 180.0),
    }
}

const MONO_MAP: [ChanMap; 1] = [chan(Channel::FrontCenter, 0.0, 0.0)];
const REAR_MAP: [ChanMap; 2] = [
    chan(Channel::BackLeft, -150.0, 0.0),
    chan(Channel::BackRight, 150.0, 0.0),
];
const QUAD_MAP: [ChanMap; 4] = [
    chan(Channel::FrontLeft, -45.0, 0.0),
    chan(Channel::FrontRight, 45.0, 0.0),
    chan(Channel::BackLeft, -135.0, 0.0),
    chan(Channel::BackRight, 135.0, 0.0),
];
const X51_MAP: [ChanMap; 6] = [
    chan(Channel::FrontLeft, -30.0, 0.0),
    chan(Channel::FrontRight, 30.0, 0.0),
    chan(Channel::FrontCenter, 0.0, 0.0),
    chan(Channel::Lfe, 0.0, 0.0),
    chan(Channel::SideLeft, -110.0, 0.0),
    chan(Channel::SideRight, 110.0, 0.0),
];
const X61_MAP: [ChanMap; 7] = [
    chan(Channel::FrontLeft, -30.0, 0.0),
    chan(Channel::FrontRight, 30.0, 0.0),
    chan(Channel::FrontCenter, 0.0, 0.0),
    chan(Channel::Lfe, 0.0, 0.0),
    chan(Channel::BackCenter, 180.0, 0.0),
    chan(Channel::SideLeft, -90.0, 0.0),
    chan(Channel::SideRight, 90.0, 0.0),
];
const X71_MAP: [ChanMap; 8] = [
    chan(Channel::FrontLeft, -30.0, 0.0),
    chan(Channel::FrontRight, 30.0, 0.0),
    chan(Channel::FrontCenter, 0.0, 0.0),
    chan(Channel::Lfe, 0.0, 0.0),
    chan(Channel::BackLeft, -150.0, 0.0),
    chan(Channel::BackRight, 150.0, 0.0),
    chan(Channel::SideLeft, -90.0, 0.0),
    chan(Channel::SideRight, 90.0, 0.0),
];

/// Gains for an ambisonic target bus from panning coefficients
pub(crate) fn compute_pan_gains(
    chanmap: &[BfChannelConfig],
    numchans: usize,
    coeffs: &[f32; MAX_AMBI_COEFFS],
    ingain: f32,
    gains: &mut [f32; MAX_OUTPUT_CHANNELS],
) {
    gains.fill(0.0);
    for (g, cfg) in gains.iter_mut().zip(&chanmap[..numchans]) {
        *g = cfg.scale * coeffs[cfg.index] * ingain;
    }
}

/// Fixed-point step from a final pitch multiplier
fn pitch_to_step(pitch: f32) -> u32 {
    if pitch > MAX_PITCH as f32 {
        MAX_PITCH << FRACTION_BITS
    } else {
        ((pitch * FRACTION_ONE as f32) as u32).max(1)
    }
}

struct PanInputs<'a> {
    azimuth: f32,
    elevation: f32,
    distance: f32,
    spread: f32,
    dry_gain: f32,
    dry_gain_hf: f32,
    dry_gain_lf: f32,
    wet_gain: [f32; MAX_SENDS],
    wet_gain_hf: [f32; MAX_SENDS],
    wet_gain_lf: [f32; MAX_SENDS],
    send_slots: &'a [Option<Arc<EffectSlot>>],
}

/// Select channel maps, dispatch to a render path, and derive the shelf
/// filters for every path.
#[allow(clippy::needless_range_loop)]
fn calc_panning_and_filters(
    voice: &Voice,
    inputs: &PanInputs,
    buffer_format: BufferFormat,
    props: &VoiceProps,
    listener: &ListenerParams,
    device: &Device,
) {
    let mix = unsafe { voice.mix_state() };
    let num_sends = device.num_aux_sends.min(mix.sends.len());

    let stereo_map = [
        // Convert counter-clockwise pan angles to clockwise.
        ChanMap {
            channel: Channel::FrontLeft,
            angle: -props.stereo_pan[0],
            elevation: 0.0,
        },
        ChanMap {
            channel: Channel::FrontRight,
            angle: -props.stereo_pan[1],
            elevation: 0.0,
        },
    ];

    let mut direct_channels = props.direct_channels;
    let mut downmix_gain = 1.0f32;
    let (chans, num_channels, is_bformat): (&[ChanMap], usize, bool) = match buffer_format {
        BufferFormat::Mono => {
            // Mono buffers are never played direct.
            direct_channels = false;
            (&MONO_MAP, 1, false)
        }
        BufferFormat::Stereo => {
            downmix_gain = 1.0 / 2.0;
            (&stereo_map, 2, false)
        }
        BufferFormat::Rear => {
            downmix_gain = 1.0 / 2.0;
            (&REAR_MAP, 2, false)
        }
        BufferFormat::Quad => {
            downmix_gain = 1.0 / 4.0;
            (&QUAD_MAP, 4, false)
        }
        BufferFormat::X51 => {
            // Excludes LFE.
            downmix_gain = 1.0 / 5.0;
            (&X51_MAP, 6, false)
        }
        BufferFormat::X61 => {
            downmix_gain = 1.0 / 6.0;
            (&X61_MAP, 7, false)
        }
        BufferFormat::X71 => {
            downmix_gain = 1.0 / 7.0;
            (&X71_MAP, 8, false)
        }
        BufferFormat::BFormat2D => {
            direct_channels = false;
            (&MONO_MAP, 3, true)
        }
        BufferFormat::BFormat3D => {
            direct_channels = false;
            (&MONO_MAP, 4, true)
        }
    };
    mix.num_channels = num_channels;

    for param in &mut mix.direct.params[..num_channels] {
        param.hrtf_target = HrtfParams::default();
        param.target_gains.fill(0.0);
    }
    for send in &mut mix.sends[..num_sends] {
        for param in &mut send.params[..num_channels] {
            param.target_gains.fill(0.0);
        }
    }

    mix.flags &= !(voice_flags::HAS_HRTF | voice_flags::HAS_NFC);
    let slot_map = EffectSlot::chan_map();

    if is_bformat {
        // Special handling for B-Format sources.
        if inputs.distance > f32::EPSILON {
            // Panning a B-Format sound toward some direction: pan the
            // first (W) channel as a normal mono sound and silence the
            // others.
            if device.avg_speaker_dist > 0.0 {
                // Clamp the distance for really close sources, to
                // prevent excessive bass.
                let mdist = (inputs.distance * listener.meters_per_unit)
                    .max(device.avg_speaker_dist / 4.0);
                let w0 = SPEED_OF_SOUND_METERS_PER_SEC / (mdist * device.frequency as f32);
                adjust_nfc(&mut mix.direct.params[0], device, w0);
                mix.direct.channels_per_order = device.channels_per_order;
                mix.flags |= voice_flags::HAS_NFC;
            }

            // Always render B-Format sources to the first-order output,
            // for smooth changes between panned and unpanned.
            mix.direct.target = TargetBus::Foa;

            let azi = if device.render_mode == RenderMode::StereoPair {
                scale_azimuth_front(inputs.azimuth, 1.5)
            } else {
                inputs.azimuth
            };
            let coeffs = calc_angle_coeffs(azi, inputs.elevation, inputs.spread);

            // W needs to be scaled down for its FuMa input convention.
            let scale0 = sf_core::AmbiScale::FROM_FUMA[0];
            compute_pan_gains(
                &device.foa.map,
                device.foa.channels,
                &coeffs,
                inputs.dry_gain * scale0,
                &mut mix.direct.params[0].target_gains,
            );
            for i in 0..num_sends {
                if inputs.send_slots[i].is_some() {
                    compute_pan_gains(
                        &slot_map,
                        slot_map.len(),
                        &coeffs,
                        inputs.wet_gain[i] * scale0,
                        &mut mix.sends[i].params[0].target_gains,
                    );
                }
            }
        } else {
            if device.avg_speaker_dist > 0.0 {
                // The filters were built with w0 = 0, which is right for
                // first-order input; the first channel may have been
                // re-adjusted while panned, so reset it.
                adjust_nfc(&mut mix.direct.params[0], device, 0.0);
                mix.direct.channels_per_order[0] = 1;
                mix.direct.channels_per_order[1] = (device.foa.channels - 1).min(3);
                for c in &mut mix.direct.channels_per_order[2..] {
                    *c = 0;
                }
                mix.flags |= voice_flags::HAS_NFC;
            }

            // Local B-Format sources have their XYZ channels rotated by
            // the orientation.
            let mut n = Vec4::direction(props.orient_at[0], props.orient_at[1], props.orient_at[2]);
            n.normalize3();
            let mut v = Vec4::direction(props.orient_up[0], props.orient_up[1], props.orient_up[2]);
            v.normalize3();
            if !props.head_relative {
                n = listener.matrix.transform(n);
                v = listener.matrix.transform(v);
            }
            let mut u = n.cross3(v);
            u.normalize3();

            // Rotation combined with the FuMa-to-ACN/N3D conversion.
            // Rows are input channels, columns output components.
            let s = &sf_core::AmbiScale::FROM_FUMA;
            let matrix: [[f32; MAX_AMBI_COEFFS]; 4] = {
                let mut m = [[0.0f32; MAX_AMBI_COEFFS]; 4];
                m[0][0] = s[0];
                m[1][1] = -n.x * s[1];
                m[1][2] = n.y * s[2];
                m[1][3] = -n.z * s[3];
                m[2][1] = u.x * s[1];
                m[2][2] = -u.y * s[2];
                m[2][3] = u.z * s[3];
                m[3][1] = -v.x * s[1];
                m[3][2] = v.y * s[2];
                m[3][3] = -v.z * s[3];
                m
            };

            mix.direct.target = TargetBus::Foa;
            for c in 0..num_channels {
                compute_pan_gains(
                    &device.foa.map,
                    device.foa.channels,
                    &matrix[c],
                    inputs.dry_gain,
                    &mut mix.direct.params[c].target_gains,
                );
            }
            for i in 0..num_sends {
                if inputs.send_slots[i].is_some() {
                    for c in 0..num_channels {
                        compute_pan_gains(
                            &slot_map,
                            slot_map.len(),
                            &matrix[c],
                            inputs.wet_gain[i],
                            &mut mix.sends[i].params[c].target_gains,
                        );
                    }
                }
            }
        }
    } else if direct_channels {
        // Direct source channels always play local: write inputs to the
        // matching real outputs, skipping the virtual bus.
        mix.direct.target = TargetBus::Real;
        for c in 0..num_channels {
            if let Some(idx) = device.real.channel_index(chans[c].channel) {
                mix.direct.params[c].target_gains[idx] = inputs.dry_gain;
            }
        }

        // Auxiliary sends still pan normally, since they mix to
        // B-Format which cannot channel-match.
        for c in 0..num_channels {
            let coeffs = calc_angle_coeffs(chans[c].angle, chans[c].elevation, 0.0);
            for i in 0..num_sends {
                if inputs.send_slots[i].is_some() {
                    compute_pan_gains(
                        &slot_map,
                        slot_map.len(),
                        &coeffs,
                        inputs.wet_gain[i],
                        &mut mix.sends[i].params[c].target_gains,
                    );
                }
            }
        }
    } else if device.render_mode == RenderMode::Hrtf {
        // Full HRTF rendering straight to the real outputs.
        mix.direct.target = TargetBus::Real;
        let store = device.hrtf.as_ref().expect("HRTF render mode requires a store");

        if inputs.distance > f32::EPSILON {
            // One response for the source direction, shared by every
            // non-LFE input channel.
            let mut params = store.coeffs_for(inputs.elevation, inputs.azimuth, inputs.spread);
            params.gain = inputs.dry_gain * downmix_gain;
            mix.direct.params[0].hrtf_target = params;
            for c in 1..num_channels {
                if chans[c].channel != Channel::Lfe {
                    mix.direct.params[c].hrtf_target = params;
                }
            }

            let coeffs = calc_angle_coeffs(inputs.azimuth, inputs.elevation, inputs.spread);
            for i in 0..num_sends {
                if inputs.send_slots[i].is_some() {
                    for c in 0..num_channels {
                        if chans[c].channel != Channel::Lfe {
                            compute_pan_gains(
                                &slot_map,
                                slot_map.len(),
                                &coeffs,
                                inputs.wet_gain[i] * downmix_gain,
                                &mut mix.sends[i].params[c].target_gains,
                            );
                        }
                    }
                }
            }
        } else {
            // Local sources get a "virtual speaker" response per input
            // channel position.
            for c in 0..num_channels {
                if chans[c].channel == Channel::Lfe {
                    continue;
                }
                let mut params =
                    store.coeffs_for(chans[c].elevation, chans[c].angle, inputs.spread);
                params.gain = inputs.dry_gain;
                mix.direct.params[c].hrtf_target = params;

                let coeffs = calc_angle_coeffs(chans[c].angle, chans[c].elevation, inputs.spread);
                for i in 0..num_sends {
                    if inputs.send_slots[i].is_some() {
                        compute_pan_gains(
                            &slot_map,
                            slot_map.len(),
                            &coeffs,
                            inputs.wet_gain[i],
                            &mut mix.sends[i].params[c].target_gains,
                        );
                    }
                }
            }
        }

        mix.flags |= voice_flags::HAS_HRTF;
    } else {
        // Non-HRTF rendering: normal ambisonic panning.
        mix.direct.target = TargetBus::Dry;

        if inputs.distance > f32::EPSILON {
            if device.avg_speaker_dist > 0.0 {
                let mdist = (inputs.distance * listener.meters_per_unit)
                    .max(device.avg_speaker_dist / 4.0);
                let w0 = SPEED_OF_SOUND_METERS_PER_SEC / (mdist * device.frequency as f32);
                for c in 0..num_channels {
                    adjust_nfc(&mut mix.direct.params[c], device, w0);
                }
                mix.direct.channels_per_order = device.channels_per_order;
                mix.flags |= voice_flags::HAS_NFC;
            }

            let azi = if device.render_mode == RenderMode::StereoPair {
                scale_azimuth_front(inputs.azimuth, 1.5)
            } else {
                inputs.azimuth
            };
            let coeffs = calc_angle_coeffs(azi, inputs.elevation, inputs.spread);

            for c in 0..num_channels {
                // Special-case LFE.
                if chans[c].channel == Channel::Lfe {
                    if device.dry.span == device.real.span {
                        if let Some(idx) = device.real.channel_index(chans[c].channel) {
                            mix.direct.params[c].target_gains[idx] = inputs.dry_gain;
                        }
                    }
                    continue;
                }
                compute_pan_gains(
                    &device.dry.map,
                    device.dry.channels,
                    &coeffs,
                    inputs.dry_gain * downmix_gain,
                    &mut mix.direct.params[c].target_gains,
                );
            }

            for i in 0..num_sends {
                if inputs.send_slots[i].is_some() {
                    for c in 0..num_channels {
                        if chans[c].channel != Channel::Lfe {
                            compute_pan_gains(
                                &slot_map,
                                slot_map.len(),
                                &coeffs,
                                inputs.wet_gain[i] * downmix_gain,
                                &mut mix.sends[i].params[c].target_gains,
                            );
                        }
                    }
                }
            }
        } else {
            if device.avg_speaker_dist > 0.0 {
                // Distance is zero: make the filters pass-through while
                // keeping history, in case the source moves away again.
                let w0 = SPEED_OF_SOUND_METERS_PER_SEC
                    / (device.avg_speaker_dist * device.frequency as f32);
                for c in 0..num_channels {
                    adjust_nfc(&mut mix.direct.params[c], device, w0);
                }
                mix.direct.channels_per_order = device.channels_per_order;
                mix.flags |= voice_flags::HAS_NFC;
            }

            for c in 0..num_channels {
                if chans[c].channel == Channel::Lfe {
                    if device.dry.span == device.real.span {
                        if let Some(idx) = device.real.channel_index(chans[c].channel) {
                            mix.direct.params[c].target_gains[idx] = inputs.dry_gain;
                        }
                    }
                    continue;
                }

                let azi = if device.render_mode == RenderMode::StereoPair {
                    scale_azimuth_front(chans[c].angle, 3.0)
                } else {
                    chans[c].angle
                };
                let coeffs = calc_angle_coeffs(azi, chans[c].elevation, inputs.spread);

                compute_pan_gains(
                    &device.dry.map,
                    device.dry.channels,
                    &coeffs,
                    inputs.dry_gain,
                    &mut mix.direct.params[c].target_gains,
                );
                for i in 0..num_sends {
                    if inputs.send_slots[i].is_some() {
                        compute_pan_gains(
                            &slot_map,
                            slot_map.len(),
                            &coeffs,
                            inputs.wet_gain[i],
                            &mut mix.sends[i].params[c].target_gains,
                        );
                    }
                }
            }
        }
    }

    // Dual shelf filters: channel 0 derives the coefficients, the rest
    // clone them.
    let frequency = device.frequency as f32;
    {
        let hf_scale = props.direct.hf_reference / frequency;
        let lf_scale = props.direct.lf_reference / frequency;
        let gain_hf = inputs.dry_gain_hf.max(0.001); // Limit -60dB
        let gain_lf = inputs.dry_gain_lf.max(0.001);

        mix.direct.filter_type = 0;
        if gain_hf != 1.0 {
            mix.direct.filter_type |= filter_flags::LOW_PASS;
        }
        if gain_lf != 1.0 {
            mix.direct.filter_type |= filter_flags::HIGH_PASS;
        }
        mix.direct.params[0].low_pass.set_params(
            BiquadType::HighShelf,
            gain_hf,
            hf_scale,
            calc_rcpq_from_slope(gain_hf, 1.0),
        );
        mix.direct.params[0].high_pass.set_params(
            BiquadType::LowShelf,
            gain_lf,
            lf_scale,
            calc_rcpq_from_slope(gain_lf, 1.0),
        );
        for c in 1..num_channels {
            let (first, rest) = mix.direct.params.split_at_mut(c);
            rest[0].low_pass.copy_params_from(&first[0].low_pass);
            rest[0].high_pass.copy_params_from(&first[0].high_pass);
        }
    }
    for i in 0..num_sends {
        let hf_scale = props.sends[i].path.hf_reference / frequency;
        let lf_scale = props.sends[i].path.lf_reference / frequency;
        let gain_hf = inputs.wet_gain_hf[i].max(0.001);
        let gain_lf = inputs.wet_gain_lf[i].max(0.001);

        let send = &mut mix.sends[i];
        send.filter_type = 0;
        if gain_hf != 1.0 {
            send.filter_type |= filter_flags::LOW_PASS;
        }
        if gain_lf != 1.0 {
            send.filter_type |= filter_flags::HIGH_PASS;
        }
        send.params[0].low_pass.set_params(
            BiquadType::HighShelf,
            gain_hf,
            hf_scale,
            calc_rcpq_from_slope(gain_hf, 1.0),
        );
        send.params[0].high_pass.set_params(
            BiquadType::LowShelf,
            gain_lf,
            lf_scale,
            calc_rcpq_from_slope(gain_lf, 1.0),
        );
        for c in 1..num_channels {
            let (first, rest) = send.params.split_at_mut(c);
            rest[0].low_pass.copy_params_from(&first[0].low_pass);
            rest[0].high_pass.copy_params_from(&first[0].high_pass);
        }
    }
}

/// Lazily (re)build and retune a channel's near-field filter
fn adjust_nfc(param: &mut crate::voice::DirectChannelParams, device: &Device, w0: f32) {
    let w1 = SPEED_OF_SOUND_METERS_PER_SEC
        / (device.avg_speaker_dist * device.frequency as f32);
    if param.nfc_w1 != w1 {
        param.nfc = NfcFilter::new(w1);
        param.nfc_w1 = w1;
    }
    param.nfc.adjust(w0);
}

/// Directly-panned / non-spatialized parameter calculation
fn calc_non_attn_source_params(voice: &Voice, ctx: &Context, device: &Device) {
    let mix = unsafe { voice.mix_state() };
    let props = mix.props.clone();
    let listener = unsafe { ctx.mix_state() }.listener.clone();
    let queue = match &mix.queue {
        Some(q) => q.clone(),
        None => return,
    };

    mix.direct.target = TargetBus::Dry;
    let num_sends = device.num_aux_sends.min(mix.sends.len());
    let mut send_slots: [Option<Arc<EffectSlot>>; MAX_SENDS] = Default::default();
    for i in 0..num_sends {
        send_slots[i] = ctx.resolve_send_slot(i, &props.sends[i].slot);
        mix.sends[i].slot = send_slots[i].clone();
    }

    // Stepping value from the buffer/device rate ratio.
    let pitch = queue.sample_rate() as f32 / device.frequency as f32 * props.pitch;
    mix.step = pitch_to_step(pitch);
    mix.resampler = sf_dsp::Resampler::new(props.resampler);
    mix.resampler.prepare(mix.step);

    let listener_gain = listener.gain;
    let mut dry_gain = props.gain.max(props.min_gain).min(props.max_gain);
    dry_gain = (dry_gain * props.direct.gain * listener_gain).min(GAIN_MIX_MAX);

    let mut wet_gain = [0.0f32; MAX_SENDS];
    let mut wet_gain_hf = [1.0f32; MAX_SENDS];
    let mut wet_gain_lf = [1.0f32; MAX_SENDS];
    for i in 0..num_sends {
        let g = props.gain.max(props.min_gain).min(props.max_gain);
        wet_gain[i] = (g * props.sends[i].path.gain * listener_gain).min(GAIN_MIX_MAX);
        wet_gain_hf[i] = props.sends[i].path.gain_hf;
        wet_gain_lf[i] = props.sends[i].path.gain_lf;
    }

    let inputs = PanInputs {
        azimuth: 0.0,
        elevation: 0.0,
        distance: 0.0,
        spread: 0.0,
        dry_gain,
        dry_gain_hf: props.direct.gain_hf,
        dry_gain_lf: props.direct.gain_lf,
        wet_gain,
        wet_gain_hf,
        wet_gain_lf,
        send_slots: &send_slots,
    };
    calc_panning_and_filters(voice, &inputs, queue.format(), &props, &listener, device);
}

/// Fully spatialized parameter calculation
fn calc_attn_source_params(voice: &Voice, ctx: &Context, device: &Device) {
    let mix = unsafe { voice.mix_state() };
    let props = mix.props.clone();
    let listener = unsafe { ctx.mix_state() }.listener.clone();
    let queue = match &mix.queue {
        Some(q) => q.clone(),
        None => return,
    };
    let num_sends = device.num_aux_sends.min(mix.sends.len());

    mix.direct.target = TargetBus::Dry;
    let mut send_slots: [Option<Arc<EffectSlot>>; MAX_SENDS] = Default::default();
    let mut room_rolloff = [0.0f32; MAX_SENDS];
    let mut decay_distance = [0.0f32; MAX_SENDS];
    let mut decay_lf_distance = [0.0f32; MAX_SENDS];
    let mut decay_hf_distance = [0.0f32; MAX_SENDS];
    for i in 0..num_sends {
        send_slots[i] = ctx.resolve_send_slot(i, &props.sends[i].slot);
        if let Some(slot) = &send_slots[i] {
            let slot_params = &unsafe { slot.mix_state() }.params;
            if slot_params.aux_send_auto {
                room_rolloff[i] = slot_params.room_rolloff + props.room_rolloff_factor;
                // Distance at which this effect's decay reaches -60dB.
                decay_distance[i] = slot_params.decay_time * listener.reverb_speed_of_sound;
                decay_lf_distance[i] = decay_distance[i] * slot_params.decay_lf_ratio;
                decay_hf_distance[i] = decay_distance[i] * slot_params.decay_hf_ratio;
                if slot_params.decay_hf_limit && slot_params.air_absorption_gain_hf < 1.0 {
                    // The air absorption limits how long HF decay can
                    // take, so the effect never outlasts the air.
                    let absorb_dist =
                        REVERB_DECAY_GAIN.log10() / slot_params.air_absorption_gain_hf.log10();
                    decay_hf_distance[i] = decay_hf_distance[i].min(absorb_dist);
                }
            } else {
                // With send auto off, the slot input matches the dry
                // path minus filter effects.
                room_rolloff[i] = props.rolloff_factor;
            }
        }
        mix.sends[i].slot = send_slots[i].clone();
    }

    // Transform source vectors to listener space.
    let mut position = Vec4::point(props.position[0], props.position[1], props.position[2]);
    let mut velocity = Vec4::direction(props.velocity[0], props.velocity[1], props.velocity[2]);
    let mut direction = Vec4::direction(props.direction[0], props.direction[1], props.direction[2]);
    if !props.head_relative {
        position = listener.matrix.transform(position);
        velocity = listener.matrix.transform(velocity);
        direction = listener.matrix.transform(direction);
    } else {
        // Offset the source velocity to be relative to the listener.
        velocity = velocity + listener.velocity;
    }

    let directional = direction.normalize3() > 0.0;
    let mut source_to_listener = Vec4::direction(-position.x, -position.y, -position.z);
    let distance = source_to_listener.normalize3();

    // Initial gains.
    let mut dry_gain = props.gain;
    let mut dry_gain_hf = 1.0f32;
    let mut dry_gain_lf = 1.0f32;
    let mut wet_gain = [props.gain; MAX_SENDS];
    let mut wet_gain_hf = [1.0f32; MAX_SENDS];
    let mut wet_gain_lf = [1.0f32; MAX_SENDS];

    // Distance attenuation.
    let mut clamped_dist = distance;
    let model = if listener.source_distance_model {
        props.distance_model
    } else {
        listener.distance_model
    };
    match model {
        DistanceModel::InverseClamped | DistanceModel::Inverse => {
            let mut ok = true;
            if model == DistanceModel::InverseClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                ok = props.max_distance >= props.ref_distance;
            }
            if ok {
                if props.ref_distance > 0.0 {
                    let dist = sf_core::lerp(props.ref_distance, clamped_dist, props.rolloff_factor);
                    if dist > 0.0 {
                        dry_gain *= props.ref_distance / dist;
                    }
                    for i in 0..num_sends {
                        let dist = sf_core::lerp(props.ref_distance, clamped_dist, room_rolloff[i]);
                        if dist > 0.0 {
                            wet_gain[i] *= props.ref_distance / dist;
                        }
                    }
                } else {
                    clamped_dist = props.ref_distance;
                }
            }
        }
        DistanceModel::LinearClamped | DistanceModel::Linear => {
            let mut ok = true;
            if model == DistanceModel::LinearClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                ok = props.max_distance >= props.ref_distance;
            }
            if ok {
                if props.max_distance != props.ref_distance {
                    let base = (clamped_dist - props.ref_distance)
                        / (props.max_distance - props.ref_distance);
                    dry_gain *= (1.0 - props.rolloff_factor * base).max(0.0);
                    for i in 0..num_sends {
                        wet_gain[i] *= (1.0 - room_rolloff[i] * base).max(0.0);
                    }
                } else {
                    clamped_dist = props.ref_distance;
                }
            }
        }
        DistanceModel::ExponentClamped | DistanceModel::Exponent => {
            let mut ok = true;
            if model == DistanceModel::ExponentClamped {
                clamped_dist = clamped_dist.max(props.ref_distance).min(props.max_distance);
                ok = props.max_distance >= props.ref_distance;
            }
            if ok {
                if clamped_dist > 0.0 && props.ref_distance > 0.0 {
                    let ratio = clamped_dist / props.ref_distance;
                    dry_gain *= ratio.powf(-props.rolloff_factor);
                    for i in 0..num_sends {
                        wet_gain[i] *= ratio.powf(-room_rolloff[i]);
                    }
                } else {
                    clamped_dist = props.ref_distance;
                }
            }
        }
        DistanceModel::Disable => {
            clamped_dist = props.ref_distance;
        }
    }

    // Directional sound cones.
    if directional && props.inner_angle < 360.0 {
        let angle = direction.dot3(source_to_listener).clamp(-1.0, 1.0).acos()
            * *CONE_SCALE
            * 2.0
            * (180.0 / PI);

        let (cone_volume, cone_hf) = if angle <= props.inner_angle {
            (1.0, 1.0)
        } else if angle < props.outer_angle {
            let scale = (angle - props.inner_angle) / (props.outer_angle - props.inner_angle);
            (
                sf_core::lerp(1.0, props.outer_gain, scale),
                sf_core::lerp(1.0, props.outer_gain_hf, scale),
            )
        } else {
            (props.outer_gain, props.outer_gain_hf)
        };

        dry_gain *= cone_volume;
        if props.dry_gain_hf_auto {
            dry_gain_hf *= cone_hf;
        }
        if props.wet_gain_auto {
            for g in wet_gain[..num_sends].iter_mut() {
                *g *= cone_volume;
            }
        }
        if props.wet_gain_hf_auto {
            for g in wet_gain_hf[..num_sends].iter_mut() {
                *g *= cone_hf;
            }
        }
    }

    // Clamp and combine with the listener gain.
    dry_gain = dry_gain.max(props.min_gain).min(props.max_gain);
    dry_gain = (dry_gain * props.direct.gain * listener.gain).min(GAIN_MIX_MAX);
    dry_gain_hf *= props.direct.gain_hf;
    dry_gain_lf *= props.direct.gain_lf;
    for i in 0..num_sends {
        wet_gain[i] = wet_gain[i].max(props.min_gain).min(props.max_gain);
        wet_gain[i] = (wet_gain[i] * props.sends[i].path.gain * listener.gain).min(GAIN_MIX_MAX);
        wet_gain_hf[i] *= props.sends[i].path.gain_hf;
        wet_gain_lf[i] *= props.sends[i].path.gain_lf;
    }

    // Distance-based air absorption and initial send decay.
    if clamped_dist > props.ref_distance && props.rolloff_factor > 0.0 {
        let meters_base =
            (clamped_dist - props.ref_distance) * props.rolloff_factor * listener.meters_per_unit;
        if props.air_absorption_factor > 0.0 {
            let hfattn = AIR_ABSORB_GAIN_HF.powf(meters_base * props.air_absorption_factor);
            dry_gain_hf *= hfattn;
            for g in wet_gain_hf[..num_sends].iter_mut() {
                *g *= hfattn;
            }
        }

        if props.wet_gain_auto {
            // Apply the effect's initial decay over the source distance
            // to the wet path.
            for i in 0..num_sends {
                if decay_distance[i] <= 0.0 {
                    continue;
                }
                let gain = REVERB_DECAY_GAIN.powf(meters_base / decay_distance[i]);
                wet_gain[i] *= gain;
                // The wet path's absorption applies under WetGainAuto,
                // not WetGainHFAuto.
                if gain > 0.0 {
                    let gain_hf = REVERB_DECAY_GAIN.powf(meters_base / decay_hf_distance[i]);
                    wet_gain_hf[i] *= (gain_hf / gain).min(1.0);
                    let gain_lf = REVERB_DECAY_GAIN.powf(meters_base / decay_lf_distance[i]);
                    wet_gain_lf[i] *= (gain_lf / gain).min(1.0);
                }
            }
        }
    }

    // Velocity-based doppler shift.
    let mut pitch = props.pitch;
    let doppler_factor = props.doppler_factor * listener.doppler_factor;
    if doppler_factor > 0.0 {
        let vss = velocity.dot3(source_to_listener) * doppler_factor;
        let vls = listener.velocity.dot3(source_to_listener) * doppler_factor;
        let sos = listener.speed_of_sound;

        if !(vls < sos) {
            // Listener moving away from the source at the speed of
            // sound; the waves cannot catch up.
            pitch = 0.0;
        } else if !(vss < sos) {
            // Source moving toward the listener at the speed of sound;
            // the waves bunch up to extreme frequencies.
            pitch = f32::INFINITY;
        } else {
            pitch *= (sos - vls) / (sos - vss);
        }
    }

    // Buffer/device rate adjustment and fixed-point step.
    pitch *= queue.sample_rate() as f32 / device.frequency as f32;
    mix.step = pitch_to_step(pitch);
    mix.resampler = sf_dsp::Resampler::new(props.resampler);
    mix.resampler.prepare(mix.step);

    let (mut ev, mut az) = (0.0f32, 0.0f32);
    if distance > 0.0 {
        // Clamp Y in case rounding left it outside -1..+1.
        ev = (-source_to_listener.y).clamp(-1.0, 1.0).asin();
        // Negate X to go from source-to-listener to listener-to-source,
        // with -Z forward in right-handed coordinates.
        az = (-source_to_listener.x).atan2(source_to_listener.z * *Z_SCALE);
    }

    let spread = if props.radius > distance {
        TAU - distance / props.radius * PI
    } else if distance > 0.0 {
        (props.radius / distance).asin() * 2.0
    } else {
        0.0
    };

    let inputs = PanInputs {
        azimuth: az,
        elevation: ev,
        distance,
        spread,
        dry_gain,
        dry_gain_hf,
        dry_gain_lf,
        wet_gain,
        wet_gain_hf,
        wet_gain_lf,
        send_slots: &send_slots,
    };
    calc_panning_and_filters(voice, &inputs, queue.format(), &props, &listener, device);
}

/// Apply a pending voice update (or recompute after a forced change) and
/// derive all mixing parameters.
pub(crate) fn calc_source_params(voice: &Voice, ctx: &Context, device: &Device, force: bool) {
    let had_update = {
        let mix = unsafe { voice.mix_state() };
        crate::props::consume_update(&voice.update, &ctx.free_voice_props, &mut mix.props)
    };
    if !had_update && !force {
        return;
    }

    let mix = unsafe { voice.mix_state() };
    let spatialized = match (&mix.queue, mix.props.spatialize_mode) {
        (None, _) => return,
        (_, SpatializeMode::On) => true,
        (_, SpatializeMode::Off) => false,
        (Some(q), SpatializeMode::Auto) => q.format() == BufferFormat::Mono,
    };

    if spatialized {
        calc_attn_source_params(voice, ctx, device);
    } else {
        calc_non_attn_source_params(voice, ctx, device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_step_bounds() {
        assert_eq!(pitch_to_step(1.0), FRACTION_ONE);
        assert_eq!(pitch_to_step(2.0), FRACTION_ONE * 2);
        assert_eq!(pitch_to_step(0.0), 1);
        assert_eq!(pitch_to_step(f32::INFINITY), MAX_PITCH << FRACTION_BITS);
        assert_eq!(pitch_to_step(1e9), MAX_PITCH << FRACTION_BITS);
    }

    #[test]
    fn pan_gains_respect_map_scale() {
        let map = [
            BfChannelConfig { scale: 0.5, index: 0 },
            BfChannelConfig { scale: 1.0, index: 3 },
        ];
        let mut coeffs = [0.0f32; MAX_AMBI_COEFFS];
        coeffs[0] = 1.0;
        coeffs[3] = 2.0;
        let mut gains = [0.0f32; MAX_OUTPUT_CHANNELS];
        compute_pan_gains(&map, 2, &coeffs, 2.0, &mut gains);
        assert_eq!(gains[0], 1.0);
        assert_eq!(gains[1], 4.0);
        assert!(gains[2..].iter().all(|&g| g == 0.0));
    }
}
