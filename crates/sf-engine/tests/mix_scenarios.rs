//! End-to-end mixing scenarios
//!
//! Drives the full pipeline through the public API: device creation,
//! contexts, voices, effect slots, and the mix entry point, checking the
//! observable output against the expected spatialization behavior.

use std::f32::consts::TAU;
use std::sync::Arc;

use sf_core::{
    BufferFormat, ChannelLayout, DeviceConfig, DistanceModel, SampleFormat, StereoEncoding,
    FRACTION_ONE, MAX_PITCH,
};
use sf_engine::{
    event_type, AsyncEvent, AudioBuffer, BufferQueue, Device, EffectProps, EffectSlotProps,
    EffectType, PassthroughEffect, SourceState, VoiceProps,
};

const BLOCK: usize = 1024;

fn stereo_device() -> Device {
    Device::new(
        "scenario",
        44100,
        ChannelLayout::Stereo,
        SampleFormat::F32,
        DeviceConfig::default(),
        None,
    )
    .unwrap()
}

/// Mix `frames` and return the interleaved f32 output
fn render(device: &mut Device, frames: usize) -> Vec<f32> {
    let chans = device.layout().count();
    let mut bytes = vec![0u8; frames * chans * 4];
    let done = device.mix(&mut bytes, frames);
    assert_eq!(done, frames);
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes(b.try_into().unwrap()))
        .collect()
}

fn mono_queue(rate: u32, data: Vec<f32>) -> Arc<BufferQueue> {
    Arc::new(BufferQueue::single(Arc::new(AudioBuffer::mono(rate, data))))
}

fn sine(freq: f32, rate: u32, frames: usize) -> Vec<f32> {
    (0..frames)
        .map(|i| (i as f32 * TAU * freq / rate as f32).sin())
        .collect()
}

/// Peak magnitude of one channel of an interleaved buffer
fn channel_peak(interleaved: &[f32], chans: usize, chan: usize, skip: usize) -> f32 {
    interleaved
        .chunks_exact(chans)
        .skip(skip)
        .map(|f| f[chan].abs())
        .fold(0.0, f32::max)
}

// ---------------------------------------------------------------------
// S1: silent device
// ---------------------------------------------------------------------

#[test]
fn silent_device_outputs_exact_zeros() {
    let mut device = stereo_device();
    let _ctx = device.create_context();
    let out = render(&mut device, BLOCK);
    assert_eq!(out.len(), BLOCK * 2);
    assert!(out.iter().all(|&s| s == 0.0));
}

// ---------------------------------------------------------------------
// S2: centered mono click
// ---------------------------------------------------------------------

#[test]
fn centered_click_is_equal_on_both_channels() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    let mut data = vec![0.0f32; 256];
    data[0] = 1.0;
    let props = VoiceProps {
        position: [0.0, 0.0, -1.0],
        distance_model: DistanceModel::Disable,
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, data), props).unwrap();

    let out = render(&mut device, BLOCK);
    let l = out[0];
    let r = out[1];
    assert!((l - r).abs() < 1e-6, "L {l} vs R {r}");
    assert!(l.abs() > 0.3, "center gain {l}");

    // Only the click is non-zero.
    for (i, &s) in out[2..512].iter().enumerate() {
        assert!(s.abs() < 1e-6, "unexpected signal at {}: {s}", i + 2);
    }
}

// ---------------------------------------------------------------------
// S3: hard-left sine
// ---------------------------------------------------------------------

#[test]
fn hard_left_source_isolates_left_channel() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    let props = VoiceProps {
        position: [-1.0, 0.0, 0.0],
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
        .unwrap();

    let out = render(&mut device, BLOCK * 4);
    // Skip the first block to pass any initial transient.
    let peak_l = channel_peak(&out, 2, 0, BLOCK);
    let peak_r = channel_peak(&out, 2, 1, BLOCK);
    assert!(peak_l > 0.1, "left peak {peak_l}");
    assert!(peak_l >= 10.0 * peak_r, "L {peak_l} R {peak_r}");
}

// ---------------------------------------------------------------------
// S4: looping pitch shift
// ---------------------------------------------------------------------

#[test]
fn looping_pitch_doubles_step_and_frequency() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    // 1kHz square wave: half-period of 22.05 samples at 44.1kHz.
    let square: Vec<f32> = (0..4410)
        .map(|i| if (i * 2000 / 44100) % 2 == 0 { 0.5 } else { -0.5 })
        .collect();
    let props = VoiceProps {
        pitch: 2.0,
        looping: true,
        position: [0.0, 0.0, -1.0],
        distance_model: DistanceModel::Disable,
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, square), props).unwrap();

    let out = render(&mut device, BLOCK * 4);
    let voice = &ctx.voices()[0];
    assert_eq!(voice.step(), 2 * FRACTION_ONE);
    assert!(voice.is_playing(), "looping voice keeps playing");

    // Dominant frequency doubles: compare energy at 2kHz against 1kHz
    // via single-bin correlation on the left channel.
    let left: Vec<f32> = out.chunks_exact(2).skip(BLOCK).map(|f| f[0]).collect();
    let bin_energy = |freq: f32| -> f32 {
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (i, &s) in left.iter().enumerate() {
            let ph = i as f32 * TAU * freq / 44100.0;
            re += s * ph.cos();
            im += s * ph.sin();
        }
        re * re + im * im
    };
    assert!(bin_energy(2000.0) > 4.0 * bin_energy(1000.0));
}

// ---------------------------------------------------------------------
// S5: inverse distance attenuation
// ---------------------------------------------------------------------

#[test]
fn inverse_model_attenuates_by_distance_ratio() {
    let render_at = |dist: f32| -> f32 {
        let mut device = stereo_device();
        let ctx = device.create_context();
        let props = VoiceProps {
            position: [0.0, 0.0, -dist],
            ref_distance: 1.0,
            rolloff_factor: 1.0,
            distance_model: DistanceModel::Inverse,
            ..Default::default()
        };
        ctx.update_context(sf_engine::ContextProps {
            source_distance_model: true,
            ..Default::default()
        });
        ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
            .unwrap();
        let out = render(&mut device, BLOCK * 2);
        channel_peak(&out, 2, 0, BLOCK)
    };

    let near = render_at(1.0);
    let far = render_at(10.0);
    assert!(near > 0.0);
    let ratio = far / near;
    assert!((ratio - 0.1).abs() < 1e-3, "attenuation ratio {ratio}");
}

#[test]
fn inverse_gain_is_monotonic_in_distance() {
    let mut last = f32::INFINITY;
    for dist in [1.0f32, 2.0, 4.0, 8.0, 16.0] {
        let mut device = stereo_device();
        let ctx = device.create_context();
        let props = VoiceProps {
            position: [0.0, 0.0, -dist],
            ..Default::default()
        };
        ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
            .unwrap();
        let out = render(&mut device, BLOCK * 2);
        let peak = channel_peak(&out, 2, 0, BLOCK);
        assert!(peak <= last + 1e-6, "gain rose at distance {dist}");
        last = peak;
    }
}

// ---------------------------------------------------------------------
// S6: doppler clamp
// ---------------------------------------------------------------------

#[test]
fn doppler_at_speed_of_sound_clamps_step() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    let props = VoiceProps {
        position: [0.0, 0.0, -10.0],
        // Moving toward the listener at exactly the speed of sound.
        velocity: [0.0, 0.0, 343.3],
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 4410)), props)
        .unwrap();

    render(&mut device, BLOCK);
    assert_eq!(ctx.voices()[0].step(), MAX_PITCH << sf_core::FRACTION_BITS);
}

#[test]
fn listener_receding_at_speed_of_sound_freezes_pitch() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    ctx.update_listener(sf_engine::ListenerProps {
        // Moving away from a source in front, along the line of sight.
        velocity: [0.0, 0.0, 343.3],
        ..Default::default()
    });
    let props = VoiceProps {
        position: [0.0, 0.0, -10.0],
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 4410)), props)
        .unwrap();

    render(&mut device, BLOCK);
    // Pitch zero floors at the minimum step.
    assert_eq!(ctx.voices()[0].step(), 1);
}

// ---------------------------------------------------------------------
// Determinism, lifecycle, and wet-path behavior
// ---------------------------------------------------------------------

#[test]
fn identical_scenes_mix_identically() {
    let run = || -> Vec<f32> {
        let mut device = stereo_device();
        let ctx = device.create_context();
        let props = VoiceProps {
            position: [0.3, 0.1, -0.8],
            ..Default::default()
        };
        ctx.play(1, mono_queue(44100, sine(313.0, 44100, 8000)), props)
            .unwrap();
        render(&mut device, BLOCK * 2)
    };

    let a = run();
    let b = run();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn finished_voice_reports_stopped_event() {
    let mut device = stereo_device();
    let ctx = device.create_context();
    ctx.enable_events(event_type::SOURCE_STATE_CHANGE);

    ctx.play(9, mono_queue(44100, vec![0.5; 100]), VoiceProps::default())
        .unwrap();
    render(&mut device, BLOCK);

    assert!(!ctx.is_source_playing(9));
    match ctx.try_event() {
        Some(AsyncEvent::SourceStateChange { id, state }) => {
            assert_eq!(id, 9);
            assert_eq!(state, SourceState::Stopped);
        }
        other => panic!("expected stop event, got {other:?}"),
    }
}

#[test]
fn stop_source_fades_out_and_stops() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    ctx.play(4, mono_queue(44100, sine(440.0, 44100, 44100)), VoiceProps::default())
        .unwrap();
    render(&mut device, BLOCK);
    assert!(ctx.is_source_playing(4));

    ctx.stop_source(4);
    render(&mut device, BLOCK);
    assert!(!ctx.is_source_playing(4));
}

#[test]
fn gain_stays_within_mix_bound() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    // A deliberately hot source: gain beyond the cap.
    let props = VoiceProps {
        gain: 100.0,
        max_gain: 100.0,
        position: [0.0, 0.0, -0.001],
        distance_model: DistanceModel::Disable,
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, vec![1.0; 8000]), props).unwrap();

    let out = render(&mut device, BLOCK);
    // The limiter plus the mix-gain cap keep the output bounded well
    // below GAIN_MIX_MAX times the input.
    for &s in &out {
        assert!(s.abs() <= sf_core::GAIN_MIX_MAX, "sample {s}");
    }
}

#[test]
fn wet_send_reaches_output_through_passthrough_slot() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    let slot = ctx.add_slot();
    ctx.update_slot(
        &slot,
        EffectSlotProps {
            gain: 1.0,
            aux_send_auto: true,
            target: None,
            effect_type: EffectType::Passthrough,
            props: EffectProps::None,
            state: Some(PassthroughEffect::new()),
        },
    );

    // Direct path muted; only the send is audible.
    let mut props = VoiceProps {
        position: [0.0, 0.0, -1.0],
        distance_model: DistanceModel::Disable,
        ..Default::default()
    };
    props.direct.gain = 0.0;
    props.sends[0].slot = Some(slot.clone());
    props.sends[0].path.gain = 1.0;
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
        .unwrap();

    let out = render(&mut device, BLOCK * 2);
    let peak = channel_peak(&out, 2, 0, BLOCK);
    assert!(peak > 0.01, "wet path silent: {peak}");
}

#[test]
fn null_effect_slot_mutes_the_send() {
    let mut device = stereo_device();
    let ctx = device.create_context();

    let slot = ctx.add_slot(); // stays EffectType::Null

    let mut props = VoiceProps {
        position: [0.0, 0.0, -1.0],
        ..Default::default()
    };
    props.direct.gain = 0.0;
    props.sends[0].slot = Some(slot.clone());
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
        .unwrap();

    let out = render(&mut device, BLOCK * 2);
    assert!(out.iter().all(|&s| s.abs() < 1e-6));
}

// ---------------------------------------------------------------------
// UHJ and B-Format paths
// ---------------------------------------------------------------------

#[test]
fn uhj_pure_w_lands_equally_on_both_channels() {
    let config = DeviceConfig {
        stereo_encoding: StereoEncoding::Uhj,
        dither: false,
        ..Default::default()
    };
    let mut device = Device::new(
        "uhj",
        44100,
        ChannelLayout::Stereo,
        SampleFormat::F32,
        config,
        None,
    )
    .unwrap();
    let ctx = device.create_context();

    // First-order 3D buffer carrying W only (FuMa W, X, Y, Z).
    let frames = 44100;
    let tone = sine(200.0, 44100, frames);
    let mut data = vec![0.0f32; frames * 4];
    for (i, &s) in tone.iter().enumerate() {
        data[i * 4] = s;
    }
    let buffer = AudioBuffer::new(BufferFormat::BFormat3D, 44100, data).unwrap();
    let queue = Arc::new(BufferQueue::single(Arc::new(buffer)));
    ctx.play(1, queue, VoiceProps::default()).unwrap();

    let out = render(&mut device, BLOCK * 4);
    let skip = BLOCK * 2;
    let (mut sum_l, mut sum_r) = (0.0f64, 0.0f64);
    for f in out.chunks_exact(2).skip(skip) {
        sum_l += (f[0] * f[0]) as f64;
        sum_r += (f[1] * f[1]) as f64;
    }
    let rms_l = (sum_l / (BLOCK * 2) as f64).sqrt();
    let rms_r = (sum_r / (BLOCK * 2) as f64).sqrt();

    assert!(rms_l > 0.05, "left silent: {rms_l}");
    // Pure W is non-directional: both channels carry it near-equally,
    // within the all-pass chains' amplitude ripple.
    let ratio = rms_l / rms_r.max(1e-9);
    assert!((0.8..1.25).contains(&ratio), "L/R ratio {ratio}");
}

// ---------------------------------------------------------------------
// HRTF rendering
// ---------------------------------------------------------------------

/// Synthetic data set: unit impulses whose delay grows with azimuth, two
/// elevation rows of eight azimuths.
fn synthetic_hrtf() -> Arc<sf_engine::HrtfStore> {
    use sf_dsp::HRIR_LENGTH;
    let az_counts = vec![8usize, 8];
    let total = 16;
    let mut coeffs = vec![0.0f32; total * HRIR_LENGTH];
    let mut delays = vec![0u8; total];
    for r in 0..total {
        coeffs[r * HRIR_LENGTH] = 1.0;
        // The far side of the head hears later.
        delays[r] = ((r % 8).min(8 - r % 8)) as u8;
    }
    Arc::new(sf_engine::HrtfStore::new(44100, az_counts, coeffs, delays).unwrap())
}

#[test]
fn hrtf_render_mode_produces_binaural_stereo() {
    let config = DeviceConfig {
        stereo_mode: sf_core::StereoMode::Headphones,
        dither: false,
        ..Default::default()
    };
    let mut device = Device::new(
        "hrtf",
        44100,
        ChannelLayout::Stereo,
        SampleFormat::F32,
        config,
        Some(synthetic_hrtf()),
    )
    .unwrap();
    assert_eq!(device.render_mode(), sf_core::RenderMode::Hrtf);
    let ctx = device.create_context();

    let props = VoiceProps {
        position: [-1.0, 0.0, 0.0],
        ..Default::default()
    };
    ctx.play(1, mono_queue(44100, sine(440.0, 44100, 44100)), props)
        .unwrap();

    let out = render(&mut device, BLOCK * 2);
    let peak_l = channel_peak(&out, 2, 0, BLOCK);
    let peak_r = channel_peak(&out, 2, 1, BLOCK);
    // Both ears hear the source; the signal is present and bounded.
    assert!(peak_l > 0.001, "left ear silent: {peak_l}");
    assert!(peak_r > 0.001, "right ear silent: {peak_r}");
    assert!(peak_l <= 2.0 && peak_r <= 2.0);
}

// ---------------------------------------------------------------------
// Output formats
// ---------------------------------------------------------------------

#[test]
fn integer_output_formats_are_silent_when_idle() {
    for fmt in [
        SampleFormat::U8,
        SampleFormat::I16,
        SampleFormat::I32,
    ] {
        let config = DeviceConfig {
            dither: false,
            ..Default::default()
        };
        let mut device =
            Device::new("fmt", 44100, ChannelLayout::Stereo, fmt, config, None).unwrap();
        let _ctx = device.create_context();

        let mut out = vec![0u8; 128 * device.frame_size()];
        device.mix(&mut out, 128);

        match fmt {
            SampleFormat::U8 => assert!(out.iter().all(|&b| b == 128)),
            SampleFormat::I16 => {
                assert!(out.chunks_exact(2).all(|b| b == [0, 0]));
            }
            _ => assert!(out.iter().all(|&b| b == 0)),
        }
    }
}

#[test]
fn surround_device_mixes_mono_source() {
    let mut device = Device::new(
        "surround",
        48000,
        ChannelLayout::X51,
        SampleFormat::F32,
        DeviceConfig::default(),
        None,
    )
    .unwrap();
    let ctx = device.create_context();

    let props = VoiceProps {
        position: [0.0, 0.0, -1.0],
        ..Default::default()
    };
    ctx.play(1, mono_queue(48000, sine(440.0, 48000, 48000)), props)
        .unwrap();

    let out = render(&mut device, BLOCK * 2);
    // A front source reaches the front-left/right pair.
    let fl = channel_peak(&out, 6, 0, BLOCK);
    let fr = channel_peak(&out, 6, 1, BLOCK);
    assert!(fl > 0.01 && fr > 0.01, "front pair silent: {fl} {fr}");
    // Symmetric between left and right.
    assert!((fl - fr).abs() < 0.05 * fl.max(fr));
}
