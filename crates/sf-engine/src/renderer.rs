//! Renderer initialization: panning layouts, HRTF selection, decoder and
//! output-conditioning setup
//!
//! Runs at device creation and reset, before the backend may start.
//! Decides the dry/first-order/real bus carving, the post-process stage,
//! and the conditioning chain (stabilizer, limiter, distance
//! compensation, dither) from the device format and configuration.

use sf_core::{
    AmbiIndex, AmbiLayout, AmbiScale, BfChannelConfig, Channel, ChannelLayout, CustomDecoder,
    RenderMode, SfError, SfResult, StereoEncoding, StereoMode, BUFFER_SIZE, MAX_AMBI2D_COEFFS,
    MAX_AMBI_COEFFS, CHANS_PER_ORDER_2D, CHANS_PER_ORDER_3D, SPEED_OF_SOUND_METERS_PER_SEC,
};
use sf_dsp::{
    bformatdec::{AMBI3D_DECODER, AMBI3D_DECODER_HF_SCALE, AMBI3D_POINTS},
    AmbiUpsampler, BFormatDec, CrossfeedFilter, DirectHrtfMixer, FrontStablizer, Limiter,
    Uhj2Encoder,
};

use crate::device::{AmbiBus, BusSpan, Device, DistChannel, DistanceComp, PostProcess, RealBus};

/// Longest distance-compensation delay in samples
const MAX_DELAY_LENGTH: usize = 1024;

/// One builtin decoder row: output channel and its ambisonic gains
struct ChannelDec {
    chan: Channel,
    gains: [f32; MAX_AMBI2D_COEFFS],
}

const fn dec(chan: Channel, gains: [f32; MAX_AMBI2D_COEFFS]) -> ChannelDec {
    ChannelDec { chan, gains }
}

const MONO_CFG: [ChannelDec; 1] = [dec(Channel::FrontCenter, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])];

const STEREO_CFG: [ChannelDec; 2] = [
    dec(Channel::FrontLeft, [5.00000000e-1, 2.88675135e-1, 5.52305643e-2, 0.0, 0.0, 0.0, 0.0]),
    dec(Channel::FrontRight, [5.00000000e-1, -2.88675135e-1, 5.52305643e-2, 0.0, 0.0, 0.0, 0.0]),
];

const QUAD_CFG: [ChannelDec; 4] = [
    dec(Channel::BackLeft, [3.53553391e-1, 2.04124145e-1, -2.04124145e-1, 0.0, 0.0, 0.0, 0.0]),
    dec(Channel::FrontLeft, [3.53553391e-1, 2.04124145e-1, 2.04124145e-1, 0.0, 0.0, 0.0, 0.0]),
    dec(Channel::FrontRight, [3.53553391e-1, -2.04124145e-1, 2.04124145e-1, 0.0, 0.0, 0.0, 0.0]),
    dec(Channel::BackRight, [3.53553391e-1, -2.04124145e-1, -2.04124145e-1, 0.0, 0.0, 0.0, 0.0]),
];

const X51_SIDE_CFG: [ChannelDec; 4] = [
    dec(Channel::SideLeft, [3.33000782e-1, 1.89084803e-1, -2.00042375e-1, -2.12307769e-2, -1.14579885e-2, 0.0, 0.0]),
    dec(Channel::FrontLeft, [1.88542860e-1, 1.27709292e-1, 1.66295695e-1, 7.30571517e-2, 2.10901184e-2, 0.0, 0.0]),
    dec(Channel::FrontRight, [1.88542860e-1, -1.27709292e-1, 1.66295695e-1, -7.30571517e-2, 2.10901184e-2, 0.0, 0.0]),
    dec(Channel::SideRight, [3.33000782e-1, -1.89084803e-1, -2.00042375e-1, 2.12307769e-2, -1.14579885e-2, 0.0, 0.0]),
];

const X51_REAR_CFG: [ChannelDec; 4] = [
    dec(Channel::BackLeft, [3.33000782e-1, 1.89084803e-1, -2.00042375e-1, -2.12307769e-2, -1.14579885e-2, 0.0, 0.0]),
    dec(Channel::FrontLeft, [1.88542860e-1, 1.27709292e-1, 1.66295695e-1, 7.30571517e-2, 2.10901184e-2, 0.0, 0.0]),
    dec(Channel::FrontRight, [1.88542860e-1, -1.27709292e-1, 1.66295695e-1, -7.30571517e-2, 2.10901184e-2, 0.0, 0.0]),
    dec(Channel::BackRight, [3.33000782e-1, -1.89084803e-1, -2.00042375e-1, 2.12307769e-2, -1.14579885e-2, 0.0, 0.0]),
];

const X61_CFG: [ChannelDec; 5] = [
    dec(Channel::SideLeft, [2.04460341e-1, 2.17177926e-1, -4.39996780e-2, -2.60790269e-2, -6.87239792e-2, 0.0, 0.0]),
    dec(Channel::FrontLeft, [1.58923161e-1, 9.21772680e-2, 1.59658796e-1, 6.66278083e-2, 3.84686854e-2, 0.0, 0.0]),
    dec(Channel::FrontRight, [1.58923161e-1, -9.21772680e-2, 1.59658796e-1, -6.66278083e-2, 3.84686854e-2, 0.0, 0.0]),
    dec(Channel::SideRight, [2.04460341e-1, -2.17177926e-1, -4.39996780e-2, 2.60790269e-2, -6.87239792e-2, 0.0, 0.0]),
    dec(Channel::BackCenter, [2.50001688e-1, 0.00000000e+0, -2.50000094e-1, 0.00000000e+0, 6.05133395e-2, 0.0, 0.0]),
];

const X71_CFG: [ChannelDec; 6] = [
    dec(Channel::BackLeft, [2.04124145e-1, 1.08880247e-1, -1.88586120e-1, -1.29099444e-1, 7.45355993e-2, 3.73460789e-2, 0.00000000e+0]),
    dec(Channel::SideLeft, [2.04124145e-1, 2.17760495e-1, 0.00000000e+0, 0.00000000e+0, -1.49071198e-1, -3.73460789e-2, 0.00000000e+0]),
    dec(Channel::FrontLeft, [2.04124145e-1, 1.08880247e-1, 1.88586120e-1, 1.29099444e-1, 7.45355993e-2, 3.73460789e-2, 0.00000000e+0]),
    dec(Channel::FrontRight, [2.04124145e-1, -1.08880247e-1, 1.88586120e-1, -1.29099444e-1, 7.45355993e-2, -3.73460789e-2, 0.00000000e+0]),
    dec(Channel::SideRight, [2.04124145e-1, -2.17760495e-1, 0.00000000e+0, 0.00000000e+0, -1.49071198e-1, 3.73460789e-2, 0.00000000e+0]),
    dec(Channel::BackRight, [2.04124145e-1, -1.08880247e-1, -1.88586120e-1, 1.29099444e-1, 7.45355993e-2, -3.73460789e-2, 0.00000000e+0]),
];

fn builtin_cfg(layout: ChannelLayout) -> (&'static [ChannelDec], usize) {
    match layout {
        ChannelLayout::Mono => (&MONO_CFG, 1),
        ChannelLayout::Stereo => (&STEREO_CFG, 3),
        ChannelLayout::Quad => (&QUAD_CFG, 3),
        ChannelLayout::X51 => (&X51_SIDE_CFG, 5),
        ChannelLayout::X51Rear => (&X51_REAR_CFG, 5),
        ChannelLayout::X61 => (&X61_CFG, 5),
        ChannelLayout::X71 => (&X71_CFG, 7),
        ChannelLayout::Ambi3D(_) => unreachable!("ambisonic output uses no builtin decoder"),
    }
}

/// Carve the mix buffers: dry bus, optionally separate first-order bus,
/// optionally separate real-output bus (else real aliases dry).
fn setup_buses(device: &mut Device, dry_channels: usize, foa_separate: bool, real_separate: bool) {
    let foa_channels = if foa_separate { 4 } else { 0 };
    let real_channels = if real_separate { device.layout.count() } else { 0 };
    let total = dry_channels + foa_channels + real_channels;

    device.mix_buffer = vec![[0.0; BUFFER_SIZE]; total];
    device.dry.span = BusSpan::new(0, dry_channels);
    device.dry.channels = dry_channels;
    device.foa.span = if foa_separate {
        BusSpan::new(dry_channels, 4)
    } else {
        device.dry.span
    };
    device.foa.channels = if foa_separate { 4 } else { dry_channels };
    device.real.span = if real_separate {
        BusSpan::new(dry_channels + foa_channels, real_channels)
    } else {
        device.dry.span
    };
}

/// Identity N3D map over the 2D or 3D component sets
fn identity_map(count: usize, from_2d: bool) -> [BfChannelConfig; MAX_AMBI_COEFFS] {
    let mut map = [BfChannelConfig::default(); MAX_AMBI_COEFFS];
    for (i, m) in map.iter_mut().enumerate().take(count) {
        *m = BfChannelConfig {
            scale: 1.0,
            index: if from_2d { AmbiIndex::FROM_2D[i] } else { AmbiIndex::FROM_3D[i] },
        };
    }
    map
}

/// Builtin panning for plain layouts (and the stereo pair / crossfeed /
/// ambisonic-output paths)
fn init_panning(device: &mut Device) {
    if let ChannelLayout::Ambi3D(order) = device.layout {
        let order = order as usize;
        let count = (order + 1) * (order + 1);
        let acnmap = match device.config.ambi_layout {
            AmbiLayout::FuMa => &AmbiIndex::FROM_FUMA,
            AmbiLayout::Acn => &AmbiIndex::FROM_ACN,
        };
        let n3dscale = device.config.ambi_norm.to_n3d();

        setup_buses(device, count, order >= 2, false);
        for i in 0..count {
            let acn = acnmap[i];
            device.dry.map[i] = BfChannelConfig {
                scale: 1.0 / n3dscale[acn],
                index: acn,
            };
        }

        if order < 2 {
            device.foa.map = device.dry.map;
            device.post = PostProcess::None;
        } else {
            device.foa.map = identity_map(4, false);
            let upsampler = AmbiUpsampler::new(
                &device.dry.map[..count],
                400.0 / device.frequency as f32,
            );
            device.post = PostProcess::AmbiUp { upsampler };
        }

        if device.config.nfc_ref_delay > 0.0 {
            let delay = device.config.nfc_ref_delay.clamp(0.001, 1000.0);
            init_near_field_ctrl(
                device,
                delay * SPEED_OF_SOUND_METERS_PER_SEC,
                order,
                &CHANS_PER_ORDER_3D,
            );
        }
        return;
    }

    let (cfg, coeffcount) = builtin_cfg(device.layout);
    setup_buses(device, coeffcount, false, true);
    device.dry.map = identity_map(coeffcount, true);
    device.foa.map = foa_alias_map(coeffcount);

    let rows: Vec<(usize, [f32; MAX_AMBI2D_COEFFS])> = cfg
        .iter()
        .filter_map(|d| device.real.channel_index(d.chan).map(|idx| (idx, d.gains)))
        .collect();

    log::debug!(
        "Enabling {}-order ambisonic decoder for {:?}",
        match coeffcount {
            c if c > 5 => "third",
            c if c > 3 => "second",
            _ => "first",
        },
        device.layout
    );
    let decoder = BFormatDec::new_single(coeffcount, 400.0 / device.frequency as f32, &rows);
    device.post = PostProcess::AmbiDec { decoder };
}

/// First-order view of a (possibly higher-order) 2D dry bus. Components
/// beyond first order read zero.
fn foa_alias_map(coeffcount: usize) -> [BfChannelConfig; MAX_AMBI_COEFFS] {
    let mut map = [BfChannelConfig::default(); MAX_AMBI_COEFFS];
    for (i, m) in map.iter_mut().enumerate().take(coeffcount.min(3)) {
        *m = BfChannelConfig {
            scale: 1.0,
            index: AmbiIndex::FROM_2D[i],
        };
    }
    map
}

/// Custom speaker-layout decoding from a loaded decoder description
fn init_custom_panning(device: &mut Device, conf: &CustomDecoder, hq: bool) -> SfResult<()> {
    let speakermap: Vec<usize> = conf
        .speakers
        .iter()
        .map(|s| {
            device.real.channel_index(s.channel).ok_or_else(|| {
                SfError::UnsupportedFormat(format!(
                    "decoder speaker {:?} not in device layout",
                    s.channel
                ))
            })
        })
        .collect::<SfResult<_>>()?;

    let periphonic = conf.is_periphonic();
    let count = if periphonic {
        match conf.order() {
            3 => 16,
            2 => 9,
            _ => 4,
        }
    } else {
        conf.order() * 2 + 1
    };

    // Re-carve now that the dry width is known.
    setup_buses(device, count, false, true);
    device.dry.map = identity_map(count, !periphonic);
    device.foa.map = if periphonic {
        identity_map(4, false)
    } else {
        foa_alias_map(count)
    };

    log::debug!(
        "Enabling {}-band {}-order{} ambisonic decoder",
        if hq && conf.freq_bands == 2 { "dual" } else { "single" },
        match conf.order() {
            3 => "third",
            2 => "second",
            _ => "first",
        },
        if periphonic { " periphonic" } else { "" }
    );
    let decoder = BFormatDec::new_custom(conf, &speakermap, device.frequency, hq);
    device.post = PostProcess::AmbiDec { decoder };

    if hq {
        let avg_dist = conf
            .speakers
            .iter()
            .map(|s| s.distance)
            .sum::<f32>()
            / conf.speakers.len().max(1) as f32;
        init_near_field_ctrl(
            device,
            avg_dist,
            conf.order(),
            if periphonic { &CHANS_PER_ORDER_3D } else { &CHANS_PER_ORDER_2D },
        );
    }

    init_distance_comp(device, conf, &speakermap);
    Ok(())
}

/// HRTF output: first-order dry bus decoded binaurally
fn init_hrtf_panning(device: &mut Device) {
    setup_buses(device, 4, false, true);
    device.dry.map = identity_map(4, false);
    device.foa.map = device.dry.map;

    // Virtual-speaker build: the cube layout with the first-order decode
    // and its HF compensation.
    let store = device.hrtf.as_ref().expect("HRTF store required");
    // Elevation and clockwise azimuth of each cube corner.
    let points: Vec<(f32, f32)> = AMBI3D_POINTS
        .iter()
        .map(|p| (p[1].asin(), p[0].atan2(-p[2])))
        .collect();
    let matrix: Vec<[f32; MAX_AMBI_COEFFS]> = AMBI3D_DECODER
        .iter()
        .map(|row| {
            let mut full = [0.0f32; MAX_AMBI_COEFFS];
            full[..4].copy_from_slice(row);
            full
        })
        .collect();
    let order_gain = [
        AMBI3D_DECODER_HF_SCALE[0],
        AMBI3D_DECODER_HF_SCALE[1],
        0.0,
        0.0,
    ];
    let mixer = DirectHrtfMixer::build(store, 4, &points, &matrix, &order_gain);

    device.post = PostProcess::Hrtf {
        mixer,
        upsampler: None,
    };
}

/// UHJ-encoded stereo output from a horizontal B-Format dry bus
fn init_uhj_panning(device: &mut Device) {
    setup_buses(device, 3, false, true);
    // FuMa-ordered, FuMa-scaled components feed the encoder directly.
    for i in 0..3 {
        let acn = AmbiIndex::FROM_FUMA[i];
        device.dry.map[i] = BfChannelConfig {
            scale: 1.0 / AmbiScale::FROM_FUMA[acn],
            index: acn,
        };
    }
    device.foa.map = device.dry.map;

    device.post = PostProcess::Uhj {
        encoder: Box::new(Uhj2Encoder::new()),
    };
}

fn init_near_field_ctrl(device: &mut Device, ctrl_dist: f32, order: usize, chans_per_order: &[usize]) {
    if !device.config.nfc || ctrl_dist <= 0.0 {
        return;
    }
    device.avg_speaker_dist = ctrl_dist.min(10.0);
    log::debug!(
        "Using near-field reference distance: {:.2} meters",
        device.avg_speaker_dist
    );
    device.channels_per_order.fill(0);
    device.channels_per_order[..=order].copy_from_slice(&chans_per_order[..=order]);
}

fn init_distance_comp(device: &mut Device, conf: &CustomDecoder, speakermap: &[usize]) {
    let maxdist = conf.speakers.iter().map(|s| s.distance).fold(0.0f32, f32::max);
    if !device.config.distance_comp || maxdist <= 0.0 {
        return;
    }

    let srate = device.frequency as f32;
    let mut channels: Vec<DistChannel> = (0..device.real.span.len)
        .map(|_| DistChannel {
            gain: 1.0,
            buffer: Vec::new(),
        })
        .collect();

    for (i, speaker) in conf.speakers.iter().enumerate() {
        let chan = speakermap[i];
        // Delays quantize to whole samples; at 48kHz that is steps of
        // about 7 millimeters.
        let delay =
            ((maxdist - speaker.distance) / SPEED_OF_SOUND_METERS_PER_SEC * srate + 0.5).floor();
        if delay >= MAX_DELAY_LENGTH as f32 {
            log::error!(
                "Delay for speaker \"{:?}\" exceeds buffer length ({} >= {})",
                speaker.channel,
                delay,
                MAX_DELAY_LENGTH
            );
        }
        let length = (delay.max(0.0) as usize).min(MAX_DELAY_LENGTH - 1);
        channels[chan].gain = speaker.distance / maxdist;
        channels[chan].buffer = vec![0.0; length];
        log::debug!(
            "Channel {:?} distance compensation: {} samples, {:.4} gain",
            speaker.channel,
            length,
            channels[chan].gain
        );
    }

    device.distance_comp = Some(DistanceComp { channels });
}

/// Select render mode and initialize panning, post-process, and output
/// conditioning for the device's current format and configuration.
pub(crate) fn init_renderer(device: &mut Device) -> SfResult<()> {
    device.render_mode = RenderMode::Normal;
    device.avg_speaker_dist = 0.0;
    device.channels_per_order.fill(0);
    device.distance_comp = None;
    device.stablizer = None;
    device.real = RealBus {
        span: BusSpan::default(),
        channels: device.layout.channels(),
    };
    device.dry = AmbiBus::default();
    device.foa = AmbiBus::default();

    if device.layout != ChannelLayout::Stereo {
        let hq = device.config.hq_mode;
        match device.config.custom_decoder.clone() {
            Some(conf) if !device.layout.is_ambisonic() => {
                init_custom_panning(device, &conf, hq)?;
            }
            _ => init_panning(device),
        }

        // The stabilizer needs the three front channels.
        if device.config.front_stabilizer && device.layout.has_front_trio() {
            let scale = 5000.0 / device.frequency as f32;
            device.stablizer = Some(FrontStablizer::new(scale));
        }
        log::debug!(
            "Front stabilizer {}",
            if device.stablizer.is_some() { "enabled" } else { "disabled" }
        );
    } else {
        let headphones = device.config.stereo_mode == StereoMode::Headphones;

        if device.hrtf.is_some() && headphones {
            device.render_mode = match device.config.hrtf_mode {
                sf_core::HrtfMode::Full => RenderMode::Hrtf,
                sf_core::HrtfMode::Basic => RenderMode::Normal,
            };
            log::debug!(
                "{} HRTF rendering enabled",
                if device.render_mode == RenderMode::Hrtf { "Full" } else { "Basic" }
            );
            init_hrtf_panning(device);
        } else if (1..=6).contains(&device.config.cf_level) {
            device.render_mode = RenderMode::StereoPair;
            init_panning(device);
            log::debug!("BS2B enabled");
            device.post = PostProcess::Bs2b {
                filter: CrossfeedFilter::new(device.config.cf_level, device.frequency as f32),
            };
        } else if device.config.stereo_encoding == StereoEncoding::Uhj {
            log::debug!("UHJ enabled");
            init_uhj_panning(device);
        } else {
            device.render_mode = RenderMode::StereoPair;
            init_panning(device);
        }
    }

    // The device limiter runs without lookahead so it adds no latency;
    // offline consumers wanting true peak safety can add their own.
    device.limiter = if device.config.output_limiter {
        Some(Limiter::with_lookahead(
            device.frequency as f32,
            device.real.span.len.min(sf_core::MAX_OUTPUT_CHANNELS),
            1.0,
            0.0,
        ))
    } else {
        None
    };

    let dither_bits = device.fmt.default_dither_bits();
    device.dither_depth = if device.config.dither && dither_bits > 0 {
        2.0f32.powi(dither_bits as i32 - 1)
    } else {
        0.0
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::{DeviceConfig, SampleFormat};

    fn device_with(layout: ChannelLayout, config: DeviceConfig) -> Device {
        Device::new("test", 48000, layout, SampleFormat::F32, config, None).unwrap()
    }

    #[test]
    fn stereo_defaults_to_panpot_pair() {
        let dev = device_with(ChannelLayout::Stereo, DeviceConfig::default());
        assert_eq!(dev.render_mode, RenderMode::StereoPair);
        assert_eq!(dev.dry.channels, 3);
        assert_eq!(dev.real.span.len, 2);
        assert!(matches!(dev.post, PostProcess::AmbiDec { .. }));
        // Real output is carved after the dry bus.
        assert_ne!(dev.real.span, dev.dry.span);
    }

    #[test]
    fn uhj_uses_fuma_scaled_bus() {
        let config = DeviceConfig {
            stereo_encoding: StereoEncoding::Uhj,
            ..Default::default()
        };
        let dev = device_with(ChannelLayout::Stereo, config);
        assert_eq!(dev.render_mode, RenderMode::Normal);
        assert!(matches!(dev.post, PostProcess::Uhj { .. }));
        assert_eq!(dev.dry.channels, 3);
        // W is ACN 0 scaled down from N3D to FuMa.
        assert_eq!(dev.dry.map[0].index, 0);
        assert!((dev.dry.map[0].scale - 1.0 / 1.414213562).abs() < 1e-6);
        // Channel order is W, X, Y.
        assert_eq!(dev.dry.map[1].index, 3);
        assert_eq!(dev.dry.map[2].index, 1);
    }

    #[test]
    fn crossfeed_selected_by_level() {
        let config = DeviceConfig {
            cf_level: 3,
            ..Default::default()
        };
        let dev = device_with(ChannelLayout::Stereo, config);
        assert!(matches!(dev.post, PostProcess::Bs2b { .. }));
        assert_eq!(dev.render_mode, RenderMode::StereoPair);
    }

    #[test]
    fn surround_gets_decoder_and_optional_stabilizer() {
        let dev = device_with(ChannelLayout::X51, DeviceConfig::default());
        assert_eq!(dev.dry.channels, 5);
        assert!(matches!(dev.post, PostProcess::AmbiDec { .. }));
        assert!(dev.stablizer.is_none());

        let config = DeviceConfig {
            front_stabilizer: true,
            ..Default::default()
        };
        let dev = device_with(ChannelLayout::X51, config);
        assert!(dev.stablizer.is_some());
    }

    #[test]
    fn first_order_ambi_output_aliases_everything() {
        let dev = device_with(ChannelLayout::Ambi3D(1), DeviceConfig::default());
        assert_eq!(dev.dry.channels, 4);
        assert_eq!(dev.foa.span, dev.dry.span);
        assert_eq!(dev.real.span, dev.dry.span);
        assert!(matches!(dev.post, PostProcess::None));
    }

    #[test]
    fn high_order_ambi_output_gets_upsampler() {
        let dev = device_with(ChannelLayout::Ambi3D(3), DeviceConfig::default());
        assert_eq!(dev.dry.channels, 16);
        assert_eq!(dev.foa.span.len, 4);
        assert_ne!(dev.foa.span, dev.dry.span);
        assert!(matches!(dev.post, PostProcess::AmbiUp { .. }));
    }

    #[test]
    fn nfc_ref_delay_enables_near_field() {
        let config = DeviceConfig {
            nfc_ref_delay: 0.005,
            ..Default::default()
        };
        let dev = device_with(ChannelLayout::Ambi3D(1), config);
        assert!(dev.avg_speaker_dist > 0.0);
        assert_eq!(dev.channels_per_order[..2], [1, 3]);
    }

    #[test]
    fn dither_depth_follows_format() {
        let dev = Device::new(
            "t",
            48000,
            ChannelLayout::Stereo,
            SampleFormat::I16,
            DeviceConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(dev.dither_depth, 32768.0);

        let dev = device_with(ChannelLayout::Stereo, DeviceConfig::default());
        assert_eq!(dev.dither_depth, 0.0);
    }
}
