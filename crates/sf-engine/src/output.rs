//! Final output conditioning and format conversion
//!
//! Distance compensation, TPDF dither, and the interleave/convert step
//! that writes the real output channels into the caller's byte buffer.

use sf_core::{ChannelBuf, Sample, SampleFormat};

use crate::device::DistanceComp;

/// Per-channel FIFO delay plus gain for mismatched speaker distances
pub(crate) fn apply_distance_comp(
    samples: &mut [ChannelBuf],
    comp: &mut DistanceComp,
    scratch: &mut [Sample],
    samples_to_do: usize,
) {
    for (chan, dist) in samples.iter_mut().zip(comp.channels.iter_mut()) {
        let gain = dist.gain;
        let base = dist.buffer.len();

        if base == 0 {
            if gain < 1.0 {
                for s in chan[..samples_to_do].iter_mut() {
                    *s *= gain;
                }
            }
            continue;
        }

        let inout = &mut chan[..samples_to_do];
        if samples_to_do >= base {
            // Old FIFO content leads, the block's tail refills it.
            scratch[..base].copy_from_slice(&dist.buffer);
            scratch[base..samples_to_do].copy_from_slice(&inout[..samples_to_do - base]);
            dist.buffer.copy_from_slice(&inout[samples_to_do - base..]);
        } else {
            scratch[..samples_to_do].copy_from_slice(&dist.buffer[..samples_to_do]);
            dist.buffer.copy_within(samples_to_do.., 0);
            dist.buffer[base - samples_to_do..].copy_from_slice(inout);
        }
        for (s, &v) in inout.iter_mut().zip(&scratch[..samples_to_do]) {
            *s = v * gain;
        }
    }
}

#[inline]
fn dither_rng(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(96314165).wrapping_add(907633515);
    *seed
}

/// TPDF dither: scale to the quantization depth, add the difference of
/// two uniform random values, round, and scale back.
pub(crate) fn apply_dither(
    samples: &mut [ChannelBuf],
    dither_seed: &mut u32,
    quant_scale: f32,
    samples_to_do: usize,
) {
    let invscale = 1.0 / quant_scale;
    let mut seed = *dither_seed;
    for chan in samples.iter_mut() {
        for s in chan[..samples_to_do].iter_mut() {
            let mut val = *s * quant_scale;
            let rng0 = dither_rng(&mut seed);
            let rng1 = dither_rng(&mut seed);
            val += (rng0 as f64 * (1.0 / u32::MAX as f64)
                - rng1 as f64 * (1.0 / u32::MAX as f64)) as f32;
            *s = val.round() * invscale;
        }
    }
    *dither_seed = seed;
}

#[inline]
fn conv_i32(val: f32) -> i32 {
    // A float mantissa covers 24 bits; scale to that range and shift so
    // the full 32-bit span is used without rounding past the precision.
    ((val * 16777216.0).clamp(-16777216.0, 16777215.0) as i32) << 7
}

#[inline]
fn conv_i16(val: f32) -> i16 {
    (val * 32768.0).clamp(-32768.0, 32767.0) as i16
}

#[inline]
fn conv_i8(val: f32) -> i8 {
    (val * 128.0).clamp(-128.0, 127.0) as i8
}

/// Interleave and convert the output channels into `out`, starting at
/// frame `offset`.
pub(crate) fn write_interleaved(
    fmt: SampleFormat,
    samples: &[ChannelBuf],
    out: &mut [u8],
    offset: usize,
    samples_to_do: usize,
    numchans: usize,
) {
    fn write_with<F: Fn(f32, &mut [u8])>(
        samples: &[ChannelBuf],
        out: &mut [u8],
        offset: usize,
        samples_to_do: usize,
        numchans: usize,
        size: usize,
        conv: F,
    ) {
        for (c, chan) in samples.iter().enumerate().take(numchans) {
            for (i, &s) in chan[..samples_to_do].iter().enumerate() {
                let byte = ((offset + i) * numchans + c) * size;
                conv(s, &mut out[byte..byte + size]);
            }
        }
    }

    match fmt {
        SampleFormat::F32 => write_with(samples, out, offset, samples_to_do, numchans, 4, |s, b| {
            b.copy_from_slice(&s.to_ne_bytes())
        }),
        SampleFormat::I32 => write_with(samples, out, offset, samples_to_do, numchans, 4, |s, b| {
            b.copy_from_slice(&conv_i32(s).to_ne_bytes())
        }),
        SampleFormat::U32 => write_with(samples, out, offset, samples_to_do, numchans, 4, |s, b| {
            b.copy_from_slice(&(conv_i32(s) as u32).wrapping_add(2147483648).to_ne_bytes())
        }),
        SampleFormat::I16 => write_with(samples, out, offset, samples_to_do, numchans, 2, |s, b| {
            b.copy_from_slice(&conv_i16(s).to_ne_bytes())
        }),
        SampleFormat::U16 => write_with(samples, out, offset, samples_to_do, numchans, 2, |s, b| {
            b.copy_from_slice(&((conv_i16(s) as i32 + 32768) as u16).to_ne_bytes())
        }),
        SampleFormat::I8 => write_with(samples, out, offset, samples_to_do, numchans, 1, |s, b| {
            b[0] = conv_i8(s) as u8
        }),
        SampleFormat::U8 => write_with(samples, out, offset, samples_to_do, numchans, 1, |s, b| {
            b[0] = (conv_i8(s) as i16 + 128) as u8
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DistChannel;
    use sf_core::BUFFER_SIZE;

    #[test]
    fn sample_conversions_match_reference_points() {
        assert_eq!(conv_i16(0.0), 0);
        assert_eq!(conv_i16(1.0), 32767);
        assert_eq!(conv_i16(-1.0), -32768);
        assert_eq!(conv_i8(1.0), 127);
        assert_eq!(conv_i8(-1.0), -128);
        // 24-bit range shifted left 7.
        assert_eq!(conv_i32(1.0), 16777215 << 7);
        assert_eq!(conv_i32(-1.0), -16777216 << 7);
        assert_eq!(conv_i32(0.5), 8388608 << 7);
    }

    #[test]
    fn float_write_is_exact_and_interleaved() {
        let mut samples = vec![[0.0f32; BUFFER_SIZE]; 2];
        samples[0][0] = 0.25;
        samples[1][0] = -0.5;
        samples[0][1] = 1.0;

        let mut out = vec![0u8; 4 * 2 * 4];
        write_interleaved(SampleFormat::F32, &samples, &mut out, 0, 4, 2);

        let read = |i: usize| f32::from_ne_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(read(0), 0.25);
        assert_eq!(read(1), -0.5);
        assert_eq!(read(2), 1.0);
        assert_eq!(read(3), 0.0);
    }

    #[test]
    fn write_offset_lands_later_in_buffer() {
        let mut samples = vec![[0.0f32; BUFFER_SIZE]; 1];
        samples[0][0] = 1.0;
        let mut out = vec![0u8; 8 * 2];
        write_interleaved(SampleFormat::I16, &samples, &mut out, 3, 1, 1);
        let v = i16::from_ne_bytes(out[6..8].try_into().unwrap());
        assert_eq!(v, 32767);
    }

    #[test]
    fn unsigned_formats_are_offset() {
        let mut samples = vec![[0.0f32; BUFFER_SIZE]; 1];
        samples[0][0] = 0.0;
        let mut out = vec![0u8; 4];
        write_interleaved(SampleFormat::U8, &samples, &mut out, 0, 1, 1);
        assert_eq!(out[0], 128);
        write_interleaved(SampleFormat::U16, &samples, &mut out, 0, 1, 1);
        assert_eq!(u16::from_ne_bytes(out[..2].try_into().unwrap()), 32768);
    }

    #[test]
    fn distance_comp_delays_and_scales() {
        let mut samples = vec![[0.0f32; BUFFER_SIZE]; 1];
        samples[0][0] = 1.0;
        let mut comp = DistanceComp {
            channels: vec![DistChannel {
                gain: 0.5,
                buffer: vec![0.0; 4],
            }],
        };
        let mut scratch = [0.0f32; BUFFER_SIZE];
        apply_distance_comp(&mut samples, &mut comp, &mut scratch, 16);

        assert_eq!(samples[0][0], 0.0);
        assert!((samples[0][4] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn distance_comp_handles_small_blocks() {
        // Block shorter than the delay: output comes entirely from the
        // FIFO and the FIFO rotates.
        let mut comp = DistanceComp {
            channels: vec![DistChannel {
                gain: 1.0,
                buffer: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            }],
        };
        let mut samples = vec![[9.0f32; BUFFER_SIZE]; 1];
        let mut scratch = [0.0f32; BUFFER_SIZE];
        apply_distance_comp(&mut samples, &mut comp, &mut scratch, 2);

        assert_eq!(&samples[0][..2], &[1.0, 2.0]);
        assert_eq!(&comp.channels[0].buffer[..], &[3.0, 4.0, 5.0, 6.0, 9.0, 9.0]);
    }

    #[test]
    fn dither_rng_matches_lcg_constants() {
        let mut seed = 22222u32;
        let a = dither_rng(&mut seed);
        assert_eq!(a, 22222u32.wrapping_mul(96314165).wrapping_add(907633515));
    }

    #[test]
    fn dither_quantizes_to_depth() {
        let mut samples = vec![[0.3f32; BUFFER_SIZE]; 1];
        let mut seed = 22222u32;
        apply_dither(&mut samples, &mut seed, 256.0, 64);
        for &s in &samples[0][..64] {
            let q = s * 256.0;
            assert!((q - q.round()).abs() < 1e-4, "not quantized: {s}");
        }
        assert_ne!(seed, 22222);
    }
}
