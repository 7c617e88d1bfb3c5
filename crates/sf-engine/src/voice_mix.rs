//! The per-voice inner mixing loop
//!
//! For each playing voice and block: read pitched samples per input
//! channel through the selected resampler, run the dual shelf filters,
//! and accumulate into the direct bus (through HRTF or gain vectors,
//! with near-field control on ambisonic targets) and each send's wet
//! buffer. Gains ramp linearly from current to target across the block.
//!
//! Returns whether the voice is still playing; a voice that exhausts its
//! queue (and is not looping) or was flagged stopping reports false and
//! the caller posts the stop event.

use sf_core::{ChannelBuf, Sample, BUFFER_SIZE, FRACTION_BITS, FRACTION_MASK, GAIN_SILENCE_THRESHOLD};
use sf_dsp::{mix_hrtf, mix_hrtf_blend, MAX_RESAMPLE_PADDING};

use crate::buffer::BufferQueue;
use crate::context::Context;
use crate::device::Device;
use crate::voice::{filter_flags, voice_flags, TargetBus, Voice};

const PAD: usize = MAX_RESAMPLE_PADDING;
/// Workable source frames per inner chunk, past the padding
const CHUNK_SRC: usize = BUFFER_SIZE;

/// Copy `dst.len()` frames of one channel starting at (`item`, `frame`),
/// following the queue and wrapping when looping; the tail is zeroed when
/// the queue ends first.
fn read_queue_samples(
    queue: &BufferQueue,
    looping: bool,
    mut item: usize,
    mut frame: usize,
    channel: usize,
    dst: &mut [Sample],
) {
    let mut written = 0;
    while written < dst.len() {
        if item >= queue.len() {
            if looping && queue.total_frames() > 0 {
                item = 0;
                frame = 0;
                continue;
            }
            break;
        }
        let buf = queue.entry(item);
        let got = buf.copy_channel(channel, frame, &mut dst[written..]);
        written += got;
        if written < dst.len() {
            item += 1;
            frame = 0;
        }
    }
    dst[written..].fill(0.0);
}

/// Accumulate `data` into a run of output channels with linearly ramped
/// gains. `counter` is the ramp length; remaining samples use the target.
fn mix_samples(
    data: &[Sample],
    out: &mut [ChannelBuf],
    current: &mut [f32],
    target: &[f32],
    counter: usize,
    dst_offset: usize,
    todo: usize,
) {
    for (c, chan) in out.iter_mut().enumerate() {
        let mut gain = current[c];
        let diff = target[c] - gain;
        let mut pos = 0;

        if diff.abs() > f32::EPSILON && counter > 0 {
            let step = diff / counter as f32;
            let ramp = counter.min(todo);
            for i in 0..ramp {
                gain += step;
                chan[dst_offset + i] += data[i] * gain;
            }
            if ramp == counter {
                gain = target[c];
            }
            current[c] = gain;
            pos = ramp;
        } else {
            gain = target[c];
            current[c] = gain;
        }

        if gain.abs() <= GAIN_SILENCE_THRESHOLD {
            continue;
        }
        for i in pos..todo {
            chan[dst_offset + i] += data[i] * gain;
        }
    }
}

/// Run the path's shelf filters as flagged, returning the buffer holding
/// the result.
fn do_filters<'a>(
    low_pass: &mut sf_dsp::BiquadFilter,
    high_pass: &mut sf_dsp::BiquadFilter,
    scratch: &'a mut [Sample],
    src: &'a [Sample],
    filter_type: u8,
) -> &'a [Sample] {
    let todo = src.len();
    match filter_type & (filter_flags::LOW_PASS | filter_flags::HIGH_PASS) {
        0 => {
            low_pass.passthru(todo);
            high_pass.passthru(todo);
            src
        }
        f if f == filter_flags::LOW_PASS => {
            high_pass.passthru(todo);
            low_pass.process(&mut scratch[..todo], src);
            &scratch[..todo]
        }
        f if f == filter_flags::HIGH_PASS => {
            low_pass.passthru(todo);
            high_pass.process(&mut scratch[..todo], src);
            &scratch[..todo]
        }
        _ => {
            // Both shelves, low then high, sample-wise into the scratch.
            for (d, &s) in scratch[..todo].iter_mut().zip(src) {
                *d = high_pass.process_sample(low_pass.process_sample(s));
            }
            &scratch[..todo]
        }
    }
}

/// Mix one voice into the device and send buses for this block.
pub(crate) fn mix_voice(
    voice: &Voice,
    _ctx: &Context,
    device: &mut Device,
    samples_to_do: usize,
) -> bool {
    let mix = unsafe { voice.mix_state() };
    let queue = match &mix.queue {
        Some(q) => q.clone(),
        None => return false,
    };
    let num_channels = mix.num_channels;
    if num_channels == 0 || mix.step < 1 || queue.total_frames() == 0 {
        return false;
    }
    let looping = mix.props.looping;
    if voice.take_stop_request() {
        mix.flags |= voice_flags::STOPPING;
    }
    let stopping = mix.flags & voice_flags::STOPPING != 0;

    if stopping {
        // Fade to silence over this block, then report stopped.
        for param in &mut mix.direct.params[..num_channels] {
            param.target_gains.fill(0.0);
            param.hrtf_target.gain = 0.0;
        }
        for send in mix.sends.iter_mut() {
            for param in &mut send.params[..num_channels] {
                param.target_gains.fill(0.0);
            }
        }
    }

    // After the first block, changes ramp current toward target across
    // the block; the first block jumps straight to the targets.
    let counter = if mix.flags & voice_flags::FADE != 0 {
        samples_to_do
    } else {
        for param in &mut mix.direct.params[..num_channels] {
            param.current_gains = param.target_gains;
            param.hrtf_current = param.hrtf_target;
        }
        for send in mix.sends.iter_mut() {
            for param in &mut send.params[..num_channels] {
                param.current_gains = param.target_gains;
            }
        }
        0
    };
    let mut still_playing = true;

    let mut src_data = [0.0f32; PAD * 2 + CHUNK_SRC];
    let mut resampled = [0.0f32; BUFFER_SIZE];
    let mut filtered = [0.0f32; BUFFER_SIZE];
    let mut nfc_scratch = [0.0f32; BUFFER_SIZE];

    let mut dst_done = 0usize;
    while dst_done < samples_to_do && still_playing {
        let frac = mix.position_frac;
        let step = mix.step;

        // Largest destination run whose source span fits the window.
        let max_dst = (((CHUNK_SRC as u64) << FRACTION_BITS).saturating_sub(frac as u64)
            / step as u64) as usize;
        let todo = max_dst.min(samples_to_do - dst_done).max(1).min(BUFFER_SIZE);
        let src_needed = (((todo as u64 * step as u64 + frac as u64) >> FRACTION_BITS) as usize + 1)
            .min(CHUNK_SRC);

        for c in 0..num_channels {
            // History taps, then fresh source data (zero tail past the
            // queue end).
            src_data[..PAD].copy_from_slice(&mix.prev_samples[c][..PAD]);
            read_queue_samples(
                &queue,
                looping,
                mix.queue_index,
                mix.position,
                c,
                &mut src_data[PAD..PAD + src_needed + PAD],
            );

            mix.resampler
                .resample(&src_data, PAD, frac, step, &mut resampled[..todo]);

            let direct = &mut mix.direct;
            let filter_type = direct.filter_type;
            let filter_param = &mut direct.params[c];
            let samples = do_filters(
                &mut filter_param.low_pass,
                &mut filter_param.high_pass,
                &mut filtered,
                &resampled[..todo],
                filter_type,
            );

            if mix.flags & voice_flags::HAS_HRTF != 0 {
                // HRTF only renders to the stereo real output.
                let span = device.real.span;
                let lidx = device
                    .real
                    .channel_index(sf_core::Channel::FrontLeft)
                    .unwrap_or(0);
                let ridx = device
                    .real
                    .channel_index(sf_core::Channel::FrontRight)
                    .unwrap_or(1);
                let bus = device.bus_mut(span);
                let (left, right) = two_channels(bus, lidx, ridx);
                let left = &mut left[dst_done..dst_done + todo];
                let right = &mut right[dst_done..dst_done + todo];

                let param = &mut direct.params[c];
                if !param.hrtf_current.same_filter(&param.hrtf_target) {
                    // The response changed; crossfade old out, new in.
                    let old = param.hrtf_current;
                    let target = param.hrtf_target;
                    mix_hrtf_blend(
                        left,
                        right,
                        samples,
                        &mut param.hrtf_state,
                        &old,
                        old.gain,
                        &target,
                    );
                    param.hrtf_current = param.hrtf_target;
                } else {
                    let gain = param.hrtf_current.gain;
                    let gain_step = if counter > 0 {
                        (param.hrtf_target.gain - gain) / counter as f32
                    } else {
                        0.0
                    };
                    let target = param.hrtf_target;
                    let final_gain = mix_hrtf(
                        left,
                        right,
                        samples,
                        &mut param.hrtf_state,
                        &target,
                        gain,
                        gain_step,
                    );
                    param.hrtf_current.gain = final_gain;
                }
            } else if mix.flags & voice_flags::HAS_NFC != 0
                && direct.target != TargetBus::Real
            {
                // Ambisonic target: run near-field control per order
                // band before accumulation.
                let span = match direct.target {
                    TargetBus::Dry => device.dry.span,
                    TargetBus::Foa => device.foa.span,
                    TargetBus::Real => device.real.span,
                };
                let param = &mut direct.params[c];
                let orders = direct.channels_per_order;
                let bus = device.bus_mut(span);

                let mut chan_offset = 0usize;
                let first_order_len = orders[0].min(bus.len());
                mix_samples(
                    samples,
                    &mut bus[..first_order_len],
                    &mut param.current_gains[..orders[0]],
                    &param.target_gains[..orders[0]],
                    counter,
                    dst_done,
                    todo,
                );
                chan_offset += orders[0];
                for order in 1..=sf_core::MAX_AMBI_ORDER {
                    let count = orders[order];
                    if count < 1 || chan_offset + count > bus.len() {
                        break;
                    }
                    param
                        .nfc
                        .process_order(order, &mut nfc_scratch[..todo], samples);
                    mix_samples(
                        &nfc_scratch[..todo],
                        &mut bus[chan_offset..chan_offset + count],
                        &mut param.current_gains[chan_offset..chan_offset + count],
                        &param.target_gains[chan_offset..chan_offset + count],
                        counter,
                        dst_done,
                        todo,
                    );
                    chan_offset += count;
                }
            } else {
                let span = match direct.target {
                    TargetBus::Dry => device.dry.span,
                    TargetBus::Foa => device.foa.span,
                    TargetBus::Real => device.real.span,
                };
                let param = &mut direct.params[c];
                let bus = device.bus_mut(span);
                let n = bus.len();
                mix_samples(
                    samples,
                    bus,
                    &mut param.current_gains[..n],
                    &param.target_gains[..n],
                    counter,
                    dst_done,
                    todo,
                );
            }

            // Auxiliary sends into each slot's wet buffer.
            for send in mix.sends.iter_mut() {
                let slot = match &send.slot {
                    Some(s) => s.clone(),
                    None => continue,
                };
                let param = &mut send.params[c];
                let samples = do_filters(
                    &mut param.low_pass,
                    &mut param.high_pass,
                    &mut nfc_scratch,
                    &resampled[..todo],
                    send.filter_type,
                );
                let wet = unsafe { slot.mix_state() };
                let n = wet.wet_buffer.len();
                mix_samples(
                    samples,
                    &mut wet.wet_buffer[..],
                    &mut param.current_gains[..n],
                    &param.target_gains[..n],
                    counter,
                    dst_done,
                    todo,
                );
            }
        }

        // Advance the fixed-point position and refresh the history taps.
        let adv_frac = mix.position_frac as u64 + todo as u64 * step as u64;
        let advance = (adv_frac >> FRACTION_BITS) as usize;
        mix.position_frac = (adv_frac as u32) & FRACTION_MASK;

        if advance > 0 {
            for c in 0..num_channels {
                // src_data still holds this channel only for the last
                // channel processed; reread the history window instead.
                let mut hist = [0.0f32; PAD];
                let start = mix.position + advance;
                if start >= PAD {
                    read_queue_samples(
                        &queue,
                        looping,
                        mix.queue_index,
                        start - PAD,
                        c,
                        &mut hist,
                    );
                } else {
                    // The window still reaches into the old history.
                    let keep = PAD - start;
                    let prev = mix.prev_samples[c];
                    hist[..keep].copy_from_slice(&prev[advance..advance + keep]);
                    read_queue_samples(&queue, looping, mix.queue_index, 0, c, &mut hist[keep..]);
                }
                mix.prev_samples[c][..PAD].copy_from_slice(&hist);
            }

            mix.position += advance;
            // Move through the queue, wrapping when looping.
            loop {
                let frames = queue.entry(mix.queue_index).frames();
                if mix.position < frames {
                    break;
                }
                mix.position -= frames;
                mix.queue_index += 1;
                if mix.queue_index >= queue.len() {
                    if looping {
                        mix.queue_index = 0;
                    } else {
                        still_playing = false;
                        break;
                    }
                }
            }
        }

        dst_done += todo;
    }

    // The block's ramp completed: lock in the targets and ramp future
    // changes.
    for param in &mut mix.direct.params[..num_channels] {
        param.current_gains = param.target_gains;
        param.hrtf_current.gain = param.hrtf_target.gain;
    }
    for send in mix.sends.iter_mut() {
        for param in &mut send.params[..num_channels] {
            param.current_gains = param.target_gains;
        }
    }
    mix.flags |= voice_flags::FADE;

    still_playing && !stopping
}

/// Two distinct mutable channels of a bus
fn two_channels(bus: &mut [ChannelBuf], a: usize, b: usize) -> (&mut ChannelBuf, &mut ChannelBuf) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = bus.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = bus.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_samples_ramps_to_target() {
        let data = [1.0f32; 64];
        let mut out = vec![[0.0f32; BUFFER_SIZE]; 1];
        let mut current = [0.0f32; 1];
        let target = [1.0f32; 1];
        mix_samples(&data, &mut out, &mut current, &target, 64, 0, 64);

        // Linear ramp: first sample carries one step of gain, the last
        // the full target.
        assert!((out[0][0] - 1.0 / 64.0).abs() < 1e-5);
        assert!((out[0][63] - 1.0).abs() < 1e-5);
        assert_eq!(current[0], 1.0);
    }

    #[test]
    fn mix_samples_skips_silent_channels() {
        let data = [1.0f32; 16];
        let mut out = vec![[0.0f32; BUFFER_SIZE]; 1];
        let mut current = [0.0f32; 1];
        let target = [0.0f32; 1];
        mix_samples(&data, &mut out, &mut current, &target, 0, 0, 16);
        assert!(out[0][..16].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn read_queue_wraps_when_looping() {
        use crate::buffer::AudioBuffer;
        use std::sync::Arc;

        let q = BufferQueue::single(Arc::new(AudioBuffer::mono(44100, vec![1.0, 2.0, 3.0])));
        let mut dst = [0.0f32; 7];
        read_queue_samples(&q, true, 0, 1, 0, &mut dst);
        assert_eq!(dst, [2.0, 3.0, 1.0, 2.0, 3.0, 1.0, 2.0]);

        let mut dst = [0.0f32; 5];
        read_queue_samples(&q, false, 0, 1, 0, &mut dst);
        assert_eq!(dst, [2.0, 3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn two_channels_split() {
        let mut bus = vec![[0.0f32; BUFFER_SIZE]; 3];
        bus[0][0] = 1.0;
        bus[2][0] = 2.0;
        let (a, b) = two_channels(&mut bus, 0, 2);
        assert_eq!(a[0], 1.0);
        assert_eq!(b[0], 2.0);
        let (a, b) = two_channels(&mut bus, 2, 0);
        assert_eq!(a[0], 2.0);
        assert_eq!(b[0], 1.0);
    }
}
