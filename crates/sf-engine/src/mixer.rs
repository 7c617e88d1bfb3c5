//! The device mixing cycle
//!
//! One `mix` call produces the requested frames in blocks of at most
//! `BUFFER_SIZE`: apply pending parameter updates, mix every playing
//! voice into the dry and wet buses, run the effect chain in dependency
//! order, post-process into the real output channels, condition, and
//! convert into the caller's buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sf_core::{Channel, BUFFER_SIZE};

use crate::context::Context;
use crate::device::{Device, PostProcess};
use crate::events::{event_type, AsyncEvent, SourceState};
use crate::panning::{calc_source_params, OVERRIDE_REVERB_SPEED_OF_SOUND};
use crate::props::consume_update;
use crate::slot::{EffectProps, EffectSlot, EffectTarget, in_target_chain};
use crate::voice_mix::mix_voice;

/// Split two non-overlapping bus spans out of the mix buffers
fn split_buses(
    buf: &mut [sf_core::ChannelBuf],
    a: crate::device::BusSpan,
    b: crate::device::BusSpan,
) -> (&mut [sf_core::ChannelBuf], &mut [sf_core::ChannelBuf]) {
    debug_assert!(a.offset + a.len <= b.offset || b.offset + b.len <= a.offset);
    if a.offset < b.offset {
        let (lo, hi) = buf.split_at_mut(b.offset);
        (&mut lo[a.offset..a.offset + a.len], &mut hi[..b.len])
    } else {
        let (lo, hi) = buf.split_at_mut(a.offset);
        let b_slice = &mut lo[b.offset..b.offset + b.len];
        (&mut hi[..a.len], b_slice)
    }
}

/// Apply a pending effect-slot update and re-run the state's `update`.
/// Returns true when anything changed.
fn calc_effect_slot_params(slot: &Arc<EffectSlot>, ctx: &Context, device: &Device, force: bool) -> bool {
    let smix = unsafe { slot.mix_state() };

    let had_update = match slot.update.take() {
        Some(mut boxed) => {
            let props = &mut boxed.data;
            smix.params.gain = props.gain;
            smix.params.aux_send_auto = props.aux_send_auto;
            // A slot may not feed itself; longer cycles are rejected by
            // the control-side validation.
            smix.params.target = props.target.take().filter(|t| !Arc::ptr_eq(t, slot));
            smix.params.effect_type = props.effect_type;
            smix.params.props = props.props;
            match props.props {
                EffectProps::Reverb(r) => {
                    smix.params.room_rolloff = r.room_rolloff_factor;
                    smix.params.decay_time = r.decay_time;
                    smix.params.decay_lf_ratio = r.decay_lf_ratio;
                    smix.params.decay_hf_ratio = r.decay_hf_ratio;
                    smix.params.decay_hf_limit = r.decay_hf_limit;
                    smix.params.air_absorption_gain_hf = r.air_absorption_gain_hf;
                }
                EffectProps::None => {
                    smix.params.room_rolloff = 0.0;
                    smix.params.decay_time = 0.0;
                    smix.params.decay_lf_ratio = 0.0;
                    smix.params.decay_hf_ratio = 0.0;
                    smix.params.decay_hf_limit = false;
                    smix.params.air_absorption_gain_hf = 1.0;
                }
            }

            if let Some(new_state) = props.state.take() {
                let old_state = std::mem::replace(&mut smix.state, new_state);
                // The swapped-out state must not be dropped here. Ship it
                // to the control thread; if the ring is full, stash it in
                // the props box to be reclaimed on recycling.
                if let Err(AsyncEvent::ReleaseEffectState(reclaimed)) =
                    ctx.try_post_event(AsyncEvent::ReleaseEffectState(old_state))
                {
                    props.state = Some(reclaimed);
                }
            }

            ctx.free_slot_props.push(boxed);
            true
        }
        None => false,
    };

    if !had_update && !force {
        return false;
    }

    let slot_map = EffectSlot::chan_map();
    let target = match &smix.params.target {
        Some(_) => EffectTarget {
            out_map: &slot_map,
            out_channels: slot_map.len(),
        },
        None => EffectTarget {
            out_map: &device.dry.map,
            out_channels: device.dry.channels,
        },
    };
    smix.state.update(&smix.params, &target);
    true
}

/// Propagate pending updates for everything in the context
fn process_param_updates(ctx: &Context, device: &Device) {
    ctx.update_count.fetch_add(1, Ordering::AcqRel);
    if !ctx.hold_updates.load(Ordering::Acquire) {
        let mix = unsafe { ctx.mix_state() };

        let cforce = consume_update(&ctx.update, &ctx.free_context_props, &mut mix.ctx_props);
        if cforce {
            let props = mix.ctx_props.clone();
            mix.listener
                .apply_context(&props, *OVERRIDE_REVERB_SPEED_OF_SOUND);
        }
        let lforce = consume_update(
            &ctx.listener_update,
            &ctx.free_listener_props,
            &mut mix.listener_props,
        );
        if lforce {
            let props = mix.listener_props.clone();
            mix.listener.apply_listener(&props);
        }

        let mut force = cforce || lforce;
        {
            let slots = ctx.slots.read();
            for slot in slots.iter() {
                force |= calc_effect_slot_params(slot, ctx, device, cforce);
            }
        }

        for voice in ctx.voices.iter() {
            if voice.source_id() != 0 {
                calc_source_params(voice, ctx, device, force);
            }
        }
    }
    ctx.update_count.fetch_add(1, Ordering::AcqRel);
}

/// Mix one context's voices and run its effect chain
fn process_context(ctx: &Context, device: &mut Device, samples_to_do: usize) {
    process_param_updates(ctx, device);

    // Clear the slots' wet mixing buffers.
    {
        let slots = ctx.slots.read();
        for slot in slots.iter() {
            let smix = unsafe { slot.mix_state() };
            for chan in smix.wet_buffer.iter_mut() {
                chan[..samples_to_do].fill(0.0);
            }
        }
    }

    // Mix voices that have a playing source.
    for voice in ctx.voices.iter() {
        if !voice.is_playing() {
            continue;
        }
        let sid = voice.source_id();
        if sid == 0 || unsafe { voice.mix_state() }.step < 1 {
            continue;
        }

        if !mix_voice(voice, ctx, device, samples_to_do) {
            voice.finish();
            if ctx.enabled_events.load(Ordering::Acquire) & event_type::SOURCE_STATE_CHANGE != 0 {
                // Dropped silently when the ring is full.
                ctx.post_event(AsyncEvent::SourceStateChange {
                    id: sid,
                    state: SourceState::Stopped,
                });
            }
        }
    }

    // Order the effect slots so producers run before their targets.
    let cmix = unsafe { ctx.mix_state() };
    cmix.slot_scratch.clear();
    {
        let slots = ctx.slots.read();
        if slots.is_empty() {
            return;
        }
        cmix.slot_scratch.reserve(slots.len());
        for slot in slots.iter() {
            let pos = cmix
                .slot_scratch
                .iter()
                .position(|placed| in_target_chain(slot, placed))
                .unwrap_or(cmix.slot_scratch.len());
            cmix.slot_scratch.insert(pos, slot.clone());
        }
    }

    for slot in cmix.slot_scratch.iter() {
        let smix = unsafe { slot.mix_state() };
        let crate::slot::SlotMix {
            params,
            state,
            wet_buffer,
        } = smix;
        match &params.target {
            Some(target_slot) => {
                // Chained slot: render into the target's wet input.
                let tmix = unsafe { target_slot.mix_state() };
                state.process(samples_to_do, &wet_buffer[..], &mut tmix.wet_buffer[..]);
            }
            None => {
                let out = device.bus_mut(device.dry.span);
                state.process(samples_to_do, &wet_buffer[..], out);
            }
        }
    }
}

impl Device {
    /// Write exactly `num_frames` interleaved frames of the device format
    /// into `out`, mixing as needed. Returns the frames actually written;
    /// fewer only after a disconnect (the caller zero-fills the rest).
    pub fn mix(&mut self, out: &mut [u8], num_frames: usize) -> usize {
        assert!(out.len() >= num_frames * self.frame_size());

        let mut frames_done = 0usize;
        while frames_done < num_frames {
            if !self.shared.is_connected() {
                break;
            }
            let samples_to_do = (num_frames - frames_done).min(BUFFER_SIZE);

            // Clear the main mixing buffers.
            for buffer in self.mix_buffer.iter_mut() {
                buffer[..samples_to_do].fill(0.0);
            }

            // Increment the mix count at the start (lsb becomes 1).
            self.shared.mix_count.fetch_add(1, Ordering::AcqRel);

            let shared = self.shared.clone();
            {
                let contexts = shared.contexts.read();
                for ctx in contexts.iter() {
                    process_context(ctx, self, samples_to_do);
                }
            }

            // Advance the clock; whole seconds move into the base so the
            // conversion stays exact for long runs.
            self.samples_done += samples_to_do as u32;
            self.clock_base_ns +=
                (self.samples_done / self.frequency) as u64 * 1_000_000_000;
            self.samples_done %= self.frequency;
            let clock = self.clock_base_ns
                + self.samples_done as u64 * 1_000_000_000 / self.frequency as u64;
            self.shared.clock_ns.store(clock, Ordering::Release);

            // Increment the mix count at the end (lsb becomes 0).
            self.shared.mix_count.fetch_add(1, Ordering::AcqRel);

            self.run_post_process(samples_to_do);
            self.run_conditioning(samples_to_do);

            let real_span = self.real.span;
            let numchans = real_span.len;
            let fmt = self.fmt;
            crate::output::write_interleaved(
                fmt,
                self.bus(real_span),
                out,
                frames_done,
                samples_to_do,
                numchans,
            );

            frames_done += samples_to_do;
        }
        frames_done
    }

    /// Finalize the dry mix into the real output channels
    fn run_post_process(&mut self, samples_to_do: usize) {
        let mut post = std::mem::replace(&mut self.post, PostProcess::None);
        match &mut post {
            PostProcess::Hrtf { mixer, upsampler } => {
                if let Some(up) = upsampler {
                    // First-order content expands into the dry stream the
                    // direct mixer consumes.
                    let (dry, foa) = split_buses(&mut self.mix_buffer, self.dry.span, self.foa.span);
                    up.process(dry, foa, samples_to_do);
                }
                let lidx = self.real.channel_index(Channel::FrontLeft).unwrap_or(0);
                let ridx = self.real.channel_index(Channel::FrontRight).unwrap_or(1);
                let (dry, real) = split_buses(&mut self.mix_buffer, self.dry.span, self.real.span);
                let (left, right) = if lidx < ridx {
                    let (lo, hi) = real.split_at_mut(ridx);
                    (&mut lo[lidx], &mut hi[0])
                } else {
                    let (lo, hi) = real.split_at_mut(lidx);
                    (&mut hi[0], &mut lo[ridx])
                };
                mixer.process(left, right, dry, samples_to_do);
            }
            PostProcess::AmbiDec { decoder } => {
                if self.dry.span != self.foa.span {
                    let (foa, dry) = split_buses(&mut self.mix_buffer, self.foa.span, self.dry.span);
                    decoder.up_sample(dry, foa, self.foa.channels, samples_to_do);
                }
                let (dry, real) = split_buses(&mut self.mix_buffer, self.dry.span, self.real.span);
                decoder.process(real, dry, samples_to_do);
            }
            PostProcess::AmbiUp { upsampler } => {
                // First-order content rises into the (aliased) dry/real
                // higher-order stream.
                let (dry, foa) = split_buses(&mut self.mix_buffer, self.dry.span, self.foa.span);
                upsampler.process(dry, foa, samples_to_do);
            }
            PostProcess::Uhj { encoder } => {
                let lidx = self.real.channel_index(Channel::FrontLeft).unwrap_or(0);
                let ridx = self.real.channel_index(Channel::FrontRight).unwrap_or(1);
                let (dry, real) = split_buses(&mut self.mix_buffer, self.dry.span, self.real.span);
                let (lo, hi) = real.split_at_mut(ridx.max(lidx));
                let (left, right) = if lidx < ridx {
                    (&mut lo[lidx], &mut hi[0])
                } else {
                    (&mut hi[0], &mut lo[ridx])
                };
                encoder.encode(left, right, dry, samples_to_do);
            }
            PostProcess::Bs2b { filter } => {
                let lidx = self.real.channel_index(Channel::FrontLeft).unwrap_or(0);
                let ridx = self.real.channel_index(Channel::FrontRight).unwrap_or(1);
                let real = self.bus_mut(self.real.span);
                let (lo, hi) = real.split_at_mut(ridx.max(lidx));
                let (left, right) = if lidx < ridx {
                    (&mut lo[lidx], &mut hi[0])
                } else {
                    (&mut hi[0], &mut lo[ridx])
                };
                filter.process(&mut left[..samples_to_do], &mut right[..samples_to_do]);
            }
            PostProcess::None => {}
        }
        self.post = post;
    }

    /// Stabilize, limit, distance-compensate, and dither the real output
    fn run_conditioning(&mut self, samples_to_do: usize) {
        if let Some(mut stablizer) = self.stablizer.take() {
            let lidx = self.real.channel_index(Channel::FrontLeft);
            let ridx = self.real.channel_index(Channel::FrontRight);
            let cidx = self.real.channel_index(Channel::FrontCenter);
            if let (Some(l), Some(r), Some(c)) = (lidx, ridx, cidx) {
                let real = self.bus_mut(self.real.span);
                stablizer.process(real, l, r, c, samples_to_do);
            }
            self.stablizer = Some(stablizer);
        }

        if let Some(mut limiter) = self.limiter.take() {
            let real_span = self.real.span;
            limiter.process(self.bus_mut(real_span), samples_to_do);
            self.limiter = Some(limiter);
        }

        if let Some(mut comp) = self.distance_comp.take() {
            let real_span = self.real.span;
            let mut scratch = std::mem::replace(&mut self.temp_buffer, Box::new([0.0; BUFFER_SIZE]));
            crate::output::apply_distance_comp(
                self.bus_mut(real_span),
                &mut comp,
                &mut scratch[..],
                samples_to_do,
            );
            self.temp_buffer = scratch;
            self.distance_comp = Some(comp);
        }

        if self.dither_depth > 0.0 {
            let real_span = self.real.span;
            let depth = self.dither_depth;
            let mut seed = self.dither_seed;
            crate::output::apply_dither(self.bus_mut(real_span), &mut seed, depth, samples_to_do);
            self.dither_seed = seed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{EffectSlotProps, EffectType, PassthroughEffect};
    use sf_core::{ChannelLayout, DeviceConfig, SampleFormat};

    fn stereo_device() -> Device {
        Device::new(
            "mixer-test",
            48000,
            ChannelLayout::Stereo,
            SampleFormat::F32,
            DeviceConfig::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn mix_counter_parity() {
        let mut dev = stereo_device();
        let shared = dev.shared();
        let mut out = vec![0u8; 256 * dev.frame_size()];
        dev.mix(&mut out, 256);
        // Two increments per block: even afterward.
        assert_eq!(shared.mix_count() & 1, 0);
        assert_eq!(shared.mix_count(), 2);
    }

    #[test]
    fn mix_clock_advances() {
        let mut dev = stereo_device();
        let shared = dev.shared();
        let mut out = vec![0u8; 48000 * dev.frame_size()];
        dev.mix(&mut out, 48000);
        assert_eq!(shared.read_clock_ns(), 1_000_000_000);
    }

    #[test]
    fn disconnected_device_stops_mixing() {
        let mut dev = stereo_device();
        dev.handle_disconnect("gone");
        let mut out = vec![0u8; 64 * dev.frame_size()];
        assert_eq!(dev.mix(&mut out, 64), 0);
    }

    #[test]
    fn slot_ordering_runs_producers_first() {
        let dev = stereo_device();
        let ctx = dev.create_context();

        // c -> b -> a (a terminates at the main bus). Insert in an order
        // that forces re-sorting.
        let a = ctx.add_slot();
        let b = ctx.add_slot();
        let c = ctx.add_slot();
        for (slot, target) in [(&a, None), (&b, Some(a.clone())), (&c, Some(b.clone()))] {
            ctx.update_slot(
                slot,
                EffectSlotProps {
                    gain: 1.0,
                    aux_send_auto: true,
                    target,
                    effect_type: EffectType::Passthrough,
                    props: EffectProps::None,
                    state: Some(PassthroughEffect::new()),
                },
            );
        }

        let mut dev = dev;
        let mut out = vec![0u8; 64 * dev.frame_size()];
        dev.mix(&mut out, 64);

        let order = &unsafe { ctx.mix_state() }.slot_scratch;
        let pos_of = |s: &Arc<EffectSlot>| order.iter().position(|x| Arc::ptr_eq(x, s)).unwrap();
        assert!(pos_of(&c) < pos_of(&b));
        assert!(pos_of(&b) < pos_of(&a));
    }
}
