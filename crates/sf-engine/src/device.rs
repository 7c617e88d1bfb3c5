//! Audio output devices: buses, post-process resources, and the state
//! shared with control threads
//!
//! A device owns one flat array of channel block buffers carved into
//! three logical buses: the dry (ambisonic or speaker-feed) bus, the
//! first-order bus B-Format sources and the up-sampler use, and the real
//! output bus. Buses may alias the same storage; spans record the
//! carving. Renderer initialization decides the layout and the
//! post-process chain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sf_core::{
    BfChannelConfig, Channel, ChannelBuf, ChannelLayout, DeviceConfig, RenderMode, SampleFormat,
    SfError, SfResult, BUFFER_SIZE, MAX_AMBI_COEFFS, MAX_AMBI_ORDER, MAX_OUTPUT_CHANNELS,
    MAX_SENDS,
};
use sf_dsp::{
    AmbiUpsampler, BFormatDec, CrossfeedFilter, DirectHrtfMixer, FrontStablizer, HrtfStore,
    Limiter, Uhj2Encoder,
};

use crate::context::{Context, DEFAULT_EVENT_CAPACITY, DEFAULT_VOICE_COUNT};
use crate::events::{event_type, AsyncEvent, SourceState};

/// A contiguous range of the device's mix buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusSpan {
    pub offset: usize,
    pub len: usize,
}

impl BusSpan {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

/// An ambisonic bus: its storage span plus the component binding of each
/// channel
pub(crate) struct AmbiBus {
    pub span: BusSpan,
    pub map: [BfChannelConfig; MAX_AMBI_COEFFS],
    pub channels: usize,
}

impl Default for AmbiBus {
    fn default() -> Self {
        Self {
            span: BusSpan::default(),
            map: [BfChannelConfig::default(); MAX_AMBI_COEFFS],
            channels: 0,
        }
    }
}

/// The real output bus with its channel names
#[derive(Default)]
pub(crate) struct RealBus {
    pub span: BusSpan,
    pub channels: Vec<Channel>,
}

impl RealBus {
    pub fn channel_index(&self, chan: Channel) -> Option<usize> {
        self.channels.iter().position(|&c| c == chan)
    }
}

/// Post-process stage selected at device configuration
pub(crate) enum PostProcess {
    Hrtf {
        mixer: DirectHrtfMixer,
        upsampler: Option<AmbiUpsampler>,
    },
    AmbiDec {
        decoder: BFormatDec,
    },
    AmbiUp {
        upsampler: AmbiUpsampler,
    },
    Uhj {
        encoder: Box<Uhj2Encoder>,
    },
    Bs2b {
        filter: CrossfeedFilter,
    },
    None,
}

/// Per-channel delay/gain compensation for mismatched speaker distances
pub(crate) struct DistanceComp {
    pub channels: Vec<DistChannel>,
}

pub(crate) struct DistChannel {
    pub gain: f32,
    pub buffer: Vec<f32>,
}

/// State shared between the mixer and control threads
pub struct DeviceShared {
    pub(crate) connected: AtomicBool,
    /// Low bit set while a mix is in progress
    pub(crate) mix_count: AtomicU64,
    /// Device clock in nanoseconds, published each block
    pub(crate) clock_ns: AtomicU64,
    pub(crate) contexts: RwLock<Vec<Arc<Context>>>,
}

impl DeviceShared {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mix_count(&self) -> u64 {
        self.mix_count.load(Ordering::Acquire)
    }

    /// Read the device clock consistently against a running mixer: retry
    /// while the mix counter is odd or moved.
    pub fn read_clock_ns(&self) -> u64 {
        loop {
            let before = self.mix_count.load(Ordering::Acquire);
            if before & 1 == 0 {
                let clock = self.clock_ns.load(Ordering::Acquire);
                if self.mix_count.load(Ordering::Acquire) == before {
                    return clock;
                }
            }
            std::hint::spin_loop();
        }
    }
}

/// Process-wide audio output endpoint
pub struct Device {
    pub(crate) name: String,
    pub(crate) frequency: u32,
    pub(crate) layout: ChannelLayout,
    pub(crate) fmt: SampleFormat,
    pub(crate) update_size: usize,
    pub(crate) num_updates: usize,
    pub(crate) num_aux_sends: usize,
    pub(crate) config: DeviceConfig,

    pub(crate) render_mode: RenderMode,
    pub(crate) mix_buffer: Vec<ChannelBuf>,
    pub(crate) dry: AmbiBus,
    pub(crate) foa: AmbiBus,
    pub(crate) real: RealBus,
    pub(crate) avg_speaker_dist: f32,
    pub(crate) channels_per_order: [usize; MAX_AMBI_ORDER + 1],

    pub(crate) post: PostProcess,
    pub(crate) stablizer: Option<FrontStablizer>,
    pub(crate) limiter: Option<Limiter>,
    pub(crate) distance_comp: Option<DistanceComp>,
    pub(crate) dither_depth: f32,
    pub(crate) dither_seed: u32,
    pub(crate) temp_buffer: Box<ChannelBuf>,
    pub(crate) hrtf: Option<Arc<HrtfStore>>,

    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) samples_done: u32,
    pub(crate) clock_base_ns: u64,
}

impl Device {
    /// Open a device. `hrtf` supplies the loaded HRTF data set when one
    /// is available for selection.
    pub fn new(
        name: &str,
        frequency: u32,
        layout: ChannelLayout,
        fmt: SampleFormat,
        config: DeviceConfig,
        hrtf: Option<Arc<HrtfStore>>,
    ) -> SfResult<Self> {
        if name.is_empty() {
            return Err(SfError::InvalidDeviceName(name.into()));
        }
        if frequency == 0 {
            return Err(SfError::UnsupportedFormat("zero sample rate".into()));
        }
        if layout.count() > MAX_OUTPUT_CHANNELS {
            return Err(SfError::UnsupportedFormat(format!(
                "{} output channels (max {})",
                layout.count(),
                MAX_OUTPUT_CHANNELS
            )));
        }

        let mut device = Self {
            name: name.to_string(),
            frequency,
            layout,
            fmt,
            update_size: 1024,
            num_updates: 3,
            num_aux_sends: 2.min(MAX_SENDS),
            config,
            render_mode: RenderMode::Normal,
            mix_buffer: Vec::new(),
            dry: AmbiBus::default(),
            foa: AmbiBus::default(),
            real: RealBus::default(),
            avg_speaker_dist: 0.0,
            channels_per_order: [0; MAX_AMBI_ORDER + 1],
            post: PostProcess::None,
            stablizer: None,
            limiter: None,
            distance_comp: None,
            dither_depth: 0.0,
            dither_seed: 22222,
            temp_buffer: Box::new([0.0; BUFFER_SIZE]),
            hrtf,
            shared: Arc::new(DeviceShared {
                connected: AtomicBool::new(true),
                mix_count: AtomicU64::new(0),
                clock_ns: AtomicU64::new(0),
                contexts: RwLock::new(Vec::new()),
            }),
            samples_done: 0,
            clock_base_ns: 0,
        };

        crate::renderer::init_renderer(&mut device)?;
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.fmt
    }

    pub fn num_aux_sends(&self) -> usize {
        self.num_aux_sends
    }

    /// Frames per backend update
    pub fn update_size(&self) -> usize {
        self.update_size
    }

    /// Update blocks the backend keeps in flight
    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    /// Bytes per interleaved output frame
    pub fn frame_size(&self) -> usize {
        self.layout.count() * self.fmt.bytes_per_sample()
    }

    /// Handle shared with control threads
    pub fn shared(&self) -> Arc<DeviceShared> {
        self.shared.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Create a context bound to this device
    pub fn create_context(&self) -> Arc<Context> {
        let ctx = Context::new(self.num_aux_sends, DEFAULT_VOICE_COUNT, DEFAULT_EVENT_CAPACITY);
        self.shared.contexts.write().push(ctx.clone());
        ctx
    }

    pub fn remove_context(&self, ctx: &Arc<Context>) {
        self.shared.contexts.write().retain(|c| !Arc::ptr_eq(c, ctx));
    }

    /// Mutable view of one bus's channel buffers
    pub(crate) fn bus_mut(&mut self, span: BusSpan) -> &mut [ChannelBuf] {
        &mut self.mix_buffer[span.offset..span.offset + span.len]
    }

    pub(crate) fn bus(&self, span: BusSpan) -> &[ChannelBuf] {
        &self.mix_buffer[span.offset..span.offset + span.len]
    }

    /// Fatal backend I/O failure: flip the connected flag exactly once,
    /// notify contexts, and stop every playing voice.
    pub fn handle_disconnect(&mut self, msg: &str) {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        log::warn!("Device \"{}\" disconnected: {}", self.name, msg);

        let mut truncated = msg.to_string();
        truncated.truncate(crate::events::EVENT_MSG_MAX);

        let shared = self.shared.clone();
        let contexts = shared.contexts.read();
        for ctx in contexts.iter() {
            let enabled = ctx.enabled_events.load(Ordering::Acquire);
            if enabled & event_type::DISCONNECTED != 0 {
                // Best effort; the connected flag already flipped.
                ctx.post_event(AsyncEvent::Disconnected {
                    msg: truncated.clone(),
                });
            }

            for voice in ctx.voices.iter() {
                if !voice.is_playing() {
                    continue;
                }
                let sid = voice.source_id();
                if sid == 0 {
                    continue;
                }
                voice.finish();
                if enabled & event_type::SOURCE_STATE_CHANGE != 0 {
                    ctx.post_event(AsyncEvent::SourceStateChange {
                        id: sid,
                        state: SourceState::Stopped,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(layout: ChannelLayout) -> Device {
        Device::new("test", 48000, layout, SampleFormat::F32, DeviceConfig::default(), None)
            .unwrap()
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(Device::new(
            "",
            48000,
            ChannelLayout::Stereo,
            SampleFormat::F32,
            DeviceConfig::default(),
            None
        )
        .is_err());
        assert!(Device::new(
            "x",
            0,
            ChannelLayout::Stereo,
            SampleFormat::F32,
            DeviceConfig::default(),
            None
        )
        .is_err());
    }

    #[test]
    fn frame_size_accounts_for_format() {
        assert_eq!(device(ChannelLayout::Stereo).frame_size(), 8);
        let d = Device::new(
            "t",
            48000,
            ChannelLayout::X51,
            SampleFormat::I16,
            DeviceConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(d.frame_size(), 12);
    }

    #[test]
    fn disconnect_is_idempotent_and_stops_voices() {
        let mut dev = device(ChannelLayout::Stereo);
        let ctx = dev.create_context();
        ctx.enable_events(event_type::SOURCE_STATE_CHANGE | event_type::DISCONNECTED);

        let buf = Arc::new(crate::buffer::AudioBuffer::mono(48000, vec![0.0; 8]));
        ctx.play(
            5,
            Arc::new(crate::buffer::BufferQueue::single(buf)),
            crate::voice::VoiceProps::default(),
        )
        .unwrap();

        dev.handle_disconnect("backend failure");
        assert!(!dev.is_connected());
        assert!(!ctx.is_source_playing(5));

        // One disconnect event plus one stop event; a second call adds
        // nothing.
        dev.handle_disconnect("again");
        let mut disconnected = 0;
        let mut stopped = 0;
        while let Some(evt) = ctx.try_event() {
            match evt {
                AsyncEvent::Disconnected { .. } => disconnected += 1,
                AsyncEvent::SourceStateChange { .. } => stopped += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(disconnected, 1);
        assert_eq!(stopped, 1);
    }

    #[test]
    fn clock_reader_sees_even_counts() {
        let dev = device(ChannelLayout::Stereo);
        assert_eq!(dev.shared.read_clock_ns(), 0);
        assert_eq!(dev.shared.mix_count() & 1, 0);
    }
}
