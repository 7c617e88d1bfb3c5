//! sf-engine: device, context, and voice orchestration for Soundfield
//!
//! The mixing pipeline, pull-driven by a backend thread:
//! - `props` - lock-free single-slot parameter mailboxes and free stacks
//! - `events` - SPSC async-event ring plus its counting semaphore
//! - `buffer` - source sample buffers and per-voice queues
//! - `listener` / `context` - the scene: listener, voices, effect slots
//! - `voice` / `panning` / `voice_mix` - per-source gain computation and
//!   the resample/filter/accumulate inner loop
//! - `slot` - effect slots, the effect-state contract, graph chaining
//! - `device` / `renderer` / `mixer` / `output` - bus carving, panning
//!   and HRTF setup, the block cycle, and output conditioning
//! - `backend` - wave-file and null mix-thread owners
//!
//! Control threads talk to a running mixer exclusively through atomics,
//! mailboxes, and the event ring; the mixer allocates nothing on its
//! steady-state path.

mod backend;
mod buffer;
mod context;
mod device;
mod events;
mod listener;
mod mixer;
mod output;
mod panning;
mod props;
mod renderer;
mod slot;
mod voice;
mod voice_mix;

pub use backend::{Backend, NullBackend, WaveBackend};
pub use buffer::{AudioBuffer, BufferQueue};
pub use context::{Context, DEFAULT_EVENT_CAPACITY, DEFAULT_VOICE_COUNT};
pub use device::{BusSpan, Device, DeviceShared};
pub use events::{event_type, AsyncEvent, Semaphore, SourceState};
pub use listener::{ContextProps, ListenerProps};
pub use slot::{
    EffectProps, EffectSlot, EffectSlotProps, EffectState, EffectTarget, EffectType, NullEffect,
    PassthroughEffect, ReverbProps, SlotParams, MAX_EFFECT_CHANNELS,
};
pub use voice::{PathProps, SendProps, SpatializeMode, Voice, VoiceProps};

// Device creation consumes a loaded HRTF data set from the DSP layer.
pub use sf_dsp::HrtfStore;
