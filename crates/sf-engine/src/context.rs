//! Mixing contexts: a scene of voices and effect slots bound to a device
//!
//! The control thread owns the public methods here; everything it shares
//! with the mixer goes through atomic fields, props mailboxes, or the
//! async-event ring. The mixer-side derived state (listener transform,
//! slot ordering scratch) lives in a cell only the mixer touches.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rtrb::{Consumer, Producer};
use sf_core::{SfError, SfResult};

use crate::buffer::BufferQueue;
use crate::events::{event_ring, AsyncEvent, Semaphore};
use crate::listener::{ContextProps, ListenerParams, ListenerProps};
use crate::props::{publish_update, FreeStack, Mailbox};
use crate::slot::{EffectSlot, EffectSlotProps, SlotParams};
use crate::voice::{Voice, VoiceProps};

/// Default number of voices a context allocates
pub const DEFAULT_VOICE_COUNT: usize = 64;

/// Default async-event ring capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Mixer-side context state
pub(crate) struct ContextMixState {
    pub listener: ListenerParams,
    pub ctx_props: ContextProps,
    pub listener_props: ListenerProps,
    /// Dependency-ordered slot scratch, reused across blocks
    pub slot_scratch: Vec<Arc<EffectSlot>>,
}

pub struct Context {
    pub(crate) update: Mailbox<ContextProps>,
    pub(crate) listener_update: Mailbox<ListenerProps>,

    pub(crate) free_context_props: FreeStack<ContextProps>,
    pub(crate) free_listener_props: FreeStack<ListenerProps>,
    pub(crate) free_voice_props: FreeStack<VoiceProps>,
    pub(crate) free_slot_props: FreeStack<EffectSlotProps>,

    /// Control thread can pause propagation for batched updates
    pub(crate) hold_updates: AtomicBool,
    /// Odd while propagation is running (seqlock for observers)
    pub(crate) update_count: AtomicU64,
    pub(crate) enabled_events: AtomicU32,

    pub(crate) voices: Box<[Voice]>,
    pub(crate) slots: RwLock<Vec<Arc<EffectSlot>>>,
    pub(crate) default_slot: RwLock<Option<Arc<EffectSlot>>>,

    event_tx: UnsafeCell<Producer<AsyncEvent>>,
    event_rx: Mutex<Consumer<AsyncEvent>>,
    pub(crate) event_sem: Semaphore,

    pub(crate) mix: UnsafeCell<ContextMixState>,
    num_sends: usize,
}

// UnsafeCell fields are confined to the mixer thread; see the field
// comments. Everything else is atomic or internally locked.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new(num_sends: usize, voice_count: usize, event_capacity: usize) -> Arc<Self> {
        let (tx, rx) = event_ring(event_capacity);
        Arc::new(Self {
            update: Mailbox::new(),
            listener_update: Mailbox::new(),
            free_context_props: FreeStack::new(),
            free_listener_props: FreeStack::new(),
            free_voice_props: FreeStack::new(),
            free_slot_props: FreeStack::new(),
            hold_updates: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            enabled_events: AtomicU32::new(0),
            voices: (0..voice_count).map(|_| Voice::new(num_sends)).collect(),
            slots: RwLock::new(Vec::new()),
            default_slot: RwLock::new(None),
            event_tx: UnsafeCell::new(tx),
            event_rx: Mutex::new(rx),
            event_sem: Semaphore::new(),
            mix: UnsafeCell::new(ContextMixState {
                listener: ListenerParams::default(),
                ctx_props: ContextProps::default(),
                listener_props: ListenerProps::default(),
                slot_scratch: Vec::new(),
            }),
            num_sends,
        })
    }

    pub fn num_sends(&self) -> usize {
        self.num_sends
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    // ---------------- control-thread API ----------------

    /// Start playing a source on a free voice
    pub fn play(&self, source_id: u32, queue: Arc<BufferQueue>, props: VoiceProps) -> SfResult<()> {
        if source_id == 0 {
            return Err(SfError::InvalidParam("source id 0 is reserved"));
        }
        let voice = self
            .voices
            .iter()
            .find(|v| v.is_free())
            .ok_or(SfError::VoicePoolExhausted)?;
        voice.begin(source_id, queue, props.clone());
        // The mixer derives gains and filters from the pending update on
        // its next block.
        publish_update(&voice.update, &self.free_voice_props, props);
        Ok(())
    }

    /// Ask the mixer to fade out and stop every voice of a source
    pub fn stop_source(&self, source_id: u32) {
        for voice in self.voices.iter() {
            if voice.source_id() == source_id {
                voice.request_stop();
            }
        }
    }

    /// Whether any voice is still rendering the source
    pub fn is_source_playing(&self, source_id: u32) -> bool {
        self.voices
            .iter()
            .any(|v| v.source_id() == source_id && v.is_playing())
    }

    /// Publish new source parameters
    pub fn update_source(&self, source_id: u32, props: VoiceProps) {
        for voice in self.voices.iter() {
            if voice.source_id() == source_id {
                publish_update(&voice.update, &self.free_voice_props, props.clone());
            }
        }
    }

    /// Publish new listener parameters
    pub fn update_listener(&self, props: ListenerProps) {
        publish_update(&self.listener_update, &self.free_listener_props, props);
    }

    /// Publish new context-wide parameters
    pub fn update_context(&self, props: ContextProps) {
        publish_update(&self.update, &self.free_context_props, props);
    }

    /// Create an effect slot and add it to the active set
    pub fn add_slot(&self) -> Arc<EffectSlot> {
        let slot = EffectSlot::new();
        self.slots.write().push(slot.clone());
        slot
    }

    /// Remove a slot from the active set. The slot stops processing at
    /// the next block boundary.
    pub fn remove_slot(&self, slot: &Arc<EffectSlot>) {
        self.slots.write().retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Designate the slot that send 0 routes to when a source names none
    pub fn set_default_slot(&self, slot: Option<Arc<EffectSlot>>) {
        *self.default_slot.write() = slot;
    }

    /// Publish new effect-slot parameters (and optionally a new state)
    pub fn update_slot(&self, slot: &Arc<EffectSlot>, props: EffectSlotProps) {
        let mut boxed = self
            .free_slot_props
            .pop()
            .unwrap_or_else(|| crate::props::PropsBox::new(EffectSlotProps::default()));
        boxed.data = props;
        if let Some(mut displaced) = slot.update.publish(boxed) {
            // A stashed-back effect state from a full event ring gets
            // dropped here, on the control thread.
            displaced.data.state = None;
            displaced.data.target = None;
            self.free_slot_props.push(displaced);
        }
    }

    /// Pause parameter propagation so multiple updates land atomically
    pub fn hold_updates(&self) {
        self.hold_updates.store(true, Ordering::Release);
    }

    /// Resume parameter propagation
    pub fn resume_updates(&self) {
        self.hold_updates.store(false, Ordering::Release);
    }

    /// Enable event categories (bitmask of [`crate::events::event_type`])
    pub fn enable_events(&self, mask: u32) {
        self.enabled_events.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn disable_events(&self, mask: u32) {
        self.enabled_events.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Block up to `timeout` for the next async event
    pub fn wait_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        if !self.event_sem.wait_timeout(timeout) {
            return None;
        }
        self.event_rx.lock().pop().ok()
    }

    /// Drain any pending events without blocking
    pub fn try_event(&self) -> Option<AsyncEvent> {
        if !self.event_sem.try_wait() {
            return None;
        }
        self.event_rx.lock().pop().ok()
    }

    /// Snapshot of the update counter; odd means propagation in progress
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Acquire)
    }

    // ---------------- mixer-thread API ----------------

    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mix_state(&self) -> &mut ContextMixState {
        &mut *self.mix.get()
    }

    /// Post an event from the mixer; returns false when the ring is full
    pub(crate) fn post_event(&self, event: AsyncEvent) -> bool {
        self.try_post_event(event).is_ok()
    }

    /// Post an event, handing it back when the ring is full so payloads
    /// (effect states) are never lost.
    pub(crate) fn try_post_event(&self, event: AsyncEvent) -> Result<(), AsyncEvent> {
        // Mixer thread only.
        let tx = unsafe { &mut *self.event_tx.get() };
        match tx.push(event) {
            Ok(()) => {
                self.event_sem.post();
                Ok(())
            }
            Err(rtrb::PushError::Full(event)) => Err(event),
        }
    }

    /// Resolve a send's slot: explicit, or the default for send 0.
    /// Slots holding a null effect do not count.
    pub(crate) fn resolve_send_slot(
        &self,
        send_idx: usize,
        explicit: &Option<Arc<EffectSlot>>,
    ) -> Option<Arc<EffectSlot>> {
        let slot = match explicit {
            Some(s) => Some(s.clone()),
            None if send_idx == 0 => self.default_slot.read().clone(),
            None => None,
        }?;
        let params: &SlotParams = &unsafe { slot.mix_state() }.params;
        if params.effect_type == crate::slot::EffectType::Null {
            return None;
        }
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;
    use crate::events::SourceState;

    fn queue() -> Arc<BufferQueue> {
        Arc::new(BufferQueue::single(Arc::new(AudioBuffer::mono(
            44100,
            vec![0.0; 64],
        ))))
    }

    #[test]
    fn voice_pool_exhaustion_errors() {
        let ctx = Context::new(2, 2, 8);
        ctx.play(1, queue(), VoiceProps::default()).unwrap();
        ctx.play(2, queue(), VoiceProps::default()).unwrap();
        assert!(matches!(
            ctx.play(3, queue(), VoiceProps::default()),
            Err(SfError::VoicePoolExhausted)
        ));
    }

    #[test]
    fn source_id_zero_is_rejected() {
        let ctx = Context::new(2, 4, 8);
        assert!(ctx.play(0, queue(), VoiceProps::default()).is_err());
    }

    #[test]
    fn events_flow_from_mixer_to_control() {
        let ctx = Context::new(2, 4, 8);
        assert!(ctx.post_event(AsyncEvent::SourceStateChange {
            id: 3,
            state: SourceState::Stopped,
        }));
        match ctx.try_event() {
            Some(AsyncEvent::SourceStateChange { id, .. }) => assert_eq!(id, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ctx.try_event().is_none());
    }

    #[test]
    fn event_ring_overflow_reports_false() {
        let ctx = Context::new(2, 4, 1);
        assert!(ctx.post_event(AsyncEvent::SourceStateChange {
            id: 1,
            state: SourceState::Stopped,
        }));
        assert!(!ctx.post_event(AsyncEvent::SourceStateChange {
            id: 2,
            state: SourceState::Stopped,
        }));
    }

    #[test]
    fn slot_registry() {
        let ctx = Context::new(2, 4, 8);
        let slot = ctx.add_slot();
        assert_eq!(ctx.slots.read().len(), 1);
        ctx.remove_slot(&slot);
        assert!(ctx.slots.read().is_empty());
    }
}
