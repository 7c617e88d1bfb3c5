//! Async event delivery from the mixer to the control thread
//!
//! The mixer posts events (source stopped, effect state released,
//! disconnect) into an SPSC ring and bumps a counting semaphore; the
//! context's event consumer blocks on the semaphore and drains the ring.
//! A full ring drops events rather than blocking the mixer.

use parking_lot::{Condvar, Mutex};
use rtrb::{Consumer, Producer, RingBuffer};
use std::time::Duration;

use crate::slot::EffectState;

/// Longest disconnect message carried in an event
pub const EVENT_MSG_MAX: usize = 256;

/// Source playback state reported through events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Playing,
    Paused,
}

/// Event record delivered to the control thread
pub enum AsyncEvent {
    /// A voice finished or was stopped by the mixer
    SourceStateChange { id: u32, state: SourceState },
    /// A swapped-out effect state to be dropped off the mixer thread
    ReleaseEffectState(Box<dyn EffectState>),
    /// The device's backend reported fatal I/O failure
    Disconnected { msg: String },
}

impl std::fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsyncEvent::SourceStateChange { id, state } => f
                .debug_struct("SourceStateChange")
                .field("id", id)
                .field("state", state)
                .finish(),
            AsyncEvent::ReleaseEffectState(_) => f.write_str("ReleaseEffectState"),
            AsyncEvent::Disconnected { msg } => {
                f.debug_struct("Disconnected").field("msg", msg).finish()
            }
        }
    }
}

/// Event categories a context can enable
pub mod event_type {
    pub const SOURCE_STATE_CHANGE: u32 = 1 << 0;
    pub const DISCONNECTED: u32 = 1 << 1;
}

/// Counting semaphore pairing the event ring
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.condvar.notify_one();
    }

    /// Block until a post arrives
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.condvar.wait(&mut count);
        }
        *count -= 1;
    }

    /// Wait with a timeout; returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.condvar.wait_for(&mut count, timeout).timed_out() {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Take a pending post without blocking
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

/// Create the event ring pair. Capacity is fixed at device creation.
pub fn event_ring(capacity: usize) -> (Producer<AsyncEvent>, Consumer<AsyncEvent>) {
    RingBuffer::new(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_delivers_in_order() {
        let (mut tx, mut rx) = event_ring(8);
        tx.push(AsyncEvent::SourceStateChange {
            id: 1,
            state: SourceState::Stopped,
        })
        .unwrap();
        tx.push(AsyncEvent::Disconnected {
            msg: "gone".into(),
        })
        .unwrap();

        match rx.pop().unwrap() {
            AsyncEvent::SourceStateChange { id, state } => {
                assert_eq!(id, 1);
                assert_eq!(state, SourceState::Stopped);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.pop().unwrap() {
            AsyncEvent::Disconnected { msg } => assert_eq!(msg, "gone"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.pop().is_err());
    }

    #[test]
    fn full_ring_rejects_without_blocking() {
        let (mut tx, _rx) = event_ring(1);
        assert!(tx
            .push(AsyncEvent::SourceStateChange {
                id: 1,
                state: SourceState::Stopped
            })
            .is_ok());
        assert!(tx
            .push(AsyncEvent::SourceStateChange {
                id: 2,
                state: SourceState::Stopped
            })
            .is_err());
    }

    #[test]
    fn semaphore_counts_posts() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        assert!(!sem.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let sem = std::sync::Arc::new(Semaphore::new());
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        sem.post();
        assert!(waiter.join().unwrap());
    }
}
