//! Lock-free parameter mailboxes and the recycled-props free stack
//!
//! Each mutable object exposes a single-slot mailbox: the control thread
//! prepares a props box and exchanges it in; the mixer exchanges it out at
//! the start of a block. Consumed and displaced boxes go onto a Treiber
//! free stack so steady-state updates allocate nothing. Intermediate
//! writes are lost by design; the mixer only wants the latest state.
//!
//! Thread contract: any thread may push onto the free stack (the mixer
//! returns consumed boxes, the control thread returns displaced ones),
//! but only the control thread pops. With a single popper the stack needs
//! no ABA protection.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Free-stack link wrapper around a props value
pub struct PropsBox<T> {
    next: AtomicPtr<PropsBox<T>>,
    pub data: T,
}

impl<T> PropsBox<T> {
    pub fn new(data: T) -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            data,
        })
    }
}

/// Single-slot atomic mailbox holding a pending props update
pub struct Mailbox<T> {
    slot: AtomicPtr<PropsBox<T>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish an update, returning the previous pending box if the mixer
    /// had not consumed it yet.
    pub fn publish(&self, props: Box<PropsBox<T>>) -> Option<Box<PropsBox<T>>> {
        let new = Box::into_raw(props);
        let old = self.slot.swap(new, Ordering::AcqRel);
        // The swapped-out pointer was owned by the slot; reclaim it.
        if old.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(old) })
        }
    }

    /// Take the pending update, if any (mixer side).
    pub fn take(&self) -> Option<Box<PropsBox<T>>> {
        let old = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(old) })
        }
    }

    /// Whether an update is pending, without consuming it
    pub fn is_pending(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        let p = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

// The mailbox transfers whole boxes between threads.
unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

/// Treiber stack of recycled props boxes
pub struct FreeStack<T> {
    head: AtomicPtr<PropsBox<T>>,
}

impl<T> FreeStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a box (any thread, lock-free)
    pub fn push(&self, props: Box<PropsBox<T>>) {
        let node = Box::into_raw(props);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pop a recycled box (control thread only)
    pub fn pop(&self) -> Option<Box<PropsBox<T>>> {
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            // Safe with a single popper: `head` cannot be freed while we
            // hold it, because only this thread pops.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(unsafe { Box::from_raw(head) }),
                Err(current) => head = current,
            }
        }
        None
    }
}

impl<T> Default for FreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FreeStack<T> {
    fn drop(&mut self) {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<T: Send> Send for FreeStack<T> {}
unsafe impl<T: Send> Sync for FreeStack<T> {}

/// Fetch a recycled box or allocate a fresh one, fill it, and publish it.
/// The control-thread path for every parameter update.
pub fn publish_update<T: Default>(mailbox: &Mailbox<T>, freelist: &FreeStack<T>, data: T) {
    let mut boxed = freelist.pop().unwrap_or_else(|| PropsBox::new(T::default()));
    boxed.data = data;
    if let Some(displaced) = mailbox.publish(boxed) {
        freelist.push(displaced);
    }
}

/// Consume a pending update into `dest`, recycling the box. Returns true
/// when an update was applied. The mixer-thread path.
pub fn consume_update<T: Clone>(mailbox: &Mailbox<T>, freelist: &FreeStack<T>, dest: &mut T) -> bool {
    match mailbox.take() {
        Some(boxed) => {
            dest.clone_from(&boxed.data);
            freelist.push(boxed);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn mailbox_latest_wins() {
        let mailbox = Mailbox::new();
        assert!(mailbox.publish(PropsBox::new(1u32)).is_none());
        // The unconsumed first value comes back displaced.
        let displaced = mailbox.publish(PropsBox::new(2u32)).unwrap();
        assert_eq!(displaced.data, 1);
        assert_eq!(mailbox.take().unwrap().data, 2);
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn freestack_recycles() {
        let stack = FreeStack::new();
        stack.push(PropsBox::new(7u32));
        stack.push(PropsBox::new(8u32));
        assert_eq!(stack.pop().unwrap().data, 8);
        assert_eq!(stack.pop().unwrap().data, 7);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn publish_consume_roundtrip() {
        let mailbox = Mailbox::new();
        let freelist = FreeStack::new();
        publish_update(&mailbox, &freelist, 41u32);
        publish_update(&mailbox, &freelist, 42u32);

        let mut dest = 0u32;
        assert!(consume_update(&mailbox, &freelist, &mut dest));
        assert_eq!(dest, 42);
        assert!(!consume_update(&mailbox, &freelist, &mut dest));

        // Both boxes ended up recycled.
        assert!(freelist.pop().is_some());
        assert!(freelist.pop().is_some());
        assert!(freelist.pop().is_none());
    }

    #[test]
    fn drop_counts_balance() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mailbox = Mailbox::new();
            let stack = FreeStack::new();
            mailbox.publish(PropsBox::new(Counted(drops.clone())));
            mailbox.publish(PropsBox::new(Counted(drops.clone())));
            stack.push(PropsBox::new(Counted(drops.clone())));
        }
        // One displaced box dropped eagerly, one in the mailbox, one in
        // the stack.
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_publish_take() {
        let mailbox = Arc::new(Mailbox::new());
        let freelist = Arc::new(FreeStack::new());

        let publisher = {
            let mailbox = Arc::clone(&mailbox);
            let freelist = Arc::clone(&freelist);
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    publish_update(&mailbox, &freelist, i);
                }
            })
        };

        let mut last = 0u64;
        let mut dest = 0u64;
        let consumer_freelist = Arc::clone(&freelist);
        for _ in 0..50_000 {
            if consume_update(&mailbox, &consumer_freelist, &mut dest) {
                // Values only move forward; intermediate ones may be lost.
                assert!(dest >= last);
                last = dest;
            }
        }
        publisher.join().unwrap();
    }
}
