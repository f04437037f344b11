// src/event/executor.rs

//! The turn queue: FIFO yielded callbacks, each tied to an owned handle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type TurnSlot = Rc<RefCell<Option<Box<dyn FnOnce()>>>>;

/// Something that can schedule a callback for a later turn.
///
/// The production implementation is the event manager; tests use a mock that
/// steps turns by hand.
pub trait Executor {
    fn run_later(&self, runnable: Box<dyn FnOnce()>) -> PendingRunnable;
}

/// Handle to a queued-but-not-yet-run callback. Dropping it removes the
/// queue entry; after drop, the callback is guaranteed not to run.
pub struct PendingRunnable {
    slot: TurnSlot,
}

impl Drop for PendingRunnable {
    fn drop(&mut self) {
        self.slot.borrow_mut().take();
    }
}

/// FIFO queue of turn slots. Cancelled entries stay in the deque as empty
/// slots and are skipped when popping.
pub struct TurnQueue {
    queue: RefCell<VecDeque<TurnSlot>>,
}

impl TurnQueue {
    pub fn new() -> TurnQueue {
        TurnQueue {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn push(&self, runnable: Box<dyn FnOnce()>) -> PendingRunnable {
        let slot: TurnSlot = Rc::new(RefCell::new(Some(runnable)));
        self.queue.borrow_mut().push_back(slot.clone());
        PendingRunnable { slot }
    }

    /// Queue a callback with no cancellation handle (used for notifications
    /// that are no-ops for dead subscribers anyway).
    pub fn push_detached(&self, runnable: Box<dyn FnOnce()>) {
        let slot: TurnSlot = Rc::new(RefCell::new(Some(runnable)));
        self.queue.borrow_mut().push_back(slot);
    }

    /// Run the next live callback, if any. Returns whether one ran.
    pub fn run_next(&self) -> bool {
        loop {
            let slot = match self.queue.borrow_mut().pop_front() {
                Some(slot) => slot,
                None => return false,
            };
            // Release the slot borrow before running: the callback may drop
            // its own handle (settling a promise drops the queued-turn
            // owner).
            let runnable = slot.borrow_mut().take();
            if let Some(runnable) = runnable {
                runnable();
                return true;
            }
            // Cancelled entry; keep looking.
        }
    }

    /// Number of live (uncancelled) entries.
    pub fn len(&self) -> usize {
        self.queue
            .borrow()
            .iter()
            .filter(|slot| slot.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TurnQueue {
    fn default() -> TurnQueue {
        TurnQueue::new()
    }
}
