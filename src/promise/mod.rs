// src/promise/mod.rs

//! One-shot, exclusively-owned deferred values.
//!
//! A [`Promise`] is a handle to a value that an asynchronous operation will
//! produce later. The handle owns the operation: dropping the promise before
//! fulfillment cancels everything upstream of it, and the fulfiller side
//! observes the drop instead of delivering anywhere.
//!
//! Composition happens through the `when*` combinators in [`join`], which
//! are bound to an [`Executor`](crate::event::Executor): continuations never
//! run synchronously with the `fulfill` call that armed them, since
//! completion only *schedules* a turn.
//!
//! Everything here is single-threaded; cells are `Rc<RefCell<_>>` and the
//! fulfiller holds a weak back-reference, so a dead promise makes `fulfill`
//! a silent no-op.

mod join;

pub use join::{when, when2, when3, when4, When1, When2, When3, When4};

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::errors::{BuildError, CapturedError};

/// What a promise ultimately carries: a value or a captured error.
pub type PromiseResult<T> = std::result::Result<T, CapturedError>;

type Waiter<T> = Box<dyn FnOnce(PromiseResult<T>)>;

enum State<T> {
    /// Not yet completed; at most one consumer waiter may be armed.
    Pending { waiter: Option<Waiter<T>> },
    /// Completed before anyone subscribed.
    Ready(PromiseResult<T>),
    /// Completed and delivered; nothing further may happen.
    Consumed,
}

pub(crate) struct PromiseCell<T> {
    state: State<T>,
    /// Resources that must stay alive until this promise settles or is
    /// dropped: async-operation handles, child process guards, upstream
    /// cells. Dropping the cell drops these, which is what cancellation is.
    owned: Vec<Box<dyn Any>>,
}

pub struct Promise<T: 'static> {
    cell: Rc<RefCell<PromiseCell<T>>>,
}

pub struct PromiseFulfiller<T: 'static> {
    cell: Weak<RefCell<PromiseCell<T>>>,
}

fn new_cell<T>() -> Rc<RefCell<PromiseCell<T>>> {
    Rc::new(RefCell::new(PromiseCell {
        state: State::Pending { waiter: None },
        owned: Vec::new(),
    }))
}

impl<T: 'static> Promise<T> {
    /// A promise together with its fulfiller.
    pub fn pending() -> (Promise<T>, PromiseFulfiller<T>) {
        let cell = new_cell();
        let fulfiller = PromiseFulfiller {
            cell: Rc::downgrade(&cell),
        };
        (Promise { cell }, fulfiller)
    }

    /// An already-fulfilled promise.
    pub fn fulfilled(value: T) -> Promise<T> {
        Promise {
            cell: Rc::new(RefCell::new(PromiseCell {
                state: State::Ready(Ok(value)),
                owned: Vec::new(),
            })),
        }
    }

    /// An already-failed promise.
    pub fn rejected(error: BuildError) -> Promise<T> {
        Promise::rejected_captured(CapturedError::new(error))
    }

    pub(crate) fn rejected_captured(error: CapturedError) -> Promise<T> {
        Promise {
            cell: Rc::new(RefCell::new(PromiseCell {
                state: State::Ready(Err(error)),
                owned: Vec::new(),
            })),
        }
    }

    /// Tie a resource's lifetime to this promise. The resource is dropped
    /// when the promise settles and is consumed, or when it is cancelled.
    pub fn attach<R: 'static>(self, resource: R) -> Promise<T> {
        self.cell.borrow_mut().owned.push(Box::new(resource));
        self
    }

    /// Arm the single consumer waiter, consuming this handle. The returned
    /// cell must be kept alive by the subscriber or the producer side loses
    /// its target (that is the cancellation path).
    ///
    /// The waiter is bookkeeping, not a user continuation: it may run
    /// synchronously from inside `fulfill`.
    pub(crate) fn subscribe(self, waiter: Waiter<T>) -> Rc<RefCell<PromiseCell<T>>> {
        {
            let mut cell = self.cell.borrow_mut();
            match std::mem::replace(&mut cell.state, State::Consumed) {
                State::Pending { waiter: existing } => {
                    debug_assert!(existing.is_none(), "promise subscribed twice");
                    cell.state = State::Pending {
                        waiter: Some(waiter),
                    };
                }
                State::Ready(result) => {
                    drop(cell);
                    waiter(result);
                }
                State::Consumed => {
                    debug_assert!(false, "promise already consumed");
                }
            }
        }
        self.cell
    }

    pub(crate) fn from_cell(cell: Rc<RefCell<PromiseCell<T>>>) -> Promise<T> {
        Promise { cell }
    }
}

/// Deliver a result into a cell: hand it to the armed waiter, or store it
/// for a future subscriber. Completing a settled cell is ignored.
pub(crate) fn complete_cell<T>(cell: &Rc<RefCell<PromiseCell<T>>>, result: PromiseResult<T>) {
    let mut borrow = cell.borrow_mut();
    let taken = match &mut borrow.state {
        State::Pending { waiter } => waiter.take(),
        _ => return,
    };
    match taken {
        Some(waiter) => {
            borrow.state = State::Consumed;
            drop(borrow);
            waiter(result);
        }
        None => {
            borrow.state = State::Ready(result);
        }
    }
}

impl<T: 'static> PromiseFulfiller<T> {
    /// Fulfill with a value. No-op if the promise was dropped.
    pub fn fulfill(self, value: T) {
        if let Some(cell) = self.cell.upgrade() {
            complete_cell(&cell, Ok(value));
        }
    }

    /// Fulfill by chaining: the promise settles when `inner` does, adopting
    /// its value or error. If the promise was dropped, `inner` is dropped
    /// too, cancelling it.
    pub fn fulfill_with(self, inner: Promise<T>) {
        let Some(cell) = self.cell.upgrade() else {
            return;
        };
        let weak = Rc::downgrade(&cell);
        let inner_cell = inner.subscribe(Box::new(move |result| {
            if let Some(cell) = weak.upgrade() {
                complete_cell(&cell, result);
            }
        }));
        cell.borrow_mut().owned.push(Box::new(inner_cell));
    }

    /// Fail the promise with an error. No-op if the promise was dropped.
    pub fn reject(self, error: BuildError) {
        if let Some(cell) = self.cell.upgrade() {
            complete_cell(&cell, Err(CapturedError::new(error)));
        }
    }

    /// True while the promise end is alive and unfulfilled; turns false as
    /// soon as the promise is dropped or completed.
    pub fn is_waiting(&self) -> bool {
        match self.cell.upgrade() {
            Some(cell) => matches!(cell.borrow().state, State::Pending { .. }),
            None => false,
        }
    }
}

/// Continuation return values: a plain value, another promise (chaining), or
/// a `Result` (the Rust rendition of a continuation that throws).
pub trait IntoPromise<T: 'static> {
    fn into_promise(self) -> Promise<T>;
}

impl<T: 'static> IntoPromise<T> for Promise<T> {
    fn into_promise(self) -> Promise<T> {
        self
    }
}

impl<T: 'static> IntoPromise<T> for T {
    fn into_promise(self) -> Promise<T> {
        Promise::fulfilled(self)
    }
}

impl<T: 'static> IntoPromise<T> for std::result::Result<T, BuildError> {
    fn into_promise(self) -> Promise<T> {
        match self {
            Ok(value) => Promise::fulfilled(value),
            Err(error) => Promise::rejected(error),
        }
    }
}

impl<T: 'static> From<T> for Promise<T> {
    fn from(value: T) -> Promise<T> {
        Promise::fulfilled(value)
    }
}

/// A promise input as seen by a failure continuation: either the value the
/// input produced, or the error it captured.
pub enum MaybeException<T> {
    Value(T),
    Exception(CapturedError),
}

impl<T> MaybeException<T> {
    pub(crate) fn from_result(result: PromiseResult<T>) -> MaybeException<T> {
        match result {
            Ok(value) => MaybeException::Value(value),
            Err(error) => MaybeException::Exception(error),
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, MaybeException::Exception(_))
    }

    /// Take the value, or re-raise the captured error.
    pub fn get(self) -> std::result::Result<T, BuildError> {
        match self {
            MaybeException::Value(value) => Ok(value),
            MaybeException::Exception(error) => Err(BuildError::Captured(error)),
        }
    }
}
