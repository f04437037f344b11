// src/promise/join.rs

//! The `when*` combinators: join one to four inputs and run a continuation
//! once all of them have settled.
//!
//! Arguments are `impl Into<Promise<T>>`, so plain values ride along with
//! promises (they become pre-fulfilled inputs). Completion of the last input
//! *schedules* the continuation on the executor; it never runs from inside a
//! `fulfill` call. Dropping the returned promise drops the queued turn and
//! every input subscription, collapsing the chain rightward.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::event::{Executor, PendingRunnable};

use super::{
    complete_cell, new_cell, IntoPromise, MaybeException, Promise, PromiseCell, PromiseResult,
};

struct JoinCore {
    remaining: Cell<usize>,
    /// Installed before arming, taken by whichever input completes last.
    fire: RefCell<Option<Box<dyn FnOnce()>>>,
}

type Slot<T> = Rc<RefCell<Option<PromiseResult<T>>>>;

/// Subscribe one input to the join. Returns the input's cell, which the
/// output promise must own to keep the producer side alive.
fn arm<T: 'static>(
    promise: Promise<T>,
    core: &Rc<JoinCore>,
    slot: &Slot<T>,
) -> Rc<RefCell<PromiseCell<T>>> {
    let core = core.clone();
    let slot = slot.clone();
    promise.subscribe(Box::new(move |result| {
        *slot.borrow_mut() = Some(result);
        let remaining = core.remaining.get() - 1;
        core.remaining.set(remaining);
        if remaining == 0 {
            if let Some(fire) = core.fire.borrow_mut().take() {
                fire();
            }
        }
    }))
}

/// Hand the continuation's product to the output cell: settle immediately
/// for ready promises, otherwise adopt (chain) the inner promise.
fn settle<R: 'static>(out: &Rc<RefCell<PromiseCell<R>>>, produced: Promise<R>) {
    let weak = Rc::downgrade(out);
    let inner_cell = produced.subscribe(Box::new(move |result| {
        if let Some(out) = weak.upgrade() {
            complete_cell(&out, result);
        }
    }));
    out.borrow_mut().owned.push(Box::new(inner_cell));
}

macro_rules! define_when {
    ($Name:ident, $func:ident, $count:expr, $(($T:ident, $promise:ident, $slot:ident, $result:ident)),+) => {
        pub struct $Name<$($T: 'static),+> {
            executor: Rc<dyn Executor>,
            $($promise: Promise<$T>,)+
        }

        pub fn $func<$($T: 'static),+>(
            executor: &Rc<dyn Executor>,
            $($promise: impl Into<Promise<$T>>,)+
        ) -> $Name<$($T),+> {
            $Name {
                executor: executor.clone(),
                $($promise: $promise.into(),)+
            }
        }

        impl<$($T: 'static),+> $Name<$($T),+> {
            /// Run `on_success` with the joined values. Any input error is
            /// propagated into the output promise unchanged.
            pub fn then<R, RR, F>(self, on_success: F) -> Promise<R>
            where
                R: 'static,
                RR: IntoPromise<R>,
                F: FnOnce($($T),+) -> RR + 'static,
            {
                self.finish(
                    Box::new(move |$($result),+| on_success($($result),+).into_promise()),
                    None,
                )
            }

            /// Like [`then`](Self::then), but with a failure continuation
            /// that receives every input as a [`MaybeException`] when at
            /// least one of them carried an error.
            pub fn then_catch<R, RR, GG, F, G>(self, on_success: F, on_failure: G) -> Promise<R>
            where
                R: 'static,
                RR: IntoPromise<R>,
                GG: IntoPromise<R>,
                F: FnOnce($($T),+) -> RR + 'static,
                G: FnOnce($(MaybeException<$T>),+) -> GG + 'static,
            {
                self.finish(
                    Box::new(move |$($result),+| on_success($($result),+).into_promise()),
                    Some(Box::new(move |$($result),+| {
                        on_failure($($result),+).into_promise()
                    })),
                )
            }

            fn finish<R: 'static>(
                self,
                on_success: Box<dyn FnOnce($($T),+) -> Promise<R>>,
                on_failure: Option<Box<dyn FnOnce($(MaybeException<$T>),+) -> Promise<R>>>,
            ) -> Promise<R> {
                let core = Rc::new(JoinCore {
                    remaining: Cell::new($count),
                    fire: RefCell::new(None),
                });
                $(let $slot: Slot<$T> = Rc::new(RefCell::new(None));)+
                let out = new_cell::<R>();
                let pending: Rc<RefCell<Option<PendingRunnable>>> =
                    Rc::new(RefCell::new(None));

                let fire = {
                    let executor = self.executor.clone();
                    let weak_out = Rc::downgrade(&out);
                    let pending = pending.clone();
                    $(let $slot = $slot.clone();)+
                    move || {
                        let turn = Box::new(move || {
                            let Some(out) = weak_out.upgrade() else {
                                return;
                            };
                            $(let Some($result) = $slot.borrow_mut().take() else {
                                return;
                            };)+
                            let produced: Promise<R> = if $($result.is_err())||+ {
                                match on_failure {
                                    Some(on_failure) => {
                                        on_failure($(MaybeException::from_result($result)),+)
                                    }
                                    None => {
                                        let mut first = None;
                                        $(if first.is_none() {
                                            if let Err(error) = &$result {
                                                first = Some(error.clone());
                                            }
                                        })+
                                        match first {
                                            Some(error) => Promise::rejected_captured(error),
                                            None => return,
                                        }
                                    }
                                }
                            } else {
                                $(let Ok($result) = $result else {
                                    return;
                                };)+
                                on_success($($result),+)
                            };
                            settle(&out, produced);
                        });
                        *pending.borrow_mut() = Some(executor.run_later(turn));
                    }
                };
                *core.fire.borrow_mut() = Some(Box::new(fire));

                $(let $promise = arm(self.$promise, &core, &$slot);)+

                {
                    let mut borrow = out.borrow_mut();
                    $(borrow.owned.push(Box::new($promise));)+
                    borrow.owned.push(Box::new(pending));
                }
                Promise::from_cell(out)
            }
        }
    };
}

define_when!(When1, when, 1usize, (A, pa, sa, ra));
define_when!(When2, when2, 2usize, (A, pa, sa, ra), (B, pb, sb, rb));
define_when!(When3, when3, 3usize, (A, pa, sa, ra), (B, pb, sb, rb), (C, pc, sc, rc));
define_when!(
    When4,
    when4,
    4usize,
    (A, pa, sa, ra),
    (B, pb, sb, rb),
    (C, pc, sc, rc),
    (D, pd, sd, rd)
);
